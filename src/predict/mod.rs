//! Opaque predictor contract and mixture-density output handling.
//!
//! The trained network is an external artifact; the pipeline sees only the
//! [`Predictor`] trait — a blocking call from a fixed-shape input to one
//! Gaussian mixture over log₁₀-PGA per target. This module also owns the
//! conversion from mixtures to per-threshold exceedance probabilities.

use crate::assembler::InferenceInput;
use crate::types::intensity::{IntensityLabel, PGA_THRESHOLDS_MS2, THRESHOLD_COUNT};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("predictor initialization failed: {0}")]
    Init(String),

    #[error("inference failed: {0}")]
    Failed(String),

    #[error("malformed predictor output: {0}")]
    BadOutput(String),
}

/// One target's mixture of Gaussians over log₁₀-PGA (m/s²).
#[derive(Debug, Clone)]
pub struct TargetMixture {
    pub weights: Vec<f64>,
    pub means: Vec<f64>,
    pub log_stddevs: Vec<f64>,
}

impl TargetMixture {
    /// Mixture weights must sum to one within tolerance and the component
    /// vectors must agree in length.
    pub fn validate(&self) -> Result<(), PredictError> {
        if self.weights.len() != self.means.len() || self.weights.len() != self.log_stddevs.len() {
            return Err(PredictError::BadOutput(format!(
                "component length mismatch: {} weights, {} means, {} log-stddevs",
                self.weights.len(),
                self.means.len(),
                self.log_stddevs.len()
            )));
        }
        let total: f64 = self.weights.iter().sum();
        if (total - 1.0).abs() > 1e-4 {
            return Err(PredictError::BadOutput(format!(
                "mixture weights sum to {total}, expected 1"
            )));
        }
        Ok(())
    }

    /// Probability that log₁₀-PGA exceeds `threshold`.
    pub fn exceedance(&self, threshold: f64) -> f64 {
        let mut p = 0.0;
        for ((&w, &mu), &log_sigma) in self
            .weights
            .iter()
            .zip(self.means.iter())
            .zip(self.log_stddevs.iter())
        {
            let sigma = log_sigma.exp();
            if let Ok(normal) = Normal::new(mu, sigma) {
                p += w * (1.0 - normal.cdf(threshold));
            }
        }
        p.clamp(0.0, 1.0)
    }

    /// Exceedance probability at each of the nine intensity thresholds.
    pub fn exceedance_profile(&self) -> [f64; THRESHOLD_COUNT] {
        let mut profile = [0.0; THRESHOLD_COUNT];
        for (i, level) in PGA_THRESHOLDS_MS2.iter().enumerate() {
            profile[i] = self.exceedance(level.log10());
        }
        profile
    }

    /// Intensity label at the given probability cutoff.
    pub fn label(&self, cutoff: f64) -> IntensityLabel {
        IntensityLabel::from_exceedance(&self.exceedance_profile(), cutoff)
    }
}

/// Full predictor output: one mixture per target, in target-list order.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub mixtures: Vec<TargetMixture>,
}

impl InferenceOutput {
    pub fn validate(&self) -> Result<(), PredictError> {
        for mixture in &self.mixtures {
            mixture.validate()?;
        }
        Ok(())
    }
}

/// The opaque trained network.
///
/// Blocking, single-threaded-safe, free of hidden global state. The
/// dispatcher owns the only instance and serializes every call.
pub trait Predictor: Send {
    fn predict(&mut self, input: &InferenceInput) -> Result<InferenceOutput, PredictError>;
}

/// Stand-in predictor emitting quiet (deep-floor) mixtures for every
/// target. Lets the pipeline run end-to-end where the trained network is
/// not linked in; every report will carry intensity `"0"`.
pub struct NullPredictor;

impl Predictor for NullPredictor {
    fn predict(&mut self, input: &InferenceInput) -> Result<InferenceOutput, PredictError> {
        let mixtures = (0..input.n_targets())
            .map(|_| TargetMixture {
                weights: vec![1.0],
                means: vec![-5.0],
                log_stddevs: vec![-2.0],
            })
            .collect();
        Ok(InferenceOutput { mixtures })
    }
}
