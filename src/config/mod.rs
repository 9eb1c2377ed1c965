//! Runtime Configuration Module
//!
//! One explicit record enumerating every tunable of the pipeline, replacing
//! scattered magic numbers. Values come from built-in defaults overridden by
//! `TTSAM_*` environment variables.
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(Config::from_env());
//!
//! // Anywhere in the codebase:
//! let window = config::get().window_seconds;
//! ```
//!
//! Components take the values they need at construction, so library code
//! and tests can run against a plain [`Config`] without touching the global.

pub mod defaults;

use crate::types::intensity::IntensityLabel;
use std::sync::OnceLock;
use tracing::warn;

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ring retention window (seconds).
    pub window_seconds: f64,
    /// The only accepted waveform sample rate (Hz).
    pub sample_rate_hz: f64,
    /// Fixed station dimension of the inference input.
    pub n_stations_max: usize,
    /// Inference cadence during an active event (seconds).
    pub tick_interval: f64,
    /// Delay from first pick to first tick (seconds).
    pub initial_delay: f64,
    /// Exceedance probability cutoff for intensity labeling.
    pub intensity_cutoff: f64,
    /// Minimum label entering the alarm list.
    pub alarm_min_intensity: IntensityLabel,
    /// Minimum co-picking stations to open an event.
    pub trigger_min_stations: usize,
    /// Trigger picks must fall within this span of each other (seconds).
    pub trigger_window_seconds: f64,
    /// Pairwise distance gate between trigger stations (km).
    pub trigger_spatial_km: f64,
    /// New picks extend the event if within this span of the latest (seconds).
    pub event_linger_seconds: f64,
    /// Silence after the last pick before the terminal tick (seconds).
    pub event_drain_seconds: f64,
    /// Duplicate-pick window per station (seconds).
    pub epsilon_pick: f64,
    /// Soft predictor budget (seconds).
    pub predict_timeout_seconds: f64,
    /// Bandpass lower corner (Hz).
    pub bandpass_low_hz: f64,
    /// Bandpass upper corner (Hz).
    pub bandpass_high_hz: f64,
    /// Butterworth order per bandpass edge.
    pub bandpass_order: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window_seconds: defaults::WINDOW_SECONDS,
            sample_rate_hz: defaults::SAMPLE_RATE_HZ,
            n_stations_max: defaults::N_STATIONS_MAX,
            tick_interval: defaults::TICK_INTERVAL_SECONDS,
            initial_delay: defaults::INITIAL_DELAY_SECONDS,
            intensity_cutoff: defaults::INTENSITY_PROB_CUTOFF,
            alarm_min_intensity: IntensityLabel::Four,
            trigger_min_stations: defaults::TRIGGER_MIN_STATIONS,
            trigger_window_seconds: defaults::TRIGGER_WINDOW_SECONDS,
            trigger_spatial_km: defaults::TRIGGER_SPATIAL_KM,
            event_linger_seconds: defaults::EVENT_LINGER_SECONDS,
            event_drain_seconds: defaults::EVENT_DRAIN_SECONDS,
            epsilon_pick: defaults::EPSILON_PICK,
            predict_timeout_seconds: defaults::PREDICT_TIMEOUT_SECONDS,
            bandpass_low_hz: defaults::BANDPASS_LOW_HZ,
            bandpass_high_hz: defaults::BANDPASS_HIGH_HZ,
            bandpass_order: defaults::BANDPASS_ORDER,
        }
    }
}

impl Config {
    /// Build configuration from defaults plus `TTSAM_*` env overrides.
    ///
    /// Unparseable values log a warning and keep the default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_f64("TTSAM_WINDOW_SECONDS", &mut cfg.window_seconds);
        env_usize("TTSAM_N_STATIONS_MAX", &mut cfg.n_stations_max);
        env_f64("TTSAM_TICK_INTERVAL", &mut cfg.tick_interval);
        env_f64("TTSAM_INTENSITY_CUTOFF", &mut cfg.intensity_cutoff);

        if let Ok(raw) = std::env::var("TTSAM_ALARM_MIN_INTENSITY") {
            match raw.parse::<IntensityLabel>() {
                Ok(label) => cfg.alarm_min_intensity = label,
                Err(_) => warn!(
                    value = %raw,
                    "TTSAM_ALARM_MIN_INTENSITY is not a valid intensity label, keeping default"
                ),
            }
        }
        cfg
    }

    /// Samples per retention window at the configured rate.
    pub fn window_samples(&self) -> usize {
        (self.window_seconds * self.sample_rate_hz).round() as usize
    }
}

fn env_f64(key: &str, slot: &mut f64) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<f64>() {
            Ok(v) if v.is_finite() && v > 0.0 => *slot = v,
            _ => warn!(var = key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

fn env_usize(key: &str, slot: &mut usize) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse::<usize>() {
            Ok(v) if v > 0 => *slot = v,
            _ => warn!(var = key, value = %raw, "ignoring unparseable env override"),
        }
    }
}

/// Global configuration, initialized once at startup.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the global configuration. Warns if called more than once.
pub fn init(config: Config) {
    if CONFIG.set(config).is_err() {
        warn!("config::init() called more than once — ignoring");
    }
}

/// Get the global configuration.
///
/// Panics if `init()` has not been called; a missing config is a startup
/// bug, not a recoverable condition.
pub fn get() -> &'static Config {
    CONFIG
        .get()
        .expect("config::get() called before config::init()")
}

/// Whether the global configuration has been installed.
pub fn is_initialized() -> bool {
    CONFIG.get().is_some()
}
