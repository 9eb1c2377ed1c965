//! Taiwan CWA seismic intensity scale.
//!
//! Ten ordered labels from `"0"` to `"7"`, derived from PGA exceedance at
//! nine thresholds. The half-step labels order as `5- < 5+ < 6- < 6+`.

use serde::{Deserialize, Serialize};

/// Number of exceedance thresholds (labels above `"0"`).
pub const THRESHOLD_COUNT: usize = 9;

/// PGA level bounds in m/s² for labels `"1"` through `"7"`.
///
/// A target is assigned label *k* when the exceedance probability at
/// `PGA_THRESHOLDS_MS2[k-1]` meets the cutoff.
pub const PGA_THRESHOLDS_MS2: [f64; THRESHOLD_COUNT] =
    [0.008, 0.025, 0.080, 0.250, 0.80, 1.4, 2.5, 4.4, 8.0];

/// Ordered intensity label.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum IntensityLabel {
    #[serde(rename = "0")]
    Zero,
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5-")]
    FiveMinus,
    #[serde(rename = "5+")]
    FivePlus,
    #[serde(rename = "6-")]
    SixMinus,
    #[serde(rename = "6+")]
    SixPlus,
    #[serde(rename = "7")]
    Seven,
}

/// All labels in ascending order.
pub const ALL_LABELS: [IntensityLabel; 10] = [
    IntensityLabel::Zero,
    IntensityLabel::One,
    IntensityLabel::Two,
    IntensityLabel::Three,
    IntensityLabel::Four,
    IntensityLabel::FiveMinus,
    IntensityLabel::FivePlus,
    IntensityLabel::SixMinus,
    IntensityLabel::SixPlus,
    IntensityLabel::Seven,
];

impl IntensityLabel {
    /// The label's display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntensityLabel::Zero => "0",
            IntensityLabel::One => "1",
            IntensityLabel::Two => "2",
            IntensityLabel::Three => "3",
            IntensityLabel::Four => "4",
            IntensityLabel::FiveMinus => "5-",
            IntensityLabel::FivePlus => "5+",
            IntensityLabel::SixMinus => "6-",
            IntensityLabel::SixPlus => "6+",
            IntensityLabel::Seven => "7",
        }
    }

    /// Ordinal position in the scale (0 for `"0"`, 9 for `"7"`).
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// Numeric value used for comparisons in alert text: `"5+"` is 5.25,
    /// `"5-"` is 4.75, plain labels are their integer value.
    pub fn numeric(&self) -> f64 {
        match self {
            IntensityLabel::FiveMinus => 4.75,
            IntensityLabel::FivePlus => 5.25,
            IntensityLabel::SixMinus => 5.75,
            IntensityLabel::SixPlus => 6.25,
            IntensityLabel::Seven => 7.0,
            other => other.ordinal() as f64,
        }
    }

    /// Label for a threshold index (0 → `"1"`, 8 → `"7"`).
    pub fn from_threshold_index(index: usize) -> Self {
        ALL_LABELS[(index + 1).min(ALL_LABELS.len() - 1)]
    }

    /// The log10-PGA threshold (m/s²) that must be exceeded for this label.
    /// `"0"` has no threshold.
    pub fn log_pga_threshold(&self) -> Option<f64> {
        let ord = self.ordinal();
        if ord == 0 {
            None
        } else {
            Some(PGA_THRESHOLDS_MS2[ord - 1].log10())
        }
    }

    /// The highest label whose exceedance probability meets the cutoff.
    ///
    /// `probs[k]` is the probability of exceeding `PGA_THRESHOLDS_MS2[k]`.
    /// Returns `"0"` when none do.
    pub fn from_exceedance(probs: &[f64; THRESHOLD_COUNT], cutoff: f64) -> Self {
        let mut label = IntensityLabel::Zero;
        for (i, &p) in probs.iter().enumerate() {
            if p >= cutoff {
                label = Self::from_threshold_index(i);
            }
        }
        label
    }
}

impl std::fmt::Display for IntensityLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntensityLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_LABELS
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown intensity label: {s:?}"))
    }
}
