//! System-wide default constants.
//!
//! Centralises the pipeline's magic numbers in one place. Grouped by
//! subsystem for easy discovery. Runtime overrides come from `TTSAM_*`
//! environment variables (see [`Config::from_env`](super::Config::from_env)).

// ============================================================================
// Wave Buffer
// ============================================================================

/// Ring retention window (seconds). 30 s at 100 Hz = 3 000 samples/channel.
pub const WINDOW_SECONDS: f64 = 30.0;

/// The only supported waveform sample rate (Hz). Other rates are rejected.
pub const SAMPLE_RATE_HZ: f64 = 100.0;

/// Bandpass lower corner (Hz).
pub const BANDPASS_LOW_HZ: f64 = 0.075;

/// Bandpass upper corner (Hz).
pub const BANDPASS_HIGH_HZ: f64 = 10.0;

/// Butterworth order per bandpass edge.
pub const BANDPASS_ORDER: usize = 4;

/// Inter-packet gap (in sample periods) beyond which the channel filter
/// state is reset before filtering the new packet.
pub const FILTER_GAP_SAMPLES: f64 = 2.0;

// ============================================================================
// Pick Aggregator / Event Trigger
// ============================================================================

/// Minimum co-picking stations required to open an event.
pub const TRIGGER_MIN_STATIONS: usize = 3;

/// All trigger picks must fall within this span of each other (seconds).
pub const TRIGGER_WINDOW_SECONDS: f64 = 15.0;

/// Pairwise great-circle gate between trigger stations (km).
pub const TRIGGER_SPATIAL_KM: f64 = 120.0;

/// Two picks from one station closer than this are duplicates (seconds).
pub const EPSILON_PICK: f64 = 0.5;

/// A new pick extends the active event if within this span of the latest
/// accepted pick (seconds).
pub const EVENT_LINGER_SECONDS: f64 = 20.0;

/// Wall-clock silence after the last accepted pick before the event drains
/// to a terminal tick (seconds).
pub const EVENT_DRAIN_SECONDS: f64 = 30.0;

/// Inference cadence during an active event (seconds, wall clock).
pub const TICK_INTERVAL_SECONDS: f64 = 1.0;

/// Delay between the first pick and the first tick, giving waveforms time
/// to accumulate (seconds).
pub const INITIAL_DELAY_SECONDS: f64 = 3.0;

/// Coarse cooperative timer period for the aggregator loop (milliseconds).
pub const TIMER_POLL_MS: u64 = 100;

/// Bounded tick-request queue depth. On overflow the oldest non-terminal
/// request is dropped.
pub const TICK_QUEUE_CAPACITY: usize = 8;

// ============================================================================
// Tensor Assembler
// ============================================================================

/// Fixed station dimension of the inference input.
pub const N_STATIONS_MAX: usize = 25;

/// Station metadata columns:
/// `[lat, lon, elev_m, vs30, norm_scale, secs_since_first_pick, participation]`.
pub const K_META: usize = 7;

/// Target metadata columns: `[lat, lon, vs30]`.
pub const K_TGT: usize = 3;

// ============================================================================
// Inference Dispatch
// ============================================================================

/// Soft budget for one predictor call (seconds). Over-budget ticks are
/// classified `predict_timeout`.
pub const PREDICT_TIMEOUT_SECONDS: f64 = 2.5;

/// Exceedance probability a threshold must reach to set the intensity label.
pub const INTENSITY_PROB_CUTOFF: f64 = 0.5;

/// Targets at or above this label enter the alarm list.
pub const ALARM_MIN_INTENSITY: &str = "4";

/// Broadcast capacity of the report view channel.
pub const VIEW_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Transports
// ============================================================================

/// Initial reconnection delay (seconds, doubles each attempt).
pub const INITIAL_RECONNECT_DELAY_SECS: u64 = 1;

/// Backoff cap for transport retries (seconds).
pub const MAX_RECONNECT_DELAY_SECS: u64 = 5;

/// Consecutive reconnection attempts before the transport is declared
/// unrecoverable.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Per-line read timeout on TCP transports (seconds).
pub const READ_TIMEOUT_SECS: u64 = 120;

// ============================================================================
// Catalogs
// ============================================================================

/// Station table file name under the data directory.
pub const SITE_INFO_FILE: &str = "site_info.csv";

/// Target list file name under the data directory.
pub const TARGET_FILE: &str = "eew_target.csv";

/// Vs30 grid file name under the data directory.
pub const VS30_GRID_FILE: &str = "vs30_grid.csv";

/// Bin width (degrees) of the Vs30 nearest-cell index.
pub const VS30_BIN_DEGREES: f64 = 0.05;
