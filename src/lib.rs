//! TTSAM Realtime: earthquake shaking-intensity forecasting pipeline.
//!
//! Ingests 3-component ground-motion waveforms and P-phase picks from a
//! seismic station network, and on every qualifying trigger assembles a
//! fixed-shape tensor of recent motion plus site metadata, runs the
//! trained intensity network, and publishes per-target PGA-exceedance
//! reports.
//!
//! ## Architecture
//!
//! - **Wave Buffer**: per-channel bounded rings of bandpassed samples,
//!   keyed by absolute sample time
//! - **Pick Aggregator**: deduplicating P-pick store with the co-pick
//!   event trigger and tick scheduler
//! - **Tensor Assembler**: deterministic fixed-shape inference inputs
//! - **Inference Dispatcher**: serial predictor pump, report log, and
//!   outward publishing

pub mod assembler;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod ingest;
pub mod picks;
pub mod pipeline;
pub mod predict;
pub mod report;
pub mod types;
pub mod wave;

// Re-export the types that cross component boundaries.
pub use assembler::{AssembleError, InferenceInput, TensorAssembler};
pub use catalog::{CatalogError, Catalogs, StationCatalog, TargetCatalog, Vs30Grid};
pub use config::Config;
pub use dispatch::InferenceDispatcher;
pub use picks::{PickAggregator, TickQueue};
pub use predict::{InferenceOutput, PredictError, Predictor, TargetMixture};
pub use report::{Report, ReportKind};
pub use types::intensity::IntensityLabel;
pub use types::{Pick, StationMeta, Target, TickRequest, WaveformPacket};
pub use wave::{ChannelBlock, WaveBuffer, WaveError};
