//! Wave Buffer: bounded per-channel rings of recent filtered ground motion.
//!
//! Absorbs ~100 Hz waveform packets across the whole station network with
//! per-channel isolation: each (station, component) ring lives in its own
//! map entry, so inserts on different channels never contend and a window
//! read holds the entry lock only for the copy-out.

mod filter;
mod ring;

pub use filter::Bandpass;
pub use ring::{ChannelRing, InsertOutcome};

use crate::config::Config;
use crate::types::{Component, WaveformPacket};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// Per-packet insertion failures. All are local: the ring continues.
#[derive(Debug, Error)]
pub enum WaveError {
    #[error("unsupported sample rate {got} Hz (expected {expected} Hz)")]
    UnsupportedRate { got: f64, expected: f64 },

    #[error("bad packet: {0}")]
    BadPacket(String),
}

/// A three-component window snapshot aligned to the sample grid.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBlock {
    pub z: ComponentWindow,
    pub n: ComponentWindow,
    pub e: ComponentWindow,
}

/// One component's samples with per-sample validity.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentWindow {
    pub samples: Vec<f64>,
    pub valid: Vec<bool>,
}

impl ChannelBlock {
    /// The component windows in Z/N/E order.
    pub fn components(&self) -> [&ComponentWindow; 3] {
        [&self.z, &self.n, &self.e]
    }
}

/// Monotonic observability counters for the buffer.
#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    dropped_stale: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_unsupported_rate: AtomicU64,
    dropped_bad_packet: AtomicU64,
    gap_resyncs: AtomicU64,
}

/// Snapshot of [`WaveBuffer`] health counters.
#[derive(Debug, Clone, Serialize)]
pub struct WaveBufferStats {
    pub channels: usize,
    pub inserted: u64,
    pub dropped_stale: u64,
    pub dropped_duplicate: u64,
    pub dropped_unsupported_rate: u64,
    pub dropped_bad_packet: u64,
    pub gap_resyncs: u64,
}

/// Bounded circular store of recent filtered waveforms for every channel.
pub struct WaveBuffer {
    rings: DashMap<(String, Component), ChannelRing>,
    rate: f64,
    window_samples: usize,
    bandpass_low_hz: f64,
    bandpass_high_hz: f64,
    bandpass_order: usize,
    counters: Counters,
}

impl WaveBuffer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            rings: DashMap::new(),
            rate: cfg.sample_rate_hz,
            window_samples: cfg.window_samples(),
            bandpass_low_hz: cfg.bandpass_low_hz,
            bandpass_high_hz: cfg.bandpass_high_hz,
            bandpass_order: cfg.bandpass_order,
            counters: Counters::default(),
        }
    }

    /// Insert one waveform packet: validate, gain-correct, filter, store.
    ///
    /// Failures are per-packet; counters record the reason.
    pub fn insert(&self, packet: &WaveformPacket) -> Result<InsertOutcome, WaveError> {
        if (packet.sample_rate_hz - self.rate).abs() > f64::EPSILON {
            self.counters
                .dropped_unsupported_rate
                .fetch_add(1, Ordering::Relaxed);
            return Err(WaveError::UnsupportedRate {
                got: packet.sample_rate_hz,
                expected: self.rate,
            });
        }
        if packet.samples.len() != packet.expected_len() {
            self.counters
                .dropped_bad_packet
                .fetch_add(1, Ordering::Relaxed);
            return Err(WaveError::BadPacket(format!(
                "{}.{}: {} samples for a {:.3} s span",
                packet.station,
                packet.channel,
                packet.samples.len(),
                packet.end_time - packet.start_time
            )));
        }
        if !(packet.gain.is_finite() && packet.gain != 0.0) {
            self.counters
                .dropped_bad_packet
                .fetch_add(1, Ordering::Relaxed);
            return Err(WaveError::BadPacket(format!(
                "{}.{}: non-finite or zero gain",
                packet.station, packet.channel
            )));
        }

        // Counts to physical units before filtering.
        let corrected: Vec<f64> = packet.samples.iter().map(|s| s / packet.gain).collect();

        let key = (packet.station.clone(), packet.channel);
        let mut ring = self.rings.entry(key).or_insert_with(|| {
            ChannelRing::new(
                self.rate,
                self.window_samples,
                Bandpass::new(
                    self.bandpass_order,
                    self.bandpass_low_hz,
                    self.bandpass_high_hz,
                    self.rate,
                ),
            )
        });

        let outcome = ring.insert(packet.start_time, &corrected);
        match outcome {
            InsertOutcome::Inserted => {
                self.counters.inserted.fetch_add(1, Ordering::Relaxed);
            }
            InsertOutcome::Stale => {
                self.counters.dropped_stale.fetch_add(1, Ordering::Relaxed);
            }
            InsertOutcome::Duplicate => {
                self.counters
                    .dropped_duplicate
                    .fetch_add(1, Ordering::Relaxed);
            }
            InsertOutcome::GapResync => {
                self.counters.gap_resyncs.fetch_add(1, Ordering::Relaxed);
                self.counters.inserted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    station = %packet.station,
                    channel = %packet.channel,
                    start = packet.start_time,
                    "ring reset on forward timestamp jump"
                );
            }
        }
        Ok(outcome)
    }

    /// Copy the last window of all three components ending at `end_time`.
    ///
    /// Returns `None` if any component ring is missing entirely. Invalid
    /// samples come back as zero with their mask bit cleared.
    pub fn read_window(&self, station: &str, end_time: f64) -> Option<ChannelBlock> {
        let mut windows = Vec::with_capacity(3);
        for component in Component::ALL {
            let key = (station.to_string(), component);
            let ring = self.rings.get(&key)?;
            let (samples, valid) = ring.window_ending_at(end_time);
            windows.push(ComponentWindow { samples, valid });
        }
        let e = windows.pop()?;
        let n = windows.pop()?;
        let z = windows.pop()?;
        Some(ChannelBlock { z, n, e })
    }

    /// Samples per window.
    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    /// Health counter snapshot.
    pub fn stats(&self) -> WaveBufferStats {
        WaveBufferStats {
            channels: self.rings.len(),
            inserted: self.counters.inserted.load(Ordering::Relaxed),
            dropped_stale: self.counters.dropped_stale.load(Ordering::Relaxed),
            dropped_duplicate: self.counters.dropped_duplicate.load(Ordering::Relaxed),
            dropped_unsupported_rate: self
                .counters
                .dropped_unsupported_rate
                .load(Ordering::Relaxed),
            dropped_bad_packet: self.counters.dropped_bad_packet.load(Ordering::Relaxed),
            gap_resyncs: self.counters.gap_resyncs.load(Ordering::Relaxed),
        }
    }
}
