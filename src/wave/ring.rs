//! Per-channel circular sample store.
//!
//! Samples live at fixed positions derived from their absolute time: a
//! sample at time `t` has global index `round(t * rate)` and occupies the
//! physical slot `index mod capacity`. Sliding the window forward is then
//! just advancing the base index and invalidating the reused slots, so an
//! insert never moves existing data.

use super::filter::Bandpass;
use crate::config::defaults::FILTER_GAP_SAMPLES;

/// What happened to an inserted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Samples written into the ring.
    Inserted,
    /// Packet entirely older than the retained window; dropped silently.
    Stale,
    /// Packet re-delivered samples that are all present already; dropped.
    Duplicate,
    /// Forward jump past the retained window; the ring was reset around
    /// the packet.
    GapResync,
}

/// One channel's bounded ring of filtered samples plus validity bitmap.
#[derive(Debug, Clone)]
pub struct ChannelRing {
    rate: f64,
    capacity: usize,
    samples: Vec<f64>,
    valid: Vec<bool>,
    /// Global sample index of the oldest retained slot. The anchor time is
    /// `base / rate`.
    base: i64,
    initialized: bool,
    filter: Bandpass,
    /// One past the newest global index ever passed through the filter.
    filtered_through: i64,
}

impl ChannelRing {
    pub fn new(rate: f64, capacity: usize, filter: Bandpass) -> Self {
        Self {
            rate,
            capacity,
            samples: vec![0.0; capacity],
            valid: vec![false; capacity],
            base: 0,
            initialized: false,
            filter,
            filtered_through: i64::MIN,
        }
    }

    /// Absolute time of the oldest retained sample.
    pub fn anchor(&self) -> f64 {
        self.base as f64 / self.rate
    }

    #[inline]
    fn slot(&self, global: i64) -> usize {
        global.rem_euclid(self.capacity as i64) as usize
    }

    /// Insert gain-corrected samples starting at `start_time`, filtering
    /// them with the channel's continuous bandpass state.
    pub fn insert(&mut self, start_time: f64, data: &[f64]) -> InsertOutcome {
        if data.is_empty() {
            return InsertOutcome::Duplicate;
        }
        let len = data.len() as i64;
        let g0 = (start_time * self.rate).round() as i64;

        if !self.initialized {
            self.base = g0;
            self.initialized = true;
            self.filtered_through = g0;
        }

        let i0 = g0 - self.base;

        // Entirely older than the anchor.
        if i0 + len <= 0 {
            return InsertOutcome::Stale;
        }

        // Every targeted slot already valid and already filtered: a
        // re-delivery, not an overwrite of anything new.
        if g0 + len <= self.filtered_through
            && (g0..g0 + len).all(|g| {
                g >= self.base && g < self.base + self.capacity as i64 && self.valid[self.slot(g)]
            })
        {
            return InsertOutcome::Duplicate;
        }

        let mut outcome = InsertOutcome::Inserted;

        if i0 > self.capacity as i64 {
            // Forward jump past the whole window: reset around the packet.
            self.base = g0;
            self.valid.fill(false);
            self.filter.reset();
            self.filtered_through = g0;
            outcome = InsertOutcome::GapResync;
        } else if i0 + len > self.capacity as i64 {
            // Slide the window so the packet's end fits, invalidating the
            // rotated-out slots.
            let advance = i0 + len - self.capacity as i64;
            for g in self.base..self.base + advance {
                let slot = self.slot(g);
                self.valid[slot] = false;
            }
            self.base += advance;
        }

        // Inter-packet gap beyond tolerance: the delay line no longer
        // describes the signal leading into this packet.
        if g0 > self.filtered_through + FILTER_GAP_SAMPLES as i64
            && outcome != InsertOutcome::GapResync
        {
            self.filter.reset();
        }

        let mut filtered = data.to_vec();
        self.filter.process_block(&mut filtered);
        self.filtered_through = self.filtered_through.max(g0 + len);

        for (j, &value) in filtered.iter().enumerate() {
            let g = g0 + j as i64;
            if g < self.base {
                continue;
            }
            let slot = self.slot(g);
            self.samples[slot] = value;
            self.valid[slot] = true;
        }

        outcome
    }

    /// Copy out the `capacity` samples ending at `end_time`, aligned to the
    /// sample grid. Slots outside the retained window or never written come
    /// back as zero with `valid = false`.
    pub fn window_ending_at(&self, end_time: f64) -> (Vec<f64>, Vec<bool>) {
        let mut out = vec![0.0; self.capacity];
        let mut mask = vec![false; self.capacity];
        if !self.initialized {
            return (out, mask);
        }

        let g_end = (end_time * self.rate).round() as i64;
        let g_start = g_end - self.capacity as i64;
        let window_end = self.base + self.capacity as i64;

        for (i, g) in (g_start..g_end).enumerate() {
            if g >= self.base && g < window_end {
                let slot = self.slot(g);
                if self.valid[slot] {
                    out[i] = self.samples[slot];
                    mask[i] = true;
                }
            }
        }
        (out, mask)
    }

    /// Count of currently valid samples.
    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}
