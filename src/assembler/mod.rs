//! Tensor Assembler: deterministic construction of the inference input.
//!
//! Snapshots the wave buffer and static catalogs into the fixed-shape
//! bundle the predictor expects. The same buffer contents, tick request,
//! and catalogs always produce a byte-identical tensor: station selection
//! is ordered by (first pick time, station id), overflow drops the latest
//! picks, underflow rows stay zeroed and masked off.

use crate::catalog::Catalogs;
use crate::config::defaults::{K_META, K_TGT};
use crate::types::TickRequest;
use crate::wave::WaveBuffer;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AssembleError {
    /// No participating station produced a usable waveform window.
    #[error("no valid station windows for event {event_id} tick {tick_index}")]
    InsufficientData { event_id: u64, tick_index: u32 },
}

/// Fixed-shape input bundle for one inference call.
///
/// `waveform` is station-major then channel-major:
/// `waveform[s * 3 * window + c * window + i]`. `station_meta` rows carry
/// `[lat, lon, elev_m, vs30, norm_scale, secs_since_first_pick,
/// participation]`; `targets` rows carry `[lat, lon, vs30]`.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceInput {
    pub waveform: Vec<f64>,
    pub station_meta: Vec<f64>,
    pub targets: Vec<f64>,
    pub station_mask: Vec<bool>,
    /// Participating station ids, in tensor row order.
    pub station_names: Vec<String>,
    n_stations_max: usize,
    window_samples: usize,
    n_targets: usize,
}

impl InferenceInput {
    pub fn n_stations_max(&self) -> usize {
        self.n_stations_max
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    /// Stations actually populated.
    pub fn n_stations(&self) -> usize {
        self.station_names.len()
    }

    /// One channel row of one station's waveform block.
    pub fn channel(&self, station_row: usize, component: usize) -> &[f64] {
        let start = station_row * 3 * self.window_samples + component * self.window_samples;
        &self.waveform[start..start + self.window_samples]
    }

    /// One station's metadata row.
    pub fn meta_row(&self, station_row: usize) -> &[f64] {
        &self.station_meta[station_row * K_META..(station_row + 1) * K_META]
    }
}

/// Builds [`InferenceInput`]s from the live wave buffer and catalogs.
pub struct TensorAssembler {
    wave: Arc<WaveBuffer>,
    catalogs: Arc<Catalogs>,
    n_stations_max: usize,
    window_samples: usize,
}

impl TensorAssembler {
    pub fn new(
        wave: Arc<WaveBuffer>,
        catalogs: Arc<Catalogs>,
        n_stations_max: usize,
    ) -> Self {
        let window_samples = wave.window_samples();
        Self {
            wave,
            catalogs,
            n_stations_max,
            window_samples,
        }
    }

    /// Assemble the input bundle for one tick.
    pub fn assemble(&self, tick: &TickRequest) -> Result<InferenceInput, AssembleError> {
        let window = self.window_samples;
        let mut input = InferenceInput {
            waveform: vec![0.0; self.n_stations_max * 3 * window],
            station_meta: vec![0.0; self.n_stations_max * K_META],
            targets: Vec::with_capacity(self.catalogs.targets.len() * K_TGT),
            station_mask: vec![false; self.n_stations_max],
            station_names: Vec::new(),
            n_stations_max: self.n_stations_max,
            window_samples: window,
            n_targets: self.catalogs.targets.len(),
        };

        // Station order is fixed by the tick request; overflow past the
        // tensor's station dimension drops the latest picks.
        let mut row = 0;
        for entry in tick.station_pick_order.iter().take(self.n_stations_max) {
            let Some(meta) = self.catalogs.stations.get(&entry.station) else {
                debug!(station = %entry.station, "station absent from catalog, row skipped");
                continue;
            };
            let Some(block) = self.wave.read_window(&entry.station, tick.wave_end_time) else {
                debug!(station = %entry.station, "no waveform window, row skipped");
                continue;
            };

            // Demean each channel independently, then normalize the whole
            // station block by its global peak so the network sees shape;
            // the peak goes into the metadata row to preserve magnitude.
            let mut channels: [Vec<f64>; 3] = [
                block.z.samples.clone(),
                block.n.samples.clone(),
                block.e.samples.clone(),
            ];
            for channel in &mut channels {
                let mean = channel.iter().sum::<f64>() / channel.len() as f64;
                for sample in channel.iter_mut() {
                    *sample -= mean;
                }
            }
            let peak = channels
                .iter()
                .flat_map(|c| c.iter())
                .fold(0.0_f64, |acc, s| acc.max(s.abs()));
            let scale = if peak > 0.0 { peak } else { 1.0 };
            for channel in &mut channels {
                for sample in channel.iter_mut() {
                    *sample /= scale;
                }
            }

            for (c, channel) in channels.iter().enumerate() {
                let start = row * 3 * window + c * window;
                input.waveform[start..start + window].copy_from_slice(channel);
            }

            let vs30 = meta
                .vs30
                .unwrap_or_else(|| self.catalogs.vs30.lookup(meta.latitude, meta.longitude));
            let meta_row = [
                meta.latitude,
                meta.longitude,
                meta.elevation_m,
                vs30,
                scale,
                entry.pick_time - tick.first_pick_time,
                1.0,
            ];
            input.station_meta[row * K_META..(row + 1) * K_META].copy_from_slice(&meta_row);
            input.station_mask[row] = true;
            input.station_names.push(entry.station.clone());
            row += 1;
        }

        if row == 0 {
            return Err(AssembleError::InsufficientData {
                event_id: tick.event_id,
                tick_index: tick.tick_index,
            });
        }

        for target in self.catalogs.targets.targets() {
            input.targets.push(target.latitude);
            input.targets.push(target.longitude);
            input.targets.push(target.vs30);
        }

        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{StationCatalog, TargetCatalog, Vs30Grid};
    use crate::config::Config;
    use crate::types::{Component, StationMeta, StationPick, Target, WaveformPacket};

    fn station(lat: f64) -> StationMeta {
        StationMeta {
            latitude: lat,
            longitude: 121.0,
            elevation_m: 50.0,
            vs30: Some(500.0),
            site_class: None,
        }
    }

    fn catalogs() -> Arc<Catalogs> {
        Arc::new(Catalogs {
            stations: StationCatalog::from_entries([
                ("S1".to_string(), station(23.5)),
                ("S2".to_string(), station(23.6)),
                ("S3".to_string(), station(23.7)),
            ]),
            targets: TargetCatalog::from_targets(vec![
                Target {
                    name: "TAP".into(),
                    latitude: 25.0,
                    longitude: 121.5,
                    vs30: 450.0,
                    county: "Taipei".into(),
                },
                Target {
                    name: "HUA".into(),
                    latitude: 23.9,
                    longitude: 121.6,
                    vs30: 520.0,
                    county: "Hualien".into(),
                },
            ]),
            vs30: Vs30Grid::from_points(vec![(23.5, 121.0, 400.0)]),
        })
    }

    fn feed_station(buffer: &WaveBuffer, station: &str, amplitude: f64) {
        for component in Component::ALL {
            for k in 0..35 {
                let start = 70.0 + k as f64;
                let samples: Vec<f64> = (0..100)
                    .map(|i| {
                        let t = start + i as f64 / 100.0;
                        amplitude * (2.0 * std::f64::consts::PI * 1.5 * t).sin()
                    })
                    .collect();
                buffer
                    .insert(&WaveformPacket {
                        station: station.to_string(),
                        channel: component,
                        sample_rate_hz: 100.0,
                        start_time: start,
                        end_time: start + 1.0,
                        samples,
                        gain: 1.0,
                    })
                    .unwrap();
            }
        }
    }

    fn tick(stations: &[&str]) -> TickRequest {
        TickRequest {
            event_id: 1,
            tick_index: 1,
            wave_end_time: 104.0,
            first_pick_time: 100.0,
            station_pick_order: stations
                .iter()
                .enumerate()
                .map(|(i, s)| StationPick {
                    station: s.to_string(),
                    pick_time: 100.0 + i as f64 * 0.5,
                })
                .collect(),
            terminal: false,
        }
    }

    fn assembler(buffer: Arc<WaveBuffer>) -> TensorAssembler {
        TensorAssembler::new(buffer, catalogs(), 25)
    }

    #[test]
    fn output_shape_is_invariant() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        feed_station(&buffer, "S1", 2.0);
        let asm = assembler(Arc::clone(&buffer));

        let input = asm.assemble(&tick(&["S1"])).unwrap();
        assert_eq!(input.waveform.len(), 25 * 3 * 3000);
        assert_eq!(input.station_meta.len(), 25 * K_META);
        assert_eq!(input.targets.len(), 2 * K_TGT);
        assert_eq!(input.station_mask.len(), 25);
        assert_eq!(input.n_stations(), 1);
        assert!(input.station_mask[0]);
        assert!(!input.station_mask[1]);
    }

    #[test]
    fn missing_station_rows_are_skipped_not_padded() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        feed_station(&buffer, "S1", 2.0);
        feed_station(&buffer, "S3", 1.0);
        let asm = assembler(Arc::clone(&buffer));

        // S2 has no waveforms: its row is skipped and S3 moves up.
        let input = asm.assemble(&tick(&["S1", "S2", "S3"])).unwrap();
        assert_eq!(input.station_names, vec!["S1", "S3"]);
        assert!(input.station_mask[0] && input.station_mask[1]);
        assert!(!input.station_mask[2]);
    }

    #[test]
    fn normalization_peak_is_stored_in_meta() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        feed_station(&buffer, "S1", 4.0);
        let asm = assembler(Arc::clone(&buffer));

        let input = asm.assemble(&tick(&["S1"])).unwrap();
        let meta = input.meta_row(0);
        let scale = meta[4];
        assert!(scale > 0.0);

        // Every normalized sample is within [-1, 1] and the peak hits 1.
        let peak = (0..3)
            .flat_map(|c| input.channel(0, c).iter())
            .fold(0.0_f64, |acc, s| acc.max(s.abs()));
        assert!((peak - 1.0).abs() < 1e-12);

        // Metadata row layout.
        assert_eq!(meta[0], 23.5);
        assert_eq!(meta[3], 500.0);
        assert_eq!(meta[5], 0.0); // seconds since first pick
        assert_eq!(meta[6], 1.0); // participation flag
    }

    #[test]
    fn assembly_is_deterministic() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        feed_station(&buffer, "S1", 2.0);
        feed_station(&buffer, "S2", 3.0);
        let asm = assembler(Arc::clone(&buffer));

        let a = asm.assemble(&tick(&["S1", "S2"])).unwrap();
        let b = asm.assemble(&tick(&["S1", "S2"])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_valid_stations_is_insufficient_data() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        let asm = assembler(Arc::clone(&buffer));
        assert!(matches!(
            asm.assemble(&tick(&["S1", "S2"])),
            Err(AssembleError::InsufficientData { .. })
        ));
    }

    #[test]
    fn overflow_drops_latest_picks() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        feed_station(&buffer, "S1", 2.0);
        feed_station(&buffer, "S2", 2.0);
        feed_station(&buffer, "S3", 2.0);
        let asm = TensorAssembler::new(Arc::clone(&buffer), catalogs(), 2);

        let input = asm.assemble(&tick(&["S1", "S2", "S3"])).unwrap();
        assert_eq!(input.station_names, vec!["S1", "S2"]);
    }

    #[test]
    fn target_rows_follow_catalog_order() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        feed_station(&buffer, "S1", 2.0);
        let asm = assembler(Arc::clone(&buffer));

        let input = asm.assemble(&tick(&["S1"])).unwrap();
        assert_eq!(input.targets[0..3], [25.0, 121.5, 450.0]);
        assert_eq!(input.targets[3..6], [23.9, 121.6, 520.0]);
    }
}
