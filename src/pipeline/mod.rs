//! Long-lived component loops.
//!
//! One loop per pipeline thread: the wave ingestor feeding the wave
//! buffer, and the pick loop driving the aggregator's state machine from
//! the pick source plus a coarse 100 ms timer. Each loop `select!`s on the
//! shared cancellation token and reports its final counters on exit.

use crate::config::defaults::TIMER_POLL_MS;
use crate::ingest::{PickSource, SourceEvent, WaveSource};
use crate::picks::{PickAggregator, PickDisposition, TickQueue};
use crate::report::PickLog;
use crate::types::unix_now;
use crate::wave::WaveBuffer;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Final statistics of the wave ingest loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub packets_received: u64,
    pub packets_rejected: u64,
}

/// Pulls waveform packets from the transport into the wave buffer.
pub struct WaveIngestLoop {
    buffer: Arc<WaveBuffer>,
    cancel: CancellationToken,
}

impl WaveIngestLoop {
    pub fn new(buffer: Arc<WaveBuffer>, cancel: CancellationToken) -> Self {
        Self { buffer, cancel }
    }

    /// Run until EOF, cancellation, or an unrecoverable transport error.
    pub async fn run<S: WaveSource>(self, source: &mut S) -> anyhow::Result<IngestStats> {
        info!("[WaveIngest] reading from {}", source.source_name());
        let mut stats = IngestStats::default();

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[WaveIngest] shutdown signal received");
                    break;
                }
                result = source.next_wave() => result?,
            };

            match event {
                SourceEvent::Message(packet) => {
                    stats.packets_received += 1;
                    if let Err(e) = self.buffer.insert(&packet) {
                        stats.packets_rejected += 1;
                        debug!(error = %e, "packet rejected");
                    }
                }
                SourceEvent::Eof => {
                    info!(
                        packets = stats.packets_received,
                        "[WaveIngest] source reached end"
                    );
                    break;
                }
            }
        }

        let buffer_stats = self.buffer.stats();
        info!(
            received = stats.packets_received,
            rejected = stats.packets_rejected,
            channels = buffer_stats.channels,
            gap_resyncs = buffer_stats.gap_resyncs,
            "[WaveIngest] final statistics"
        );
        Ok(stats)
    }
}

/// Drives the pick aggregator from the pick transport and a coarse timer.
pub struct PickLoop {
    aggregator: PickAggregator,
    queue: Arc<TickQueue>,
    pick_log: PickLog,
    cancel: CancellationToken,
}

impl PickLoop {
    pub fn new(
        aggregator: PickAggregator,
        queue: Arc<TickQueue>,
        pick_log: PickLog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            aggregator,
            queue,
            pick_log,
            cancel,
        }
    }

    /// Run until EOF, cancellation, or an unrecoverable transport error.
    pub async fn run<S: PickSource>(mut self, source: &mut S) -> anyhow::Result<()> {
        info!("[PickLoop] reading from {}", source.source_name());
        let mut timer =
            tokio::time::interval(std::time::Duration::from_millis(TIMER_POLL_MS));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[PickLoop] shutdown signal received");
                    break;
                }
                _ = timer.tick() => {
                    for tick in self.aggregator.on_timer(unix_now()) {
                        self.queue.push(tick);
                    }
                }
                result = source.next_pick() => {
                    match result? {
                        SourceEvent::Message((pick, raw_line)) => {
                            let now = unix_now();
                            let outcome = self.aggregator.on_pick(&pick, now);
                            if outcome.disposition == PickDisposition::Accepted {
                                self.pick_log.append(now, &raw_line);
                            }
                            for tick in outcome.ticks {
                                self.queue.push(tick);
                            }
                        }
                        SourceEvent::Eof => {
                            info!("[PickLoop] source reached end");
                            break;
                        }
                    }
                }
            }
        }

        // Finalize: if an event is still active, let it drain later runs
        // handle; report what happened this run.
        let stats = self.aggregator.stats();
        if self.queue.dropped() > 0 {
            warn!(
                dropped = self.queue.dropped(),
                "tick requests shed under backpressure"
            );
        }
        info!(
            received = stats.picks_received,
            accepted = stats.picks_accepted,
            deduplicated = stats.picks_deduplicated,
            events = stats.events_started,
            ticks = stats.ticks_emitted,
            "[PickLoop] final statistics"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StationCatalog;
    use crate::config::Config;
    use crate::ingest::{ReplayPickSource, ReplayWaveSource};
    use crate::types::{Component, Phase, Pick, StationMeta, WaveformPacket};

    fn packets(station: &str, seconds: usize) -> Vec<WaveformPacket> {
        let mut out = Vec::new();
        for component in Component::ALL {
            for k in 0..seconds {
                let start = k as f64;
                out.push(WaveformPacket {
                    station: station.to_string(),
                    channel: component,
                    sample_rate_hz: 100.0,
                    start_time: start,
                    end_time: start + 1.0,
                    samples: vec![0.5; 100],
                    gain: 1.0,
                });
            }
        }
        out
    }

    #[tokio::test]
    async fn wave_loop_fills_buffer_until_eof() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        let cancel = CancellationToken::new();
        let mut source = ReplayWaveSource::new(packets("A001", 5), 0);

        let stats = WaveIngestLoop::new(Arc::clone(&buffer), cancel)
            .run(&mut source)
            .await
            .unwrap();
        assert_eq!(stats.packets_received, 15);
        assert_eq!(stats.packets_rejected, 0);
        assert!(buffer.read_window("A001", 5.0).is_some());
    }

    #[tokio::test]
    async fn wave_loop_counts_rejects() {
        let buffer = Arc::new(WaveBuffer::new(&Config::default()));
        let cancel = CancellationToken::new();
        let mut bad = packets("A001", 1);
        bad[0].sample_rate_hz = 20.0;
        let mut source = ReplayWaveSource::new(bad, 0);

        let stats = WaveIngestLoop::new(buffer, cancel)
            .run(&mut source)
            .await
            .unwrap();
        assert_eq!(stats.packets_rejected, 1);
    }

    #[tokio::test]
    async fn pick_loop_logs_accepted_picks() {
        let dir = tempfile::tempdir().unwrap();
        let stations = Arc::new(StationCatalog::from_entries([(
            "A001".to_string(),
            StationMeta {
                latitude: 23.5,
                longitude: 121.0,
                elevation_m: 10.0,
                vs30: None,
                site_class: None,
            },
        )]));
        let aggregator = PickAggregator::new(&Config::default(), stations);
        let queue = Arc::new(TickQueue::new(8));
        let cancel = CancellationToken::new();

        let pick = Pick {
            station: "A001".to_string(),
            phase: Phase::P,
            pick_time: unix_now(),
            weight: 1.0,
            amplitude_proxy: 0.1,
        };
        let mut source = ReplayPickSource::new(
            vec![(pick, "A001 raw pick line with thirteen fields etc".to_string())],
            0,
        );

        PickLoop::new(aggregator, queue, PickLog::new(dir.path()), cancel)
            .run(&mut source)
            .await
            .unwrap();

        let pick_dir = dir.path().join("pick");
        let files: Vec<_> = std::fs::read_dir(&pick_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content = std::fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("A001 raw pick line"));
    }
}
