//! Pipeline Scenario Tests
//!
//! Exercises the wave buffer, pick aggregator, and inference dispatcher
//! together through the seed scenarios: cold start, minimal trigger, pick
//! dedup, gap resync, predictor timeout, and intensity labeling.

use std::sync::Arc;

use ttsam_realtime::assembler::TensorAssembler;
use ttsam_realtime::bus::{view_channel, LogPublisher};
use ttsam_realtime::catalog::{Catalogs, StationCatalog, TargetCatalog, Vs30Grid};
use ttsam_realtime::config::Config;
use ttsam_realtime::dispatch::InferenceDispatcher;
use ttsam_realtime::picks::{PickAggregator, PickDisposition};
use ttsam_realtime::predict::{
    InferenceOutput, NullPredictor, PredictError, Predictor, TargetMixture,
};
use ttsam_realtime::report::Report;
use ttsam_realtime::types::intensity::{IntensityLabel, PGA_THRESHOLDS_MS2};
use ttsam_realtime::types::{Component, Phase, Pick, StationMeta, WaveformPacket};
use ttsam_realtime::wave::WaveBuffer;

// ============================================================================
// Helpers
// ============================================================================

/// Ten stations in a ~30 km cluster.
fn station_cluster() -> Vec<(String, StationMeta)> {
    (0..10)
        .map(|i| {
            (
                format!("S{i:02}"),
                StationMeta {
                    latitude: 23.5 + 0.02 * i as f64,
                    longitude: 121.0 + 0.02 * i as f64,
                    elevation_m: 100.0 + i as f64,
                    vs30: Some(500.0),
                    site_class: None,
                },
            )
        })
        .collect()
}

fn catalogs() -> Arc<Catalogs> {
    Arc::new(Catalogs {
        stations: StationCatalog::from_entries(station_cluster()),
        targets: TargetCatalog::from_targets(vec![
            ttsam_realtime::Target {
                name: "TAP".into(),
                latitude: 25.04,
                longitude: 121.51,
                vs30: 450.0,
                county: "Taipei".into(),
            },
            ttsam_realtime::Target {
                name: "HUA".into(),
                latitude: 23.97,
                longitude: 121.60,
                vs30: 520.0,
                county: "Hualien".into(),
            },
        ]),
        vs30: Vs30Grid::from_points(vec![(23.5, 121.0, 460.0)]),
    })
}

/// Feed `seconds` of clean 100 Hz 3-component waveform starting at `t0`.
fn feed_waves(buffer: &WaveBuffer, station: &str, t0: f64, seconds: usize) {
    for component in Component::ALL {
        for k in 0..seconds {
            let start = t0 + k as f64;
            let samples: Vec<f64> = (0..100)
                .map(|i| {
                    let t = start + i as f64 / 100.0;
                    20.0 * (2.0 * std::f64::consts::PI * 1.2 * t).sin()
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
                    gain: 3.2e-6,
                })
                .expect("packet insert");
        }
    }
}

fn p_pick(station: &str, time: f64, weight: f64) -> Pick {
    Pick {
        station: station.to_string(),
        phase: Phase::P,
        pick_time: time,
        weight,
        amplitude_proxy: 0.05,
    }
}

fn dispatcher(
    buffer: Arc<WaveBuffer>,
    predictor: Box<dyn Predictor>,
    log_dir: &std::path::Path,
) -> InferenceDispatcher {
    let catalogs = catalogs();
    let assembler = TensorAssembler::new(buffer, Arc::clone(&catalogs), 25);
    let (view_tx, _view_rx) = view_channel(16);
    InferenceDispatcher::new(
        &Config::default(),
        assembler,
        predictor,
        catalogs,
        Arc::new(LogPublisher),
        view_tx,
        log_dir.into(),
    )
}

fn read_report_lines(log_dir: &std::path::Path) -> Vec<Report> {
    let report_dir = log_dir.join("report");
    let mut out = Vec::new();
    for entry in std::fs::read_dir(report_dir).unwrap() {
        let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        for line in content.lines() {
            out.push(serde_json::from_str::<Report>(line).unwrap());
        }
    }
    out
}

// ============================================================================
// S1 - Cold start, no picks
// ============================================================================

#[test]
fn s1_cold_start_produces_no_reports_and_full_windows() {
    let buffer = WaveBuffer::new(&Config::default());
    for (station, _) in station_cluster() {
        feed_waves(&buffer, &station, 0.0, 60);
    }

    let mut aggregator = PickAggregator::new(&Config::default(), Arc::new(
        StationCatalog::from_entries(station_cluster()),
    ));
    // Sixty seconds of timer polling with no picks: nothing fires.
    let mut t = 0.0;
    while t < 60.0 {
        assert!(aggregator.on_timer(t).is_empty());
        t += 0.1;
    }
    assert!(!aggregator.is_active());
    assert_eq!(aggregator.stats().events_started, 0);

    // After the first 30 s every window read is fully valid.
    let block = buffer.read_window("S00", 60.0).expect("window");
    for component in block.components() {
        assert_eq!(component.samples.len(), 3000);
        assert!(component.valid.iter().all(|&v| v));
    }
}

// ============================================================================
// S2 - Minimal trigger
// ============================================================================

#[test]
fn s2_minimal_trigger_fires_first_tick_after_initial_delay() {
    let cfg = Config::default();
    let buffer = Arc::new(WaveBuffer::new(&cfg));
    for (station, _) in station_cluster() {
        feed_waves(&buffer, &station, 70.0, 35);
    }

    let mut aggregator = PickAggregator::new(&cfg, Arc::new(
        StationCatalog::from_entries(station_cluster()),
    ));
    aggregator.on_pick(&p_pick("S00", 100.00, 1.0), 100.00);
    aggregator.on_pick(&p_pick("S01", 100.50, 1.0), 100.50);
    assert!(!aggregator.is_active());
    aggregator.on_pick(&p_pick("S02", 101.00, 1.0), 101.00);
    assert!(aggregator.is_active());

    // No tick before first_pick_time + INITIAL_DELAY_SECONDS.
    assert!(aggregator.on_timer(102.9).is_empty());
    let ticks = aggregator.on_timer(103.0);
    assert_eq!(ticks.len(), 1);
    let tick = &ticks[0];
    assert_eq!(tick.first_pick_time, 100.00);
    assert_eq!(tick.picks_count(), 3);

    // The dispatcher turns it into a logged report with picks = 3.
    let dir = tempfile::tempdir().unwrap();
    let mut dispatcher = dispatcher(buffer, Box::new(NullPredictor), dir.path());
    let report = dispatcher.process_tick(tick, 103.0).expect("report");
    assert_eq!(report.picks, 3);
    assert_eq!(report.event_id, 1);

    let logged = read_report_lines(dir.path());
    assert!(!logged.is_empty());
    assert!(logged.iter().all(|r| r.picks == 3));
    assert!(logged.iter().all(|r| r.run_time > 0.0));
    assert!(logged.iter().all(|r| r.wave_lag >= 0.0));
}

// ============================================================================
// S3 - Dedup pick
// ============================================================================

#[test]
fn s3_duplicate_pick_is_dropped_keeping_better_record() {
    let cfg = Config::default();
    let mut aggregator = PickAggregator::new(&cfg, Arc::new(
        StationCatalog::from_entries(station_cluster()),
    ));
    aggregator.on_pick(&p_pick("S00", 100.00, 2.0), 100.00);
    aggregator.on_pick(&p_pick("S01", 100.50, 1.0), 100.50);
    aggregator.on_pick(&p_pick("S02", 101.00, 1.0), 101.00);
    assert!(aggregator.is_active());

    // Duplicate for S00 at t=100.10 with lower weight.
    let outcome = aggregator.on_pick(&p_pick("S00", 100.10, 1.0), 100.10);
    assert_eq!(outcome.disposition, PickDisposition::Deduplicated);
    assert_eq!(aggregator.stats().picks_deduplicated, 1);

    // The accepted set still lists S00 exactly once, with the original
    // pick time.
    let ticks = aggregator.on_timer(103.0);
    let tick = &ticks[0];
    let s00: Vec<_> = tick
        .station_pick_order
        .iter()
        .filter(|p| p.station == "S00")
        .collect();
    assert_eq!(s00.len(), 1);
    assert_eq!(s00[0].pick_time, 100.00);
}

// ============================================================================
// S4 - Gap resync
// ============================================================================

#[test]
fn s4_forward_jump_resets_ring_and_counts_resync() {
    let cfg = Config::default();
    let buffer = WaveBuffer::new(&cfg);
    feed_waves(&buffer, "S00", 170.0, 30);
    assert_eq!(buffer.stats().gap_resyncs, 0);

    // One packet far in the future on the Z channel only.
    buffer
        .insert(&WaveformPacket {
            station: "S00".into(),
            channel: Component::Z,
            sample_rate_hz: 100.0,
            start_time: 260.0,
            end_time: 261.0,
            samples: vec![1.0; 100],
            gain: 1.0,
        })
        .unwrap();
    assert_eq!(buffer.stats().gap_resyncs, 1);

    let block = buffer.read_window("S00", 260.2).expect("window");
    // Z: anchor advanced, only the newest samples valid.
    assert!(block.z.valid[..2900].iter().all(|&v| !v));
    assert!(block.z.valid[2980..].iter().all(|&v| v));
    // N kept its old (now out-of-window) data: nothing valid at 260.2.
    assert!(block.n.valid.iter().all(|&v| !v));
}

// ============================================================================
// S5 - Predictor timeout
// ============================================================================

struct SleepyPredictor;

impl Predictor for SleepyPredictor {
    fn predict(
        &mut self,
        input: &ttsam_realtime::InferenceInput,
    ) -> Result<InferenceOutput, PredictError> {
        std::thread::sleep(std::time::Duration::from_secs(3));
        NullPredictor.predict(input)
    }
}

#[test]
fn s5_slow_predictor_yields_timeout_records_and_event_continues() {
    let cfg = Config::default();
    let buffer = Arc::new(WaveBuffer::new(&cfg));
    for (station, _) in station_cluster().into_iter().take(3) {
        feed_waves(&buffer, &station, 70.0, 35);
    }

    let mut aggregator = PickAggregator::new(&cfg, Arc::new(
        StationCatalog::from_entries(station_cluster()),
    ));
    aggregator.on_pick(&p_pick("S00", 100.00, 1.0), 100.00);
    aggregator.on_pick(&p_pick("S01", 100.50, 1.0), 100.50);
    aggregator.on_pick(&p_pick("S02", 101.00, 1.0), 101.00);

    let dir = tempfile::tempdir().unwrap();
    let mut dispatcher = dispatcher(buffer, Box::new(SleepyPredictor), dir.path());

    let first_batch = aggregator.on_timer(103.0);
    let second_batch = aggregator.on_timer(104.0);
    for tick in first_batch.iter().chain(second_batch.iter()) {
        dispatcher.process_tick(tick, 104.0 + tick.tick_index as f64);
    }

    let logged = read_report_lines(dir.path());
    assert_eq!(logged.len(), 2);
    assert!(logged
        .iter()
        .all(|r| r.kind == ttsam_realtime::ReportKind::PredictTimeout));
    assert!(logged.iter().all(|r| r.event_id == 1));
    let mut indices: Vec<u32> = logged.iter().map(|r| r.tick_index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![1, 2]);
}

// ============================================================================
// S6 - Intensity labeling
// ============================================================================

/// Predictor whose first target exceeds "4" with p=0.8 and "5-" with
/// p=0.3 (cutoff 0.5 labels it "4"); second target stays quiet.
struct CalibratedPredictor;

impl Predictor for CalibratedPredictor {
    fn predict(
        &mut self,
        _input: &ttsam_realtime::InferenceInput,
    ) -> Result<InferenceOutput, PredictError> {
        let t4 = PGA_THRESHOLDS_MS2[3].log10();
        let t5m = PGA_THRESHOLDS_MS2[4].log10();
        let hot = TargetMixture {
            weights: vec![0.5, 0.3, 0.2],
            means: vec![(t4 + t5m) / 2.0, t5m + 1.0, t4 - 1.0],
            log_stddevs: vec![0.01_f64.ln(); 3],
        };
        let quiet = TargetMixture {
            weights: vec![1.0],
            means: vec![-5.0],
            log_stddevs: vec![-2.0],
        };
        Ok(InferenceOutput {
            mixtures: vec![hot, quiet],
        })
    }
}

#[test]
fn s6_exceedance_labels_and_alarm_list() {
    let cfg = Config::default();
    let buffer = Arc::new(WaveBuffer::new(&cfg));
    feed_waves(&buffer, "S00", 70.0, 35);

    let dir = tempfile::tempdir().unwrap();
    let mut dispatcher = dispatcher(buffer, Box::new(CalibratedPredictor), dir.path());

    let tick = ttsam_realtime::TickRequest {
        event_id: 1,
        tick_index: 1,
        wave_end_time: 103.0,
        first_pick_time: 100.0,
        station_pick_order: vec![ttsam_realtime::types::StationPick {
            station: "S00".into(),
            pick_time: 100.0,
        }],
        terminal: false,
    };
    let report = dispatcher.process_tick(&tick, 104.0).expect("report");

    assert_eq!(report.per_target["TAP"], IntensityLabel::Four);
    assert_eq!(report.per_target["HUA"], IntensityLabel::Zero);
    assert_eq!(report.alarm, vec!["TAP".to_string()]);
    assert_eq!(report.alarm_county, vec!["Taipei".to_string()]);
    assert_eq!(report.new_alarm_county, vec!["Taipei".to_string()]);
}

// ============================================================================
// Report round-trip fidelity
// ============================================================================

#[test]
fn report_round_trip_preserves_numeric_fields() {
    let cfg = Config::default();
    let buffer = Arc::new(WaveBuffer::new(&cfg));
    feed_waves(&buffer, "S00", 70.0, 35);

    let dir = tempfile::tempdir().unwrap();
    let mut dispatcher = dispatcher(buffer, Box::new(NullPredictor), dir.path());

    let tick = ttsam_realtime::TickRequest {
        event_id: 1,
        tick_index: 1,
        wave_end_time: 103.0,
        first_pick_time: 100.0,
        station_pick_order: vec![ttsam_realtime::types::StationPick {
            station: "S00".into(),
            pick_time: 100.0,
        }],
        terminal: false,
    };
    let report = dispatcher.process_tick(&tick, 104.25).expect("report");

    let json = serde_json::to_string(&report).unwrap();
    let back: Report = serde_json::from_str(&json).unwrap();
    assert!((back.wave_time - report.wave_time).abs() < 1e-6);
    assert!((back.wave_lag - report.wave_lag).abs() < 1e-6);
    assert!((back.run_time - report.run_time).abs() < 1e-6);
    assert_eq!(back.per_target, report.per_target);
    assert_eq!(back, report);
}
