//! Inference Dispatcher: the single consumer that turns tick requests into
//! published reports.
//!
//! Owns the only `Predictor` instance and strictly serializes calls into
//! it, so reports within an event are emitted in tick order. Predictor
//! failures and over-budget calls degrade to error records; the event
//! always continues and downstream observers keep seeing liveness.

use crate::assembler::{AssembleError, TensorAssembler};
use crate::bus::{ReportPublisher, ViewEvent};
use crate::catalog::Catalogs;
use crate::config::Config;
use crate::picks::TickQueue;
use crate::predict::{InferenceOutput, Predictor};
use crate::report::{
    format_alert, utc_from_unix, CountyAlarm, Report, ReportKind, ReportLog,
};
use crate::types::intensity::IntensityLabel;
use crate::types::TickRequest;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dispatcher health counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub ticks_processed: u64,
    pub ticks_skipped: u64,
    pub predict_failures: u64,
    pub predict_timeouts: u64,
    pub reports_published: u64,
}

/// Serial pump from tick requests through the predictor to the outward
/// surfaces.
pub struct InferenceDispatcher {
    assembler: TensorAssembler,
    predictor: Box<dyn Predictor>,
    catalogs: Arc<Catalogs>,
    publisher: Arc<dyn ReportPublisher>,
    view_tx: broadcast::Sender<ViewEvent>,
    log_dir: PathBuf,
    intensity_cutoff: f64,
    alarm_min: IntensityLabel,
    predict_timeout: f64,
    county: CountyAlarm,
    current_log: Option<(u64, ReportLog)>,
    stats: DispatchStats,
}

impl InferenceDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &Config,
        assembler: TensorAssembler,
        predictor: Box<dyn Predictor>,
        catalogs: Arc<Catalogs>,
        publisher: Arc<dyn ReportPublisher>,
        view_tx: broadcast::Sender<ViewEvent>,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            assembler,
            predictor,
            catalogs,
            publisher,
            view_tx,
            log_dir,
            intensity_cutoff: cfg.intensity_cutoff,
            alarm_min: cfg.alarm_min_intensity,
            predict_timeout: cfg.predict_timeout_seconds,
            county: CountyAlarm::new(),
            current_log: None,
            stats: DispatchStats::default(),
        }
    }

    /// Consume tick requests until shutdown, draining the queue before
    /// exit so a terminal tick always closes its event.
    pub async fn run(mut self, queue: Arc<TickQueue>, cancel: CancellationToken) -> DispatchStats {
        info!("[Dispatcher] task starting");
        loop {
            let tick = tokio::select! {
                _ = cancel.cancelled() => break,
                tick = queue.pop() => tick,
            };
            // The predictor is a blocking call; keep the runtime healthy.
            tokio::task::block_in_place(|| {
                self.process_tick(&tick, crate::types::unix_now());
            });
        }

        while let Some(tick) = queue.try_pop() {
            tokio::task::block_in_place(|| {
                self.process_tick(&tick, crate::types::unix_now());
            });
        }
        info!(
            processed = self.stats.ticks_processed,
            skipped = self.stats.ticks_skipped,
            timeouts = self.stats.predict_timeouts,
            "[Dispatcher] shutdown complete"
        );
        self.stats
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Run one tick: assemble, predict, label, persist, publish.
    ///
    /// Returns the report, or `None` when the tick was skipped for lack of
    /// data.
    pub fn process_tick(&mut self, tick: &TickRequest, now: f64) -> Option<Report> {
        self.rotate_log(tick);

        let t_start = Instant::now();
        let result = match self.assembler.assemble(tick) {
            Ok(input) => Some(self.predictor.predict(&input)),
            Err(AssembleError::InsufficientData { event_id, tick_index }) => {
                debug!(event_id, tick_index, "tick skipped: no valid station windows");
                self.stats.ticks_skipped += 1;
                None
            }
        };

        let report = result.map(|outcome| {
            let elapsed = t_start.elapsed().as_secs_f64();
            let (kind, output) = self.classify(outcome, elapsed, tick);
            self.build_report(tick, now, elapsed, kind, output)
        });

        if let Some(ref report) = report {
            if let Some((_, log)) = self.current_log.as_mut() {
                if let Err(e) = log.append(report) {
                    warn!(error = %e, "report log write failed");
                }
            }

            let alert = if report.new_alarm_county.is_empty() {
                None
            } else {
                Some(format_alert(report, &self.county))
            };
            self.publisher.publish(report, alert.as_deref());
            let _ = self
                .view_tx
                .send(ViewEvent::Report(Arc::new(report.clone())));
            self.stats.reports_published += 1;
            self.stats.ticks_processed += 1;
        }

        if tick.terminal {
            info!(event_id = tick.event_id, "event closed");
            self.current_log = None;
            self.county.reset();
        }

        report
    }

    /// Open the event's report log when the event changes.
    fn rotate_log(&mut self, tick: &TickRequest) {
        let stale = match &self.current_log {
            Some((event_id, _)) => *event_id != tick.event_id,
            None => true,
        };
        if !stale {
            return;
        }
        self.county.reset();
        match ReportLog::open(&self.log_dir, tick.event_id, tick.first_pick_time) {
            Ok(log) => {
                info!(
                    event_id = tick.event_id,
                    path = %log.path().display(),
                    "event report log opened"
                );
                self.current_log = Some((tick.event_id, log));
            }
            Err(e) => {
                warn!(event_id = tick.event_id, error = %e, "cannot open report log");
                self.current_log = None;
            }
        }
    }

    /// Classify the predictor outcome against the soft budget.
    fn classify(
        &mut self,
        outcome: Result<InferenceOutput, crate::predict::PredictError>,
        elapsed: f64,
        tick: &TickRequest,
    ) -> (ReportKind, Option<InferenceOutput>) {
        match outcome {
            Ok(output) => {
                if let Err(e) = output.validate() {
                    warn!(event_id = tick.event_id, tick = tick.tick_index, error = %e,
                        "predictor output rejected");
                    self.stats.predict_failures += 1;
                    return (ReportKind::PredictFailed, None);
                }
                if elapsed > self.predict_timeout {
                    warn!(
                        event_id = tick.event_id,
                        tick = tick.tick_index,
                        elapsed,
                        budget = self.predict_timeout,
                        "predictor exceeded soft budget, result discarded"
                    );
                    self.stats.predict_timeouts += 1;
                    return (ReportKind::PredictTimeout, None);
                }
                (ReportKind::Report, Some(output))
            }
            Err(e) => {
                warn!(event_id = tick.event_id, tick = tick.tick_index, error = %e,
                    "predictor failed");
                self.stats.predict_failures += 1;
                (ReportKind::PredictFailed, None)
            }
        }
    }

    fn build_report(
        &mut self,
        tick: &TickRequest,
        now: f64,
        elapsed: f64,
        kind: ReportKind,
        output: Option<InferenceOutput>,
    ) -> Report {
        let mut per_target: BTreeMap<String, IntensityLabel> = BTreeMap::new();
        let mut alarm: Vec<(IntensityLabel, String)> = Vec::new();

        if let Some(output) = output {
            for (target, mixture) in self
                .catalogs
                .targets
                .targets()
                .iter()
                .zip(output.mixtures.iter())
            {
                let label = mixture.label(self.intensity_cutoff);
                per_target.insert(target.name.clone(), label);
                self.county.observe(target, label, self.alarm_min);
                if label >= self.alarm_min {
                    alarm.push((label, target.name.clone()));
                }
            }
        }

        alarm.sort_by(|a, b| {
            b.0.numeric()
                .total_cmp(&a.0.numeric())
                .then_with(|| a.1.cmp(&b.1))
        });

        Report {
            event_id: tick.event_id,
            tick_index: tick.tick_index,
            kind,
            report_time: utc_from_unix(now)
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            wave_time: tick.wave_end_time - tick.first_pick_time,
            wave_endt: utc_from_unix(tick.wave_end_time)
                .format("%Y-%m-%d %H:%M:%S%.6f")
                .to_string(),
            wave_lag: now - tick.wave_end_time,
            run_time: elapsed,
            picks: tick.picks_count(),
            alarm: alarm.into_iter().map(|(_, name)| name).collect(),
            alarm_county: self.county.alarmed(),
            new_alarm_county: self.county.take_new(),
            per_target,
        }
    }
}
