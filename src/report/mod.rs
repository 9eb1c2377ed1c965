//! Intensity reports, the append-only event log, and alarm aggregation.
//!
//! One report per tick: per-target intensity labels, the alarm list, and
//! timing diagnostics, serialized as one JSON object per line into
//! `logs/report/<yyyy-mm-ddTHH:MM:SS_event_id>.log`. Accepted picks go to
//! a daily audit log. County alarms accumulate across the ticks of one
//! event and re-announce only on escalation.

use crate::types::intensity::IntensityLabel;
use crate::types::Target;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Outcome class of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// Normal inference result.
    Report,
    /// The predictor returned an error; no labels in this record.
    PredictFailed,
    /// The predictor exceeded its soft budget; result discarded.
    PredictTimeout,
}

/// One tick's published record.
///
/// Per-target labels are flattened into the JSON object keyed by target
/// name; consumers must ignore unknown keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub event_id: u64,
    pub tick_index: u32,
    pub kind: ReportKind,
    /// ISO-8601 UTC.
    pub report_time: String,
    /// Seconds of waveform accumulated since the first pick.
    pub wave_time: f64,
    /// Wall-clock end of the snapshotted window.
    pub wave_endt: String,
    /// now − wave_end_time at publish.
    pub wave_lag: f64,
    /// Inference wall time for this tick.
    pub run_time: f64,
    /// Participating picks.
    pub picks: usize,
    /// Targets at or above the alarm threshold, strongest first.
    pub alarm: Vec<String>,
    /// Counties at or above the alarm threshold this event, sorted.
    pub alarm_county: Vec<String>,
    /// Counties newly alarmed or escalated since the previous tick.
    pub new_alarm_county: Vec<String>,
    #[serde(flatten)]
    pub per_target: BTreeMap<String, IntensityLabel>,
}

/// UTC timestamp from fractional Unix seconds.
pub fn utc_from_unix(t: f64) -> DateTime<Utc> {
    let secs = t.floor() as i64;
    let nanos = ((t - t.floor()) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Event log stamp used in report file names.
pub fn event_file_stamp(first_pick_time: f64, event_id: u64) -> String {
    format!(
        "{}_{}",
        utc_from_unix(first_pick_time).format("%Y-%m-%dT%H:%M:%S"),
        event_id
    )
}

// ============================================================================
// Event report log
// ============================================================================

/// Append-only, line-delimited JSON log for one event.
pub struct ReportLog {
    file: File,
    path: PathBuf,
}

impl ReportLog {
    /// Open `logs/report/<stamp>.log`, creating directories as needed.
    pub fn open(log_dir: &Path, event_id: u64, first_pick_time: f64) -> std::io::Result<Self> {
        let dir = log_dir.join("report");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.log", event_file_stamp(first_pick_time, event_id)));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// Append one report as a complete JSON line.
    pub fn append(&mut self, report: &Report) -> std::io::Result<()> {
        let line = serde_json::to_string(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.file, "{line}")?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// Pick audit log
// ============================================================================

/// Daily line-delimited log of accepted picks (audit only).
pub struct PickLog {
    dir: PathBuf,
}

impl PickLog {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            dir: log_dir.join("pick"),
        }
    }

    /// Append one raw pick line to the day's file. Failures are logged and
    /// swallowed; the audit trail never blocks the pipeline.
    pub fn append(&self, now: f64, line: &str) {
        let path = self
            .dir
            .join(format!("{}.log", utc_from_unix(now).format("%Y-%m-%d")));
        let result = std::fs::create_dir_all(&self.dir).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{line}")
        });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "pick audit write failed");
        }
    }
}

// ============================================================================
// County alarm escalation
// ============================================================================

/// Accumulates per-county maximum intensity across one event's ticks.
///
/// A county announces once on entering the alarm set and again only when
/// its intensity escalates.
#[derive(Debug, Default)]
pub struct CountyAlarm {
    active: BTreeMap<String, IntensityLabel>,
    announced: BTreeMap<String, IntensityLabel>,
}

impl CountyAlarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one target's label for this tick.
    pub fn observe(&mut self, target: &Target, label: IntensityLabel, alarm_min: IntensityLabel) {
        if label < alarm_min || target.county.is_empty() {
            return;
        }
        let entry = self
            .active
            .entry(target.county.clone())
            .or_insert(IntensityLabel::Zero);
        if label > *entry {
            *entry = label;
        }
    }

    /// Counties currently at alarm, sorted by name.
    pub fn alarmed(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Counties that appeared or escalated since the last call; marks them
    /// announced.
    pub fn take_new(&mut self) -> Vec<String> {
        let mut new = Vec::new();
        for (county, &label) in &self.active {
            match self.announced.get(county) {
                Some(&prev) if label <= prev => {}
                _ => new.push(county.clone()),
            }
        }
        for county in &new {
            if let Some(&label) = self.active.get(county) {
                self.announced.insert(county.clone(), label);
            }
        }
        new
    }

    /// Peak label for a county this event.
    pub fn level(&self, county: &str) -> Option<IntensityLabel> {
        self.active.get(county).copied()
    }

    /// Clear all state at event end.
    pub fn reset(&mut self) {
        self.active.clear();
        self.announced.clear();
    }
}

// ============================================================================
// Alert text
// ============================================================================

/// Human-readable alert block for the outward bus.
pub fn format_alert(report: &Report, county_levels: &CountyAlarm) -> String {
    let mut lines = Vec::new();
    lines.push("--------------------------------------------------".to_string());
    lines.push("[Earthquake Intensity Alert]".to_string());
    lines.push(String::new());
    lines.push(format!("Alert time: {}", report.report_time));
    lines.push(String::new());

    if !report.new_alarm_county.is_empty() {
        lines.push("[New alarms]".to_string());
        let mut entries: Vec<(IntensityLabel, &str)> = report
            .new_alarm_county
            .iter()
            .filter_map(|county| {
                county_levels
                    .level(county)
                    .map(|label| (label, county.as_str()))
            })
            .collect();
        entries.sort_by(|a, b| b.0.numeric().total_cmp(&a.0.numeric()).then(a.1.cmp(b.1)));
        for (label, county) in entries {
            lines.push(format!("{county}: intensity {label} or above"));
        }
        lines.push(String::new());
    }

    lines.push("[System]".to_string());
    lines.push(format!("Wave lag: {:.2} s", report.wave_lag));
    lines.push(format!("Accumulated wave: {:.2} s", report.wave_time));
    lines.push(format!("Run time: {:.4} s", report.run_time));
    lines.push("--------------------------------------------------".to_string());
    lines.join("\n")
}
