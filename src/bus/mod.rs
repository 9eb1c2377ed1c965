//! Outward publishing seams.
//!
//! The dispatcher fans each report out to a publish/subscribe bus (MQTT in
//! production, behind [`ReportPublisher`]) and to a broadcast view channel
//! consumed by the external WebSocket layer. Both are fire-and-forget: a
//! slow or absent consumer never stalls a tick.

use crate::report::Report;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Fire-and-forget publisher for the outward bus.
///
/// Implementations must not block the dispatcher; errors are theirs to
/// swallow.
pub trait ReportPublisher: Send + Sync {
    /// Publish one report. `alert_text` is present when the report carries
    /// new county alarms.
    fn publish(&self, report: &Report, alert_text: Option<&str>);
}

/// Default publisher: structured log lines only.
pub struct LogPublisher;

impl ReportPublisher for LogPublisher {
    fn publish(&self, report: &Report, alert_text: Option<&str>) {
        debug!(
            event_id = report.event_id,
            tick = report.tick_index,
            alarms = report.alarm.len(),
            "report published"
        );
        if let Some(text) = alert_text {
            tracing::info!("\n{text}");
        }
    }
}

/// Events pushed to the WebSocket view layer.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    Report(Arc<Report>),
}

/// Create the bounded view broadcast channel.
pub fn view_channel(capacity: usize) -> (broadcast::Sender<ViewEvent>, broadcast::Receiver<ViewEvent>) {
    broadcast::channel(capacity)
}
