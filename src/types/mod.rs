//! Core data model for the shaking-intensity pipeline.
//!
//! Explicit structs for everything that crosses a component boundary:
//! waveform packets, phase picks, station/target metadata, and the tick
//! requests that drive inference. Unknown fields on inbound messages are
//! ignored at decode.

pub mod intensity;

use serde::{Deserialize, Serialize};

/// Seismometer component of a 3-axis instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    Z,
    N,
    E,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Z, Component::N, Component::E];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Z => "Z",
            Component::N => "N",
            Component::E => "E",
        }
    }

    /// Row index in the per-station waveform block.
    pub fn index(&self) -> usize {
        match self {
            Component::Z => 0,
            Component::N => 1,
            Component::E => 2,
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Z" | "z" => Ok(Component::Z),
            "N" | "n" => Ok(Component::N),
            "E" | "e" => Ok(Component::E),
            other => Err(format!("unknown component: {other:?}")),
        }
    }
}

/// One waveform packet from the upstream transport.
///
/// Samples are raw counts; dividing by `gain` yields physical units
/// (cm/s²). `samples.len()` must equal `round((end_time - start_time) *
/// sample_rate_hz)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveformPacket {
    pub station: String,
    pub channel: Component,
    pub sample_rate_hz: f64,
    /// Absolute start time of the first sample (Unix seconds).
    pub start_time: f64,
    /// Absolute end time, one sample period past the last sample.
    pub end_time: f64,
    pub samples: Vec<f64>,
    /// Counts per physical unit; samples are divided by this on insert.
    pub gain: f64,
}

impl WaveformPacket {
    /// Sample count implied by the packet's time span and rate.
    pub fn expected_len(&self) -> usize {
        ((self.end_time - self.start_time) * self.sample_rate_hz).round() as usize
    }
}

/// Seismic phase of a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    P,
    S,
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P" | "p" => Ok(Phase::P),
            "S" | "s" => Ok(Phase::S),
            other => Err(format!("unknown phase: {other:?}")),
        }
    }
}

/// A phase arrival from the upstream picker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pick {
    pub station: String,
    pub phase: Phase,
    /// Arrival time (Unix seconds).
    pub pick_time: f64,
    /// Pick quality; higher wins when deduplicating.
    pub weight: f64,
    /// Amplitude proxy reported by the picker (diagnostic only).
    pub amplitude_proxy: f64,
}

/// Static per-station metadata, complete before ingestion begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationMeta {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation_m: f64,
    pub vs30: Option<f64>,
    pub site_class: Option<String>,
}

/// A named geographic point at which intensity is predicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub vs30: f64,
    /// Administrative region used for alarm aggregation.
    pub county: String,
}

/// A station's membership in an active event.
#[derive(Debug, Clone, PartialEq)]
pub struct StationPick {
    pub station: String,
    /// First accepted pick time for this station within the event.
    pub pick_time: f64,
}

/// One inference invocation request emitted by the pick aggregator.
#[derive(Debug, Clone)]
pub struct TickRequest {
    pub event_id: u64,
    /// Strictly increasing within an event, starting at 0.
    pub tick_index: u32,
    /// Absolute end of the waveform window to snapshot.
    pub wave_end_time: f64,
    /// Earliest pick of the event (drives file naming and lag metrics).
    pub first_pick_time: f64,
    /// Participating stations ordered by (first pick time, station id).
    pub station_pick_order: Vec<StationPick>,
    /// The event has drained; close out after this tick.
    pub terminal: bool,
}

impl TickRequest {
    /// Number of participating stations.
    pub fn picks_count(&self) -> usize {
        self.station_pick_order.len()
    }
}

/// Current Unix time as fractional seconds.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_expected_len_rounds_to_sample_grid() {
        let packet = WaveformPacket {
            station: "A001".into(),
            channel: Component::Z,
            sample_rate_hz: 100.0,
            start_time: 10.0,
            end_time: 10.5,
            samples: vec![0.0; 50],
            gain: 1.0,
        };
        assert_eq!(packet.expected_len(), 50);
        assert_eq!(packet.expected_len(), packet.samples.len());
    }

    #[test]
    fn component_round_trip() {
        for c in Component::ALL {
            assert_eq!(c.as_str().parse::<Component>().unwrap(), c);
        }
        assert_eq!(Component::E.index(), 2);
    }

    #[test]
    fn packet_decode_ignores_unknown_fields() {
        let json = r#"{
            "station": "A001", "channel": "Z", "sample_rate_hz": 100.0,
            "start_time": 0.0, "end_time": 0.1,
            "samples": [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0],
            "gain": 3.2e-6, "quality": "who-knows"
        }"#;
        let packet: WaveformPacket = serde_json::from_str(json).unwrap();
        assert_eq!(packet.samples.len(), 10);
    }
}
