//! Upstream transport adapters.
//!
//! The production ring-buffer transports are external; the pipeline sees
//! two source traits yielding typed messages. Waveform packets arrive as
//! one JSON object per line, pick messages as whitespace-separated text
//! lines from the phase picker. TCP sources reconnect with capped
//! exponential backoff and keep health counters; stdin sources serve the
//! replay/simulation path.

use crate::types::{Phase, Pick, WaveformPacket};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    INITIAL_RECONNECT_DELAY_SECS, MAX_RECONNECT_ATTEMPTS, MAX_RECONNECT_DELAY_SECS,
    READ_TIMEOUT_SECS,
};

/// Events produced by a source.
pub enum SourceEvent<T> {
    Message(T),
    /// End of data: EOF for stdin/replay, exhausted reconnection for TCP.
    Eof,
}

/// Blocking-iterator abstraction over the waveform transport.
#[async_trait]
pub trait WaveSource: Send + 'static {
    async fn next_wave(&mut self) -> Result<SourceEvent<WaveformPacket>>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

/// Blocking-iterator abstraction over the pick transport.
#[async_trait]
pub trait PickSource: Send + 'static {
    /// The next parsed pick together with its raw line (for the audit log).
    async fn next_pick(&mut self) -> Result<SourceEvent<(Pick, String)>>;

    fn source_name(&self) -> &str;
}

// ============================================================================
// Pick message parsing
// ============================================================================

#[derive(Debug, Error)]
pub enum PickParseError {
    #[error("pick line has {0} fields, expected at least 13")]
    TooShort(usize),

    #[error("pick field {field}: {message}")]
    BadField {
        field: &'static str,
        message: String,
    },
}

/// Whitespace-separated pick line layout from the upstream picker:
/// `station channel sample_rate network location phase pick_time weight
/// instrument_flag upd_seconds duration amplitude_proxy p_or_s`.
/// The trailing `p_or_s` column is authoritative for phase gating.
pub fn parse_pick_line(line: &str) -> Result<Pick, PickParseError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 13 {
        return Err(PickParseError::TooShort(fields.len()));
    }

    let parse_f64 = |field: &'static str, raw: &str| {
        raw.parse::<f64>().map_err(|e| PickParseError::BadField {
            field,
            message: e.to_string(),
        })
    };

    let pick_time = parse_f64("pick_time", fields[6])?;
    let weight = parse_f64("weight", fields[7])?;
    let amplitude_proxy = parse_f64("amplitude_proxy", fields[11])?;
    let phase = fields[12]
        .parse::<Phase>()
        .map_err(|message| PickParseError::BadField {
            field: "p_or_s",
            message,
        })?;

    Ok(Pick {
        station: fields[0].to_string(),
        phase,
        pick_time,
        weight,
        amplitude_proxy,
    })
}

/// Lines the picker emits that are not picks (ring restarts, heartbeats).
fn is_noise_line(line: &str) -> bool {
    line.is_empty() || line.contains("Restarting") || line.split_whitespace().count() < 13
}

// ============================================================================
// TCP line transport with reconnection
// ============================================================================

/// Transport health counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub messages_received: u64,
    pub reconnections: u64,
    pub timeouts: u64,
    pub malformed_lines: u64,
}

/// A reconnecting line-oriented TCP client shared by both transports.
struct TcpLineTransport {
    label: &'static str,
    host: String,
    port: u16,
    reader: Option<BufReader<TcpStream>>,
    line_buffer: String,
    stats: TransportStats,
}

impl TcpLineTransport {
    async fn connect(label: &'static str, host: &str, port: u16) -> Result<Self> {
        let mut transport = Self {
            label,
            host: host.to_string(),
            port,
            reader: None,
            line_buffer: String::with_capacity(4096),
            stats: TransportStats::default(),
        };
        transport.dial().await?;
        Ok(transport)
    }

    async fn dial(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        info!(transport = self.label, address = %addr, "connecting");
        let stream = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| anyhow::anyhow!("{}: connect timeout to {addr}", self.label))??;
        self.reader = Some(BufReader::new(stream));
        info!(transport = self.label, "connected");
        Ok(())
    }

    /// Reconnect with exponential backoff, capped per the transport error
    /// policy. Returns `Err` once attempts are exhausted.
    async fn reconnect(&mut self) -> Result<()> {
        self.reader = None;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            let delay = (INITIAL_RECONNECT_DELAY_SECS << (attempt - 1).min(8))
                .min(MAX_RECONNECT_DELAY_SECS);
            warn!(
                transport = self.label,
                attempt,
                delay_secs = delay,
                "reconnecting after failure"
            );
            tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            match self.dial().await {
                Ok(()) => {
                    self.stats.reconnections += 1;
                    return Ok(());
                }
                Err(e) => warn!(transport = self.label, attempt, error = %e, "attempt failed"),
            }
        }
        Err(anyhow::anyhow!(
            "{}: reconnection exhausted after {} attempts",
            self.label,
            MAX_RECONNECT_ATTEMPTS
        ))
    }

    /// Next non-empty line, reconnecting through timeouts and disconnects.
    async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let Some(reader) = self.reader.as_mut() else {
                self.reconnect().await?;
                continue;
            };

            self.line_buffer.clear();
            let read = tokio::time::timeout(
                std::time::Duration::from_secs(READ_TIMEOUT_SECS),
                reader.read_line(&mut self.line_buffer),
            )
            .await;

            match read {
                Ok(Ok(0)) => {
                    warn!(transport = self.label, "connection closed by peer");
                    self.reconnect().await?;
                }
                Ok(Ok(_)) => {
                    let line = self.line_buffer.trim();
                    if line.is_empty() {
                        continue;
                    }
                    self.stats.messages_received += 1;
                    return Ok(Some(line.to_string()));
                }
                Ok(Err(e)) => {
                    warn!(transport = self.label, error = %e, "read failed");
                    self.reconnect().await?;
                }
                Err(_) => {
                    self.stats.timeouts += 1;
                    warn!(
                        transport = self.label,
                        timeout_secs = READ_TIMEOUT_SECS,
                        "read timeout"
                    );
                    self.reconnect().await?;
                }
            }
        }
    }
}

// ============================================================================
// Waveform sources
// ============================================================================

/// JSON-per-line waveform packets over TCP.
pub struct TcpWaveSource {
    transport: TcpLineTransport,
}

impl TcpWaveSource {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            transport: TcpLineTransport::connect("wave-tcp", host, port).await?,
        })
    }

    pub fn stats(&self) -> &TransportStats {
        &self.transport.stats
    }
}

#[async_trait]
impl WaveSource for TcpWaveSource {
    async fn next_wave(&mut self) -> Result<SourceEvent<WaveformPacket>> {
        loop {
            let Some(line) = self.transport.next_line().await? else {
                return Ok(SourceEvent::Eof);
            };
            match serde_json::from_str::<WaveformPacket>(&line) {
                Ok(packet) => return Ok(SourceEvent::Message(packet)),
                Err(e) => {
                    self.transport.stats.malformed_lines += 1;
                    debug!(error = %e, "malformed waveform line skipped");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "wave-tcp"
    }
}

/// JSON-per-line waveform packets from stdin (simulation path).
pub struct StdinWaveSource {
    reader: BufReader<tokio::io::Stdin>,
    line_buffer: String,
}

impl StdinWaveSource {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            line_buffer: String::with_capacity(4096),
        }
    }
}

impl Default for StdinWaveSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WaveSource for StdinWaveSource {
    async fn next_wave(&mut self) -> Result<SourceEvent<WaveformPacket>> {
        loop {
            self.line_buffer.clear();
            if self.reader.read_line(&mut self.line_buffer).await? == 0 {
                return Ok(SourceEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<WaveformPacket>(line) {
                Ok(packet) => return Ok(SourceEvent::Message(packet)),
                Err(e) => warn!(error = %e, "malformed waveform line skipped"),
            }
        }
    }

    fn source_name(&self) -> &str {
        "wave-stdin"
    }
}

/// Replays pre-built packets (tests, file replay).
pub struct ReplayWaveSource {
    packets: std::vec::IntoIter<WaveformPacket>,
    delay_ms: u64,
}

impl ReplayWaveSource {
    pub fn new(packets: Vec<WaveformPacket>, delay_ms: u64) -> Self {
        Self {
            packets: packets.into_iter(),
            delay_ms,
        }
    }
}

#[async_trait]
impl WaveSource for ReplayWaveSource {
    async fn next_wave(&mut self) -> Result<SourceEvent<WaveformPacket>> {
        match self.packets.next() {
            Some(packet) => {
                if self.delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
                }
                Ok(SourceEvent::Message(packet))
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "wave-replay"
    }
}

// ============================================================================
// Pick sources
// ============================================================================

/// Text pick lines over TCP.
pub struct TcpPickSource {
    transport: TcpLineTransport,
}

impl TcpPickSource {
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            transport: TcpLineTransport::connect("pick-tcp", host, port).await?,
        })
    }

    pub fn stats(&self) -> &TransportStats {
        &self.transport.stats
    }
}

#[async_trait]
impl PickSource for TcpPickSource {
    async fn next_pick(&mut self) -> Result<SourceEvent<(Pick, String)>> {
        loop {
            let Some(line) = self.transport.next_line().await? else {
                return Ok(SourceEvent::Eof);
            };
            if is_noise_line(&line) {
                continue;
            }
            match parse_pick_line(&line) {
                Ok(pick) => return Ok(SourceEvent::Message((pick, line))),
                Err(e) => {
                    self.transport.stats.malformed_lines += 1;
                    debug!(error = %e, "malformed pick line skipped");
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "pick-tcp"
    }
}

/// Text pick lines from stdin (simulation path).
pub struct StdinPickSource {
    reader: BufReader<tokio::io::Stdin>,
    line_buffer: String,
}

impl StdinPickSource {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(tokio::io::stdin()),
            line_buffer: String::with_capacity(1024),
        }
    }
}

impl Default for StdinPickSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PickSource for StdinPickSource {
    async fn next_pick(&mut self) -> Result<SourceEvent<(Pick, String)>> {
        loop {
            self.line_buffer.clear();
            if self.reader.read_line(&mut self.line_buffer).await? == 0 {
                return Ok(SourceEvent::Eof);
            }
            let line = self.line_buffer.trim().to_string();
            if is_noise_line(&line) {
                continue;
            }
            match parse_pick_line(&line) {
                Ok(pick) => return Ok(SourceEvent::Message((pick, line))),
                Err(e) => debug!(error = %e, "malformed pick line skipped"),
            }
        }
    }

    fn source_name(&self) -> &str {
        "pick-stdin"
    }
}

/// Replays pre-built picks (tests).
pub struct ReplayPickSource {
    picks: std::vec::IntoIter<(Pick, String)>,
    delay_ms: u64,
    hold_open: bool,
}

impl ReplayPickSource {
    pub fn new(picks: Vec<(Pick, String)>, delay_ms: u64) -> Self {
        Self {
            picks: picks.into_iter(),
            delay_ms,
            hold_open: false,
        }
    }

    /// After exhaustion, block instead of reporting EOF, so the consuming
    /// loop keeps its timer running until cancellation.
    pub fn hold_open(picks: Vec<(Pick, String)>, delay_ms: u64) -> Self {
        Self {
            picks: picks.into_iter(),
            delay_ms,
            hold_open: true,
        }
    }
}

#[async_trait]
impl PickSource for ReplayPickSource {
    async fn next_pick(&mut self) -> Result<SourceEvent<(Pick, String)>> {
        match self.picks.next() {
            Some(entry) => {
                if self.delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
                }
                Ok(SourceEvent::Message(entry))
            }
            None if self.hold_open => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            None => Ok(SourceEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "pick-replay"
    }
}
