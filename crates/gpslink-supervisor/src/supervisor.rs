//! The link supervisor: resolve, connect, stream, detect stalls, reconnect.
//!
//! One supervisor owns at most one [`Connection`] at a time. It runs on its
//! own task ([`LinkSupervisor::spawn`]) and hands validated records to the
//! caller through a bounded channel wrapped in a [`RecordStream`]. Lines
//! that are not telemetry only ever reach the diagnostic side-channel.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Resolving → Connecting → Connected → Streaming
//!                        ▲                        │ stale / lost
//!                        └──── Degraded ◀─────────┘
//! ```
//!
//! Every exit path (cancellation, consumer gone, fatal error) closes the
//! active transport and releases any bound device before the state becomes
//! `Closed` and `DISCONNECTED` is emitted.
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gpslink_bluez::Link;
use gpslink_core::{BtAddress, Channel, Endpoint, LinkState, TelemetryRecord};
use gpslink_protocol::{preview, ClientHello, Frame, FrameDecoder, StreamBuffer, PREVIEW_CHARS};

use crate::capabilities::Capabilities;
use crate::config::LinkConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::manager::{ConnectError, Connection, ConnectionManager};
use crate::resolver::{ChannelCandidateList, ChannelResolver};

// ============================================================================
// Errors
// ============================================================================

/// No valid record arrived within the staleness threshold.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("No telemetry for {}s (threshold {}s)", idle.as_secs(), threshold.as_secs())]
pub struct StalenessError {
    pub idle: Duration,
    pub threshold: Duration,
}

/// Terminal outcome of a supervisor run.
#[derive(Error, Debug)]
pub enum LinkError {
    /// No connection could be established on any candidate channel.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Too many consecutive reconnect cycles without a valid record.
    #[error("Reconnect budget of {budget} exhausted; last failure: {last}")]
    ReconnectBudgetExhausted { budget: u32, last: String },

    /// The supervisor task panicked or was aborted.
    #[error("Supervisor task failed: {0}")]
    Task(String),
}

// ============================================================================
// Record Stream
// ============================================================================

/// Forward-only sequence of validated records from a spawned supervisor.
///
/// Records arrive in wire order. The stream cannot be restarted; once
/// [`RecordStream::next`] returns `None` the supervisor has finished and
/// [`RecordStream::finish`] reports why.
pub struct RecordStream {
    records: mpsc::Receiver<TelemetryRecord>,
    task: JoinHandle<Result<(), LinkError>>,
    state: watch::Receiver<LinkState>,
}

impl RecordStream {
    /// Next record, or `None` once the supervisor has stopped.
    pub async fn next(&mut self) -> Option<TelemetryRecord> {
        self.records.recv().await
    }

    /// Watch handle on the supervisor's [`LinkState`].
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Stops consuming and waits for the supervisor's outcome.
    ///
    /// Dropping the receiver tells a still-running supervisor that nobody
    /// is listening; it then closes its transport and returns `Ok(())`.
    pub async fn finish(self) -> Result<(), LinkError> {
        drop(self.records);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(LinkError::Task(e.to_string())),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Why a streaming session ended.
#[derive(Debug)]
enum StreamEnd {
    Stale(StalenessError),
    Lost(String),
    Cancelled,
    ConsumerGone,
}

/// What happened to one decoded line.
enum LineOutcome {
    Delivered,
    Skipped,
    Cancelled,
    ConsumerGone,
}

pub struct LinkSupervisor {
    address: BtAddress,
    config: LinkConfig,
    capabilities: Capabilities,
    diagnostics: DiagnosticSink,
    cancel: CancellationToken,
    decoder: FrameDecoder,
    state: watch::Sender<LinkState>,
}

impl LinkSupervisor {
    pub fn new(
        address: BtAddress,
        config: LinkConfig,
        capabilities: Capabilities,
        diagnostics: DiagnosticSink,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        Self {
            address,
            config,
            capabilities,
            diagnostics,
            cancel,
            decoder: FrameDecoder::new(),
            state,
        }
    }

    /// Replaces the frame decoder (e.g. one with a fixed clock).
    #[must_use]
    pub fn with_decoder(mut self, decoder: FrameDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Runs the supervisor on its own task.
    pub fn spawn(self) -> RecordStream {
        let (tx, records) = mpsc::channel(self.config.record_buffer.max(1));
        let state = self.subscribe_state();
        let task = tokio::spawn(async move { self.run(tx).await });
        RecordStream {
            records,
            task,
            state,
        }
    }

    /// Runs until cancelled, the consumer goes away, or a fatal error.
    ///
    /// Always ends in [`LinkState::Closed`] with `DISCONNECTED` emitted,
    /// after the transport has been closed.
    pub async fn run(&self, records: mpsc::Sender<TelemetryRecord>) -> Result<(), LinkError> {
        info!(address = %self.address, transport = %self.config.transport, "Link supervisor starting");

        let result = self.drive(&records).await;
        match &result {
            Ok(()) => info!(address = %self.address, "Link supervisor stopped"),
            Err(e) => error!(address = %self.address, error = %e, "Link supervisor failed"),
        }

        self.set_state(LinkState::Closed);
        self.diagnostics.emit(Diagnostic::Disconnected);
        result
    }

    async fn drive(&self, records: &mpsc::Sender<TelemetryRecord>) -> Result<(), LinkError> {
        self.set_state(LinkState::Resolving);

        let resolver = ChannelResolver::new(
            self.capabilities.discovery.clone(),
            self.config.discovery.clone(),
            self.diagnostics.clone(),
        );
        let mut candidates = match self.config.channel {
            Some(channel) => resolver.with_override(channel),
            None => resolver.resolve(self.address, &self.cancel).await,
        };
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let manager = ConnectionManager::new(
            self.capabilities.connector.clone(),
            self.capabilities.control.clone(),
            self.config.retry.clone(),
            self.config.connect_timeout(),
            self.diagnostics.clone(),
        );

        let budget = self.config.max_reconnects;
        let mut reconnects: u32 = 0;

        loop {
            self.set_state(LinkState::Connecting);

            let mut connection = match self.establish(&manager, &candidates).await {
                Ok(connection) => connection,
                Err(ConnectError::Cancelled) => return Ok(()),
                Err(e) => {
                    self.diagnostics.emit(Diagnostic::ConnectionFailed {
                        reason: format!("no candidate channel accepted the connection: {e}"),
                    });
                    return Err(LinkError::Connect(e));
                }
            };

            let endpoint = connection.endpoint();
            candidates.promote(endpoint.channel());
            self.set_state(LinkState::Connected);
            self.diagnostics.emit(Diagnostic::Connected {
                endpoint,
                transport: manager.transport_kind(),
            });
            if let Some(lease) = connection.link().lease() {
                self.diagnostics.emit(Diagnostic::Bound {
                    path: lease.path().display().to_string(),
                    endpoint: lease.endpoint(),
                });
            }

            self.set_state(LinkState::Streaming);
            self.handshake(connection.link_mut()).await;
            let (end, delivered) = self.stream(connection.link_mut(), records).await;

            if matches!(end, StreamEnd::Stale(_) | StreamEnd::Lost(_)) {
                self.set_state(LinkState::Degraded);
            }
            self.close(connection).await;

            let reason = match end {
                StreamEnd::Cancelled => {
                    info!(%endpoint, "Streaming cancelled");
                    return Ok(());
                }
                StreamEnd::ConsumerGone => {
                    info!(%endpoint, "Record consumer went away");
                    return Ok(());
                }
                StreamEnd::Stale(e) => e.to_string(),
                StreamEnd::Lost(reason) => reason,
            };

            // The budget bounds consecutive unproductive cycles.
            if delivered > 0 {
                reconnects = 0;
            }
            reconnects = reconnects.saturating_add(1);
            if reconnects > budget {
                self.diagnostics.emit(Diagnostic::FatalError {
                    reason: format!("reconnect budget of {budget} exhausted: {reason}"),
                });
                return Err(LinkError::ReconnectBudgetExhausted {
                    budget,
                    last: reason,
                });
            }

            warn!(%endpoint, cycle = reconnects, budget, %reason, "Reconnecting");
            self.diagnostics.emit(Diagnostic::Reconnecting {
                cycle: reconnects,
                budget,
            });
        }
    }

    /// Connects on the primary candidate, then sweeps the remaining ones
    /// with a single attempt each.
    async fn establish(
        &self,
        manager: &ConnectionManager,
        candidates: &ChannelCandidateList,
    ) -> Result<Connection, ConnectError> {
        let primary = Endpoint::new(self.address, candidates.primary());
        let first = match manager
            .connect(primary, candidates, self.config.max_attempts, &self.cancel)
            .await
        {
            Ok(connection) => return Ok(connection),
            Err(e) => e,
        };

        if matches!(first, ConnectError::Cancelled) {
            return Err(first);
        }
        if first.is_host_absent() {
            info!(address = %self.address, "Device unreachable; skipping remaining channels");
            return Err(first);
        }

        let remaining: Vec<Channel> = candidates
            .channels()
            .into_iter()
            .filter(|channel| !first.tried().contains(channel))
            .collect();
        if remaining.is_empty() {
            return Err(first);
        }

        self.diagnostics.emit(Diagnostic::TryingCommonPorts {
            channels: remaining.clone(),
        });

        let mut last = first;
        for (index, channel) in remaining.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ConnectError::Cancelled),
                    _ = sleep(self.config.port_sweep_pause()) => {}
                }
            }

            self.diagnostics.emit(Diagnostic::TryingPort { channel: *channel });
            let endpoint = Endpoint::new(self.address, *channel);
            match manager.connect(endpoint, candidates, 1, &self.cancel).await {
                Ok(connection) => return Ok(connection),
                Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
                Err(e) => {
                    let absent = e.is_host_absent();
                    last = e;
                    if absent {
                        break;
                    }
                }
            }
        }

        Err(last)
    }

    /// Sends the client hello. Failure is reported, never fatal.
    async fn handshake(&self, link: &mut Link) {
        let settings = &self.config.handshake;
        if !settings.enabled {
            return;
        }

        let line = match ClientHello::new(settings.name.clone()).to_line() {
            Ok(line) => line,
            Err(e) => {
                self.diagnostics.emit(Diagnostic::HandshakeError {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let write = async {
            let stream = link.stream();
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = timeout(settings.timeout(), write) => result,
        };

        match result {
            Ok(Ok(())) => {
                debug!(name = %settings.name, "Handshake sent");
                self.diagnostics.emit(Diagnostic::HandshakeSent);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Handshake failed; continuing");
                self.diagnostics.emit(Diagnostic::HandshakeError {
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!("Handshake timed out; continuing");
                self.diagnostics.emit(Diagnostic::HandshakeError {
                    reason: format!("timed out after {}s", settings.timeout().as_secs()),
                });
            }
        }
    }

    /// Reads until the link stalls, drops, or the run is stopped.
    ///
    /// Returns how the session ended and how many records were delivered.
    async fn stream(
        &self,
        link: &mut Link,
        records: &mpsc::Sender<TelemetryRecord>,
    ) -> (StreamEnd, u64) {
        let read_timeout = self.config.read_timeout();
        let threshold = self.config.stale_after();
        let max_line = self.config.max_line_bytes;

        let mut buffer = StreamBuffer::with_capacity(self.config.read_chunk_bytes);
        let mut chunk = vec![0u8; self.config.read_chunk_bytes.max(1)];
        let mut last_valid = Instant::now();
        let mut delivered: u64 = 0;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return (StreamEnd::Cancelled, delivered),
                _ = records.closed() => return (StreamEnd::ConsumerGone, delivered),
                read = timeout(read_timeout, link.stream().read(&mut chunk)) => read,
            };

            match read {
                // Per-read timeout: fall through to the staleness check.
                Err(_) => {}
                Ok(Ok(0)) => {
                    self.diagnostics.emit(Diagnostic::ConnectionLost {
                        reason: "peer closed the connection".to_string(),
                    });
                    return (StreamEnd::Lost("peer closed the connection".to_string()), delivered);
                }
                Ok(Ok(n)) => {
                    buffer.append(chunk.get(..n).unwrap_or_default());

                    for line in buffer.drain_lines() {
                        match self.handle_line(&line, records).await {
                            LineOutcome::Delivered => {
                                delivered = delivered.saturating_add(1);
                                last_valid = Instant::now();
                            }
                            LineOutcome::Skipped => {}
                            LineOutcome::Cancelled => return (StreamEnd::Cancelled, delivered),
                            LineOutcome::ConsumerGone => {
                                return (StreamEnd::ConsumerGone, delivered)
                            }
                        }
                    }

                    if buffer.pending_len() > max_line {
                        let text = StreamBuffer::decode_text(buffer.pending());
                        warn!(bytes = buffer.pending_len(), limit = max_line, "Dropping oversized partial line");
                        self.diagnostics.emit(Diagnostic::ParseError {
                            preview: format!(
                                "line exceeds {max_line} bytes: {}",
                                preview(&text, PREVIEW_CHARS)
                            ),
                        });
                        buffer.clear();
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Read failed");
                    self.diagnostics.emit(Diagnostic::ConnectionLost {
                        reason: e.to_string(),
                    });
                    return (StreamEnd::Lost(e.to_string()), delivered);
                }
            }

            let idle = last_valid.elapsed();
            if idle >= threshold {
                warn!(idle_secs = idle.as_secs(), "No telemetry within threshold");
                self.diagnostics.emit(Diagnostic::DataTimeout { idle });
                return (StreamEnd::Stale(StalenessError { idle, threshold }), delivered);
            }
        }
    }

    async fn handle_line(
        &self,
        line: &[u8],
        records: &mpsc::Sender<TelemetryRecord>,
    ) -> LineOutcome {
        let text = StreamBuffer::decode_text(line);
        if text.trim().is_empty() {
            return LineOutcome::Skipped;
        }

        match self.decoder.decode(&text) {
            Frame::Telemetry(record) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => LineOutcome::Cancelled,
                    sent = records.send(record) => match sent {
                        Ok(()) => LineOutcome::Delivered,
                        Err(_) => LineOutcome::ConsumerGone,
                    },
                }
            }
            Frame::NonTelemetry(record) => {
                debug!(summary = %record.summary(), "Non-telemetry line");
                self.diagnostics.emit(Diagnostic::NonTelemetry {
                    summary: record.summary(),
                });
                LineOutcome::Skipped
            }
            Frame::Malformed(e) => {
                debug!(error = %e, "Malformed line");
                self.diagnostics.emit(Diagnostic::ParseError { preview: e.preview });
                LineOutcome::Skipped
            }
        }
    }

    /// Closes the transport, then reports what was released.
    async fn close(&self, connection: Connection) {
        let bound = connection
            .link()
            .lease()
            .map(|lease| lease.path().display().to_string());

        connection.close().await;
        self.diagnostics.emit(Diagnostic::SocketClosed);
        if let Some(path) = bound {
            self.diagnostics.emit(Diagnostic::Released { path });
        }
    }

    fn set_state(&self, next: LinkState) {
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(address = %self.address, state = %next, "Link state changed");
        } else {
            let current = *self.state.borrow();
            warn!(address = %self.address, %current, requested = %next, "Ignored illegal state transition");
        }
    }
}
