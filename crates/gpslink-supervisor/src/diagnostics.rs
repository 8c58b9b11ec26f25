//! Diagnostic side-channel.
//!
//! Every notable event of the link is a [`Diagnostic`]. They are delivered
//! over an unbounded channel and rendered as single `EVENT_NAME:details`
//! lines; nothing downstream parses them.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use gpslink_core::{BtAddress, Channel, Endpoint, ErrorClass};

/// One observable event.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    ScanningServices { address: BtAddress },
    FoundService { channel: Channel, name: String },
    ServiceScanError { reason: String },
    Channels { channels: Vec<Channel> },
    ConnectAttempt { attempt: u32, max_attempts: u32, channel: Channel },
    ConnectError { class: ErrorClass, detail: String },
    ReleasingExisting { address: BtAddress },
    BluetoothReset { address: BtAddress },
    ResetError { reason: String },
    TryingChannel { channel: Channel },
    RetryWait { delay: Duration },
    TryingCommonPorts { channels: Vec<Channel> },
    TryingPort { channel: Channel },
    Connected { endpoint: Endpoint, transport: &'static str },
    HandshakeSent,
    HandshakeError { reason: String },
    ParseError { preview: String },
    NonTelemetry { summary: String },
    DataTimeout { idle: Duration },
    ConnectionLost { reason: String },
    Reconnecting { cycle: u32, budget: u32 },
    Bound { path: String, endpoint: Endpoint },
    Released { path: String },
    ConnectionFailed { reason: String },
    FatalError { reason: String },
    SocketClosed,
    Disconnected,
}

impl Diagnostic {
    /// The `EVENT_NAME` part.
    pub fn tag(&self) -> &'static str {
        match self {
            Diagnostic::ScanningServices { .. } => "SCANNING_SERVICES",
            Diagnostic::FoundService { .. } => "FOUND_SERVICE",
            Diagnostic::ServiceScanError { .. } => "SERVICE_SCAN_ERROR",
            Diagnostic::Channels { .. } => "CHANNELS",
            Diagnostic::ConnectAttempt { .. } => "CONNECT_ATTEMPT",
            Diagnostic::ConnectError { .. } => "CONNECT_ERROR",
            Diagnostic::ReleasingExisting { .. } => "RELEASING_EXISTING",
            Diagnostic::BluetoothReset { .. } => "BLUETOOTH_RESET",
            Diagnostic::ResetError { .. } => "RESET_ERROR",
            Diagnostic::TryingChannel { .. } => "TRYING_CHANNEL",
            Diagnostic::RetryWait { .. } => "RETRY_WAIT",
            Diagnostic::TryingCommonPorts { .. } => "TRYING_COMMON_PORTS",
            Diagnostic::TryingPort { .. } => "TRYING_PORT",
            Diagnostic::Connected { .. } => "CONNECTED",
            Diagnostic::HandshakeSent => "HANDSHAKE_SENT",
            Diagnostic::HandshakeError { .. } => "HANDSHAKE_ERROR",
            Diagnostic::ParseError { .. } => "PARSE_ERROR",
            Diagnostic::NonTelemetry { .. } => "NON_TELEMETRY",
            Diagnostic::DataTimeout { .. } => "DATA_TIMEOUT",
            Diagnostic::ConnectionLost { .. } => "CONNECTION_LOST",
            Diagnostic::Reconnecting { .. } => "RECONNECTING",
            Diagnostic::Bound { .. } => "BOUND",
            Diagnostic::Released { .. } => "RELEASED",
            Diagnostic::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Diagnostic::FatalError { .. } => "FATAL_ERROR",
            Diagnostic::SocketClosed => "SOCKET_CLOSED",
            Diagnostic::Disconnected => "DISCONNECTED",
        }
    }
}

fn join_channels(channels: &[Channel]) -> String {
    channels
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Single-line rendering; embedded newlines would break the line format.
fn one_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        match self {
            Diagnostic::ScanningServices { address }
            | Diagnostic::ReleasingExisting { address }
            | Diagnostic::BluetoothReset { address } => write!(f, "{tag}:{address}"),
            Diagnostic::FoundService { channel, name } => {
                write!(f, "{tag}:port={channel},name={}", one_line(name))
            }
            Diagnostic::ServiceScanError { reason }
            | Diagnostic::ResetError { reason }
            | Diagnostic::HandshakeError { reason }
            | Diagnostic::ConnectionLost { reason }
            | Diagnostic::ConnectionFailed { reason }
            | Diagnostic::FatalError { reason } => write!(f, "{tag}:{}", one_line(reason)),
            Diagnostic::Channels { channels } | Diagnostic::TryingCommonPorts { channels } => {
                write!(f, "{tag}:{}", join_channels(channels))
            }
            Diagnostic::ConnectAttempt {
                attempt,
                max_attempts,
                channel,
            } => write!(f, "{tag}:{attempt}/{max_attempts},channel={channel}"),
            Diagnostic::ConnectError { class, detail } => {
                write!(f, "{tag}:{class},{}", one_line(detail))
            }
            Diagnostic::TryingChannel { channel } | Diagnostic::TryingPort { channel } => {
                write!(f, "{tag}:{channel}")
            }
            Diagnostic::RetryWait { delay } => write!(f, "{tag}:{}s", delay.as_secs_f64()),
            Diagnostic::Connected {
                endpoint,
                transport,
            } => write!(
                f,
                "{tag}:{},channel={},transport={transport}",
                endpoint.address(),
                endpoint.channel()
            ),
            Diagnostic::ParseError { preview } => write!(f, "{tag}:{}", one_line(preview)),
            Diagnostic::NonTelemetry { summary } => write!(f, "{tag}:{summary}"),
            Diagnostic::DataTimeout { idle } => write!(f, "{tag}:{}s", idle.as_secs()),
            Diagnostic::Reconnecting { cycle, budget } => write!(f, "{tag}:{cycle}/{budget}"),
            Diagnostic::Bound { path, endpoint } => {
                write!(f, "{tag}:{path},channel={}", endpoint.channel())
            }
            Diagnostic::Released { path } => write!(f, "{tag}:{path}"),
            Diagnostic::HandshakeSent | Diagnostic::SocketClosed | Diagnostic::Disconnected => {
                f.write_str(tag)
            }
        }
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Cloneable sender half of the diagnostic channel.
///
/// Sending never blocks and never fails the caller; with no receiver the
/// event is only traced.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticSink {
    tx: Option<mpsc::UnboundedSender<Diagnostic>>,
}

impl DiagnosticSink {
    pub fn new(tx: mpsc::UnboundedSender<Diagnostic>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink plus the receiver to drain it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Diagnostic>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A sink that only traces.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        debug!(diagnostic = %diagnostic, "Link event");
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is listening; not an error.
            let _ = tx.send(diagnostic);
        }
    }
}
