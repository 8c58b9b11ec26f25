//! Scripted capabilities shared by the supervisor integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

use gpslink_bluez::{
    BindError, BindingFacility, Connector, ControlError, DeviceLease, DiscoveryError, Link,
    LinkControl, LinkStream, ServiceDiscovery, ServiceRecord, TransportError,
};
use gpslink_core::{BtAddress, Channel, Endpoint};
use gpslink_protocol::FrameDecoder;
use gpslink_supervisor::{Capabilities, Diagnostic, DiagnosticSink, LinkConfig, LinkSupervisor};

pub const FIXED_NOW_MS: i64 = 1_700_000_000_000;

pub fn address() -> BtAddress {
    "AA:BB:CC:DD:EE:FF".parse().unwrap()
}

pub fn channel(n: u16) -> Channel {
    Channel::new(n).unwrap()
}

pub fn numbers(channels: &[Channel]) -> Vec<u8> {
    channels.iter().map(|c| c.get()).collect()
}

/// Decoder whose injected timestamps are always [`FIXED_NOW_MS`].
pub fn fixed_decoder() -> FrameDecoder {
    FrameDecoder::with_clock(|| FIXED_NOW_MS)
}

/// Defaults with nothing that needs a real host.
pub fn test_config() -> LinkConfig {
    LinkConfig {
        use_sudo: false,
        ..LinkConfig::default()
    }
}

/// A connected in-memory pair: `(supervisor side, peer side)`.
pub fn pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(4096)
}

/// Everything sent so far on the diagnostic channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Diagnostic>) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    while let Ok(diagnostic) = rx.try_recv() {
        out.push(diagnostic);
    }
    out
}

pub fn tags(diagnostics: &[Diagnostic]) -> Vec<&'static str> {
    diagnostics.iter().map(Diagnostic::tag).collect()
}

pub fn count(diagnostics: &[Diagnostic], tag: &str) -> usize {
    diagnostics.iter().filter(|d| d.tag() == tag).count()
}

pub fn position(diagnostics: &[Diagnostic], tag: &str) -> Option<usize> {
    diagnostics.iter().position(|d| d.tag() == tag)
}

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

pub enum DiscoveryScript {
    Records(Vec<ServiceRecord>),
    Fail,
    Hang,
}

pub struct ScriptedDiscovery {
    script: DiscoveryScript,
    calls: AtomicU32,
}

impl ScriptedDiscovery {
    pub fn new(script: DiscoveryScript) -> Self {
        Self {
            script,
            calls: AtomicU32::new(0),
        }
    }

    /// Advertises one serial-port service per channel.
    pub fn serial(channels: &[u16]) -> Self {
        Self::new(DiscoveryScript::Records(
            channels
                .iter()
                .map(|n| ServiceRecord::new("Serial Port", channel(*n)))
                .collect(),
        ))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceDiscovery for ScriptedDiscovery {
    async fn browse(&self, _address: BtAddress) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            DiscoveryScript::Records(records) => Ok(records.clone()),
            DiscoveryScript::Fail => Err(DiscoveryError::Unavailable(
                "Failed to connect to SDP server".to_string(),
            )),
            DiscoveryScript::Hang => std::future::pending().await,
        }
    }
}

// ----------------------------------------------------------------------------
// Link control
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedControl {
    releases: AtomicU32,
    resets: AtomicU32,
    reset_fails: bool,
}

impl ScriptedControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_reset() -> Self {
        Self {
            reset_fails: true,
            ..Self::default()
        }
    }

    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LinkControl for ScriptedControl {
    async fn release_local(&self, _address: BtAddress) -> Result<bool, ControlError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn reset_link(&self, _address: BtAddress) -> Result<(), ControlError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.reset_fails {
            Err(ControlError::Other("Device not available".to_string()))
        } else {
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

/// What one connect attempt on a channel does.
pub enum Outcome {
    Accept(Box<dyn LinkStream>),
    AcceptLeased(Box<dyn LinkStream>, DeviceLease),
    Refuse,
    Unreachable,
    BadState,
    Hang,
}

impl Outcome {
    pub fn accept(stream: impl LinkStream + 'static) -> Self {
        Outcome::Accept(Box::new(stream))
    }

    fn error(endpoint: &Endpoint, source: io::Error) -> TransportError {
        TransportError::Connect {
            endpoint: *endpoint,
            source,
        }
    }
}

/// Connector driven by per-channel outcome queues.
///
/// A channel with an empty queue refuses the connection.
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<HashMap<u8, VecDeque<Outcome>>>,
    attempts: Mutex<Vec<(Channel, Instant)>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, channel: u16, outcome: Outcome) {
        let number = u8::try_from(channel).unwrap();
        self.scripts
            .lock()
            .unwrap()
            .entry(number)
            .or_default()
            .push_back(outcome);
    }

    /// Channels attempted, in order.
    pub fn attempts(&self) -> Vec<Channel> {
        self.attempts.lock().unwrap().iter().map(|(c, _)| *c).collect()
    }

    /// Time between consecutive attempts.
    pub fn gaps(&self) -> Vec<Duration> {
        let attempts = self.attempts.lock().unwrap();
        attempts
            .windows(2)
            .map(|w| w[1].1.duration_since(w[0].1))
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError> {
        self.attempts
            .lock()
            .unwrap()
            .push((endpoint.channel(), Instant::now()));
        let outcome = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&endpoint.channel().get())
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Refuse);

        match outcome {
            Outcome::Accept(stream) => Ok(Link::new(stream, "scripted")),
            Outcome::AcceptLeased(stream, lease) => {
                Ok(Link::new(stream, "scripted").with_lease(lease))
            }
            Outcome::Refuse => Err(Outcome::error(
                endpoint,
                io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused"),
            )),
            Outcome::Unreachable => Err(Outcome::error(
                endpoint,
                io::Error::from_raw_os_error(libc::EHOSTDOWN),
            )),
            Outcome::BadState => Err(Outcome::error(
                endpoint,
                io::Error::from_raw_os_error(libc::EBADF),
            )),
            Outcome::Hang => std::future::pending().await,
        }
    }

    fn kind(&self) -> &'static str {
        "scripted"
    }
}

// ----------------------------------------------------------------------------
// Streams and facilities
// ----------------------------------------------------------------------------

/// Stream whose shutdown takes `delay`, so a watcher can observe the
/// state the supervisor is in while it closes the link.
pub struct SlowClose {
    inner: DuplexStream,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl SlowClose {
    pub fn new(inner: DuplexStream, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            sleep: None,
        }
    }
}

impl AsyncRead for SlowClose {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SlowClose {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let delay = self.delay;
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
        ready!(sleep.as_mut().poll(cx));
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Binding facility over a temp directory that counts releases.
pub struct CountingFacility {
    dir: PathBuf,
    releases: AtomicU32,
}

impl CountingFacility {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            releases: AtomicU32::new(0),
        }
    }

    pub fn releases(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BindingFacility for CountingFacility {
    async fn bind(&self, slot: u8, _endpoint: &Endpoint) -> Result<(), BindError> {
        std::fs::write(self.dir.join(format!("rfcomm{slot}")), b"")
            .map_err(|e| BindError::Other(e.to_string()))
    }

    async fn release(&self, slot: u8) -> Result<(), BindError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        let _ = std::fs::remove_file(self.dir.join(format!("rfcomm{slot}")));
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

pub struct Harness {
    pub discovery: Arc<ScriptedDiscovery>,
    pub control: Arc<ScriptedControl>,
    pub connector: Arc<ScriptedConnector>,
}

impl Harness {
    pub fn new(discovery: ScriptedDiscovery) -> Self {
        Self::with_control(discovery, ScriptedControl::new())
    }

    pub fn with_control(discovery: ScriptedDiscovery, control: ScriptedControl) -> Self {
        Self {
            discovery: Arc::new(discovery),
            control: Arc::new(control),
            connector: Arc::new(ScriptedConnector::new()),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            discovery: self.discovery.clone(),
            control: self.control.clone(),
            connector: self.connector.clone(),
        }
    }

    pub fn supervisor(
        &self,
        config: LinkConfig,
        cancel: CancellationToken,
    ) -> (LinkSupervisor, mpsc::UnboundedReceiver<Diagnostic>) {
        let (sink, rx) = DiagnosticSink::channel();
        let supervisor = LinkSupervisor::new(address(), config, self.capabilities(), sink, cancel)
            .with_decoder(fixed_decoder());
        (supervisor, rx)
    }
}
