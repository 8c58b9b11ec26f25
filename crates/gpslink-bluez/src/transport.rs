//! Transport-agnostic byte-stream links.
//!
//! A [`Connector`] turns an [`Endpoint`] into a [`Link`]: a boxed
//! `AsyncRead + AsyncWrite` stream, optionally holding a [`DeviceLease`]
//! that must be released when the link is closed.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use gpslink_core::{Endpoint, ErrorClass};

use crate::binder::DeviceLease;
use crate::binding::BindError;

/// Errors opening a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The session to the endpoint could not be established.
    #[error("Connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    /// A bound device file could not be opened.
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Bind(#[from] BindError),

    /// No transport implementation exists for this platform.
    #[error("RFCOMM sockets are not supported on this platform")]
    Unsupported,
}

impl TransportError {
    /// Classifies the failure for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Connect { source, .. } | TransportError::Open { source, .. } => {
                ErrorClass::from_io_error(source)
            }
            TransportError::Bind(_) | TransportError::Unsupported => ErrorClass::Unclassified,
        }
    }
}

/// Anything a link can stream over.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkStream for T {}

/// One open transport handle.
///
/// Closing is explicit ([`Link::close`]) so the device lease is released
/// before the caller moves on. Dropping without closing still releases
/// the lease on a best-effort basis.
pub struct Link {
    stream: Box<dyn LinkStream>,
    lease: Option<DeviceLease>,
    description: String,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("description", &self.description)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl Link {
    pub fn new(stream: impl LinkStream + 'static, description: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            lease: None,
            description: description.into(),
        }
    }

    /// Attaches a device lease to be released when the link closes.
    #[must_use]
    pub fn with_lease(mut self, lease: DeviceLease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Short description of the transport (socket, device path).
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn lease(&self) -> Option<&DeviceLease> {
        self.lease.as_ref()
    }

    /// The underlying stream.
    pub fn stream(&mut self) -> &mut (dyn LinkStream + 'static) {
        self.stream.as_mut()
    }

    /// Shuts the stream down and releases any lease. Never fails.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!(link = %self.description, error = %e, "Shutdown reported an error");
        }
        drop(self.stream);

        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
    }
}

/// Opens links to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a fresh link. The caller bounds this with its connect timeout.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError>;

    /// Name used in diagnostics (`socket`, `device`).
    fn kind(&self) -> &'static str;

    /// Deadline for one `connect` given the configured connect timeout.
    fn connect_deadline(&self, connect_timeout: Duration) -> Duration {
        connect_timeout
    }
}
