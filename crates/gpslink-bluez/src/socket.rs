//! Direct RFCOMM socket transport (BlueZ via `bluer`).

use async_trait::async_trait;
use tracing::debug;

use gpslink_core::Endpoint;

use crate::transport::{Connector, Link, TransportError};

/// Opens RFCOMM stream sockets with the host Bluetooth stack.
///
/// A fresh socket is created for every call, so a handle left unusable by
/// an earlier failure is never reused.
#[derive(Debug, Clone, Copy, Default)]
pub struct RfcommConnector;

impl RfcommConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RfcommConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError> {
        debug!(%endpoint, "Opening RFCOMM socket");
        let stream = open(endpoint).await?;
        Ok(Link::new(stream, format!("rfcomm socket {endpoint}")))
    }

    fn kind(&self) -> &'static str {
        "socket"
    }
}

#[cfg(target_os = "linux")]
async fn open(endpoint: &Endpoint) -> Result<bluer::rfcomm::Stream, TransportError> {
    use bluer::rfcomm::{SocketAddr, Stream};

    let target = SocketAddr::new(
        bluer::Address::new(endpoint.address().octets()),
        endpoint.channel().get(),
    );
    Stream::connect(target)
        .await
        .map_err(|source| TransportError::Connect {
            endpoint: *endpoint,
            source,
        })
}

#[cfg(not(target_os = "linux"))]
async fn open(_endpoint: &Endpoint) -> Result<tokio::io::DuplexStream, TransportError> {
    Err(TransportError::Unsupported)
}
