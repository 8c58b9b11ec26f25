//! Service discovery (SDP) against a remote device.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use gpslink_core::{BtAddress, Channel};

use crate::command::{CommandError, ToolCommand};

/// Errors from a service browse. Always recoverable: callers fall back to
/// default channels.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Service discovery failed: {0}")]
    Tool(#[from] CommandError),

    #[error("Service discovery unavailable: {0}")]
    Unavailable(String),
}

/// One advertised RFCOMM service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Advertised service name, if the record carried one.
    pub name: Option<String>,
    pub channel: Channel,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, channel: Channel) -> Self {
        Self {
            name: Some(name.into()),
            channel,
        }
    }

    /// Case-insensitive substring match of the name against any keyword.
    pub fn matches_any(&self, keywords: &[String]) -> bool {
        let Some(name) = &self.name else {
            return false;
        };
        let name = name.to_lowercase();
        keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && name.contains(&keyword.to_lowercase()))
    }
}

/// Enumerates the services a remote device advertises.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Returns RFCOMM services in the order the remote reported them.
    ///
    /// May hang; callers bound it with their own deadline.
    async fn browse(&self, address: BtAddress) -> Result<Vec<ServiceRecord>, DiscoveryError>;
}

// ============================================================================
// sdptool
// ============================================================================

/// Discovery through `sdptool browse <address>`.
#[derive(Debug, Clone)]
pub struct SdpTool {
    timeout: Duration,
}

impl SdpTool {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SdpTool {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl ServiceDiscovery for SdpTool {
    async fn browse(&self, address: BtAddress) -> Result<Vec<ServiceRecord>, DiscoveryError> {
        let output = ToolCommand::new("sdptool")
            .args(["browse".to_string(), address.to_string()])
            .timeout(self.timeout)
            .run()
            .await?;

        let records = parse_sdp_records(&output.stdout);
        debug!(%address, count = records.len(), "Parsed SDP records");
        Ok(records)
    }
}

/// Parses `sdptool browse` output into RFCOMM service records.
///
/// Records are separated by blank lines. A record contributes only if it
/// lists an RFCOMM `Channel:`; `Service Name:` is optional.
pub fn parse_sdp_records(output: &str) -> Vec<ServiceRecord> {
    let mut records = Vec::new();
    let mut name: Option<String> = None;
    let mut channel: Option<Channel> = None;

    let mut flush = |name: &mut Option<String>, channel: &mut Option<Channel>| {
        if let Some(channel) = channel.take() {
            records.push(ServiceRecord {
                name: name.take(),
                channel,
            });
        }
        *name = None;
    };

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut name, &mut channel);
            continue;
        }

        if let Some(value) = line.strip_prefix("Service Name:") {
            // A new name without a blank separator starts a new record.
            if name.is_some() || channel.is_some() {
                flush(&mut name, &mut channel);
            }
            let value = value.trim();
            if !value.is_empty() {
                name = Some(value.to_string());
            }
        } else if let Some(value) = line.strip_prefix("Channel:") {
            if channel.is_none() {
                channel = value.trim().parse::<Channel>().ok();
            }
        }
    }
    flush(&mut name, &mut channel);

    records
}
