//! Recovery actions against the host Bluetooth stack.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use gpslink_core::BtAddress;

use crate::command::{CommandError, ToolCommand};

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Link control failed: {0}")]
    Tool(#[from] CommandError),

    #[error("Link control failed: {0}")]
    Other(String),
}

/// Host-side recovery capabilities used between connect attempts.
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Releases local RFCOMM bindings that hold `address`.
    ///
    /// Returns `true` if anything was released.
    async fn release_local(&self, address: BtAddress) -> Result<bool, ControlError>;

    /// Drops and re-establishes the OS-level association with `address`.
    async fn reset_link(&self, address: BtAddress) -> Result<(), ControlError>;
}

/// Timings for [`BluezControl`].
#[derive(Debug, Clone)]
pub struct ControlTimings {
    pub list_timeout: Duration,
    pub release_timeout: Duration,
    pub release_settle: Duration,
    pub disconnect_timeout: Duration,
    pub disconnect_settle: Duration,
    pub connect_timeout: Duration,
    pub connect_settle: Duration,
}

impl Default for ControlTimings {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(2),
            release_timeout: Duration::from_secs(2),
            release_settle: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(3),
            disconnect_settle: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            connect_settle: Duration::from_secs(2),
        }
    }
}

/// [`LinkControl`] via `rfcomm` and `bluetoothctl`.
#[derive(Debug, Clone, Default)]
pub struct BluezControl {
    sudo: bool,
    timings: ControlTimings,
}

impl BluezControl {
    pub fn new(sudo: bool) -> Self {
        Self {
            sudo,
            timings: ControlTimings::default(),
        }
    }

    #[must_use]
    pub fn with_timings(mut self, timings: ControlTimings) -> Self {
        self.timings = timings;
        self
    }
}

#[async_trait]
impl LinkControl for BluezControl {
    async fn release_local(&self, address: BtAddress) -> Result<bool, ControlError> {
        let listing = ToolCommand::new("rfcomm")
            .arg("-a")
            .timeout(self.timings.list_timeout)
            .output()
            .await?;

        if !listing_mentions(&listing.stdout, address) {
            debug!(%address, "No local RFCOMM binding to release");
            return Ok(false);
        }

        ToolCommand::new("rfcomm")
            .args(["release", "all"])
            .sudo(self.sudo)
            .timeout(self.timings.release_timeout)
            .run()
            .await?;
        sleep(self.timings.release_settle).await;

        info!(%address, "Released existing RFCOMM bindings");
        Ok(true)
    }

    async fn reset_link(&self, address: BtAddress) -> Result<(), ControlError> {
        let target = address.to_string();

        // Disconnect fails when the device is not connected; only a tool
        // that cannot run at all is an error here.
        ToolCommand::new("bluetoothctl")
            .args(["disconnect", target.as_str()])
            .timeout(self.timings.disconnect_timeout)
            .output()
            .await?;
        sleep(self.timings.disconnect_settle).await;

        ToolCommand::new("bluetoothctl")
            .args(["connect", target.as_str()])
            .timeout(self.timings.connect_timeout)
            .run()
            .await?;
        sleep(self.timings.connect_settle).await;

        info!(%address, "Reset device link");
        Ok(())
    }
}

/// True if an `rfcomm -a` listing contains `address` (case-insensitive).
fn listing_mentions(listing: &str, address: BtAddress) -> bool {
    listing
        .to_uppercase()
        .contains(&address.to_string().to_uppercase())
}
