//! Privileged `/dev/rfcommN` binding facility.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use gpslink_core::Endpoint;

use crate::command::{CommandError, ToolCommand};

#[derive(Error, Debug)]
pub enum BindError {
    #[error("Bind tool failed: {0}")]
    Tool(#[from] CommandError),

    #[error("No free RFCOMM slot under {dir}")]
    NoFreeSlot { dir: PathBuf },

    #[error("Could not bind {endpoint} (tried channels {tried})")]
    Exhausted { endpoint: Endpoint, tried: String },

    #[error("Bind failed: {0}")]
    Other(String),
}

/// Binds numbered device slots to remote endpoints.
///
/// Implementations only run the facility; slot allocation and path
/// confirmation are done by [`crate::DeviceBinder`].
#[async_trait]
pub trait BindingFacility: Send + Sync {
    async fn bind(&self, slot: u8, endpoint: &Endpoint) -> Result<(), BindError>;

    async fn release(&self, slot: u8) -> Result<(), BindError>;
}

/// [`BindingFacility`] via `rfcomm bind` / `rfcomm release`.
#[derive(Debug, Clone)]
pub struct RfcommTool {
    sudo: bool,
    bind_timeout: Duration,
    release_timeout: Duration,
}

impl RfcommTool {
    pub fn new(sudo: bool) -> Self {
        Self {
            sudo,
            bind_timeout: Duration::from_secs(5),
            release_timeout: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, bind: Duration, release: Duration) -> Self {
        self.bind_timeout = bind;
        self.release_timeout = release;
        self
    }

    fn bind_command(&self, slot: u8, endpoint: &Endpoint) -> ToolCommand {
        ToolCommand::new("rfcomm")
            .args([
                "bind".to_string(),
                slot.to_string(),
                endpoint.address().to_string(),
                endpoint.channel().to_string(),
            ])
            .sudo(self.sudo)
            .timeout(self.bind_timeout)
    }

    fn release_command(&self, slot: u8) -> ToolCommand {
        ToolCommand::new("rfcomm")
            .args(["release".to_string(), slot.to_string()])
            .sudo(self.sudo)
            .timeout(self.release_timeout)
    }
}

#[async_trait]
impl BindingFacility for RfcommTool {
    async fn bind(&self, slot: u8, endpoint: &Endpoint) -> Result<(), BindError> {
        self.bind_command(slot, endpoint).run().await?;
        Ok(())
    }

    async fn release(&self, slot: u8) -> Result<(), BindError> {
        self.release_command(slot).run().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpslink_core::{BtAddress, Channel};

    #[test]
    fn test_bind_command_line() {
        let endpoint = Endpoint::new(
            "AA:BB:CC:DD:EE:FF".parse::<BtAddress>().unwrap(),
            Channel::new(3).unwrap(),
        );
        let tool = RfcommTool::new(true);

        assert_eq!(
            tool.bind_command(0, &endpoint).display(),
            "sudo rfcomm bind 0 AA:BB:CC:DD:EE:FF 3"
        );
        assert_eq!(tool.release_command(7).display(), "sudo rfcomm release 7");
    }

    #[test]
    fn test_without_sudo() {
        let tool = RfcommTool::new(false);
        assert_eq!(tool.release_command(1).display(), "rfcomm release 1");
    }
}
