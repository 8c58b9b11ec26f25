//! The host capabilities a supervisor is built from.

use std::sync::Arc;

use gpslink_bluez::{
    BluezControl, Connector, DeviceBinder, DeviceConnector, LinkControl, RfcommConnector,
    RfcommTool, SdpTool, ServiceDiscovery,
};

use crate::config::{LinkConfig, TransportKind};

/// Discovery, recovery and transport implementations.
///
/// Production code uses [`Capabilities::host`]; tests substitute scripted
/// implementations of each trait.
#[derive(Clone)]
pub struct Capabilities {
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub control: Arc<dyn LinkControl>,
    pub connector: Arc<dyn Connector>,
}

impl Capabilities {
    /// BlueZ tools plus the transport selected in `config`.
    pub fn host(config: &LinkConfig) -> Self {
        let connector: Arc<dyn Connector> = match config.transport {
            TransportKind::Socket => Arc::new(RfcommConnector::new()),
            TransportKind::Device => {
                let facility = RfcommTool::new(config.use_sudo).with_timeouts(
                    config.binder.bind_timeout(),
                    config.binder.release_timeout(),
                );
                let binder = DeviceBinder::new(Arc::new(facility), config.binder.to_binder_config());
                Arc::new(DeviceConnector::new(binder))
            }
        };

        Self {
            discovery: Arc::new(SdpTool::new(config.discovery.timeout())),
            control: Arc::new(BluezControl::new(config.use_sudo)),
            connector,
        }
    }
}
