//! gpslink BlueZ - Host Bluetooth integration
//!
//! Everything that touches the host Bluetooth stack lives behind a narrow
//! capability trait so the supervisor's retry and streaming logic can be
//! exercised against scripted implementations:
//!
//! - [`ServiceDiscovery`]: enumerate advertised services (`sdptool browse`)
//! - [`LinkControl`]: release local bindings, reset the device link (`rfcomm`, `bluetoothctl`)
//! - [`BindingFacility`]: bind/release `/dev/rfcommN` slots (`rfcomm bind`)
//! - [`Connector`]: open a byte-stream [`Link`] to an endpoint (RFCOMM socket or bound device)
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

pub mod binder;
pub mod binding;
pub mod command;
pub mod control;
pub mod discovery;
pub mod socket;
pub mod transport;

pub use binder::{BinderConfig, DeviceBinder, DeviceConnector, DeviceLease};
pub use binding::{BindError, BindingFacility, RfcommTool};
pub use command::{CommandError, ToolCommand, ToolOutput};
pub use control::{BluezControl, ControlError, LinkControl};
pub use discovery::{parse_sdp_records, DiscoveryError, SdpTool, ServiceDiscovery, ServiceRecord};
pub use socket::RfcommConnector;
pub use transport::{Connector, Link, LinkStream, TransportError};
