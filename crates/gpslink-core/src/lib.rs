//! gpslink Core - Shared types for the Bluetooth GPS telemetry link
//!
//! This crate provides the domain types shared between the wire
//! protocol (`gpslink-protocol`), the host Bluetooth integration
//! (`gpslink-bluez`) and the link supervisor (`gpslink-supervisor`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod class;
pub mod endpoint;
pub mod error;
pub mod state;
pub mod telemetry;

// Re-exports for convenience
pub use class::ErrorClass;
pub use endpoint::{BtAddress, Channel, Endpoint};
pub use error::{DomainError, DomainResult};
pub use state::LinkState;
pub use telemetry::{Position, RecordTimestamp, TelemetryRecord};
