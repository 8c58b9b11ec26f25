//! gpslink Supervisor - Keeps one telemetry link alive
//!
//! Composition, leaves first:
//!
//! - [`ChannelResolver`]: candidate RFCOMM channels, ranked by confidence
//! - [`RetryPolicy`]: `(attempt, error class) -> recovery actions` table
//! - [`ConnectionManager`]: bounded connect attempts driven by the policy
//! - [`LinkSupervisor`]: resolve, connect, stream, watch for staleness, reconnect
//!
//! Diagnostics travel on a side-channel ([`DiagnosticSink`]); validated
//! records travel on the [`RecordStream`].
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

pub mod capabilities;
pub mod config;
pub mod diagnostics;
pub mod manager;
pub mod resolver;
pub mod retry;
pub mod supervisor;

pub use capabilities::Capabilities;
pub use config::{ConfigError, LinkConfig, TransportKind};
pub use diagnostics::{Diagnostic, DiagnosticSink};
pub use manager::{ConnectError, Connection, ConnectionManager};
pub use resolver::{Candidate, ChannelCandidateList, ChannelResolver, Confidence};
pub use retry::{AttemptContext, RecoveryAction, RecoveryStep, RetryPolicy, RetryRule};
pub use supervisor::{LinkError, LinkSupervisor, RecordStream, StalenessError};
