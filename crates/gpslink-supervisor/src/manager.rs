//! Connection establishment with policy-driven recovery.
//!
//! Each attempt opens a fresh transport under a connect deadline. A
//! failure is classified into an [`ErrorClass`] and the [`RetryPolicy`]
//! decides what happens before the next attempt. Per-attempt errors never
//! escape; the caller sees either a [`Connection`] or one final
//! [`ConnectError`] carrying the last classification.
//!
//! **Panic-Free Policy:** no `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside of tests.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gpslink_bluez::{Connector, Link, LinkControl};
use gpslink_core::{Channel, Endpoint, ErrorClass};

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::resolver::ChannelCandidateList;
use crate::retry::{AttemptContext, RecoveryAction, RetryPolicy};

// ============================================================================
// Errors
// ============================================================================

/// Final outcome of a failed [`ConnectionManager::connect`].
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Every allowed attempt failed.
    #[error("Could not connect to {endpoint} after {attempts} attempt(s): {class} ({detail})")]
    Exhausted {
        endpoint: Endpoint,
        attempts: u32,
        class: ErrorClass,
        detail: String,
        tried: Vec<Channel>,
    },

    /// Recovery escalated to giving up before attempts ran out.
    #[error("Gave up on {endpoint} after {attempts} attempt(s): {class} ({detail})")]
    GaveUp {
        endpoint: Endpoint,
        attempts: u32,
        class: ErrorClass,
        detail: String,
        tried: Vec<Channel>,
    },

    #[error("Connect cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Classification of the last failed attempt.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ConnectError::Exhausted { class, .. } | ConnectError::GaveUp { class, .. } => {
                Some(*class)
            }
            ConnectError::Cancelled => None,
        }
    }

    /// Channels attempted, in order, without repeats.
    pub fn tried(&self) -> &[Channel] {
        match self {
            ConnectError::Exhausted { tried, .. } | ConnectError::GaveUp { tried, .. } => tried,
            ConnectError::Cancelled => &[],
        }
    }

    /// True when the remote is absent, so other channels cannot help.
    pub fn is_host_absent(&self) -> bool {
        self.class().is_some_and(ErrorClass::is_host_absent)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// The single live transport owned by a supervisor.
#[derive(Debug)]
pub struct Connection {
    endpoint: Endpoint,
    link: Link,
    attempts: u32,
}

impl Connection {
    /// The endpoint that accepted the connection.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Attempts it took, counting from 1.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }

    /// Closes the transport and releases any bound device.
    pub async fn close(self) {
        self.link.close().await;
    }
}

// ============================================================================
// Connection Manager
// ============================================================================

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    control: Arc<dyn LinkControl>,
    policy: RetryPolicy,
    connect_timeout: Duration,
    diagnostics: DiagnosticSink,
}

/// Outcome of running one recovery plan.
enum Recovery {
    Continue,
    GiveUp,
    Cancelled,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        control: Arc<dyn LinkControl>,
        policy: RetryPolicy,
        connect_timeout: Duration,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            connector,
            control,
            policy,
            connect_timeout,
            diagnostics,
        }
    }

    /// Name of the underlying transport.
    pub fn transport_kind(&self) -> &'static str {
        self.connector.kind()
    }

    /// Connects to `endpoint`, making at most `max_attempts` attempts.
    ///
    /// `candidates` supplies the channel used when the policy asks for an
    /// alternate. No recovery runs after the final attempt.
    pub async fn connect(
        &self,
        endpoint: Endpoint,
        candidates: &ChannelCandidateList,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<Connection, ConnectError> {
        let max_attempts = max_attempts.max(1);
        let mut current = endpoint;
        let mut tried: Vec<Channel> = Vec::new();
        let mut last: (ErrorClass, String) = (ErrorClass::Unclassified, String::new());

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return Err(ConnectError::Cancelled);
            }
            if !tried.contains(&current.channel()) {
                tried.push(current.channel());
            }

            self.diagnostics.emit(Diagnostic::ConnectAttempt {
                attempt: attempt + 1,
                max_attempts,
                channel: current.channel(),
            });

            let (class, detail) = match self.attempt(&current, cancel).await {
                AttemptResult::Connected(link) => {
                    info!(endpoint = %current, attempts = attempt + 1, "Connected");
                    return Ok(Connection {
                        endpoint: current,
                        link,
                        attempts: attempt + 1,
                    });
                }
                AttemptResult::Cancelled => return Err(ConnectError::Cancelled),
                AttemptResult::Failed(class, detail) => (class, detail),
            };

            warn!(endpoint = %current, attempt, %class, %detail, "Connect attempt failed");
            self.diagnostics.emit(Diagnostic::ConnectError {
                class,
                detail: detail.clone(),
            });
            last = (class, detail);

            if attempt + 1 >= max_attempts {
                break;
            }

            let ctx = AttemptContext {
                attempt,
                class,
                on_default_channel: current.channel().is_default(),
                alternate_available: candidates.after(current.channel()).is_some(),
            };
            let plan = self.policy.plan(&ctx);
            debug!(?ctx, ?plan, "Recovery plan");

            match self.recover(&plan, &mut current, candidates, cancel).await {
                Recovery::Continue => {}
                Recovery::Cancelled => return Err(ConnectError::Cancelled),
                Recovery::GiveUp => {
                    let (class, detail) = last;
                    return Err(ConnectError::GaveUp {
                        endpoint: current,
                        attempts: attempt + 1,
                        class,
                        detail,
                        tried,
                    });
                }
            }
        }

        let (class, detail) = last;
        Err(ConnectError::Exhausted {
            endpoint: current,
            attempts: max_attempts,
            class,
            detail,
            tried,
        })
    }

    async fn attempt(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> AttemptResult {
        let deadline = self.connector.connect_deadline(self.connect_timeout);
        let result = tokio::select! {
            _ = cancel.cancelled() => return AttemptResult::Cancelled,
            result = timeout(deadline, self.connector.connect(endpoint)) => result,
        };

        match result {
            Ok(Ok(link)) => AttemptResult::Connected(link),
            Ok(Err(e)) => AttemptResult::Failed(e.class(), e.to_string()),
            Err(_) => AttemptResult::Failed(
                ErrorClass::Timeout,
                format!("no answer within {}s", deadline.as_secs()),
            ),
        }
    }

    async fn recover(
        &self,
        plan: &[RecoveryAction],
        current: &mut Endpoint,
        candidates: &ChannelCandidateList,
        cancel: &CancellationToken,
    ) -> Recovery {
        let address = current.address();

        for action in plan {
            match *action {
                RecoveryAction::ReleaseAndRebind => {
                    let released = tokio::select! {
                        _ = cancel.cancelled() => return Recovery::Cancelled,
                        released = self.control.release_local(address) => released,
                    };
                    match released {
                        Ok(true) => self.diagnostics.emit(Diagnostic::ReleasingExisting { address }),
                        Ok(false) => debug!(%address, "Nothing bound locally"),
                        // Not fatal: the next attempt opens a fresh handle anyway.
                        Err(e) => warn!(%address, error = %e, "Releasing local bindings failed"),
                    }
                }
                RecoveryAction::ResetDeviceLink => {
                    let reset = tokio::select! {
                        _ = cancel.cancelled() => return Recovery::Cancelled,
                        reset = self.control.reset_link(address) => reset,
                    };
                    match reset {
                        Ok(()) => self.diagnostics.emit(Diagnostic::BluetoothReset { address }),
                        Err(e) => {
                            warn!(%address, error = %e, "Link reset failed; giving up");
                            self.diagnostics.emit(Diagnostic::ResetError {
                                reason: e.to_string(),
                            });
                            return Recovery::GiveUp;
                        }
                    }
                }
                RecoveryAction::TryAlternateChannel => match candidates.after(current.channel()) {
                    Some(next) => {
                        *current = current.with_channel(next);
                        self.diagnostics.emit(Diagnostic::TryingChannel { channel: next });
                    }
                    None => debug!(channel = %current.channel(), "No alternate channel left"),
                },
                RecoveryAction::WaitBackoff(delay) => {
                    self.diagnostics.emit(Diagnostic::RetryWait { delay });
                    tokio::select! {
                        _ = cancel.cancelled() => return Recovery::Cancelled,
                        _ = sleep(delay) => {}
                    }
                }
                RecoveryAction::GiveUp => return Recovery::GiveUp,
            }
        }

        Recovery::Continue
    }
}

enum AttemptResult {
    Connected(Link),
    Failed(ErrorClass, String),
    Cancelled,
}
