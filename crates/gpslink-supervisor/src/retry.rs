//! Recovery policy between connect attempts.
//!
//! The policy is data: an ordered list of [`RetryRule`]s, first match
//! wins. Each rule maps the context of a failed attempt (attempt index,
//! error class, channel situation) to the steps taken before the next
//! attempt. Rules can be replaced from the config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use gpslink_core::ErrorClass;

/// Steps used when no rule matches.
const FALLBACK_STEPS: &[RecoveryStep] = &[RecoveryStep::Backoff];

/// A concrete action the connection manager performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Release local bindings so the next attempt starts from a clean handle.
    ReleaseAndRebind,
    /// Disconnect and reconnect the device at the OS layer.
    ResetDeviceLink,
    /// Move on to the next candidate channel.
    TryAlternateChannel,
    /// Sleep before the next attempt.
    WaitBackoff(Duration),
    /// Stop attempting.
    GiveUp,
}

/// A step as written in a rule; `Backoff` is resolved per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStep {
    ReleaseAndRebind,
    ResetDeviceLink,
    TryAlternateChannel,
    Backoff,
    GiveUp,
}

/// What is known about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// Zero-based attempt index.
    pub attempt: u32,
    pub class: ErrorClass,
    /// The attempt used the standard SPP channel.
    pub on_default_channel: bool,
    /// Another candidate channel is left to try.
    pub alternate_available: bool,
}

/// One row of the policy table. Unset conditions match anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default)]
    pub default_channel_only: bool,
    #[serde(default)]
    pub needs_alternate: bool,
    pub steps: Vec<RecoveryStep>,
}

impl RetryRule {
    /// Rule matching every failure of `class`.
    pub fn for_class(class: ErrorClass, steps: Vec<RecoveryStep>) -> Self {
        Self {
            class: Some(class),
            attempt: None,
            default_channel_only: false,
            needs_alternate: false,
            steps,
        }
    }

    pub fn matches(&self, ctx: &AttemptContext) -> bool {
        self.class.map_or(true, |class| class == ctx.class)
            && self.attempt.map_or(true, |attempt| attempt == ctx.attempt)
            && (!self.default_channel_only || ctx.on_default_channel)
            && (!self.needs_alternate || ctx.alternate_available)
    }
}

/// Ordered rule table plus the linear backoff step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Backoff after attempt `i` is `(i + 1) * backoff_step_secs`.
    pub backoff_step_secs: u64,
    pub rules: Vec<RetryRule>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_step_secs: 2,
            rules: vec![
                RetryRule::for_class(
                    ErrorClass::TransportBadState,
                    vec![RecoveryStep::ReleaseAndRebind, RecoveryStep::Backoff],
                ),
                RetryRule::for_class(
                    ErrorClass::UnreachableHost,
                    vec![RecoveryStep::ResetDeviceLink, RecoveryStep::Backoff],
                ),
                RetryRule {
                    class: Some(ErrorClass::RefusedNoService),
                    attempt: Some(0),
                    default_channel_only: true,
                    needs_alternate: true,
                    steps: vec![RecoveryStep::TryAlternateChannel],
                },
            ],
        }
    }
}

impl RetryPolicy {
    /// Backoff after the zero-based `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_step_secs).saturating_mul(attempt.saturating_add(1))
    }

    /// Actions to run after a failed attempt, in order.
    ///
    /// Falls back to a plain backoff when no rule matches.
    pub fn plan(&self, ctx: &AttemptContext) -> Vec<RecoveryAction> {
        let steps: &[RecoveryStep] = self
            .rules
            .iter()
            .find(|rule| rule.matches(ctx))
            .map_or(FALLBACK_STEPS, |rule| rule.steps.as_slice());

        steps
            .iter()
            .map(|step| match step {
                RecoveryStep::ReleaseAndRebind => RecoveryAction::ReleaseAndRebind,
                RecoveryStep::ResetDeviceLink => RecoveryAction::ResetDeviceLink,
                RecoveryStep::TryAlternateChannel => RecoveryAction::TryAlternateChannel,
                RecoveryStep::Backoff => RecoveryAction::WaitBackoff(self.backoff(ctx.attempt)),
                RecoveryStep::GiveUp => RecoveryAction::GiveUp,
            })
            .collect()
    }
}
