//! Integration tests for ConnectionManager recovery behavior.
//!
//! Time is paused, so backoff waits are measured exactly in virtual time.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{
    address, channel, count, drain, numbers, pair, Outcome, ScriptedConnector, ScriptedControl,
};
use gpslink_core::{Endpoint, ErrorClass};
use gpslink_supervisor::{
    ChannelCandidateList, ConnectError, ConnectionManager, Diagnostic, DiagnosticSink, RetryPolicy,
};

struct Fixture {
    connector: Arc<ScriptedConnector>,
    control: Arc<ScriptedControl>,
    manager: ConnectionManager,
    diagnostics: mpsc::UnboundedReceiver<Diagnostic>,
}

fn fixture(control: ScriptedControl) -> Fixture {
    let connector = Arc::new(ScriptedConnector::new());
    let control = Arc::new(control);
    let (sink, diagnostics) = DiagnosticSink::channel();
    let manager = ConnectionManager::new(
        connector.clone(),
        control.clone(),
        RetryPolicy::default(),
        Duration::from_secs(10),
        sink,
    );
    Fixture {
        connector,
        control,
        manager,
        diagnostics,
    }
}

fn candidates(channels: &[u16]) -> ChannelCandidateList {
    let channels: Vec<_> = channels.iter().map(|n| channel(*n)).collect();
    ChannelCandidateList::from_channels(&channels)
}

fn endpoint(n: u16) -> Endpoint {
    Endpoint::new(address(), channel(n))
}

// ============================================================================
// Refused
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_refused_on_default_channel_switches_to_next_candidate() {
    let mut fx = fixture(ScriptedControl::new());
    let (client, _peer) = pair();
    fx.connector.script(1, Outcome::Refuse);
    fx.connector.script(2, Outcome::accept(client));

    let connection = fx
        .manager
        .connect(endpoint(1), &candidates(&[1, 2, 3]), 3, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(connection.endpoint().channel(), channel(2));
    assert_eq!(connection.attempts(), 2);
    assert_eq!(numbers(&fx.connector.attempts()), vec![1, 2]);
    assert_eq!(fx.connector.gaps(), vec![Duration::ZERO]);

    let diagnostics = drain(&mut fx.diagnostics);
    assert!(diagnostics
        .iter()
        .any(|d| d.to_string() == "TRYING_CHANNEL:2"));
    assert_eq!(count(&diagnostics, "RETRY_WAIT"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_without_alternate_retries_same_channel_with_backoff() {
    let fx = fixture(ScriptedControl::new());

    let err = fx
        .manager
        .connect(endpoint(1), &candidates(&[1]), 3, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(numbers(&fx.connector.attempts()), vec![1, 1, 1]);
    assert_eq!(
        fx.connector.gaps(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
    match err {
        ConnectError::Exhausted {
            attempts, class, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(class, ErrorClass::RefusedNoService);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_refused_on_non_default_channel_backs_off() {
    let fx = fixture(ScriptedControl::new());
    let (client, _peer) = pair();
    fx.connector.script(12, Outcome::Refuse);
    fx.connector.script(12, Outcome::accept(client));

    let connection = fx
        .manager
        .connect(endpoint(12), &candidates(&[12, 1, 2]), 3, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(connection.endpoint().channel(), channel(12));
    assert_eq!(fx.connector.gaps(), vec![Duration::from_secs(2)]);
}

// ============================================================================
// Bad state
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bad_state_releases_then_waits_attempt_scaled_backoff() {
    let mut fx = fixture(ScriptedControl::new());
    let (client, _peer) = pair();
    fx.connector.script(1, Outcome::BadState);
    fx.connector.script(1, Outcome::BadState);
    fx.connector.script(1, Outcome::accept(client));

    let connection = fx
        .manager
        .connect(endpoint(1), &candidates(&[1, 2]), 3, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(connection.attempts(), 3);
    assert_eq!(fx.control.releases(), 2);
    assert_eq!(
        fx.connector.gaps(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );

    let rendered: Vec<String> = drain(&mut fx.diagnostics)
        .iter()
        .map(ToString::to_string)
        .collect();
    assert!(rendered.contains(&"RELEASING_EXISTING:AA:BB:CC:DD:EE:FF".to_string()));
    assert!(rendered.contains(&"RETRY_WAIT:2s".to_string()));
    assert!(rendered.contains(&"RETRY_WAIT:4s".to_string()));
}

// ============================================================================
// Unreachable
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unreachable_resets_link_before_retrying() {
    let mut fx = fixture(ScriptedControl::new());
    let (client, _peer) = pair();
    fx.connector.script(1, Outcome::Unreachable);
    fx.connector.script(1, Outcome::accept(client));

    let connection = fx
        .manager
        .connect(endpoint(1), &candidates(&[1, 2]), 3, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(connection.endpoint().channel(), channel(1));
    assert_eq!(fx.control.resets(), 1);
    assert_eq!(count(&drain(&mut fx.diagnostics), "BLUETOOTH_RESET"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_reset_gives_up_early() {
    let mut fx = fixture(ScriptedControl::failing_reset());
    fx.connector.script(1, Outcome::Unreachable);

    let err = fx
        .manager
        .connect(endpoint(1), &candidates(&[1, 2]), 3, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::GaveUp { attempts: 1, .. }));
    assert!(err.is_host_absent());
    assert_eq!(fx.connector.attempts().len(), 1);
    assert_eq!(count(&drain(&mut fx.diagnostics), "RESET_ERROR"), 1);
}

// ============================================================================
// Timeouts and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_hanging_connect_is_classified_as_timeout() {
    let fx = fixture(ScriptedControl::new());
    fx.connector.script(1, Outcome::Hang);

    let started = tokio::time::Instant::now();
    let err = fx
        .manager
        .connect(endpoint(1), &candidates(&[1]), 1, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.class(), Some(ErrorClass::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(err.tried(), &[channel(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let fx = fixture(ScriptedControl::new());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = fx
        .manager
        .connect(endpoint(1), &candidates(&[1]), 3, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectError::Cancelled));
    assert_eq!(fx.connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_recovery_after_final_attempt() {
    let mut fx = fixture(ScriptedControl::new());
    fx.connector.script(1, Outcome::BadState);

    let err = fx
        .manager
        .connect(endpoint(1), &candidates(&[1]), 1, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.class(), Some(ErrorClass::TransportBadState));
    assert_eq!(fx.control.releases(), 0);
    let diagnostics = drain(&mut fx.diagnostics);
    assert_eq!(count(&diagnostics, "CONNECT_ATTEMPT"), 1);
    assert_eq!(count(&diagnostics, "RETRY_WAIT"), 0);
}
