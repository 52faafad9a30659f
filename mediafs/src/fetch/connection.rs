use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::{info, warn};

use crate::errors::FetchError;

/// Health of the remote, as seen by the fetch client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConnectionHealth {
    Healthy,
    /// Recent calls failed; new attempts wait for a backoff delay first.
    Degraded,
    /// Too many consecutive failures; calls fail fast until the cool-down
    /// has passed, then one attempt probes the remote again.
    Reconnecting,
}

/// Retry and backoff tuning.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry, doubled for every further failure.
    pub base: Duration,
    /// Upper bound for a single backoff delay.
    pub max: Duration,
    /// Whether to randomize delays (full jitter). Disabled in tests.
    pub jitter: bool,
    /// Consecutive failures after which the remote counts as down.
    pub max_failures: u32,
    /// How long to fail fast before probing a down remote again.
    pub reconnect_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: true,
            max_failures: 5,
            reconnect_after: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// The delay applied before an attempt, after `failures` consecutive
    /// failures (`failures >= 1`).
    pub fn delay(&self, failures: u32) -> Duration {
        // ExponentialBackoff yields base^n * factor. Use base 2 and a factor of
        // half the configured delay, so the sequence is base, 2*base, 4*base…
        let factor = (self.base.as_millis() as u64 / 2).max(if self.base.is_zero() { 0 } else { 1 });
        let delay = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max)
            .nth(failures.saturating_sub(1) as usize)
            .unwrap_or(self.max);

        if self.jitter {
            jitter(delay)
        } else {
            delay
        }
    }
}

/// What a caller has to do before issuing a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// Sleep for the given duration, then proceed.
    Wait(Duration),
    /// Don't issue the request.
    Reject,
    /// Don't issue the request, the remote rejected our credentials.
    Unauthorized,
}

#[derive(Clone, Debug)]
struct ConnectionState {
    health: ConnectionHealth,
    consecutive_failures: u32,
    last_success: Option<SystemTime>,
    last_failure: Option<SystemTime>,
    last_error: Option<String>,
    reconnecting_since: Option<Instant>,
    /// A call was let through to a down remote, and hasn't reported back
    /// yet.
    probing: bool,
    unauthorized: bool,
}

/// Point-in-time copy of the connection state, for the status interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub health: ConnectionHealth,
    pub consecutive_failures: u32,
    pub last_success: Option<SystemTime>,
    pub last_failure: Option<SystemTime>,
    pub last_error: Option<String>,
    /// Set once the remote rejected our credentials, until cleared by
    /// [ConnectionTracker::clear_unauthorized].
    pub unauthorized: bool,
}

/// Tracks [ConnectionHealth] for one remote.
///
/// The state is advisory: it decides how long a caller waits before its
/// attempt, it never serializes network calls. Critical sections are limited
/// to reading and updating a few counters.
pub struct ConnectionTracker {
    state: Mutex<ConnectionState>,
    policy: BackoffPolicy,
}

impl ConnectionTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(ConnectionState {
                health: ConnectionHealth::Healthy,
                consecutive_failures: 0,
                last_success: None,
                last_failure: None,
                last_error: None,
                reconnecting_since: None,
                probing: false,
                unauthorized: false,
            }),
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Decides whether (and when) a new request may be issued.
    ///
    /// While reconnecting, only one call at a time gets through once the
    /// cool-down has passed. Its outcome has to be reported through
    /// [Self::record_success] or [Self::record_failure].
    pub fn admit(&self) -> Admission {
        let mut state = self.state.lock();
        if state.unauthorized {
            return Admission::Unauthorized;
        }
        match state.health {
            ConnectionHealth::Healthy => Admission::Proceed,
            ConnectionHealth::Degraded => {
                Admission::Wait(self.policy.delay(state.consecutive_failures))
            }
            ConnectionHealth::Reconnecting => match state.reconnecting_since {
                Some(since) if since.elapsed() < self.policy.reconnect_after => Admission::Reject,
                _ if state.probing => Admission::Reject,
                _ => {
                    state.probing = true;
                    Admission::Proceed
                }
            },
        }
    }

    /// Lets requests through again after the credentials were rejected.
    /// Called when the operator asks for a rescan.
    pub fn clear_unauthorized(&self) {
        let mut state = self.state.lock();
        if state.unauthorized {
            info!("retrying with the configured credentials");
            state.unauthorized = false;
        }
    }

    /// Any response from the remote (including "not found") counts as success.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.health != ConnectionHealth::Healthy {
            info!(
                failures = state.consecutive_failures,
                "connection to remote recovered"
            );
        }
        state.health = ConnectionHealth::Healthy;
        state.consecutive_failures = 0;
        state.reconnecting_since = None;
        state.probing = false;
        state.last_success = Some(SystemTime::now());
    }

    /// Records a failed attempt and advances the state machine.
    pub fn record_failure(&self, error: &FetchError) {
        let mut state = self.state.lock();
        state.last_failure = Some(SystemTime::now());
        state.last_error = Some(error.to_string());
        state.probing = false;

        if let FetchError::Unauthorized(_) = error {
            // Not a health problem of the connection. Stops all requests
            // until cleared.
            if !state.unauthorized {
                warn!(err = %error, "credentials rejected, pausing requests to the remote");
            }
            state.unauthorized = true;
            return;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        match state.health {
            ConnectionHealth::Healthy | ConnectionHealth::Degraded
                if state.consecutive_failures >= self.policy.max_failures =>
            {
                warn!(
                    failures = state.consecutive_failures,
                    err = %error,
                    "remote unreachable, failing fast until reconnect"
                );
                state.health = ConnectionHealth::Reconnecting;
                state.reconnecting_since = Some(Instant::now());
            }
            ConnectionHealth::Healthy => {
                state.health = ConnectionHealth::Degraded;
            }
            ConnectionHealth::Degraded => {}
            ConnectionHealth::Reconnecting => {
                // failed probe, re-arm the cool-down.
                state.reconnecting_since = Some(Instant::now());
            }
        }
    }

    pub fn health(&self) -> ConnectionHealth {
        self.state.lock().health
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.lock();
        ConnectionSnapshot {
            health: state.health,
            consecutive_failures: state.consecutive_failures,
            last_success: state.last_success,
            last_failure: state.last_failure,
            last_error: state.last_error.clone(),
            unauthorized: state.unauthorized,
        }
    }
}
