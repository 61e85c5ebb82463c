//! # Admission Controller
//!
//! Decides, per client address, whether a request may proceed. Each address
//! moves through a small state machine driven purely by request timestamps:
//!
//! ```text
//! Fresh ──► Within-Window ──(count > limit)──► Throttled ──(repeat)──► Banned
//!   ▲             │                                 │                    │
//!   └─────────────┴──────── window / ban lapses ────┴────────────────────┘
//! ```
//!
//! - **Within-Window**: requests are counted against `(window_ms, limit)`;
//!   the window restarts once `window_ms` has elapsed from its start.
//! - **Throttled**: the request that pushes the count over the limit is
//!   rejected with a retry hint and leaves a throttle marker.
//! - **Banned**: with a [`BanPolicy`], a second throttle that lands in the
//!   repeat window after the marker bans the address for a fixed duration.
//!   That request is still answered with `Reject`; the ban applies from the
//!   next request on, up to and including its expiry instant. Banned
//!   requests are rejected without touching window accounting.
//!
//! A startup grace period admits everything until it elapses, after which
//! the controller is permanently [`Phase::Enforcing`]. The plain fixed-window
//! limiter is the same machine with `ban: None` and no grace.
//!
//! The table sits behind one coarse mutex; every call is O(1) and the lock is
//! never held across an await point. Lapsed entries are inert and removed by
//! [`AdmissionController::reap`].

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Milliseconds on whatever clock the caller uses (the server uses Unix time).
pub type Millis = u64;

/// Reference window length.
pub const DEFAULT_WINDOW_MS: Millis = 8_000;
/// Reference request limit per window.
pub const DEFAULT_LIMIT: u32 = 2;
/// Reference startup grace period.
pub const DEFAULT_GRACE_MS: Millis = 60_000;
/// Reference ban duration (one hour).
pub const DEFAULT_BAN_MS: Millis = 60 * 60 * 1000;
/// Slack added to the repeat-offence bounds.
const REPEAT_SLACK_MS: Millis = 1_000;

/// Validation failures for [`AdmissionConfig`].
#[derive(Debug, Error)]
pub enum AdmissionConfigError {
    /// A setting is out of range.
    #[error("invalid admission config: {0}")]
    Invalid(String),
}

/// # Ban Policy
///
/// How a repeat offender is escalated. A second throttle counts as a repeat
/// offence when it lands more than `min_gap_ms` and less than `max_gap_ms`
/// after the recorded throttle marker. Throttles closer than `min_gap_ms`
/// belong to the same burst and leave the marker alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanPolicy {
    /// How long a ban lasts.
    pub duration_ms: Millis,
    /// Lower bound of the repeat window.
    pub min_gap_ms: Millis,
    /// Upper bound of the repeat window.
    pub max_gap_ms: Millis,
}

impl BanPolicy {
    /// The reference policy for a window: a one hour ban when the next
    /// window is throttled again, i.e. roughly `2 × window_ms` after the first.
    pub fn for_window(window_ms: Millis) -> Self {
        Self {
            duration_ms: DEFAULT_BAN_MS,
            min_gap_ms: window_ms + REPEAT_SLACK_MS,
            max_gap_ms: 2 * window_ms + REPEAT_SLACK_MS,
        }
    }
}

/// # Admission Config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionConfig {
    /// Length of a counting window.
    pub window_ms: Millis,
    /// Requests admitted per window.
    pub limit: u32,
    /// Admit everything for this long after start-up.
    #[serde(default)]
    pub grace_ms: Millis,
    /// Escalation to timed bans; `None` keeps a plain fixed window.
    #[serde(default)]
    pub ban: Option<BanPolicy>,
    /// Refund the count of requests that end up failing (status ≥ 400).
    #[serde(default)]
    pub skip_failed_requests: bool,
}

impl AdmissionConfig {
    /// The escalating variant with the reference grace period and ban policy.
    pub fn escalating(window_ms: Millis, limit: u32) -> Self {
        Self {
            window_ms,
            limit,
            grace_ms: DEFAULT_GRACE_MS,
            ban: Some(BanPolicy::for_window(window_ms)),
            skip_failed_requests: false,
        }
    }

    /// A plain fixed window: no bans, no grace.
    pub fn fixed_window(window_ms: Millis, limit: u32) -> Self {
        Self {
            window_ms,
            limit,
            grace_ms: 0,
            ban: None,
            skip_failed_requests: false,
        }
    }

    /// Replaces the grace period.
    pub fn with_grace(mut self, grace_ms: Millis) -> Self {
        self.grace_ms = grace_ms;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    /// [`AdmissionConfigError::Invalid`] for a zero window or limit, or an
    /// empty repeat window.
    pub fn validate(&self) -> Result<(), AdmissionConfigError> {
        if self.window_ms == 0 {
            return Err(AdmissionConfigError::Invalid("window_ms must be greater than zero".to_string()));
        }
        if self.limit == 0 {
            return Err(AdmissionConfigError::Invalid("limit must be greater than zero".to_string()));
        }
        if let Some(ban) = &self.ban {
            if ban.duration_ms == 0 {
                return Err(AdmissionConfigError::Invalid(
                    "ban duration_ms must be greater than zero".to_string(),
                ));
            }
            if ban.max_gap_ms <= ban.min_gap_ms {
                return Err(AdmissionConfigError::Invalid(format!(
                    "ban max_gap_ms ({}) must exceed min_gap_ms ({})",
                    ban.max_gap_ms, ban.min_gap_ms
                )));
            }
        }
        Ok(())
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::escalating(DEFAULT_WINDOW_MS, DEFAULT_LIMIT)
    }
}

/// Outcome of [`AdmissionController::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Proceed with the request.
    Admit,
    /// Rate limited; the current window ends in `retry_after_ms`.
    Reject {
        /// Time until the window resets.
        retry_after_ms: Millis,
    },
    /// Banned through the given timestamp.
    Banned {
        /// Ban expiry on the controller's clock.
        until_ms: Millis,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(self) -> bool {
        matches!(self, Decision::Admit)
    }
}

/// Whether the controller is still inside its start-up grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Everything is admitted until `until_ms`.
    WarmingUp {
        /// End of the grace period.
        until_ms: Millis,
    },
    /// Limits and bans apply.
    Enforcing,
}

/// Per-address bookkeeping.
#[derive(Debug, Clone)]
struct ClientState {
    window_start: Millis,
    count: u32,
    throttled_at: Option<Millis>,
    banned_until: Option<Millis>,
}

impl ClientState {
    fn fresh(now: Millis) -> Self {
        Self {
            window_start: now,
            count: 0,
            throttled_at: None,
            banned_until: None,
        }
    }

    /// True once nothing about this entry can influence a future decision.
    fn is_inert(&self, now: Millis, config: &AdmissionConfig) -> bool {
        let window_lapsed = now.saturating_sub(self.window_start) >= config.window_ms;
        let marker_lapsed = match (self.throttled_at, config.ban) {
            (Some(marker), Some(ban)) => now.saturating_sub(marker) >= ban.max_gap_ms,
            _ => true,
        };
        let ban_lapsed = self.banned_until.map_or(true, |until| until < now);
        window_lapsed && marker_lapsed && ban_lapsed
    }
}

/// # Admission Controller
///
/// The process-wide rate limiter. Construct one at start-up and share it via
/// `Arc`.
pub struct AdmissionController {
    config: AdmissionConfig,
    started_at: Millis,
    enforcing: AtomicBool,
    clients: Mutex<HashMap<IpAddr, ClientState>>,
}

impl AdmissionController {
    /// Creates a controller whose grace period starts at `started_at`.
    pub fn new(config: AdmissionConfig, started_at: Millis) -> Self {
        Self {
            config,
            started_at,
            enforcing: AtomicBool::new(false),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// The phase at `now`.
    pub fn phase(&self, now: Millis) -> Phase {
        let until_ms = self.started_at.saturating_add(self.config.grace_ms);
        if now < until_ms && !self.enforcing.load(Ordering::Relaxed) {
            Phase::WarmingUp { until_ms }
        } else {
            Phase::Enforcing
        }
    }

    /// Records a request from `addr` at `now` and decides its fate.
    pub fn admit(&self, addr: IpAddr, now: Millis) -> Decision {
        if let Phase::WarmingUp { .. } = self.phase(now) {
            return Decision::Admit;
        }
        if !self.enforcing.swap(true, Ordering::Relaxed) {
            info!("Rate limiter now active.");
        }

        let config = &self.config;
        let mut clients = self.lock();
        let state = clients
            .entry(addr)
            .or_insert_with(|| ClientState::fresh(now));

        if let Some(until_ms) = state.banned_until {
            if now <= until_ms {
                return Decision::Banned { until_ms };
            }
            state.banned_until = None;
            info!(%addr, "Ban lifted.");
        }

        if now.saturating_sub(state.window_start) >= config.window_ms {
            state.window_start = now;
            state.count = 0;
        }
        state.count = state.count.saturating_add(1);
        if state.count <= config.limit {
            return Decision::Admit;
        }

        let retry_after_ms = state
            .window_start
            .saturating_add(config.window_ms)
            .saturating_sub(now);
        let Some(ban) = config.ban else {
            return Decision::Reject { retry_after_ms };
        };

        match state.throttled_at {
            Some(marker) if now.saturating_sub(marker) < ban.max_gap_ms => {
                if now.saturating_sub(marker) > ban.min_gap_ms {
                    let until_ms = now.saturating_add(ban.duration_ms);
                    state.banned_until = Some(until_ms);
                    state.throttled_at = None;
                    warn!(%addr, until_ms, "Client banned.");
                }
            }
            _ => state.throttled_at = Some(now),
        }
        Decision::Reject { retry_after_ms }
    }

    /// Gives back one request from `addr`'s current window. Only has an
    /// effect when `skip_failed_requests` is configured.
    pub fn refund(&self, addr: IpAddr) {
        if !self.config.skip_failed_requests {
            return;
        }
        if let Some(state) = self.lock().get_mut(&addr) {
            state.count = state.count.saturating_sub(1);
        }
    }

    /// Drops every entry that can no longer affect a decision. Returns how
    /// many were removed.
    pub fn reap(&self, now: Millis) -> usize {
        let mut clients = self.lock();
        let before = clients.len();
        clients.retain(|_, state| !state.is_inert(now, &self.config));
        before - clients.len()
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no address is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, ClientState>> {
        // The table holds plain counters, so a poisoned lock is still usable.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
