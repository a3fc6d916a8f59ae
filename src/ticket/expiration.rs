//! Ticket lifecycle state and the policies that decide expiry.
//!
//! Policies are pure: given a [`TicketState`] and the current time they
//! answer whether the ticket is expired. For a fixed state, every policy is
//! monotonic in time, so once a ticket reads as expired it stays expired.

use serde::{Deserialize, Serialize};

/// Mutable lifecycle fields shared by every ticket kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketState {
    pub creation_time_ms: u64,
    pub last_time_used_ms: u64,
    /// Time of the use before the last one. Creation does not count as a use.
    pub previous_time_used_ms: Option<u64>,
    pub count_of_uses: u32,
    /// Set by an explicit expire, independent of the policy.
    pub expired: bool,
    /// Selects the remember-me branch of [`ExpirationPolicy::RememberMeDelegating`].
    pub remember_me: bool,
}

impl TicketState {
    pub fn new(now_ms: u64, remember_me: bool) -> Self {
        Self {
            creation_time_ms: now_ms,
            last_time_used_ms: now_ms,
            previous_time_used_ms: None,
            count_of_uses: 0,
            expired: false,
            remember_me,
        }
    }

    /// Record one use at `now_ms`.
    pub fn update(&mut self, now_ms: u64) {
        if self.count_of_uses > 0 {
            self.previous_time_used_ms = Some(self.last_time_used_ms);
        }
        self.last_time_used_ms = now_ms.max(self.last_time_used_ms);
        self.count_of_uses = self.count_of_uses.saturating_add(1);
    }
}

/// Expiration policy attached to a ticket at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    /// Never expires on its own.
    NeverExpires,
    /// Expired from the moment it is created.
    AlwaysExpires,
    /// Expires after `number_of_uses` uses or `time_to_kill_ms` idle, whichever first.
    MultiTimeUseOrTimeout { number_of_uses: u32, time_to_kill_ms: u64 },
    /// Expires at `min(creation + time_to_live, last_used + time_to_idle)`.
    TimeToLiveTimeToIdle { time_to_live_ms: u64, time_to_idle_ms: u64 },
    /// Expires a fixed time after creation, regardless of use.
    HardTimeout { time_to_kill_ms: u64 },
    /// Expires after `time_to_kill_ms` without use.
    Timeout { time_to_kill_ms: u64 },
    /// Sliding idle timeout, plus expiry when two consecutive uses are closer
    /// together than `time_in_between_uses_ms`.
    ThrottledUseAndTimeout {
        time_to_kill_ms: u64,
        time_in_between_uses_ms: u64,
    },
    /// Uses `remember_me` for remember-me sessions and `session` otherwise.
    RememberMeDelegating {
        remember_me: Box<ExpirationPolicy>,
        session: Box<ExpirationPolicy>,
    },
}

impl ExpirationPolicy {
    /// Whether a ticket in `state` is expired at `now_ms`.
    pub fn is_expired(&self, state: &TicketState, now_ms: u64) -> bool {
        if state.expired {
            return true;
        }
        match self {
            ExpirationPolicy::NeverExpires => false,
            ExpirationPolicy::AlwaysExpires => true,
            ExpirationPolicy::MultiTimeUseOrTimeout { number_of_uses, .. } if state.count_of_uses >= *number_of_uses => {
                true
            }
            ExpirationPolicy::ThrottledUseAndTimeout {
                time_in_between_uses_ms,
                ..
            } if state
                .previous_time_used_ms
                .is_some_and(|prev| state.last_time_used_ms.saturating_sub(prev) < *time_in_between_uses_ms) =>
            {
                true
            }
            ExpirationPolicy::RememberMeDelegating { remember_me, session } => {
                if state.remember_me {
                    remember_me.is_expired(state, now_ms)
                } else {
                    session.is_expired(state, now_ms)
                }
            }
            _ => self.expiration_time_ms(state).is_some_and(|deadline| now_ms >= deadline),
        }
    }

    /// Earliest time-based deadline for a ticket in `state`, ignoring use
    /// counts. `None` when the policy has no time component.
    pub fn expiration_time_ms(&self, state: &TicketState) -> Option<u64> {
        let created = state.creation_time_ms;
        let last_used = state.last_time_used_ms;
        match self {
            ExpirationPolicy::NeverExpires => None,
            ExpirationPolicy::AlwaysExpires => Some(created),
            ExpirationPolicy::MultiTimeUseOrTimeout { time_to_kill_ms, .. }
            | ExpirationPolicy::Timeout { time_to_kill_ms }
            | ExpirationPolicy::ThrottledUseAndTimeout { time_to_kill_ms, .. } => {
                Some(last_used.saturating_add(*time_to_kill_ms))
            }
            ExpirationPolicy::TimeToLiveTimeToIdle {
                time_to_live_ms,
                time_to_idle_ms,
            } => Some(created.saturating_add(*time_to_live_ms).min(last_used.saturating_add(*time_to_idle_ms))),
            ExpirationPolicy::HardTimeout { time_to_kill_ms } => Some(created.saturating_add(*time_to_kill_ms)),
            ExpirationPolicy::RememberMeDelegating { remember_me, session } => {
                if state.remember_me {
                    remember_me.expiration_time_ms(state)
                } else {
                    session.expiration_time_ms(state)
                }
            }
        }
    }

    /// True if a consumed ticket under this policy may be validated again.
    pub fn permits_reuse(&self) -> bool {
        matches!(self, ExpirationPolicy::MultiTimeUseOrTimeout { number_of_uses, .. } if *number_of_uses > 1)
    }
}
