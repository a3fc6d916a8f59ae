//! Proptest strategies for ticket kinds, ids and expiration policies.

use aspen_tickets::{ExpirationPolicy, TicketKind};
use proptest::prelude::*;

pub fn arb_kind() -> impl Strategy<Value = TicketKind> {
    prop::sample::select(TicketKind::ALL.to_vec())
}

/// Id body as produced by the generator: counter, random part, optional suffix.
pub fn arb_id_body() -> impl Strategy<Value = String> {
    ("[0-9]{1,8}", "[a-zA-Z0-9]{16,64}", prop::option::of("[a-z0-9.]{1,16}")).prop_map(
        |(counter, random, suffix)| match suffix {
            Some(suffix) => format!("{counter}-{random}-{suffix}"),
            None => format!("{counter}-{random}"),
        },
    )
}

fn arb_duration_ms() -> impl Strategy<Value = u64> {
    1u64..100_000
}

fn arb_leaf_policy() -> impl Strategy<Value = ExpirationPolicy> {
    prop_oneof![
        Just(ExpirationPolicy::NeverExpires),
        Just(ExpirationPolicy::AlwaysExpires),
        (1u32..5, arb_duration_ms()).prop_map(|(number_of_uses, time_to_kill_ms)| {
            ExpirationPolicy::MultiTimeUseOrTimeout {
                number_of_uses,
                time_to_kill_ms,
            }
        }),
        (arb_duration_ms(), arb_duration_ms()).prop_map(|(time_to_live_ms, time_to_idle_ms)| {
            ExpirationPolicy::TimeToLiveTimeToIdle {
                time_to_live_ms,
                time_to_idle_ms,
            }
        }),
        arb_duration_ms().prop_map(|time_to_kill_ms| ExpirationPolicy::HardTimeout { time_to_kill_ms }),
        arb_duration_ms().prop_map(|time_to_kill_ms| ExpirationPolicy::Timeout { time_to_kill_ms }),
        (arb_duration_ms(), 0u64..1_000).prop_map(|(time_to_kill_ms, time_in_between_uses_ms)| {
            ExpirationPolicy::ThrottledUseAndTimeout {
                time_to_kill_ms,
                time_in_between_uses_ms,
            }
        }),
    ]
}

pub fn arb_policy() -> impl Strategy<Value = ExpirationPolicy> {
    prop_oneof![
        4 => arb_leaf_policy(),
        1 => (arb_leaf_policy(), arb_leaf_policy()).prop_map(|(remember_me, session)| {
            ExpirationPolicy::RememberMeDelegating {
                remember_me: Box::new(remember_me),
                session: Box::new(session),
            }
        }),
    ]
}

/// Gaps between successive uses of a ticket.
pub fn arb_use_gaps() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..20_000, 0..8)
}
