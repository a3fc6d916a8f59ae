//! Property-based tests for ticket dispatch, expiry and single use.

mod support;

use std::collections::HashSet;
use std::sync::Arc;

use aspen_tickets::ticket::{TicketState, UniqueTicketIdGenerator};
use aspen_tickets::{InMemoryTicketRegistry, Service, SimulatedTimeProvider, TicketError, TicketKind, TicketRegistry};
use proptest::prelude::*;
use support::proptest_generators::{arb_id_body, arb_kind, arb_policy, arb_use_gaps};
use support::{START_MS, authentication, kv_registry, ticket_service};

proptest! {
    #[test]
    fn test_prefix_dispatch_round_trips(kind in arb_kind(), body in arb_id_body()) {
        let id = format!("{}-{}", kind.prefix(), body);
        prop_assert_eq!(TicketKind::from_id(&id), Some(kind));
    }

    #[test]
    fn test_unknown_prefixes_do_not_dispatch(id in "[A-Z]{0,5}-?[a-z0-9]{0,10}") {
        let known = TicketKind::ALL.iter().any(|k| {
            id.strip_prefix(k.prefix()).and_then(|rest| rest.strip_prefix('-')).is_some_and(|rest| !rest.is_empty())
        });
        prop_assert_eq!(TicketKind::from_id(&id).is_some(), known);
    }

    #[test]
    fn test_generated_ids_are_unique_and_routable(
        kind in arb_kind(),
        body_length in 0usize..64,
        suffix in "[a-z0-9]{0,8}",
    ) {
        let generator = UniqueTicketIdGenerator::new(body_length, suffix);
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let id = generator.new_ticket_id(kind).unwrap();
            prop_assert_eq!(TicketKind::from_id(&id), Some(kind));
            prop_assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_expiry_is_monotonic_in_time(
        policy in arb_policy(),
        remember_me in any::<bool>(),
        gaps in arb_use_gaps(),
        offsets in prop::collection::vec(0u64..400_000, 1..16),
    ) {
        let mut state = TicketState::new(START_MS, remember_me);
        let mut now = START_MS;
        for gap in gaps {
            now += gap;
            state.update(now);
        }

        let mut offsets = offsets;
        offsets.sort_unstable();
        let mut seen_expired = false;
        for offset in offsets {
            let expired = policy.is_expired(&state, now + offset);
            prop_assert!(!seen_expired || expired, "{:?} un-expired at +{}", policy, offset);
            seen_expired |= expired;
        }

        state.expired = true;
        prop_assert!(policy.is_expired(&state, now));
    }

    #[test]
    fn test_concurrent_validation_succeeds_once(contenders in 2usize..8, use_kv in any::<bool>()) {
        let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap();
        rt.block_on(async {
            let registry: Arc<dyn TicketRegistry> = if use_kv {
                kv_registry()
            } else {
                Arc::new(InMemoryTicketRegistry::new())
            };
            let time = SimulatedTimeProvider::new(START_MS);
            let service = Arc::new(ticket_service(registry, &time));
            let app = Service::new("https://app");
            let tgt = service.create_ticket_granting_ticket(authentication("alice")).await.unwrap();
            let st = service.grant_service_ticket(&tgt.id, app.clone(), true).await.unwrap();

            let tasks: Vec<_> = (0..contenders)
                .map(|_| {
                    let service = service.clone();
                    let app = app.clone();
                    let id = st.id.clone();
                    tokio::spawn(async move { service.validate_service_ticket(&id, &app).await })
                })
                .collect();

            let mut successes = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(auth) => {
                        assert_eq!(auth.principal.id, "alice");
                        successes += 1;
                    }
                    Err(TicketError::TicketAlreadyConsumed { .. }) => {}
                    Err(e) => panic!("unexpected validation error: {e:?}"),
                }
            }
            assert_eq!(successes, 1);
        });
    }
}
