//! Ticket registry contract and implementations.
//!
//! [`TicketRegistry`] is the narrow storage contract every backend fulfils.
//! Typed lookup, chain-aware expiry and cascading deletion are provided on
//! top of the required primitives so every backend behaves the same.
//!
//! Backends that cannot cheaply answer "which sessions have expired" also
//! implement [`ExpiryIndex`]; the cleaner uses it when present and falls back
//! to a full scan otherwise.
//!
//! # Tiger Style
//!
//! - Chain walks stop at `MAX_CHAIN_DEPTH` and fail closed
//! - Deletion order is children first, so a partial cascade never leaves a
//!   live child without its parent

mod inmemory;
mod kv;

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use inmemory::InMemoryTicketRegistry;
pub use kv::{KeyValueRegistryConfig, KeyValueTicketRegistry};

use crate::constants::MAX_CHAIN_DEPTH;
use crate::ticket::{ServiceTicket, Ticket, TicketError, TicketGrantingTicket, TicketKind};

/// Storage contract for tickets.
///
/// Reads do not filter expired tickets; callers check expiry with
/// [`TicketRegistry::is_expired`] so "unknown" and "expired" stay distinguishable.
#[async_trait]
pub trait TicketRegistry: Send + Sync {
    /// Store a new ticket. Fails with `DuplicateTicket` if the id is taken.
    async fn add_ticket(&self, ticket: Ticket) -> Result<(), TicketError>;

    /// Load a ticket by id. `Ok(None)` if absent or the id is unrecognized.
    async fn find_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, TicketError>;

    /// Persist mutated state of an existing ticket (last writer wins).
    /// Fails with `InvalidTicket` if the ticket is no longer stored.
    async fn update_ticket(&self, ticket: Ticket) -> Result<(), TicketError>;

    /// Replace the stored ticket with `updated` only if it still equals
    /// `expected`. Returns false when the stored ticket changed or vanished.
    async fn compare_and_update(&self, expected: &Ticket, updated: Ticket) -> Result<bool, TicketError>;

    /// Remove one ticket without cascading. Returns true if it existed.
    async fn delete_single_ticket(&self, ticket_id: &str) -> Result<bool, TicketError>;

    /// Enumerate every stored ticket.
    async fn get_tickets(&self) -> Result<Vec<Ticket>, TicketError>;

    /// Remove every ticket. Returns the number removed.
    async fn delete_all(&self) -> Result<u64, TicketError>;

    /// Expiry index capability, for backends that maintain one.
    fn expiry_index(&self) -> Option<&dyn ExpiryIndex> {
        None
    }

    /// Load a ticket of the expected kind.
    ///
    /// A proxy-granting ticket satisfies a request for a ticket-granting ticket.
    async fn get_ticket(&self, ticket_id: &str, expected: TicketKind) -> Result<Ticket, TicketError> {
        let ticket = self.find_ticket(ticket_id).await?.ok_or_else(|| TicketError::invalid(ticket_id))?;
        let actual = ticket.kind();
        if !actual.satisfies(expected) {
            return Err(TicketError::TicketTypeMismatch {
                ticket_id: ticket_id.to_string(),
                expected,
                actual,
            });
        }
        Ok(ticket)
    }

    async fn get_ticket_granting_ticket(&self, ticket_id: &str) -> Result<TicketGrantingTicket, TicketError> {
        match self.get_ticket(ticket_id, TicketKind::TicketGranting).await? {
            Ticket::Granting(t) => Ok(t),
            Ticket::Service(_) => Err(TicketError::TicketTypeMismatch {
                ticket_id: ticket_id.to_string(),
                expected: TicketKind::TicketGranting,
                actual: TicketKind::Service,
            }),
        }
    }

    async fn get_service_ticket(&self, ticket_id: &str) -> Result<ServiceTicket, TicketError> {
        match self.get_ticket(ticket_id, TicketKind::Service).await? {
            Ticket::Service(t) => Ok(t),
            Ticket::Granting(t) => Err(TicketError::TicketTypeMismatch {
                ticket_id: ticket_id.to_string(),
                expected: TicketKind::Service,
                actual: t.kind(),
            }),
        }
    }

    /// Chain-aware expiry: a ticket is expired if it or any ancestor is.
    /// A missing ancestor, or a chain deeper than the limit, counts as expired.
    async fn is_expired(&self, ticket: &Ticket, now_ms: u64) -> Result<bool, TicketError> {
        if ticket.is_expired_locally(now_ms) {
            return Ok(true);
        }
        let mut parent = ticket.parent_id().map(str::to_owned);
        let mut depth = 0;
        while let Some(parent_id) = parent {
            if depth >= MAX_CHAIN_DEPTH {
                warn!(ticket_id = %ticket.id(), depth, "ticket chain too deep, treating as expired");
                return Ok(true);
            }
            match self.find_ticket(&parent_id).await? {
                None => return Ok(true),
                Some(ancestor) => {
                    if ancestor.is_expired_locally(now_ms) {
                        return Ok(true);
                    }
                    parent = ancestor.parent_id().map(str::to_owned);
                }
            }
            depth += 1;
        }
        Ok(false)
    }

    /// Delete a ticket and, for granting tickets, every service ticket and
    /// proxy-granting ticket chained from it, recursively.
    ///
    /// Returns the total number of tickets removed. Unknown ids count 0.
    async fn delete_ticket(&self, ticket_id: &str) -> Result<u64, TicketError> {
        let family = collect_family(self, ticket_id, false).await?;
        let mut deleted = 0u64;
        for id in &family {
            if self.delete_single_ticket(id).await? {
                deleted += 1;
            }
        }
        debug!(ticket_id, deleted, "deleted ticket family");
        Ok(deleted)
    }

    /// Mark a ticket and all of its descendants expired without deleting them.
    /// Returns the number of tickets marked.
    async fn mark_ticket_expired(&self, ticket_id: &str) -> Result<u64, TicketError> {
        let family = collect_family(self, ticket_id, true).await?;
        let mut marked = 0u64;
        for id in &family {
            if let Some(mut ticket) = self.find_ticket(id).await? {
                ticket.mark_ticket_expired();
                match self.update_ticket(ticket).await {
                    Ok(()) => marked += 1,
                    // Deleted concurrently; nothing left to expire
                    Err(TicketError::InvalidTicket { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        debug!(ticket_id, marked, "marked ticket family expired");
        Ok(marked)
    }

    /// Number of root ticket-granting tickets (SSO sessions).
    async fn session_count(&self) -> Result<u64, TicketError> {
        let tickets = self.get_tickets().await?;
        Ok(tickets.iter().filter(|t| t.kind() == TicketKind::TicketGranting).count() as u64)
    }

    async fn service_ticket_count(&self) -> Result<u64, TicketError> {
        let tickets = self.get_tickets().await?;
        Ok(tickets.iter().filter(|t| t.kind() == TicketKind::Service).count() as u64)
    }
}

/// Optional capability of backends that keep a time-bucketed expiry index.
#[async_trait]
pub trait ExpiryIndex: Send + Sync {
    /// Register `ticket` as an expiry candidate at `expiration_time_ms`.
    async fn add_ticket_to_expiry_bucket(
        &self,
        ticket: &TicketGrantingTicket,
        expiration_time_ms: u64,
    ) -> Result<(), TicketError>;

    /// Claim and return expired ticket-granting tickets from buckets that
    /// closed since the last scan, and from tickets marked expired.
    ///
    /// Once a candidate is claimed it is returned; later failures shorten
    /// the scan instead of failing it.
    async fn get_expired_tgts(&self, now_ms: u64) -> Result<Vec<TicketGrantingTicket>, TicketError>;
}

/// Ids of `root_id` and its stored descendants, descendants before ancestors.
///
/// Service tickets are only expanded to their proxy-granting ticket when
/// reached through a granting ticket, unless `expand_root_service` is set.
async fn collect_family<R>(registry: &R, root_id: &str, expand_root_service: bool) -> Result<Vec<String>, TicketError>
where
    R: TicketRegistry + ?Sized,
{
    let mut visited = HashSet::new();
    let mut preorder = Vec::new();
    let mut stack = vec![(root_id.to_string(), 0u32)];

    while let Some((id, depth)) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let Some(ticket) = registry.find_ticket(&id).await? else {
            continue;
        };
        preorder.push(id);

        if depth >= MAX_CHAIN_DEPTH {
            warn!(ticket_id = %ticket.id(), depth, "ticket family too deep, not descending further");
            continue;
        }
        match &ticket {
            Ticket::Granting(tgt) => {
                for child in tgt.services.keys().chain(tgt.proxy_granting_tickets.iter()) {
                    stack.push((child.clone(), depth + 1));
                }
            }
            Ticket::Service(st) if depth > 0 || expand_root_service => {
                if let Some(pgt) = &st.proxy_granting_ticket {
                    stack.push((pgt.clone(), depth + 1));
                }
            }
            Ticket::Service(_) => {}
        }
    }

    preorder.reverse();
    Ok(preorder)
}

/// Check that a ticket's id prefix agrees with its kind before it is stored.
pub(crate) fn check_routing(ticket: &Ticket) -> Result<TicketKind, TicketError> {
    let routed = TicketKind::from_id(ticket.id()).ok_or_else(|| TicketError::UnknownTicketKind {
        ticket_id: ticket.id().to_string(),
    })?;
    if routed != ticket.kind() {
        return Err(TicketError::TicketTypeMismatch {
            ticket_id: ticket.id().to_string(),
            expected: routed,
            actual: ticket.kind(),
        });
    }
    Ok(routed)
}
