//! In-memory ticket registry.
//!
//! Reference implementation of [`TicketRegistry`] for tests and single-node
//! deployments. Every operation takes one lock, so compare-and-update is
//! atomic within the process. There is no expiry index; the cleaner scans
//! all tickets instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{TicketRegistry, check_routing};
use crate::ticket::{Ticket, TicketError};

#[derive(Debug, Clone, Default)]
pub struct InMemoryTicketRegistry {
    tickets: Arc<RwLock<BTreeMap<String, Ticket>>>,
}

impl InMemoryTicketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tickets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tickets.read().await.is_empty()
    }
}

#[async_trait]
impl TicketRegistry for InMemoryTicketRegistry {
    async fn add_ticket(&self, ticket: Ticket) -> Result<(), TicketError> {
        check_routing(&ticket)?;
        let mut tickets = self.tickets.write().await;
        if tickets.contains_key(ticket.id()) {
            return Err(TicketError::DuplicateTicket {
                ticket_id: ticket.id().to_string(),
            });
        }
        debug!(ticket_id = %ticket.id(), "added ticket");
        tickets.insert(ticket.id().to_string(), ticket);
        Ok(())
    }

    async fn find_ticket(&self, ticket_id: &str) -> Result<Option<Ticket>, TicketError> {
        Ok(self.tickets.read().await.get(ticket_id).cloned())
    }

    async fn update_ticket(&self, ticket: Ticket) -> Result<(), TicketError> {
        let mut tickets = self.tickets.write().await;
        match tickets.get_mut(ticket.id()) {
            Some(stored) => {
                *stored = ticket;
                Ok(())
            }
            None => Err(TicketError::invalid(ticket.id())),
        }
    }

    async fn compare_and_update(&self, expected: &Ticket, updated: Ticket) -> Result<bool, TicketError> {
        if expected.id() != updated.id() {
            return Err(TicketError::InvalidTicketRequest {
                reason: format!("cannot replace {} with {}", expected.id(), updated.id()),
            });
        }
        let mut tickets = self.tickets.write().await;
        match tickets.get_mut(expected.id()) {
            Some(stored) if stored == expected => {
                *stored = updated;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_single_ticket(&self, ticket_id: &str) -> Result<bool, TicketError> {
        Ok(self.tickets.write().await.remove(ticket_id).is_some())
    }

    async fn get_tickets(&self) -> Result<Vec<Ticket>, TicketError> {
        Ok(self.tickets.read().await.values().cloned().collect())
    }

    async fn delete_all(&self) -> Result<u64, TicketError> {
        let mut tickets = self.tickets.write().await;
        let count = tickets.len() as u64;
        tickets.clear();
        Ok(count)
    }
}
