//! Ticket id generation.
//!
//! Ids have the form `PREFIX-<counter>-<random>-<suffix>`: the prefix routes
//! the id to a ticket kind, the counter keeps ids from one generator distinct,
//! the alphanumeric body makes them unguessable and the suffix names the
//! issuing node.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::distr::Alphanumeric;

use super::{TicketError, TicketKind};
use crate::constants::{DEFAULT_TICKET_ID_BODY_LENGTH, MIN_TICKET_ID_BODY_LENGTH, TICKET_ID_SEPARATOR};

#[derive(Debug)]
pub struct UniqueTicketIdGenerator {
    body_length: usize,
    suffix: String,
    counter: AtomicU64,
}

impl UniqueTicketIdGenerator {
    /// Create a generator. Body lengths below the minimum are raised to it.
    pub fn new(body_length: usize, suffix: impl Into<String>) -> Self {
        Self {
            body_length: body_length.max(MIN_TICKET_ID_BODY_LENGTH),
            suffix: suffix.into(),
            counter: AtomicU64::new(1),
        }
    }

    /// Generate a fresh id for `kind`.
    pub fn new_ticket_id(&self, kind: TicketKind) -> Result<String, TicketError> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let body: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(self.body_length)
            .map(char::from)
            .collect();

        let sep = TICKET_ID_SEPARATOR;
        let id = if self.suffix.is_empty() {
            format!("{}{sep}{counter}{sep}{body}", kind.prefix())
        } else {
            format!("{}{sep}{counter}{sep}{body}{sep}{}", kind.prefix(), self.suffix)
        };

        // Prefix must round-trip through dispatch or lookups would hit the wrong table
        match TicketKind::from_id(&id) {
            Some(parsed) if parsed == kind => Ok(id),
            _ => Err(TicketError::InvalidTicketRequest {
                reason: format!("generated id {id} does not dispatch to {kind}"),
            }),
        }
    }
}

impl Default for UniqueTicketIdGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_TICKET_ID_BODY_LENGTH, "")
    }
}
