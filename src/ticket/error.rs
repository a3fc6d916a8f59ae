//! Error types for ticket issuance, lookup and validation.
//!
//! Uses thiserror for derive macro error implementation as per project conventions.

use thiserror::Error;

use super::TicketKind;
use crate::api::KeyValueStoreError;

/// Errors raised by the ticket model, the registries and the ticket service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TicketError {
    /// Ticket is unknown, or was found expired at validation time.
    #[error("ticket {ticket_id} is invalid")]
    InvalidTicket {
        /// Id that was looked up.
        ticket_id: String,
    },

    /// Ticket exists but is not of the requested kind.
    #[error("ticket {ticket_id} is a {actual}, expected {expected}")]
    TicketTypeMismatch {
        ticket_id: String,
        expected: TicketKind,
        actual: TicketKind,
    },

    /// A ticket with this id is already stored.
    #[error("ticket {ticket_id} already exists")]
    DuplicateTicket { ticket_id: String },

    /// Single-use service ticket replay.
    #[error("ticket {ticket_id} has already been used")]
    TicketAlreadyConsumed { ticket_id: String },

    /// Malformed grant request.
    #[error("invalid ticket request: {reason}")]
    InvalidTicketRequest { reason: String },

    /// Operation not allowed in the ticket's current state.
    #[error("ticket {ticket_id} is in an illegal state: {reason}")]
    IllegalState { ticket_id: String, reason: String },

    /// Service ticket presented by a service other than the one it was issued to.
    #[error("ticket {ticket_id} was not issued to service {service_id}")]
    ServiceMismatch { ticket_id: String, service_id: String },

    /// Ticket id cannot be mapped to a ticket kind.
    #[error("unrecognized ticket id {ticket_id}")]
    UnknownTicketKind { ticket_id: String },

    /// A conditional update kept losing against concurrent writers.
    #[error("ticket {ticket_id} is under concurrent modification, gave up after {attempts} attempts")]
    ConcurrentModification { ticket_id: String, attempts: u32 },

    /// Ticket blob could not be encoded or decoded.
    #[error("serialization failed for ticket {ticket_id}: {reason}")]
    Serialization { ticket_id: String, reason: String },

    /// Backend storage failure.
    #[error("ticket storage failed: {reason}")]
    Storage { reason: String },
}

impl TicketError {
    pub fn invalid(ticket_id: impl Into<String>) -> Self {
        TicketError::InvalidTicket {
            ticket_id: ticket_id.into(),
        }
    }

    /// True for errors a validating service must see as one generic failure.
    pub fn is_validation_failure(&self) -> bool {
        matches!(
            self,
            TicketError::InvalidTicket { .. }
                | TicketError::TicketAlreadyConsumed { .. }
                | TicketError::ServiceMismatch { .. }
                | TicketError::TicketTypeMismatch { .. }
                | TicketError::UnknownTicketKind { .. }
        )
    }

    /// Message safe to return to the end service. Validation failures all
    /// collapse to the same text so replies do not reveal ticket state.
    pub fn public_message(&self) -> String {
        if self.is_validation_failure() {
            "ticket validation failed".to_string()
        } else {
            match self {
                TicketError::InvalidTicketRequest { reason } => format!("invalid ticket request: {reason}"),
                _ => "internal ticket registry error".to_string(),
            }
        }
    }
}

impl From<KeyValueStoreError> for TicketError {
    fn from(err: KeyValueStoreError) -> Self {
        TicketError::Storage {
            reason: err.to_string(),
        }
    }
}
