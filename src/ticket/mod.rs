//! Ticket model.
//!
//! Three kinds of ticket make up an SSO session:
//!
//! - **TGT** ([`TicketGrantingTicket`], root): created by a primary login.
//! - **ST** ([`ServiceTicket`]): minted from a TGT for one service, single-use by default.
//! - **PGT** ([`TicketGrantingTicket`], proxied): minted from a validated ST, lets a
//!   service request further STs on the user's behalf.
//!
//! Tickets refer to each other by id only, never by embedded value, so the
//! ownership graph is a DAG that each backend stores one node at a time.
//! The id prefix identifies the kind without a storage lookup.

mod authentication;
mod error;
mod expiration;
mod granting;
mod id;
mod service_ticket;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use authentication::{Attributes, Authentication, Principal, REMEMBER_ME_ATTRIBUTE, Service};
pub use error::TicketError;
pub use expiration::{ExpirationPolicy, TicketState};
pub use granting::TicketGrantingTicket;
pub use id::UniqueTicketIdGenerator;
pub use service_ticket::ServiceTicket;

use crate::constants::{
    PROXY_GRANTING_TICKET_PREFIX, SERVICE_TICKET_PREFIX, TICKET_GRANTING_TICKET_PREFIX, TICKET_ID_SEPARATOR,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TicketKind {
    TicketGranting,
    Service,
    ProxyGranting,
}

impl TicketKind {
    pub const ALL: [TicketKind; 3] = [TicketKind::TicketGranting, TicketKind::Service, TicketKind::ProxyGranting];

    pub fn prefix(self) -> &'static str {
        match self {
            TicketKind::TicketGranting => TICKET_GRANTING_TICKET_PREFIX,
            TicketKind::Service => SERVICE_TICKET_PREFIX,
            TicketKind::ProxyGranting => PROXY_GRANTING_TICKET_PREFIX,
        }
    }

    /// Map a ticket id to its kind using only the prefix before the first separator.
    pub fn from_id(id: &str) -> Option<TicketKind> {
        let (prefix, rest) = id.split_once(TICKET_ID_SEPARATOR)?;
        if rest.is_empty() {
            return None;
        }
        TicketKind::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Kinds stored in the ticket-granting table.
    pub fn is_granting(self) -> bool {
        matches!(self, TicketKind::TicketGranting | TicketKind::ProxyGranting)
    }

    /// Whether a ticket of kind `self` satisfies a request for `expected`.
    /// A proxy-granting ticket is a ticket-granting ticket.
    pub fn satisfies(self, expected: TicketKind) -> bool {
        self == expected || (expected == TicketKind::TicketGranting && self == TicketKind::ProxyGranting)
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TicketKind::TicketGranting => "ticket-granting ticket",
            TicketKind::Service => "service ticket",
            TicketKind::ProxyGranting => "proxy-granting ticket",
        };
        f.write_str(name)
    }
}

/// Any stored ticket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Ticket {
    Granting(TicketGrantingTicket),
    Service(ServiceTicket),
}

impl Ticket {
    pub fn id(&self) -> &str {
        match self {
            Ticket::Granting(t) => &t.id,
            Ticket::Service(t) => &t.id,
        }
    }

    pub fn kind(&self) -> TicketKind {
        match self {
            Ticket::Granting(t) => t.kind(),
            Ticket::Service(_) => TicketKind::Service,
        }
    }

    pub fn state(&self) -> &TicketState {
        match self {
            Ticket::Granting(t) => &t.state,
            Ticket::Service(t) => &t.state,
        }
    }

    pub fn expiration_policy(&self) -> &ExpirationPolicy {
        match self {
            Ticket::Granting(t) => &t.expiration_policy,
            Ticket::Service(t) => &t.expiration_policy,
        }
    }

    /// Id of the ticket this one depends on: the proxying parent of a PGT or
    /// the owner of an ST. `None` for root tickets.
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Ticket::Granting(t) => t.proxied_by.as_deref(),
            Ticket::Service(t) => Some(&t.granting_ticket_id),
        }
    }

    /// Expiry of this ticket alone. Use the registry for chain-aware expiry.
    pub fn is_expired_locally(&self, now_ms: u64) -> bool {
        self.expiration_policy().is_expired(self.state(), now_ms)
    }

    pub fn mark_ticket_expired(&mut self) {
        match self {
            Ticket::Granting(t) => t.mark_ticket_expired(),
            Ticket::Service(t) => t.mark_ticket_expired(),
        }
    }

    pub fn as_granting(&self) -> Option<&TicketGrantingTicket> {
        match self {
            Ticket::Granting(t) => Some(t),
            Ticket::Service(_) => None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceTicket> {
        match self {
            Ticket::Service(t) => Some(t),
            Ticket::Granting(_) => None,
        }
    }
}

impl From<TicketGrantingTicket> for Ticket {
    fn from(t: TicketGrantingTicket) -> Self {
        Ticket::Granting(t)
    }
}

impl From<ServiceTicket> for Ticket {
    fn from(t: ServiceTicket) -> Self {
        Ticket::Service(t)
    }
}
