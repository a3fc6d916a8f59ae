//! Ticket-granting tickets: root SSO sessions and proxy-granting tickets.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Authentication, ExpirationPolicy, Service, ServiceTicket, TicketError, TicketKind, TicketState};

/// A root session (`TGT-`) or a proxy-granting ticket (`PGT-`).
///
/// Parents are referenced by id only. Resolving a parent always goes through
/// the registry, so a ticket can be stored and loaded on its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketGrantingTicket {
    pub id: String,
    pub state: TicketState,
    pub expiration_policy: ExpirationPolicy,
    pub authentication: Authentication,
    /// `[own authentication] ++ parent.chained_authentications`.
    pub chained_authentications: Vec<Authentication>,
    /// Id of the ticket-granting ticket this one was proxied from.
    pub proxied_by: Option<String>,
    /// Service that requested the proxy-granting ticket.
    pub proxied_by_service: Option<Service>,
    /// Service tickets issued under this session, keyed by ticket id.
    pub services: BTreeMap<String, Service>,
    /// Proxy-granting tickets chained from this session.
    pub proxy_granting_tickets: BTreeSet<String>,
}

impl TicketGrantingTicket {
    /// Create a root ticket-granting ticket.
    pub fn new(
        id: impl Into<String>,
        authentication: Authentication,
        expiration_policy: ExpirationPolicy,
        now_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            state: TicketState::new(now_ms, authentication.is_remember_me()),
            expiration_policy,
            chained_authentications: vec![authentication.clone()],
            authentication,
            proxied_by: None,
            proxied_by_service: None,
            services: BTreeMap::new(),
            proxy_granting_tickets: BTreeSet::new(),
        }
    }

    /// Create a ticket proxied from `parent` on behalf of `service`.
    pub fn new_proxied(
        id: impl Into<String>,
        authentication: Authentication,
        expiration_policy: ExpirationPolicy,
        parent: &TicketGrantingTicket,
        service: Service,
        now_ms: u64,
    ) -> Self {
        let mut chained_authentications = Vec::with_capacity(parent.chained_authentications.len() + 1);
        chained_authentications.push(authentication.clone());
        chained_authentications.extend(parent.chained_authentications.iter().cloned());

        Self {
            id: id.into(),
            state: TicketState::new(now_ms, parent.state.remember_me),
            expiration_policy,
            authentication,
            chained_authentications,
            proxied_by: Some(parent.id.clone()),
            proxied_by_service: Some(service),
            services: BTreeMap::new(),
            proxy_granting_tickets: BTreeSet::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.proxied_by.is_none()
    }

    pub fn kind(&self) -> TicketKind {
        if self.is_root() {
            TicketKind::TicketGranting
        } else {
            TicketKind::ProxyGranting
        }
    }

    /// Authentication of the original login at the head of the proxy chain.
    pub fn root_authentication(&self) -> &Authentication {
        self.chained_authentications.last().unwrap_or(&self.authentication)
    }

    /// Expiry of this ticket alone, not considering its ancestors.
    pub fn is_expired_locally(&self, now_ms: u64) -> bool {
        self.expiration_policy.is_expired(&self.state, now_ms)
    }

    pub fn mark_ticket_expired(&mut self) {
        self.state.expired = true;
    }

    /// Ids of tracked service tickets issued for the same normalized URL as `service`.
    pub fn tracked_tickets_for(&self, service: &Service) -> Vec<String> {
        let normalized = service.normalized_url();
        self.services
            .iter()
            .filter(|(_, existing)| existing.normalized_url() == normalized)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Issue a service ticket for `service` and record it in [`Self::services`].
    ///
    /// The ticket is new-login when credentials were presented in this
    /// request or this session has never been used. With
    /// `only_track_most_recent_session`, earlier entries for the same
    /// normalized service URL are dropped; see [`Self::tracked_tickets_for`]
    /// for the ids that will be superseded.
    pub fn grant_service_ticket(
        &mut self,
        id: impl Into<String>,
        service: Option<Service>,
        expiration_policy: ExpirationPolicy,
        credentials_provided: bool,
        only_track_most_recent_session: bool,
        now_ms: u64,
    ) -> Result<ServiceTicket, TicketError> {
        let from_new_login = credentials_provided || self.state.count_of_uses == 0;
        let ticket = ServiceTicket::new(id, Some(&*self), service, from_new_login, expiration_policy, now_ms)?;

        self.state.update(now_ms);

        if only_track_most_recent_session {
            for superseded in self.tracked_tickets_for(&ticket.service) {
                self.services.remove(&superseded);
            }
        }
        self.services.insert(ticket.id.clone(), ticket.service.clone());

        Ok(ticket)
    }

    /// Forget every tracked service. Used once logout has been delivered.
    pub fn remove_all_services(&mut self) {
        self.services.clear();
    }
}
