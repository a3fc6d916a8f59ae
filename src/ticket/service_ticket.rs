//! Service tickets: short-lived credentials bound to one session and one service.

use serde::{Deserialize, Serialize};

use super::{Authentication, ExpirationPolicy, Service, TicketError, TicketGrantingTicket, TicketState};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceTicket {
    pub id: String,
    pub state: TicketState,
    pub expiration_policy: ExpirationPolicy,
    pub service: Service,
    /// Id of the owning ticket-granting ticket.
    pub granting_ticket_id: String,
    /// Issued in the same request as the primary authentication.
    pub from_new_login: bool,
    /// Set once the ticket has been validated or used to grant a proxy-granting ticket.
    pub consumed: bool,
    /// Id of the proxy-granting ticket issued from this ticket, if any.
    pub proxy_granting_ticket: Option<String>,
}

impl ServiceTicket {
    /// Build a service ticket. Both the owning ticket and the service are required.
    pub fn new(
        id: impl Into<String>,
        granting_ticket: Option<&TicketGrantingTicket>,
        service: Option<Service>,
        from_new_login: bool,
        expiration_policy: ExpirationPolicy,
        now_ms: u64,
    ) -> Result<Self, TicketError> {
        let granting_ticket = granting_ticket.ok_or_else(|| TicketError::InvalidTicketRequest {
            reason: "service ticket requires a granting ticket".into(),
        })?;
        let service = service.ok_or_else(|| TicketError::InvalidTicketRequest {
            reason: "service ticket requires a service".into(),
        })?;

        Ok(Self {
            id: id.into(),
            state: TicketState::new(now_ms, granting_ticket.state.remember_me),
            expiration_policy,
            service,
            granting_ticket_id: granting_ticket.id.clone(),
            from_new_login,
            consumed: false,
            proxy_granting_ticket: None,
        })
    }

    pub fn is_valid_for(&self, service: &Service) -> bool {
        self.service.matches(service)
    }

    /// Expiry of this ticket alone, not considering its granting ticket.
    pub fn is_expired_locally(&self, now_ms: u64) -> bool {
        self.expiration_policy.is_expired(&self.state, now_ms)
    }

    pub fn mark_ticket_expired(&mut self) {
        self.state.expired = true;
    }

    /// Record a validation. Fails if the ticket was already consumed and its
    /// policy does not allow reuse.
    pub fn consume(&mut self, now_ms: u64) -> Result<(), TicketError> {
        if self.consumed && !self.expiration_policy.permits_reuse() {
            return Err(TicketError::TicketAlreadyConsumed {
                ticket_id: self.id.clone(),
            });
        }
        self.state.update(now_ms);
        self.consumed = true;
        Ok(())
    }

    /// Issue the one proxy-granting ticket this service ticket may produce.
    ///
    /// `granting_ticket` must be this ticket's owner; the new ticket is
    /// proxied from it on behalf of this ticket's service. Counts as one use
    /// and consumes the ticket.
    pub fn grant_proxy_granting_ticket(
        &mut self,
        id: impl Into<String>,
        authentication: Authentication,
        expiration_policy: ExpirationPolicy,
        granting_ticket: &TicketGrantingTicket,
        now_ms: u64,
    ) -> Result<TicketGrantingTicket, TicketError> {
        if self.proxy_granting_ticket.is_some() {
            return Err(TicketError::IllegalState {
                ticket_id: self.id.clone(),
                reason: "proxy-granting ticket already granted from this ticket".into(),
            });
        }
        if granting_ticket.id != self.granting_ticket_id {
            return Err(TicketError::InvalidTicketRequest {
                reason: format!("{} is not the granting ticket of {}", granting_ticket.id, self.id),
            });
        }

        let pgt = TicketGrantingTicket::new_proxied(
            id,
            authentication,
            expiration_policy,
            granting_ticket,
            self.service.clone(),
            now_ms,
        );
        self.state.update(now_ms);
        self.proxy_granting_ticket = Some(pgt.id.clone());
        self.consumed = true;
        Ok(pgt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::Principal;

    fn tgt() -> TicketGrantingTicket {
        TicketGrantingTicket::new(
            "TGT-1",
            Authentication::new(Principal::new("alice"), 0),
            ExpirationPolicy::NeverExpires,
            0,
        )
    }

    fn single_use() -> ExpirationPolicy {
        ExpirationPolicy::MultiTimeUseOrTimeout {
            number_of_uses: 1,
            time_to_kill_ms: 10_000,
        }
    }

    fn st() -> ServiceTicket {
        ServiceTicket::new("ST-1", Some(&tgt()), Some(Service::new("https://a")), true, single_use(), 0).unwrap()
    }

    #[test]
    fn test_requires_granting_ticket_and_service() {
        let no_tgt = ServiceTicket::new("ST-1", None, Some(Service::new("https://a")), false, single_use(), 0);
        assert!(matches!(no_tgt, Err(TicketError::InvalidTicketRequest { .. })));

        let no_service = ServiceTicket::new("ST-1", Some(&tgt()), None, false, single_use(), 0);
        assert!(matches!(no_service, Err(TicketError::InvalidTicketRequest { .. })));
    }

    #[test]
    fn test_consume_is_single_use() {
        let mut ticket = st();
        ticket.consume(1).unwrap();
        assert!(ticket.consumed);
        assert_eq!(ticket.state.count_of_uses, 1);
        assert!(matches!(ticket.consume(2), Err(TicketError::TicketAlreadyConsumed { .. })));
        assert_eq!(ticket.state.count_of_uses, 1);
    }

    #[test]
    fn test_multi_use_policy_allows_reuse() {
        let policy = ExpirationPolicy::MultiTimeUseOrTimeout {
            number_of_uses: 3,
            time_to_kill_ms: 10_000,
        };
        let mut ticket = ServiceTicket::new("ST-1", Some(&tgt()), Some(Service::new("https://a")), false, policy, 0)
            .unwrap();
        ticket.consume(1).unwrap();
        ticket.consume(2).unwrap();
        assert_eq!(ticket.state.count_of_uses, 2);
    }

    #[test]
    fn test_second_proxy_grant_is_illegal() {
        let parent = tgt();
        let mut ticket = st();
        let auth = Authentication::new(Principal::new("https://proxy"), 1);
        let pgt = ticket
            .grant_proxy_granting_ticket("PGT-1", auth.clone(), ExpirationPolicy::NeverExpires, &parent, 1)
            .unwrap();
        assert_eq!(pgt.proxied_by.as_deref(), Some("TGT-1"));
        assert_eq!(pgt.proxied_by_service, Some(Service::new("https://a")));
        assert!(ticket.consumed);
        assert_eq!(ticket.state.count_of_uses, 1);
        assert_eq!(ticket.state.last_time_used_ms, 1);

        let second = ticket.grant_proxy_granting_ticket("PGT-2", auth, ExpirationPolicy::NeverExpires, &parent, 2);
        assert!(matches!(second, Err(TicketError::IllegalState { .. })));
        assert_eq!(ticket.proxy_granting_ticket.as_deref(), Some("PGT-1"));
        assert_eq!(ticket.state.count_of_uses, 1);
    }

    #[test]
    fn test_proxy_grant_requires_owner() {
        let other = TicketGrantingTicket::new(
            "TGT-2",
            Authentication::new(Principal::new("bob"), 0),
            ExpirationPolicy::NeverExpires,
            0,
        );
        let mut ticket = st();
        let auth = Authentication::new(Principal::new("https://proxy"), 1);
        let res = ticket.grant_proxy_granting_ticket("PGT-1", auth, ExpirationPolicy::NeverExpires, &other, 1);
        assert!(matches!(res, Err(TicketError::InvalidTicketRequest { .. })));
        assert!(!ticket.consumed);
        assert_eq!(ticket.state.count_of_uses, 0);
    }
}
