//! Inbound ticket operations used by the protocol layer.
//!
//! Every mutation of a stored ticket goes through
//! [`TicketRegistry::compare_and_update`] in a bounded retry loop, so two
//! requests racing on the same session both land their changes and two
//! validations racing on the same service ticket cannot both succeed.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::TicketConfig;
use crate::constants::{MAX_UPDATE_RETRIES, RETRY_JITTER_MS};
use crate::logout::LogoutManager;
use crate::registry::TicketRegistry;
use crate::ticket::{
    Authentication, ExpirationPolicy, Service, ServiceTicket, Ticket, TicketError, TicketGrantingTicket, TicketKind,
    UniqueTicketIdGenerator,
};
use crate::time::TimeProvider;

pub struct TicketService {
    registry: Arc<dyn TicketRegistry>,
    logout: Arc<dyn LogoutManager>,
    time: Arc<dyn TimeProvider>,
    ids: UniqueTicketIdGenerator,
    granting_ticket_policy: ExpirationPolicy,
    service_ticket_policy: ExpirationPolicy,
    proxy_granting_ticket_policy: ExpirationPolicy,
    only_track_most_recent_session: bool,
}

async fn backoff() {
    let jitter = rand::rng().random_range(0..RETRY_JITTER_MS + 1);
    tokio::time::sleep(Duration::from_millis(jitter)).await;
}

impl TicketService {
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        logout: Arc<dyn LogoutManager>,
        time: Arc<dyn TimeProvider>,
        config: &TicketConfig,
    ) -> Self {
        let granting_ticket_policy = config.tgt_expiration_policy();
        Self {
            registry,
            logout,
            time,
            ids: UniqueTicketIdGenerator::new(config.ticket_id_body_length, config.ticket_id_suffix.clone()),
            proxy_granting_ticket_policy: granting_ticket_policy.clone(),
            granting_ticket_policy,
            service_ticket_policy: config.st_expiration_policy(),
            only_track_most_recent_session: config.only_track_most_recent_session,
        }
    }

    pub fn with_granting_ticket_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.granting_ticket_policy = policy;
        self
    }

    pub fn with_service_ticket_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.service_ticket_policy = policy;
        self
    }

    pub fn with_proxy_granting_ticket_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.proxy_granting_ticket_policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<dyn TicketRegistry> {
        &self.registry
    }

    /// Start a session for an authenticated principal.
    pub async fn create_ticket_granting_ticket(
        &self,
        authentication: Authentication,
    ) -> Result<TicketGrantingTicket, TicketError> {
        let now_ms = self.time.now_unix_ms();
        let id = self.ids.new_ticket_id(TicketKind::TicketGranting)?;
        let ticket = TicketGrantingTicket::new(id, authentication, self.granting_ticket_policy.clone(), now_ms);
        self.registry.add_ticket(ticket.clone().into()).await?;
        debug!(ticket_id = %ticket.id, principal = %ticket.authentication.principal.id, "created ticket-granting ticket");
        Ok(ticket)
    }

    /// Issue a service ticket under session `tgt_id`.
    ///
    /// `credentials_provided` marks a ticket issued in the same request as
    /// the primary authentication.
    pub async fn grant_service_ticket(
        &self,
        tgt_id: &str,
        service: Service,
        credentials_provided: bool,
    ) -> Result<ServiceTicket, TicketError> {
        let now_ms = self.time.now_unix_ms();

        for _ in 0..MAX_UPDATE_RETRIES {
            let current = self.registry.get_ticket_granting_ticket(tgt_id).await?;
            let expected = Ticket::Granting(current.clone());
            if self.registry.is_expired(&expected, now_ms).await? {
                debug!(ticket_id = tgt_id, "refusing service ticket for expired session");
                return Err(TicketError::invalid(tgt_id));
            }

            let superseded = if self.only_track_most_recent_session {
                current.tracked_tickets_for(&service)
            } else {
                Vec::new()
            };
            let mut updated = current;
            let st = updated.grant_service_ticket(
                self.ids.new_ticket_id(TicketKind::Service)?,
                Some(service.clone()),
                self.service_ticket_policy.clone(),
                credentials_provided,
                self.only_track_most_recent_session,
                now_ms,
            )?;

            // Session first: a crash before the ticket is stored leaves only a dangling id
            if self.registry.compare_and_update(&expected, updated.into()).await? {
                self.registry.add_ticket(st.clone().into()).await?;
                debug!(ticket_id = %st.id, session_id = tgt_id, service_id = %service.id, "granted service ticket");
                // No longer reachable through the session, so no cascade would find them
                for id in &superseded {
                    if let Err(e) = self.registry.delete_ticket(id).await {
                        warn!(ticket_id = %id, session_id = tgt_id, error = %e, "failed to delete superseded service ticket");
                    }
                }
                return Ok(st);
            }
            backoff().await;
        }

        Err(TicketError::ConcurrentModification {
            ticket_id: tgt_id.to_string(),
            attempts: MAX_UPDATE_RETRIES,
        })
    }

    /// Validate a service ticket presented by `service`.
    ///
    /// The ticket is consumed even when the service does not match. Returns
    /// the authentication of the original login.
    pub async fn validate_service_ticket(&self, st_id: &str, service: &Service) -> Result<Authentication, TicketError> {
        let (authentication, _) = self.validate(st_id, service, None).await?;
        Ok(authentication)
    }

    /// Validate a service ticket and, in the same atomic use, issue the
    /// proxy-granting ticket the validating service asked for.
    pub async fn validate_service_ticket_with_proxy(
        &self,
        st_id: &str,
        service: &Service,
        proxy_authentication: Authentication,
    ) -> Result<(Authentication, TicketGrantingTicket), TicketError> {
        let (authentication, pgt) = self.validate(st_id, service, Some(proxy_authentication)).await?;
        let pgt = pgt.ok_or_else(|| TicketError::IllegalState {
            ticket_id: st_id.to_string(),
            reason: "validation did not produce a proxy-granting ticket".into(),
        })?;
        Ok((authentication, pgt))
    }

    async fn validate(
        &self,
        st_id: &str,
        service: &Service,
        proxy_authentication: Option<Authentication>,
    ) -> Result<(Authentication, Option<TicketGrantingTicket>), TicketError> {
        let now_ms = self.time.now_unix_ms();

        for _ in 0..MAX_UPDATE_RETRIES {
            let current = self.registry.get_service_ticket(st_id).await?;
            if current.consumed && !current.expiration_policy.permits_reuse() {
                debug!(ticket_id = st_id, "service ticket replayed");
                return Err(TicketError::TicketAlreadyConsumed {
                    ticket_id: st_id.to_string(),
                });
            }

            let expected = Ticket::Service(current.clone());
            if self.registry.is_expired(&expected, now_ms).await? {
                debug!(ticket_id = st_id, "service ticket expired at validation");
                self.registry.delete_ticket(st_id).await?;
                return Err(TicketError::invalid(st_id));
            }

            let owner = self.registry.get_ticket_granting_ticket(&current.granting_ticket_id).await?;
            let service_matches = current.is_valid_for(service);

            // Granting the proxy-granting ticket is itself the one use
            let mut updated = current;
            let pgt = match (&proxy_authentication, service_matches) {
                (Some(authentication), true) => Some(updated.grant_proxy_granting_ticket(
                    self.ids.new_ticket_id(TicketKind::ProxyGranting)?,
                    authentication.clone(),
                    self.proxy_granting_ticket_policy.clone(),
                    &owner,
                    now_ms,
                )?),
                _ => {
                    updated.consume(now_ms)?;
                    None
                }
            };

            if !self.registry.compare_and_update(&expected, updated.into()).await? {
                backoff().await;
                continue;
            }

            if !service_matches {
                warn!(ticket_id = st_id, service_id = %service.id, "service ticket presented by wrong service");
                return Err(TicketError::ServiceMismatch {
                    ticket_id: st_id.to_string(),
                    service_id: service.id.clone(),
                });
            }

            if let Some(pgt) = &pgt {
                self.store_proxy_granting_ticket(pgt).await?;
            }
            debug!(ticket_id = st_id, service_id = %service.id, "validated service ticket");
            return Ok((owner.root_authentication().clone(), pgt));
        }

        Err(TicketError::ConcurrentModification {
            ticket_id: st_id.to_string(),
            attempts: MAX_UPDATE_RETRIES,
        })
    }

    /// Issue a proxy-granting ticket from a service ticket, consuming it.
    ///
    /// A service ticket grants at most one proxy-granting ticket; a second
    /// attempt fails with `IllegalState`.
    pub async fn grant_proxy_granting_ticket(
        &self,
        st_id: &str,
        authentication: Authentication,
    ) -> Result<TicketGrantingTicket, TicketError> {
        let now_ms = self.time.now_unix_ms();

        for _ in 0..MAX_UPDATE_RETRIES {
            let current = self.registry.get_service_ticket(st_id).await?;
            // Checked before expiry: recording the grant may have used the ticket up
            if current.proxy_granting_ticket.is_some() {
                return Err(TicketError::IllegalState {
                    ticket_id: st_id.to_string(),
                    reason: "proxy-granting ticket already granted from this ticket".into(),
                });
            }
            if current.consumed && !current.expiration_policy.permits_reuse() {
                return Err(TicketError::TicketAlreadyConsumed {
                    ticket_id: st_id.to_string(),
                });
            }

            let expected = Ticket::Service(current.clone());
            if self.registry.is_expired(&expected, now_ms).await? {
                return Err(TicketError::invalid(st_id));
            }

            let owner = self.registry.get_ticket_granting_ticket(&current.granting_ticket_id).await?;
            let mut updated = current;
            let pgt = updated.grant_proxy_granting_ticket(
                self.ids.new_ticket_id(TicketKind::ProxyGranting)?,
                authentication.clone(),
                self.proxy_granting_ticket_policy.clone(),
                &owner,
                now_ms,
            )?;

            if self.registry.compare_and_update(&expected, updated.into()).await? {
                self.store_proxy_granting_ticket(&pgt).await?;
                return Ok(pgt);
            }
            backoff().await;
        }

        Err(TicketError::ConcurrentModification {
            ticket_id: st_id.to_string(),
            attempts: MAX_UPDATE_RETRIES,
        })
    }

    /// Store a new proxy-granting ticket and record it on its parent.
    async fn store_proxy_granting_ticket(&self, pgt: &TicketGrantingTicket) -> Result<(), TicketError> {
        self.registry.add_ticket(pgt.clone().into()).await?;
        let Some(parent_id) = pgt.proxied_by.as_deref() else {
            return Ok(());
        };

        for _ in 0..MAX_UPDATE_RETRIES {
            let parent = self.registry.get_ticket_granting_ticket(parent_id).await?;
            if parent.proxy_granting_tickets.contains(&pgt.id) {
                return Ok(());
            }
            let expected = Ticket::Granting(parent.clone());
            let mut updated = parent;
            updated.proxy_granting_tickets.insert(pgt.id.clone());
            if self.registry.compare_and_update(&expected, updated.into()).await? {
                debug!(ticket_id = %pgt.id, session_id = parent_id, "granted proxy-granting ticket");
                return Ok(());
            }
            backoff().await;
        }

        Err(TicketError::ConcurrentModification {
            ticket_id: parent_id.to_string(),
            attempts: MAX_UPDATE_RETRIES,
        })
    }

    /// End a session: notify its services, then delete it and everything
    /// chained from it. Returns the number of tickets removed.
    pub async fn destroy_ticket_granting_ticket(&self, tgt_id: &str) -> Result<u64, TicketError> {
        let Some(ticket) = self.registry.find_ticket(tgt_id).await? else {
            debug!(ticket_id = tgt_id, "session already gone");
            return Ok(0);
        };
        let Ticket::Granting(tgt) = ticket else {
            return Err(TicketError::TicketTypeMismatch {
                ticket_id: tgt_id.to_string(),
                expected: TicketKind::TicketGranting,
                actual: TicketKind::Service,
            });
        };

        // User-initiated logout always proceeds to deletion
        if let Err(e) = self.logout.perform_logout(&tgt).await {
            warn!(ticket_id = tgt_id, error = %e, "single logout failed during session destroy");
        }

        let deleted = self.registry.delete_ticket(tgt_id).await?;
        info!(ticket_id = tgt_id, deleted, "destroyed session");
        Ok(deleted)
    }
}
