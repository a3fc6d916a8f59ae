//! Single logout: notifying every service of a session when it ends.
//!
//! Delivery is at-least-once. A crash between notification and deletion
//! leaves the session live, so it is found and notified again by the next
//! cleaner pass. Receivers must therefore treat repeated logout messages for
//! one ticket as idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ticket::TicketGrantingTicket;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogoutError {
    /// One service could not be notified.
    #[error("logout delivery to {service_id} failed: {reason}")]
    Delivery { service_id: String, reason: String },

    /// Logout could not be attempted at all.
    #[error("logout unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Outbound notification for one service of a destroyed session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogoutMessage {
    /// Service ticket id, used as the correlation token by the receiver.
    pub ticket_id: String,
    /// Session the service ticket was issued under.
    pub session_id: String,
    pub service_id: String,
    pub logout_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogoutRequestStatus {
    Success,
    Failure,
}

/// Outcome of one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub message: LogoutMessage,
    pub status: LogoutRequestStatus,
}

/// Transport for logout notifications.
#[async_trait]
pub trait LogoutNotifier: Send + Sync {
    async fn send(&self, message: &LogoutMessage) -> Result<(), LogoutError>;
}

#[async_trait]
pub trait LogoutManager: Send + Sync {
    /// Notify every service recorded on `ticket`.
    ///
    /// Per-service failures are reported in the returned requests, not as an
    /// error. An error means no logout was attempted and the session must
    /// not be destroyed yet.
    async fn perform_logout(&self, ticket: &TicketGrantingTicket) -> Result<Vec<LogoutRequest>, LogoutError>;
}

/// Sends one message per tracked service through a [`LogoutNotifier`].
pub struct DefaultLogoutManager {
    notifier: Arc<dyn LogoutNotifier>,
    single_logout_enabled: bool,
}

impl DefaultLogoutManager {
    pub fn new(notifier: Arc<dyn LogoutNotifier>) -> Self {
        Self {
            notifier,
            single_logout_enabled: true,
        }
    }

    /// A manager that records nothing and notifies nobody.
    pub fn disabled() -> Self {
        Self {
            notifier: Arc::new(TracingLogoutNotifier),
            single_logout_enabled: false,
        }
    }
}

#[async_trait]
impl LogoutManager for DefaultLogoutManager {
    async fn perform_logout(&self, ticket: &TicketGrantingTicket) -> Result<Vec<LogoutRequest>, LogoutError> {
        if !self.single_logout_enabled {
            debug!(ticket_id = %ticket.id, "single logout disabled");
            return Ok(Vec::new());
        }

        let mut requests = Vec::with_capacity(ticket.services.len());
        for (ticket_id, service) in &ticket.services {
            let message = LogoutMessage {
                ticket_id: ticket_id.clone(),
                session_id: ticket.id.clone(),
                service_id: service.id.clone(),
                logout_url: service.logout_endpoint().to_string(),
            };
            let status = match self.notifier.send(&message).await {
                Ok(()) => LogoutRequestStatus::Success,
                Err(e) => {
                    warn!(session_id = %ticket.id, service_id = %service.id, error = %e, "logout notification failed");
                    LogoutRequestStatus::Failure
                }
            };
            requests.push(LogoutRequest { message, status });
        }

        let failed = requests.iter().filter(|r| r.status == LogoutRequestStatus::Failure).count();
        info!(session_id = %ticket.id, notified = requests.len() - failed, failed, "performed single logout");
        Ok(requests)
    }
}

/// Notifier that only logs each message. Stands in where no transport is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogoutNotifier;

#[async_trait]
impl LogoutNotifier for TracingLogoutNotifier {
    async fn send(&self, message: &LogoutMessage) -> Result<(), LogoutError> {
        info!(
            ticket_id = %message.ticket_id,
            service_id = %message.service_id,
            logout_url = %message.logout_url,
            "logout notification"
        );
        Ok(())
    }
}
