//! Background cleanup of expired tickets.
//!
//! The cleaner periodically asks the registry for expired sessions, performs
//! single logout for each and only then deletes it with a cascading delete.
//! Registries with an [`ExpiryIndex`](crate::registry::ExpiryIndex) are
//! queried through it; others are scanned in full.
//!
//! # Tiger Style
//!
//! - At most `max_tickets_per_run` sessions per pass
//! - A pass is never interrupted; cancellation is observed between passes
//! - Per-ticket failures are logged and never abort the pass
//! - Expiry decisions use the injected [`TimeProvider`], scheduling uses tokio time

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logout::{LogoutManager, LogoutRequestStatus};
use crate::registry::TicketRegistry;
use crate::ticket::{Ticket, TicketError, TicketGrantingTicket};
use crate::time::TimeProvider;

/// Configuration for the registry cleaner task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanerConfig {
    /// When false, [`RegistryCleaner::start`] spawns a task that exits immediately.
    pub enabled: bool,
    /// Delay before the first pass (default: 20 seconds).
    pub start_delay: Duration,
    /// Delay between the end of one pass and the start of the next (default: 120 seconds).
    pub repeat_interval: Duration,
    /// Maximum sessions cleaned per pass when scanning without an index.
    pub max_tickets_per_run: u32,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_delay: Duration::from_secs(20),
            repeat_interval: Duration::from_secs(120),
            max_tickets_per_run: crate::constants::DEFAULT_MAX_TGTS_TO_LOAD,
        }
    }
}

/// Counters from one cleaner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired sessions returned by the index or the scan.
    pub sessions_found: u64,
    /// Sessions whose logout ran and whose family was deleted.
    pub sessions_cleaned: u64,
    /// Tickets removed, including cascaded descendants.
    pub tickets_deleted: u64,
    /// Individual service notifications that failed.
    pub logout_failures: u64,
    /// Tickets skipped because logout or deletion failed.
    pub failures: u64,
}

pub struct RegistryCleaner {
    registry: Arc<dyn TicketRegistry>,
    logout: Arc<dyn LogoutManager>,
    time: Arc<dyn TimeProvider>,
    config: CleanerConfig,
}

/// Handle to a running cleaner task.
pub struct CleanerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl CleanerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the task after any pass in progress completes.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "registry cleaner task ended abnormally");
        }
    }
}

impl RegistryCleaner {
    pub fn new(
        registry: Arc<dyn TicketRegistry>,
        logout: Arc<dyn LogoutManager>,
        time: Arc<dyn TimeProvider>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            registry,
            logout,
            time,
            config,
        }
    }

    /// Spawn the periodic cleanup task.
    pub fn start(self: Arc<Self>) -> CleanerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            self.run(token).await;
        });
        CleanerHandle { cancel, join }
    }

    async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("registry cleaner disabled");
            return;
        }

        info!(
            start_delay_secs = self.config.start_delay.as_secs(),
            repeat_delay_secs = self.config.repeat_interval.as_secs(),
            max_tickets_per_run = self.config.max_tickets_per_run,
            "registry cleaner started"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("registry cleaner stopped before first run");
                return;
            }
            _ = tokio::time::sleep(self.config.start_delay) => {}
        }

        // Fixed delay, measured from the end of each pass
        loop {
            self.clean().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("registry cleaner shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.repeat_interval) => {}
            }
        }
    }

    /// Run one cleanup pass.
    pub async fn clean(&self) -> CleanupReport {
        let now_ms = self.time.now_unix_ms();
        let mut report = CleanupReport::default();

        let (sessions, service_tickets) = match self.expired_candidates(now_ms).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "failed to query expired tickets");
                return report;
            }
        };
        report.sessions_found = sessions.len() as u64;

        for ticket in &sessions {
            self.clean_session(ticket, now_ms, &mut report).await;
        }

        for ticket_id in &service_tickets {
            match self.registry.delete_ticket(ticket_id).await {
                Ok(deleted) => report.tickets_deleted += deleted,
                Err(e) => {
                    warn!(ticket_id = %ticket_id, error = %e, "failed to delete expired service ticket");
                    report.failures += 1;
                }
            }
        }

        if report.tickets_deleted > 0 || report.failures > 0 {
            info!(
                sessions_found = report.sessions_found,
                sessions_cleaned = report.sessions_cleaned,
                tickets_deleted = report.tickets_deleted,
                logout_failures = report.logout_failures,
                failures = report.failures,
                "registry cleaner pass completed"
            );
        } else {
            debug!("registry cleaner: no expired tickets");
        }
        report
    }

    /// Expired sessions, plus expired service tickets when scanning in full.
    async fn expired_candidates(
        &self,
        now_ms: u64,
    ) -> Result<(Vec<TicketGrantingTicket>, Vec<String>), TicketError> {
        if let Some(index) = self.registry.expiry_index() {
            return Ok((index.get_expired_tgts(now_ms).await?, Vec::new()));
        }

        let limit = self.config.max_tickets_per_run as usize;
        let mut sessions = Vec::new();
        let mut service_tickets = Vec::new();
        for ticket in self.registry.get_tickets().await? {
            if !self.registry.is_expired(&ticket, now_ms).await? {
                continue;
            }
            match ticket {
                Ticket::Granting(tgt) if sessions.len() < limit => sessions.push(tgt),
                Ticket::Granting(_) => {}
                Ticket::Service(st) => service_tickets.push(st.id),
            }
        }
        Ok((sessions, service_tickets))
    }

    /// Log out, then delete. A session whose logout could not run stays
    /// stored and is re-indexed so a later pass retries it.
    async fn clean_session(&self, ticket: &TicketGrantingTicket, now_ms: u64, report: &mut CleanupReport) {
        match self.logout.perform_logout(ticket).await {
            Ok(requests) => {
                report.logout_failures +=
                    requests.iter().filter(|r| r.status == LogoutRequestStatus::Failure).count() as u64;
            }
            Err(e) => {
                warn!(ticket_id = %ticket.id, error = %e, "logout failed, keeping expired session for retry");
                report.failures += 1;
                if let Some(index) = self.registry.expiry_index() {
                    if let Err(e) = index.add_ticket_to_expiry_bucket(ticket, now_ms).await {
                        warn!(ticket_id = %ticket.id, error = %e, "failed to re-index expired session");
                    }
                }
                return;
            }
        }

        match self.registry.delete_ticket(&ticket.id).await {
            Ok(deleted) => {
                debug!(ticket_id = %ticket.id, deleted, "cleaned expired session");
                report.sessions_cleaned += 1;
                report.tickets_deleted += deleted;
            }
            Err(e) => {
                warn!(ticket_id = %ticket.id, error = %e, "failed to delete expired session");
                report.failures += 1;
            }
        }
    }
}
