//! Shared fixtures for ticket integration tests.
//!
//! Builders for registries, services and sessions, plus logout doubles that
//! record what they were asked to do.

#![allow(dead_code)] // Each test binary uses a different subset

pub mod proptest_generators;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use aspen_tickets::api::DeterministicKeyValueStore;
use aspen_tickets::logout::{LogoutRequest, LogoutRequestStatus};
use aspen_tickets::{
    Authentication, DefaultLogoutManager, ExpirationPolicy, KeyValueRegistryConfig, KeyValueTicketRegistry,
    LogoutError, LogoutManager, LogoutMessage, LogoutNotifier, Principal, SimulatedTimeProvider, TicketConfig,
    TicketGrantingTicket, TicketRegistry, TicketService,
};

/// Fixed start of simulated time in every test.
pub const START_MS: u64 = 1_000_000;
pub const BUCKET_WIDTH_MS: u64 = 10_000;

pub type KvRegistry = KeyValueTicketRegistry<DeterministicKeyValueStore>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn authentication(principal: &str) -> Authentication {
    Authentication::new(Principal::new(principal), START_MS)
}

pub fn kv_registry() -> Arc<KvRegistry> {
    Arc::new(KeyValueTicketRegistry::new(
        DeterministicKeyValueStore::new(),
        KeyValueRegistryConfig {
            bucket_width_ms: BUCKET_WIDTH_MS,
            max_tgts_to_load: 100,
            max_ticket_duration_ms: 60_000,
        },
    ))
}

/// Ticket service over `registry` using default lifetimes and no logout.
pub fn ticket_service(registry: Arc<dyn TicketRegistry>, time: &SimulatedTimeProvider) -> TicketService {
    TicketService::new(
        registry,
        Arc::new(DefaultLogoutManager::disabled()),
        Arc::new(time.clone()),
        &TicketConfig::default(),
    )
}

/// Root session that dies `ttl_ms` after [`START_MS`].
pub fn session(id: &str, principal: &str, ttl_ms: u64) -> TicketGrantingTicket {
    TicketGrantingTicket::new(
        id,
        authentication(principal),
        ExpirationPolicy::HardTimeout { time_to_kill_ms: ttl_ms },
        START_MS,
    )
}

/// Notifier that records messages and fails for service ids containing "broken".
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<LogoutMessage>>,
}

#[async_trait]
impl LogoutNotifier for RecordingNotifier {
    async fn send(&self, message: &LogoutMessage) -> Result<(), LogoutError> {
        if message.service_id.contains("broken") {
            return Err(LogoutError::Delivery {
                service_id: message.service_id.clone(),
                reason: "503 Service Unavailable".into(),
            });
        }
        self.sent.lock().await.push(message.clone());
        Ok(())
    }
}

/// Logout manager that records each session it is asked about, whether the
/// session was still stored at that moment, and can refuse one principal.
pub struct RecordingLogoutManager {
    registry: Arc<dyn TicketRegistry>,
    refused_principal: Option<String>,
    refusing: AtomicBool,
    pub calls: Mutex<Vec<(String, bool)>>,
}

impl RecordingLogoutManager {
    pub fn new(registry: Arc<dyn TicketRegistry>) -> Self {
        Self {
            registry,
            refused_principal: None,
            refusing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn refusing(registry: Arc<dyn TicketRegistry>, principal: &str) -> Self {
        Self {
            refused_principal: Some(principal.to_string()),
            refusing: AtomicBool::new(true),
            ..Self::new(registry)
        }
    }

    pub fn stop_refusing(&self) {
        self.refusing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogoutManager for RecordingLogoutManager {
    async fn perform_logout(&self, ticket: &TicketGrantingTicket) -> Result<Vec<LogoutRequest>, LogoutError> {
        let still_stored = matches!(self.registry.find_ticket(&ticket.id).await, Ok(Some(_)));
        self.calls.lock().await.push((ticket.id.clone(), still_stored));

        let refused = self.refusing.load(Ordering::SeqCst)
            && self.refused_principal.as_deref() == Some(ticket.authentication.principal.id.as_str());
        if refused {
            return Err(LogoutError::Unavailable {
                reason: "logout endpoint unreachable".into(),
            });
        }

        Ok(ticket
            .services
            .iter()
            .map(|(ticket_id, service)| LogoutRequest {
                message: LogoutMessage {
                    ticket_id: ticket_id.clone(),
                    session_id: ticket.id.clone(),
                    service_id: service.id.clone(),
                    logout_url: service.logout_endpoint().to_string(),
                },
                status: LogoutRequestStatus::Success,
            })
            .collect())
    }
}
