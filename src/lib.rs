//! Ticket registry and lifecycle engine for single sign-on sessions.
//!
//! A session starts as a [`TicketGrantingTicket`] created from an upstream
//! [`Authentication`]. Service tickets are minted from it, validated once by
//! the service they were issued for, and may in turn grant proxy-granting
//! tickets. Tickets live in a [`TicketRegistry`]; the
//! [`KeyValueTicketRegistry`] keeps them in any [`KeyValueStore`] together
//! with a time-bucketed expiry index that the [`RegistryCleaner`] drains.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use aspen_tickets::api::inmemory::DeterministicKeyValueStore;
//! use aspen_tickets::{
//!     Authentication, DefaultLogoutManager, KeyValueTicketRegistry, Principal, Service, SystemTimeProvider,
//!     TicketConfig, TicketService,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TicketConfig::load()?;
//! let registry = Arc::new(KeyValueTicketRegistry::new(
//!     DeterministicKeyValueStore::new(),
//!     config.key_value_registry_config(),
//! ));
//! let service = TicketService::new(
//!     registry,
//!     Arc::new(DefaultLogoutManager::disabled()),
//!     Arc::new(SystemTimeProvider),
//!     &config,
//! );
//!
//! let tgt = service.create_ticket_granting_ticket(Authentication::new(Principal::new("alice"), 0)).await?;
//! let app = Service::new("https://app.example.com");
//! let st = service.grant_service_ticket(&tgt.id, app.clone(), true).await?;
//! let authentication = service.validate_service_ticket(&st.id, &app).await?;
//! assert_eq!(authentication.principal.id, "alice");
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cleaner;
pub mod config;
pub mod constants;
pub mod logout;
pub mod registry;
pub mod service;
pub mod ticket;
pub mod time;

pub use api::KeyValueStore;
pub use cleaner::{CleanerConfig, CleanerHandle, CleanupReport, RegistryCleaner};
pub use config::{ConfigError, TicketConfig};
pub use logout::{DefaultLogoutManager, LogoutError, LogoutManager, LogoutMessage, LogoutNotifier};
pub use registry::{
    ExpiryIndex, InMemoryTicketRegistry, KeyValueRegistryConfig, KeyValueTicketRegistry, TicketRegistry,
};
pub use service::TicketService;
pub use ticket::{
    Authentication, ExpirationPolicy, Principal, Service, ServiceTicket, Ticket, TicketError, TicketGrantingTicket,
    TicketKind,
};
pub use time::{SimulatedTimeProvider, SystemTimeProvider, TimeProvider};
