//! Ticket subsystem configuration
//!
//! Plain duration and integer values consumed by the ticket model, the
//! registries and the cleaner. Values come from defaults, then `TICKET_*`
//! environment variables.

pub mod error;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::ConfigError;

use crate::cleaner::CleanerConfig;
use crate::constants::{DEFAULT_BUCKET_WIDTH_MS, DEFAULT_MAX_TGTS_TO_LOAD, DEFAULT_TICKET_ID_BODY_LENGTH, MIN_TICKET_ID_BODY_LENGTH};
use crate::registry::KeyValueRegistryConfig;
use crate::ticket::ExpirationPolicy;

/// Ticket lifetimes, id generation and cleaner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketConfig {
    // Ticket-granting tickets
    pub tgt_max_time_to_live_secs: u64,
    pub tgt_time_to_kill_secs: u64,
    pub tgt_remember_me_enabled: bool,
    pub tgt_remember_me_time_to_kill_secs: u64,

    // Service tickets
    pub st_number_of_uses: u32,
    pub st_time_to_kill_secs: u64,
    pub only_track_most_recent_session: bool,

    // Id generation
    pub ticket_id_body_length: usize,
    pub ticket_id_suffix: String,

    // Registry and cleaner
    pub expiry_bucket_width_ms: u64,
    pub cleaner_enabled: bool,
    pub cleaner_start_delay_secs: u64,
    pub cleaner_repeat_interval_secs: u64,
    pub cleaner_max_tgts_to_load: u32,
}

impl TicketConfig {
    /// Load the configuration from defaults overridden by the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        macro_rules! apply_override {
            ($field:ident, $env:literal, $parser:ident) => {
                if let Some(val) = Self::$parser($env)? {
                    self.$field = val;
                }
            };
        }

        apply_override!(tgt_max_time_to_live_secs, "TICKET_TGT_MAX_TIME_TO_LIVE_SECS", env_parse);
        apply_override!(tgt_time_to_kill_secs, "TICKET_TGT_TIME_TO_KILL_SECS", env_parse);
        apply_override!(tgt_remember_me_enabled, "TICKET_TGT_REMEMBER_ME_ENABLED", env_parse);
        apply_override!(tgt_remember_me_time_to_kill_secs, "TICKET_TGT_REMEMBER_ME_TIME_TO_KILL_SECS", env_parse);

        apply_override!(st_number_of_uses, "TICKET_ST_NUMBER_OF_USES", env_parse);
        apply_override!(st_time_to_kill_secs, "TICKET_ST_TIME_TO_KILL_SECS", env_parse);
        apply_override!(only_track_most_recent_session, "TICKET_ONLY_TRACK_MOST_RECENT_SESSION", env_parse);

        apply_override!(ticket_id_body_length, "TICKET_ID_BODY_LENGTH", env_parse);
        apply_override!(ticket_id_suffix, "TICKET_ID_SUFFIX", env_parse);

        apply_override!(expiry_bucket_width_ms, "TICKET_EXPIRY_BUCKET_WIDTH_MS", env_parse);
        apply_override!(cleaner_enabled, "TICKET_CLEANER_ENABLED", env_parse);
        apply_override!(cleaner_start_delay_secs, "TICKET_CLEANER_START_DELAY_SECS", env_parse);
        apply_override!(cleaner_repeat_interval_secs, "TICKET_CLEANER_REPEAT_INTERVAL_SECS", env_parse);
        apply_override!(cleaner_max_tgts_to_load, "TICKET_CLEANER_MAX_TGTS_TO_LOAD", env_parse);

        Ok(())
    }

    fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
        match std::env::var(key) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::invalid(key, raw, "cannot be parsed")),
            Err(_) => Ok(None),
        }
    }

    /// Reject values that would make every ticket expire immediately or
    /// never let the cleaner make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tgt_max_time_to_live_secs == 0 {
            return Err(ConfigError::invalid("tgt_max_time_to_live_secs", 0, "must be positive"));
        }
        if self.tgt_time_to_kill_secs == 0 {
            return Err(ConfigError::invalid("tgt_time_to_kill_secs", 0, "must be positive"));
        }
        if self.tgt_remember_me_enabled && self.tgt_remember_me_time_to_kill_secs == 0 {
            return Err(ConfigError::invalid(
                "tgt_remember_me_time_to_kill_secs",
                0,
                "must be positive when remember-me is enabled",
            ));
        }
        if self.st_number_of_uses == 0 {
            return Err(ConfigError::invalid("st_number_of_uses", 0, "must be at least 1"));
        }
        if self.ticket_id_body_length < MIN_TICKET_ID_BODY_LENGTH {
            return Err(ConfigError::invalid(
                "ticket_id_body_length",
                self.ticket_id_body_length,
                "too short to be unguessable",
            ));
        }
        if self.ticket_id_suffix.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "ticket_id_suffix".into(),
                hint: "set TICKET_ID_SUFFIX to the host name".into(),
            });
        }
        if self.expiry_bucket_width_ms == 0 {
            return Err(ConfigError::invalid("expiry_bucket_width_ms", 0, "must be positive"));
        }
        if self.cleaner_repeat_interval_secs == 0 {
            return Err(ConfigError::invalid("cleaner_repeat_interval_secs", 0, "must be positive"));
        }
        if self.cleaner_max_tgts_to_load == 0 {
            return Err(ConfigError::invalid("cleaner_max_tgts_to_load", 0, "must be positive"));
        }
        Ok(())
    }

    // Duration getters for convenient access
    pub fn tgt_max_time_to_live(&self) -> Duration {
        Duration::from_secs(self.tgt_max_time_to_live_secs)
    }

    pub fn tgt_time_to_kill(&self) -> Duration {
        Duration::from_secs(self.tgt_time_to_kill_secs)
    }

    pub fn st_time_to_kill(&self) -> Duration {
        Duration::from_secs(self.st_time_to_kill_secs)
    }

    pub fn cleaner_start_delay(&self) -> Duration {
        Duration::from_secs(self.cleaner_start_delay_secs)
    }

    pub fn cleaner_repeat_interval(&self) -> Duration {
        Duration::from_secs(self.cleaner_repeat_interval_secs)
    }

    /// Policy attached to new ticket-granting and proxy-granting tickets.
    pub fn tgt_expiration_policy(&self) -> ExpirationPolicy {
        let session = ExpirationPolicy::TimeToLiveTimeToIdle {
            time_to_live_ms: secs_to_ms(self.tgt_max_time_to_live_secs),
            time_to_idle_ms: secs_to_ms(self.tgt_time_to_kill_secs),
        };
        if !self.tgt_remember_me_enabled {
            return session;
        }
        ExpirationPolicy::RememberMeDelegating {
            remember_me: Box::new(ExpirationPolicy::HardTimeout {
                time_to_kill_ms: secs_to_ms(self.tgt_remember_me_time_to_kill_secs),
            }),
            session: Box::new(session),
        }
    }

    /// Policy attached to new service tickets.
    pub fn st_expiration_policy(&self) -> ExpirationPolicy {
        ExpirationPolicy::MultiTimeUseOrTimeout {
            number_of_uses: self.st_number_of_uses,
            time_to_kill_ms: secs_to_ms(self.st_time_to_kill_secs),
        }
    }

    /// Longest lifetime any ticket-granting ticket can have.
    pub fn max_ticket_duration_ms(&self) -> u64 {
        let session = secs_to_ms(self.tgt_max_time_to_live_secs);
        if self.tgt_remember_me_enabled {
            session.max(secs_to_ms(self.tgt_remember_me_time_to_kill_secs))
        } else {
            session
        }
    }

    pub fn cleaner_config(&self) -> CleanerConfig {
        CleanerConfig {
            enabled: self.cleaner_enabled,
            start_delay: self.cleaner_start_delay(),
            repeat_interval: self.cleaner_repeat_interval(),
            max_tickets_per_run: self.cleaner_max_tgts_to_load,
        }
    }

    pub fn key_value_registry_config(&self) -> KeyValueRegistryConfig {
        KeyValueRegistryConfig {
            bucket_width_ms: self.expiry_bucket_width_ms,
            max_tgts_to_load: self.cleaner_max_tgts_to_load,
            max_ticket_duration_ms: self.max_ticket_duration_ms(),
        }
    }
}

fn secs_to_ms(secs: u64) -> u64 {
    secs.saturating_mul(1000)
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            tgt_max_time_to_live_secs: 28_800,
            tgt_time_to_kill_secs: 7_200,
            tgt_remember_me_enabled: false,
            tgt_remember_me_time_to_kill_secs: 1_209_600,
            st_number_of_uses: 1,
            st_time_to_kill_secs: 10,
            only_track_most_recent_session: true,
            ticket_id_body_length: DEFAULT_TICKET_ID_BODY_LENGTH,
            ticket_id_suffix: "aspen".to_string(),
            expiry_bucket_width_ms: DEFAULT_BUCKET_WIDTH_MS,
            cleaner_enabled: true,
            cleaner_start_delay_secs: 20,
            cleaner_repeat_interval_secs: 120,
            cleaner_max_tgts_to_load: DEFAULT_MAX_TGTS_TO_LOAD,
        }
    }
}
