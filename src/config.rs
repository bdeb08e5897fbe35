//! Host Configuration
//!
//! Defaults plus `DUEL_*` environment overrides. Durations are read as
//! whole milliseconds.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::game::participant::SLOT_COUNT;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Variable present but unparsable.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Environment variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },
    /// Required player count outside the supported range.
    #[error("required players must be between 1 and {max}, got {got}")]
    RequiredPlayers {
        /// Supported maximum.
        max: usize,
        /// Configured value.
        got: usize,
    },
    /// A timeout that must be positive was zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// How participants reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    /// Everything in-process (practice against the filler).
    Local,
    /// Remote participants over WebSocket.
    Networked,
}

impl FromStr for HostMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "practice" => Ok(HostMode::Local),
            "networked" | "network" | "online" => Ok(HostMode::Networked),
            _ => Err(()),
        }
    }
}

/// Process-level settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Bind address for the WebSocket listener.
    pub bind_addr: SocketAddr,
    /// Local or networked channel.
    pub mode: HostMode,
    /// Maximum concurrent sockets, approved or not.
    pub max_connections: usize,
    /// Server version string.
    pub version: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            mode: HostMode::Networked,
            max_connections: 64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `DUEL_BIND_ADDR`, `DUEL_MODE`, `DUEL_MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = env_parse("DUEL_BIND_ADDR")? {
            config.bind_addr = addr;
        }
        if let Some(mode) = env_parse("DUEL_MODE")? {
            config.mode = mode;
        }
        if let Some(max) = env_parse("DUEL_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        Ok(config)
    }
}

/// Session timing and capacity.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Participants required before the game starts (1 or 2).
    pub required_players: usize,
    /// How long to wait for the required participants.
    pub start_timeout: Duration,
    /// How long the first round waits for every participant to be reachable.
    pub attach_timeout: Duration,
    /// How long a round waits for moves.
    pub submission_timeout: Duration,
    /// How long a round waits for continue/quit votes.
    pub confirmation_timeout: Duration,
    /// How long to wait for abort acknowledgements.
    pub abort_ack_timeout: Duration,
    /// Delay before exiting after a normal game end.
    pub normal_shutdown_delay: Duration,
    /// Delay before exiting after a fault.
    pub error_shutdown_delay: Duration,
    /// Delay before exiting after the start timeout.
    pub start_timeout_shutdown_delay: Duration,
    /// Grace after everyone left before the game started.
    pub disconnect_grace_pre_start: Duration,
    /// Grace after everyone left once the game started.
    pub disconnect_grace_post_start: Duration,
    /// Stop after this many rounds.
    pub max_rounds: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            required_players: SLOT_COUNT,
            start_timeout: Duration::from_secs(60),
            attach_timeout: Duration::from_secs(5),
            submission_timeout: Duration::from_secs(15),
            confirmation_timeout: Duration::from_secs(30),
            abort_ack_timeout: Duration::from_secs(3),
            normal_shutdown_delay: Duration::from_secs(5),
            error_shutdown_delay: Duration::from_secs(2),
            start_timeout_shutdown_delay: Duration::from_secs(1),
            disconnect_grace_pre_start: Duration::from_secs(60),
            disconnect_grace_post_start: Duration::from_secs(10),
            max_rounds: None,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `DUEL_*` variables, then validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(n) = env_parse("DUEL_REQUIRED_PLAYERS")? {
            config.required_players = n;
        }
        let durations: [(&'static str, &mut Duration); 10] = [
            ("DUEL_START_TIMEOUT_MS", &mut config.start_timeout),
            ("DUEL_ATTACH_TIMEOUT_MS", &mut config.attach_timeout),
            ("DUEL_SUBMISSION_TIMEOUT_MS", &mut config.submission_timeout),
            ("DUEL_CONFIRMATION_TIMEOUT_MS", &mut config.confirmation_timeout),
            ("DUEL_ABORT_ACK_TIMEOUT_MS", &mut config.abort_ack_timeout),
            ("DUEL_NORMAL_SHUTDOWN_MS", &mut config.normal_shutdown_delay),
            ("DUEL_ERROR_SHUTDOWN_MS", &mut config.error_shutdown_delay),
            ("DUEL_START_TIMEOUT_SHUTDOWN_MS", &mut config.start_timeout_shutdown_delay),
            ("DUEL_GRACE_PRE_START_MS", &mut config.disconnect_grace_pre_start),
            ("DUEL_GRACE_POST_START_MS", &mut config.disconnect_grace_post_start),
        ];
        for (key, slot) in durations {
            if let Some(ms) = env_parse::<u64>(key)? {
                *slot = Duration::from_millis(ms);
            }
        }
        if let Some(max) = env_parse::<u32>("DUEL_MAX_ROUNDS")? {
            config.max_rounds = (max > 0).then_some(max);
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.required_players == 0 || self.required_players > SLOT_COUNT {
            return Err(ConfigError::RequiredPlayers {
                max: SLOT_COUNT,
                got: self.required_players,
            });
        }
        if self.submission_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("submission timeout"));
        }
        if self.confirmation_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("confirmation timeout"));
        }
        Ok(())
    }

    /// All-disconnected grace for the current phase.
    pub fn disconnect_grace(&self, started: bool) -> Duration {
        if started {
            self.disconnect_grace_post_start
        } else {
            self.disconnect_grace_pre_start
        }
    }
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.required_players, 2);
        assert!(config.disconnect_grace(false) > config.disconnect_grace(true));
    }

    #[test]
    fn test_required_players_bounds() {
        let too_many = SessionConfig {
            required_players: 3,
            ..Default::default()
        };
        assert!(matches!(too_many.validate(), Err(ConfigError::RequiredPlayers { got: 3, .. })));

        let none = SessionConfig {
            required_players: 0,
            ..Default::default()
        };
        assert!(none.validate().is_err());
    }

    #[test]
    fn test_zero_submission_timeout_rejected() {
        let config = SessionConfig {
            submission_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTimeout(_))));
    }

    #[test]
    fn test_host_mode_parsing() {
        assert_eq!("practice".parse::<HostMode>(), Ok(HostMode::Local));
        assert_eq!("Networked".parse::<HostMode>(), Ok(HostMode::Networked));
        assert!("carrier-pigeon".parse::<HostMode>().is_err());
    }
}
