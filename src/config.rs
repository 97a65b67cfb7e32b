//! Configuration types for connection orchestration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::participant::Role;

/// Main configuration for a session orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum participants tracked by the registry (default: 16, max: 64)
    pub max_participants: usize,

    /// Health sampling configuration
    pub health: HealthConfig,

    /// Reconnection scheduling configuration
    pub reconnect: ReconnectConfig,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Health sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Sampling interval in milliseconds (default: 2000)
    pub interval_ms: u64,

    /// Last-activity age beyond which a live connection counts as stale,
    /// in milliseconds (default: 10000; 0 disables the age check)
    pub freshness_threshold_ms: u64,

    /// Consecutive not-healthy samples before a failure signal (default: 3)
    pub failure_threshold: u32,
}

/// Reconnection scheduling configuration
///
/// Retry delays escalate linearly: attempt `n` waits `base_delay_ms * n`,
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum automatic attempts when recovering host-side (default: 3)
    pub max_attempts_host: u32,

    /// Maximum automatic attempts when recovering participant-side
    /// (default: 5, higher because mobile networks are less stable)
    pub max_attempts_participant: u32,

    /// Base retry delay in milliseconds (default: 1000)
    pub base_delay_ms: u64,

    /// Cap applied to the computed retry delay (default: 15000)
    pub max_delay_ms: u64,

    /// Window during which repeated failure signals are coalesced
    /// (default: 1000)
    pub debounce_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_participants: 16,
            health: HealthConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            freshness_threshold_ms: 10000,
            failure_threshold: 3,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts_host: 3,
            max_attempts_participant: 5,
            base_delay_ms: 1000,
            max_delay_ms: 15000,
            debounce_ms: 1000,
        }
    }
}

impl OrchestratorConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty or contains a non-`stun:` URL
    /// - a TURN server URL is not `turn:` or `turns:`
    /// - `max_participants` is not in range 1-64
    /// - `health` or `reconnect` parameters are out of range
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        // Validate STUN servers
        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }
        for url in &self.stun_servers {
            if !url.starts_with("stun:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun:, got {}",
                    url
                )));
            }
        }

        // Validate TURN servers
        for server in &self.turn_servers {
            if !server.url.starts_with("turn:") && !server.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got {}",
                    server.url
                )));
            }
        }

        // Validate participant capacity
        if self.max_participants == 0 || self.max_participants > 64 {
            return Err(Error::InvalidConfig(format!(
                "max_participants must be in range 1-64, got {}",
                self.max_participants
            )));
        }

        self.health.validate()?;
        self.reconnect.validate()?;

        Ok(())
    }

    /// Create a configuration preset optimized for fast failure detection
    ///
    /// Best for sessions where a dropped camera must be noticed and recovered
    /// within a few seconds.
    ///
    /// Settings:
    /// - Health sampling every 1000ms, freshness threshold 5000ms
    /// - Aggressive reconnection (shorter delays, larger budgets)
    ///
    /// # Example
    ///
    /// ```
    /// use stagelink::config::OrchestratorConfig;
    ///
    /// let config = OrchestratorConfig::low_latency();
    /// assert_eq!(config.health.interval_ms, 1000);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn low_latency() -> Self {
        Self {
            health: HealthConfig {
                interval_ms: 1000,
                freshness_threshold_ms: 5000,
                failure_threshold: 3,
            },
            reconnect: ReconnectConfig::aggressive(),
            ..Self::default()
        }
    }
}

impl HealthConfig {
    /// Validate health sampling parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.interval_ms < 100 {
            return Err(Error::InvalidConfig(format!(
                "health interval_ms must be at least 100, got {}",
                self.interval_ms
            )));
        }
        if self.failure_threshold == 0 {
            return Err(Error::InvalidConfig(
                "health failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Sampling interval as a [`Duration`]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl ReconnectConfig {
    /// Validate reconnection scheduling parameters
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.max_attempts_host == 0 || self.max_attempts_participant == 0 {
            return Err(Error::InvalidConfig(
                "reconnect attempt budgets must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect base_delay_ms must be at least 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnect max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    /// Attempt budget for the given local role
    pub fn max_attempts_for(&self, role: Role) -> u32 {
        match role {
            Role::Host => self.max_attempts_host,
            Role::Participant => self.max_attempts_participant,
        }
    }

    /// Delay before the given attempt number (1-based), linearly escalating
    /// and capped
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay_ms
            .saturating_mul(attempt as u64)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Preset with shorter delays and larger budgets for unstable networks
    ///
    /// # Example
    ///
    /// ```
    /// use stagelink::config::ReconnectConfig;
    ///
    /// let config = ReconnectConfig::aggressive();
    /// assert_eq!(config.base_delay_ms, 500);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn aggressive() -> Self {
        Self {
            max_attempts_host: 5,
            max_attempts_participant: 10,
            base_delay_ms: 500,
            max_delay_ms: 10000,
            debounce_ms: 250,
        }
    }

    /// Preset with longer delays and smaller budgets for stable networks
    pub fn conservative() -> Self {
        Self {
            max_attempts_host: 2,
            max_attempts_participant: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30000,
            debounce_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_stun_servers_rejected() {
        let config = OrchestratorConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_stun_url_rejected() {
        let config = OrchestratorConfig {
            stun_servers: vec!["http://example.com".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_turn_url_rejected() {
        let config = OrchestratorConfig {
            turn_servers: vec![TurnServerConfig {
                url: "udp://relay.example.com".to_string(),
                username: "user".to_string(),
                credential: "pass".to_string(),
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_participants_range() {
        let config = OrchestratorConfig {
            max_participants: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OrchestratorConfig {
            max_participants: 65,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_delay_is_linear_and_capped() {
        let config = ReconnectConfig {
            base_delay_ms: 1000,
            max_delay_ms: 2500,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(2500));
        assert_eq!(config.delay_for_attempt(100), Duration::from_millis(2500));
    }

    #[test]
    fn test_max_attempts_per_role() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts_for(Role::Host), 3);
        assert_eq!(config.max_attempts_for(Role::Participant), 5);
    }

    #[test]
    fn test_inverted_delay_bounds_rejected() {
        let config = ReconnectConfig {
            base_delay_ms: 5000,
            max_delay_ms: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(OrchestratorConfig::low_latency().validate().is_ok());
        assert!(ReconnectConfig::aggressive().validate().is_ok());
        assert!(ReconnectConfig::conservative().validate().is_ok());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = OrchestratorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_participants, config.max_participants);
        assert_eq!(back.reconnect.base_delay_ms, config.reconnect.base_delay_ms);
    }
}
