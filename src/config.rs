//! Bus-wide configuration, loaded once at startup from an optional TOML
//! file and otherwise defaulting to values matching the teacher daemon's
//! hard-coded defaults.

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::policy::Policy;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Overrides the platform-default listen address.
    pub listen: Option<String>,

    pub auth: AuthMechanisms,

    pub policy: Policy,

    pub pipeline: PipelineConfig,

    /// Floor under which the advertise/discover reaper's TTL is never
    /// allowed to fall, guarding against a misconfigured near-zero
    /// value (§4.9).
    #[serde(default = "default_observed_name_ttl_floor_ms")]
    pub observed_name_ttl_floor_ms: u64,
}

fn default_observed_name_ttl_floor_ms() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: None,
            auth: AuthMechanisms::default(),
            policy: Policy::default(),
            pipeline: PipelineConfig::default(),
            observed_name_ttl_floor_ms: default_observed_name_ttl_floor_ms(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file `{}`", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file `{}`", path.display()))
    }
}

/// Which SASL mechanisms the bus accepts from incoming connections.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthMechanisms {
    pub external: bool,
    pub cookie: bool,
    pub anonymous: bool,
}

impl Default for AuthMechanisms {
    fn default() -> Self {
        Self {
            external: true,
            cookie: true,
            anonymous: true,
        }
    }
}

impl AuthMechanisms {
    pub fn to_vec(self) -> Vec<zbus::AuthMechanism> {
        let mut mechanisms = Vec::with_capacity(3);
        if self.external {
            mechanisms.push(zbus::AuthMechanism::External);
        }
        if self.cookie {
            mechanisms.push(zbus::AuthMechanism::Cookie);
        }
        if self.anonymous {
            mechanisms.push(zbus::AuthMechanism::Anonymous);
        }

        mechanisms
    }
}

/// Tuning knobs for the bus-to-bus `RemoteEndpoint` rx/tx pipeline (§4.5).
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded depth of the outgoing message queue, per bus-to-bus link.
    pub tx_queue_capacity: usize,
    /// How long the rx loop waits for traffic before sending a probe.
    pub idle_timeout_secs: u64,
    /// How long the rx loop waits for a probe ack before re-probing.
    pub probe_timeout_secs: u64,
    /// Consecutive unanswered probes before the link is torn down.
    pub max_idle_probes: u32,
    /// Upper bound on how long a blocked producer waits for queue space.
    pub max_backpressure_wait_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tx_queue_capacity: 10,
            idle_timeout_secs: 60,
            probe_timeout_secs: 5,
            max_idle_probes: 3,
            max_backpressure_wait_secs: 20,
        }
    }
}

impl PipelineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn max_backpressure_wait(&self) -> Duration {
        Duration::from_secs(self.max_backpressure_wait_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_matches_documented_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.tx_queue_capacity, 10);
        assert_eq!(cfg.max_idle_probes, 3);
        assert_eq!(cfg.max_backpressure_wait_secs, 20);
    }

    #[test]
    fn round_trips_through_toml() {
        let toml_str = r#"
            listen = "tcp:host=127.0.0.1,port=4242"

            [auth]
            external = true
            cookie = false
            anonymous = false

            [pipeline]
            tx_queue_capacity = 4
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.listen.as_deref(),
            Some("tcp:host=127.0.0.1,port=4242")
        );
        assert!(config.auth.external);
        assert!(!config.auth.cookie);
        assert_eq!(config.pipeline.tx_queue_capacity, 4);
        // Fields omitted from the `[pipeline]` table keep their defaults.
        assert_eq!(config.pipeline.max_idle_probes, 3);
    }

    #[test]
    fn auth_mechanisms_to_vec() {
        let mechanisms = AuthMechanisms {
            external: true,
            cookie: false,
            anonymous: true,
        };
        assert_eq!(
            mechanisms.to_vec(),
            vec![zbus::AuthMechanism::External, zbus::AuthMechanism::Anonymous]
        );
    }
}
