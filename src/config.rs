//! Typed, serde-deserializable configuration aggregating every tunable
//! knob into one place.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Full mesh configuration. `Default` reproduces every documented
/// default value (baseline, non-isolated figures).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub connection: ConnectionConfig,
    pub discovery: DiscoveryConfig,
    pub gossip: GossipConfig,
    pub dht: DhtConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            discovery: DiscoveryConfig::default(),
            gossip: GossipConfig::default(),
            dht: DhtConfig::default(),
        }
    }
}

/// `ConnectionManager` knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_peers: usize,
    pub max_attempts: u32,
    pub max_attempts_isolated: u32,
    #[serde(with = "humantime_duration")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_duration")]
    pub retry_delay_isolated: Duration,
    #[serde(with = "humantime_duration")]
    pub connection_timeout_data_only: Duration,
    #[serde(with = "humantime_duration")]
    pub connection_timeout_with_media: Duration,
    #[serde(with = "humantime_duration")]
    pub isolated_timeout_bonus: Duration,
    #[serde(with = "humantime_duration")]
    pub stale_sweep_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub disconnected_grace: Duration,
    #[serde(with = "humantime_duration")]
    pub transient_state_grace: Duration,
    #[serde(with = "humantime_duration")]
    pub stuck_link_monitor_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub stuck_link_age: Duration,
    #[serde(with = "humantime_duration")]
    pub isolation_monitor_interval: Duration,
    pub eviction_enabled: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_peers: 6,
            max_attempts: 3,
            max_attempts_isolated: 5,
            retry_delay: Duration::from_millis(500),
            retry_delay_isolated: Duration::from_millis(200),
            connection_timeout_data_only: Duration::from_secs(45),
            connection_timeout_with_media: Duration::from_secs(60),
            isolated_timeout_bonus: Duration::from_secs(15),
            stale_sweep_interval: Duration::from_secs(30),
            disconnected_grace: Duration::from_secs(5),
            transient_state_grace: Duration::from_secs(60),
            stuck_link_monitor_interval: Duration::from_secs(3),
            stuck_link_age: Duration::from_secs(10),
            isolation_monitor_interval: Duration::from_secs(10),
            eviction_enabled: true,
        }
    }
}

impl ConnectionConfig {
    /// Max allowed attempts, accounting for isolation.
    pub fn max_attempts(&self, isolated: bool) -> u32 {
        if isolated { self.max_attempts_isolated } else { self.max_attempts }
    }

    /// Per-attempt cooldown, accounting for isolation.
    pub fn retry_delay(&self, isolated: bool) -> Duration {
        if isolated { self.retry_delay_isolated } else { self.retry_delay }
    }

    /// Overall per-attempt timeout, accounting for media and isolation.
    pub fn connection_timeout(&self, has_media: bool, isolated: bool) -> Duration {
        let base = if has_media {
            self.connection_timeout_with_media
        } else {
            self.connection_timeout_data_only
        };
        if isolated { base + self.isolated_timeout_bonus } else { base }
    }
}

/// `PeerDiscovery` knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub auto_discovery: bool,
    pub xor_routing: bool,
    pub min_peers: usize,
    pub max_peers: usize,
    #[serde(with = "humantime_duration")]
    pub stale_after: Duration,
    #[serde(with = "humantime_duration")]
    pub stale_sweep_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub optimization_jitter_min: Duration,
    #[serde(with = "humantime_duration")]
    pub optimization_jitter_max: Duration,
    /// Failed attempts before isolation tier 3 ("any discovered peer")
    /// kicks in.
    pub isolation_failures_before_any: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            auto_discovery: true,
            xor_routing: true,
            min_peers: 3,
            max_peers: 6,
            stale_after: Duration::from_secs(5 * 60),
            stale_sweep_interval: Duration::from_secs(30),
            optimization_jitter_min: Duration::from_secs(10),
            optimization_jitter_max: Duration::from_secs(15),
            isolation_failures_before_any: 2,
        }
    }
}

/// `GossipManager` knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub max_ttl: u32,
    #[serde(with = "humantime_duration")]
    pub expiry: Duration,
    #[serde(with = "humantime_duration")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub key_exchange_dedup_retention: Duration,
    #[serde(with = "humantime_duration")]
    pub key_exchange_dedup_window: Duration,
    /// The gossip network this node participates in; messages carrying a
    /// different `network_name` are dropped on receipt.
    pub network_name: Option<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_ttl: 10,
            expiry: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
            key_exchange_dedup_retention: Duration::from_secs(60),
            key_exchange_dedup_window: Duration::from_secs(5),
            network_name: None,
        }
    }
}

/// `Dht` knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub replication_factor: usize,
    #[serde(with = "humantime_duration")]
    pub query_timeout: Duration,
    #[serde(with = "humantime_duration")]
    pub entry_ttl: Duration,
    #[serde(with = "humantime_duration")]
    pub ttl_sweep_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            query_timeout: Duration::from_secs(5),
            entry_ttl: Duration::from_secs(24 * 60 * 60),
            ttl_sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// `serde_with`-style (de)serialization of `Duration` via `humantime`
/// strings, so config files read `"500ms"` / `"5m"` instead of raw
/// nanosecond integers.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Duration,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime_serde::re::humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        humantime_serde::re::humantime::parse_duration(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_baseline_figures() {
        let cfg = MeshConfig::default();
        assert_eq!(cfg.connection.max_attempts, 3);
        assert_eq!(cfg.connection.max_attempts_isolated, 5);
        assert_eq!(cfg.connection.retry_delay, Duration::from_millis(500));
        assert_eq!(cfg.connection.retry_delay_isolated, Duration::from_millis(200));
        assert_eq!(cfg.connection.connection_timeout_data_only, Duration::from_secs(45));
        assert_eq!(cfg.connection.connection_timeout_with_media, Duration::from_secs(60));
        assert_eq!(cfg.gossip.max_ttl, 10);
        assert_eq!(cfg.gossip.expiry, Duration::from_secs(300));
        assert_eq!(cfg.dht.replication_factor, 3);
        assert_eq!(cfg.dht.entry_ttl, Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn connection_timeout_adds_media_and_isolation_bonuses() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.connection_timeout(false, false), Duration::from_secs(45));
        assert_eq!(cfg.connection_timeout(true, false), Duration::from_secs(60));
        assert_eq!(cfg.connection_timeout(false, true), Duration::from_secs(60));
        assert_eq!(cfg.connection_timeout(true, true), Duration::from_secs(75));
    }

    #[test]
    fn max_attempts_and_retry_delay_switch_on_isolation() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.max_attempts(false), 3);
        assert_eq!(cfg.max_attempts(true), 5);
        assert_eq!(cfg.retry_delay(false), Duration::from_millis(500));
        assert_eq!(cfg.retry_delay(true), Duration::from_millis(200));
    }

    #[test]
    fn durations_round_trip_through_humantime_toml() {
        let cfg = MeshConfig::default();
        let toml_text = toml::to_string(&cfg).expect("serialize");
        assert!(toml_text.contains("500ms"));
        let back: MeshConfig = toml::from_str(&toml_text).expect("deserialize");
        assert_eq!(back.connection.retry_delay, cfg.connection.retry_delay);
        assert_eq!(back.dht.entry_ttl, cfg.dht.entry_ttl);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: MeshConfig = toml::from_str("").expect("empty config uses defaults");
        assert_eq!(cfg.connection.max_peers, ConnectionConfig::default().max_peers);
    }
}
