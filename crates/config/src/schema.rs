//! Config schema types (server, store, gateway timings).

use std::time::Duration;

use {
    beacon_protocol as protocol,
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Origins allowed by the CORS layer (credentials are allowed for these).
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            allowed_origins: vec![
                "http://localhost:3001".into(),
                "http://localhost:5173".into(),
            ],
        }
    }
}

/// Durable store connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/1".into(),
        }
    }
}

/// Session, delivery and maintenance tuning. All durations in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub outbound_queue_capacity: usize,
    pub ping_interval_secs: u64,
    pub read_deadline_secs: u64,
    pub write_deadline_secs: u64,
    pub reap_interval_secs: u64,
    pub stale_after_secs: u64,
    pub reconcile_interval_secs: u64,
    pub pending_ttl_secs: u64,
    pub presence_ttl_secs: u64,
    /// Ceiling for the resubscribe backoff when the ingress topic drops.
    pub resubscribe_max_backoff_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: protocol::OUTBOUND_QUEUE_CAPACITY,
            ping_interval_secs: protocol::PING_INTERVAL_SECS,
            read_deadline_secs: protocol::READ_DEADLINE_SECS,
            write_deadline_secs: protocol::WRITE_DEADLINE_SECS,
            reap_interval_secs: protocol::REAP_INTERVAL_SECS,
            stale_after_secs: protocol::STALE_AFTER_SECS,
            reconcile_interval_secs: protocol::RECONCILE_INTERVAL_SECS,
            pending_ttl_secs: protocol::PENDING_TTL_SECS,
            presence_ttl_secs: protocol::PRESENCE_TTL_SECS,
            resubscribe_max_backoff_secs: 30,
        }
    }
}

impl GatewayConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn resubscribe_max_backoff(&self) -> Duration {
        Duration::from_secs(self.resubscribe_max_backoff_secs)
    }

    /// Problems that would make the gateway misbehave at runtime.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.outbound_queue_capacity == 0 {
            problems.push("gateway.outbound_queue_capacity must be at least 1".to_string());
        }
        if self.ping_interval_secs == 0 {
            problems.push("gateway.ping_interval_secs must be at least 1".to_string());
        }
        if self.ping_interval_secs >= self.read_deadline_secs {
            problems.push(format!(
                "gateway.ping_interval_secs ({}) must be shorter than read_deadline_secs ({})",
                self.ping_interval_secs, self.read_deadline_secs
            ));
        }
        if self.reap_interval_secs == 0 || self.reconcile_interval_secs == 0 {
            problems.push("gateway maintenance intervals must be at least 1 second".to_string());
        }
        problems
    }
}
