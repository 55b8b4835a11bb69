//! Configuration for a spine namespace.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration apart from the security material, which `validate` checks.

use crate::error::{SpineError, SpineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Maximum single message size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpineConfig {
    /// Namespace identity and security material.
    pub namespace: NamespaceConfig,
    /// Discovery cache tuning.
    pub registry: RegistryConfig,
    /// Server-side connection handling.
    pub listener: ListenerConfig,
    /// Publisher fan-out behavior.
    pub pubsub: PubSubConfig,
}

/// Identity and security material shared by everything in a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Namespace name; part of the discovery service type.
    pub name: String,
    /// Key used for HMAC tags or to derive the encryption key.
    /// Never sent over the network.
    pub shared_secret: String,
    /// Encrypt payloads instead of appending an HMAC tag.
    pub use_encryption: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            name: "spine".to_string(),
            shared_secret: String::new(),
            use_encryption: false,
        }
    }
}

/// Discovery registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often the janitor sweeps expired records.
    pub janitor_interval_secs: u64,
    /// TTL applied to records created by on-demand resolution.
    pub default_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            janitor_interval_secs: 30,
            default_ttl_secs: 120,
        }
    }
}

impl RegistryConfig {
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Listener (server-side) tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Number of connections handled concurrently.
    pub max_concurrency: u32,
    /// Inactivity deadline applied to every accepted connection.
    pub connection_timeout_secs: u64,
    /// Largest payload accepted in a single frame.
    pub max_message_size: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            connection_timeout_secs: 5,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ListenerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// What a publisher does when a subscriber's outbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SlowConsumerPolicy {
    /// Discard the oldest queued message to make room.
    DropOldest,
    /// Discard the new message; disconnect after this many consecutive drops.
    Disconnect { max_failures: u32 },
    /// Wait for room up to the timeout, then count a failure and drop.
    Block { timeout_ms: u64 },
}

impl Default for SlowConsumerPolicy {
    fn default() -> Self {
        SlowConsumerPolicy::Disconnect { max_failures: 3 }
    }
}

/// Publisher fan-out tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Capacity of each subscriber's outbound queue.
    pub queue_capacity: usize,
    /// Policy applied when a queue is full.
    pub slow_consumer: SlowConsumerPolicy,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            slow_consumer: SlowConsumerPolicy::default(),
        }
    }
}

impl SpineConfig {
    /// Build a configuration for a namespace with default tuning.
    pub fn new(name: impl Into<String>, shared_secret: impl Into<String>, use_encryption: bool) -> Self {
        Self {
            namespace: NamespaceConfig {
                name: name.into(),
                shared_secret: shared_secret.into(),
                use_encryption,
            },
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> SpineResult<Self> {
        toml::from_str(contents).map_err(|e| SpineError::Config(e.to_string()))
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> SpineResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SpineError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject configurations that cannot produce a working namespace.
    pub fn validate(&self) -> SpineResult<()> {
        if self.namespace.name.trim().is_empty() {
            return Err(SpineError::Config("namespace name must not be empty".into()));
        }
        if self.namespace.shared_secret.is_empty() {
            return Err(SpineError::Config(
                "shared_secret is required for HMAC and encryption".into(),
            ));
        }
        if self.listener.max_concurrency == 0 {
            return Err(SpineError::Config("max_concurrency must be at least 1".into()));
        }
        if self.pubsub.queue_capacity == 0 {
            return Err(SpineError::Config("queue_capacity must be at least 1".into()));
        }
        if self.registry.janitor_interval_secs == 0 {
            return Err(SpineError::Config(
                "janitor_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
