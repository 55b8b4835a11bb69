//! Discovery registry that caches resolved service addresses with expiry.
//!
//! The [`Registry`] is a thread-safe cache from instance name to address.
//! A background browse task upserts records as the discovery transport
//! reports them, a janitor evicts expired records, and [`Registry::lookup`]
//! falls back to a live resolution when the cache has nothing usable.
//! The lock is never held across a network call.

use crate::discovery::{DiscoveryEvent, DiscoveryTransport, DOMAIN};
use chrono::{DateTime, Utc};
use spine_types::config::RegistryConfig;
use spine_types::{SpineError, SpineResult, Stage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest janitor period [`Registry::spawn_background`] will run with.
pub const MIN_JANITOR_INTERVAL: Duration = Duration::from_millis(10);

/// A cached discovery result.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    /// Advertised instance name (prefix included).
    pub name: String,
    /// Address the instance listens on.
    pub address: SocketAddr,
    /// When the record stops being served from cache.
    pub expiry: Instant,
    /// When the record was last refreshed.
    pub refreshed_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expiry
    }
}

/// Thread-safe cache of discovered endpoints for one namespace.
#[derive(Clone)]
pub struct Registry {
    records: Arc<RwLock<HashMap<String, ServiceRecord>>>,
    transport: Arc<dyn DiscoveryTransport>,
    service_type: String,
    default_ttl: Duration,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("service_type", &self.service_type)
            .field("records", &self.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry for `service_type`. No background tasks run
    /// until [`Registry::spawn_background`] is called.
    pub fn new(
        service_type: impl Into<String>,
        transport: Arc<dyn DiscoveryTransport>,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            transport,
            service_type: service_type.into(),
            default_ttl: config.default_ttl(),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Start the browse and janitor tasks. Both exit when `token` is cancelled.
    /// A zero `janitor_interval` is raised to [`MIN_JANITOR_INTERVAL`].
    pub fn spawn_background(
        &self,
        token: CancellationToken,
        janitor_interval: Duration,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let browse = tokio::spawn(self.clone().run_browse(token.clone()));
        let interval = janitor_interval.max(MIN_JANITOR_INTERVAL);
        let janitor = tokio::spawn(self.clone().run_janitor(token, interval));
        (browse, janitor)
    }

    /// Resolve `name` to an address.
    ///
    /// Unexpired cache hits return immediately. Otherwise, with a deadline,
    /// the transport is asked to resolve the name live and the result is
    /// cached; without one, the lookup fails with [`SpineError::NotFound`].
    pub async fn lookup(&self, name: &str, deadline: Option<Duration>) -> SpineResult<SocketAddr> {
        if let Some(record) = self.get(name) {
            if !record.is_expired(Instant::now()) {
                return Ok(record.address);
            }
        }

        let Some(deadline) = deadline else {
            return Err(SpineError::NotFound(name.to_string()));
        };

        let resolution = self
            .transport
            .resolve(name, &self.service_type, DOMAIN, deadline);
        let address = match tokio::time::timeout(deadline, resolution).await {
            Ok(Ok(address)) => address,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(SpineError::DeadlineExceeded {
                    stage: Stage::Resolve,
                })
            }
        };

        debug!(name, %address, "Registry: resolved on demand");
        self.upsert(name, address, self.default_ttl);
        Ok(address)
    }

    /// Evict `name` so the next lookup re-resolves it.
    pub fn remove_on_failure(&self, name: &str) -> Option<ServiceRecord> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let removed = records.remove(name);
        if removed.is_some() {
            debug!(name, "Registry: evicted after failure");
        }
        removed
    }

    /// Insert or refresh a record.
    pub fn upsert(&self, name: &str, address: SocketAddr, ttl: Duration) {
        let record = ServiceRecord {
            name: name.to_string(),
            address,
            expiry: Instant::now() + ttl,
            refreshed_at: Utc::now(),
        };
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(name.to_string(), record);
    }

    /// Snapshot of a record, expired or not.
    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(name).cloned()
    }

    /// Snapshot of every record.
    pub fn records(&self) -> Vec<ServiceRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.values().cloned().collect()
    }

    /// Drop every expired record; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|name, record| {
            let keep = !record.is_expired(now);
            if !keep {
                debug!(name = %name, "Registry: cleaning up expired record");
            }
            keep
        });
        before - records.len()
    }

    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn apply_event(&self, event: DiscoveryEvent) {
        self.upsert(&event.instance, event.address, event.ttl);
    }

    async fn run_browse(self, token: CancellationToken) {
        let mut events = tokio::select! {
            _ = token.cancelled() => return,
            browse = self.transport.browse(&self.service_type, DOMAIN) => match browse {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, service_type = %self.service_type, "Registry: browse failed to start");
                    return;
                }
            },
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(service_type = %self.service_type, "Discovery stopped");
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => self.apply_event(event),
                    None => {
                        warn!(service_type = %self.service_type, "Registry: browse stream ended");
                        return;
                    }
                },
            }
        }
    }

    async fn run_janitor(self, token: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    let removed = self.sweep_expired();
                    if removed > 0 {
                        debug!(removed, "Registry: janitor sweep");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{service_type, Advertisement, LocalDiscovery};

    fn make_registry(discovery: Arc<LocalDiscovery>) -> Registry {
        Registry::new(service_type("lab"), discovery, &RegistryConfig::default())
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_cached_lookup() {
        let registry = make_registry(Arc::new(LocalDiscovery::new()));
        registry.upsert("_serviceecho", addr(4100), Duration::from_secs(60));
        assert_eq!(registry.lookup("_serviceecho", None).await.unwrap(), addr(4100));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_without_deadline_is_not_found() {
        let registry = make_registry(Arc::new(LocalDiscovery::new()));
        let err = registry.lookup("_serviceghost", None).await.unwrap_err();
        assert!(matches!(err, SpineError::NotFound(ref n) if n == "_serviceghost"));
    }

    #[tokio::test]
    async fn test_missing_with_deadline_waits_then_fails() {
        let registry = make_registry(Arc::new(LocalDiscovery::new()));
        let started = std::time::Instant::now();
        let err = registry
            .lookup("_serviceghost", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, SpineError::DeadlineExceeded { .. }));
        assert!(elapsed >= Duration::from_millis(90), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "returned after {elapsed:?}");
    }

    #[tokio::test]
    async fn test_live_resolution_is_cached() {
        let discovery = Arc::new(LocalDiscovery::new());
        discovery
            .advertise(Advertisement {
                instance: "_serviceecho".into(),
                service_type: service_type("lab"),
                domain: DOMAIN.into(),
                port: 4200,
                metadata: vec![],
            })
            .await
            .unwrap();
        let registry = make_registry(discovery);
        assert!(registry.get("_serviceecho").is_none());

        let found = registry
            .lookup("_serviceecho", Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(found, addr(4200));
        assert_eq!(registry.get("_serviceecho").unwrap().address, addr(4200));
    }

    #[tokio::test]
    async fn test_remove_on_failure_forces_resolution() {
        let registry = make_registry(Arc::new(LocalDiscovery::new()));
        registry.upsert("_servicestale", addr(4300), Duration::from_secs(60));

        let removed = registry.remove_on_failure("_servicestale").unwrap();
        assert_eq!(removed.address, addr(4300));

        // Nothing advertises it, so the live path must run and time out.
        let err = registry
            .lookup("_servicestale", Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, SpineError::DeadlineExceeded { .. }));
        assert!(registry.remove_on_failure("_servicestale").is_none());
    }

    #[tokio::test]
    async fn test_expired_record_is_not_served() {
        let registry = make_registry(Arc::new(LocalDiscovery::new()));
        registry.upsert("_serviceshort", addr(4400), Duration::from_millis(50));
        assert!(registry.lookup("_serviceshort", None).await.is_ok());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let err = registry.lookup("_serviceshort", None).await.unwrap_err();
        assert!(matches!(err, SpineError::NotFound(_)));
        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_janitor_evicts_expired() {
        let registry = make_registry(Arc::new(LocalDiscovery::new()));
        let token = CancellationToken::new();
        let (browse, janitor) = registry.spawn_background(token.clone(), Duration::from_millis(20));

        registry.upsert("_serviceshort", addr(4500), Duration::from_millis(40));
        registry.upsert("_servicelong", addr(4501), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(registry.get("_serviceshort").is_none());
        assert!(registry.get("_servicelong").is_some());

        token.cancel();
        browse.await.unwrap();
        janitor.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_janitor_interval_is_clamped() {
        let registry = make_registry(Arc::new(LocalDiscovery::new()));
        let token = CancellationToken::new();
        let (browse, janitor) = registry.spawn_background(token.clone(), Duration::ZERO);

        registry.upsert("_serviceshort", addr(4600), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.get("_serviceshort").is_none());

        token.cancel();
        browse.await.unwrap();
        janitor.await.unwrap();
    }

    #[tokio::test]
    async fn test_browse_populates_cache() {
        let discovery = Arc::new(LocalDiscovery::with_ttl(Duration::from_secs(30)));
        let registry = make_registry(discovery.clone());
        let token = CancellationToken::new();
        let _tasks = registry.spawn_background(token.clone(), Duration::from_secs(30));

        discovery
            .advertise(Advertisement {
                instance: "_publisherlidar".into(),
                service_type: service_type("lab"),
                domain: DOMAIN.into(),
                port: 4600,
                metadata: vec![],
            })
            .await
            .unwrap();

        let mut found = None;
        for _ in 0..50 {
            if let Some(record) = registry.get("_publisherlidar") {
                found = Some(record);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = found.expect("browse task never recorded the advertisement");
        assert_eq!(record.address, addr(4600));
        assert!(!record.is_expired(Instant::now()));
        token.cancel();
    }
}
