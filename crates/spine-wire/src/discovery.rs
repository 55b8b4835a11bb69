//! Discovery transport abstraction and the in-process implementation.
//!
//! The registry only needs four operations from the local-network discovery
//! mechanism: advertise, withdraw, browse and resolve-by-name. A multicast
//! implementation lives in [`crate::mdns`] behind the `mdns` feature;
//! [`LocalDiscovery`] serves processes that share one address space and the
//! test suite.

use async_trait::async_trait;
use spine_types::{SpineError, SpineResult, Stage};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Suffix appended to the namespace name to form the discovery service type.
pub const SERVICE_TYPE_SUFFIX: &str = "._spine._tcp";
/// Discovery domain shared by all namespaces.
pub const DOMAIN: &str = "local.";
/// Instance-name prefix for request/response services.
pub const SERVICE_PREFIX: &str = "_service";
/// Instance-name prefix for publishers.
pub const PUBLISHER_PREFIX: &str = "_publisher";

/// Discovery service type for a namespace.
pub fn service_type(namespace: &str) -> String {
    format!("{namespace}{SERVICE_TYPE_SUFFIX}")
}

/// Instance name under which a service is advertised.
pub fn service_instance(name: &str) -> String {
    format!("{SERVICE_PREFIX}{name}")
}

/// Instance name under which a publisher is advertised.
pub fn publisher_instance(name: &str) -> String {
    format!("{PUBLISHER_PREFIX}{name}")
}

/// Everything needed to announce an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub instance: String,
    pub service_type: String,
    pub domain: String,
    pub port: u16,
    pub metadata: Vec<(String, String)>,
}

/// One resolved endpoint seen while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub instance: String,
    pub address: SocketAddr,
    pub ttl: Duration,
}

/// Local-network service advertisement mechanism.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync + 'static {
    /// Announce an endpoint until it is withdrawn.
    async fn advertise(&self, advertisement: Advertisement) -> SpineResult<()>;

    /// Stop announcing an endpoint.
    async fn withdraw(&self, instance: &str, service_type: &str, domain: &str) -> SpineResult<()>;

    /// Stream endpoints of `service_type` as they are seen. The stream ends
    /// when the receiver is dropped.
    async fn browse(
        &self,
        service_type: &str,
        domain: &str,
    ) -> SpineResult<mpsc::Receiver<DiscoveryEvent>>;

    /// Find one instance by name, waiting up to `deadline`.
    async fn resolve(
        &self,
        instance: &str,
        service_type: &str,
        domain: &str,
        deadline: Duration,
    ) -> SpineResult<SocketAddr>;
}

type EntryKey = (String, String, String);

/// In-process discovery: advertisements are visible to every namespace
/// holding the same `Arc<LocalDiscovery>`.
#[derive(Debug)]
pub struct LocalDiscovery {
    host: IpAddr,
    ttl: Duration,
    entries: RwLock<HashMap<EntryKey, Advertisement>>,
    announcements: broadcast::Sender<Advertisement>,
}

impl LocalDiscovery {
    /// Loopback host, two-minute TTL.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(120))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let (announcements, _) = broadcast::channel(256);
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ttl,
            entries: RwLock::new(HashMap::new()),
            announcements,
        }
    }

    /// Number of live advertisements.
    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn event_for(&self, advertisement: &Advertisement) -> DiscoveryEvent {
        DiscoveryEvent {
            instance: advertisement.instance.clone(),
            address: SocketAddr::new(self.host, advertisement.port),
            ttl: self.ttl,
        }
    }

    fn find(&self, instance: &str, service_type: &str, domain: &str) -> Option<Advertisement> {
        let key = (
            service_type.to_string(),
            domain.to_string(),
            instance.to_string(),
        );
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(&key).cloned()
    }
}

impl Default for LocalDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryTransport for LocalDiscovery {
    async fn advertise(&self, advertisement: Advertisement) -> SpineResult<()> {
        debug!(
            instance = %advertisement.instance,
            service_type = %advertisement.service_type,
            port = advertisement.port,
            "Local discovery: advertising"
        );
        let key = (
            advertisement.service_type.clone(),
            advertisement.domain.clone(),
            advertisement.instance.clone(),
        );
        {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries.insert(key, advertisement.clone());
        }
        // No receivers just means nobody is browsing yet.
        let _ = self.announcements.send(advertisement);
        Ok(())
    }

    async fn withdraw(&self, instance: &str, service_type: &str, domain: &str) -> SpineResult<()> {
        let key = (
            service_type.to_string(),
            domain.to_string(),
            instance.to_string(),
        );
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.remove(&key).is_some() {
            debug!(instance, service_type, "Local discovery: withdrawn");
        }
        Ok(())
    }

    async fn browse(
        &self,
        service_type: &str,
        domain: &str,
    ) -> SpineResult<mpsc::Receiver<DiscoveryEvent>> {
        // Subscribe before the snapshot so nothing advertised in between is lost.
        let mut announcements = self.announcements.subscribe();
        let existing: Vec<DiscoveryEvent> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .values()
                .filter(|a| a.service_type == service_type && a.domain == domain)
                .map(|a| self.event_for(a))
                .collect()
        };

        let (tx, rx) = mpsc::channel(64);
        let service_type = service_type.to_string();
        let domain = domain.to_string();
        let host = self.host;
        let ttl = self.ttl;

        tokio::spawn(async move {
            for event in existing {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    received = announcements.recv() => match received {
                        Ok(ad) => {
                            if ad.service_type != service_type || ad.domain != domain {
                                continue;
                            }
                            let event = DiscoveryEvent {
                                instance: ad.instance,
                                address: SocketAddr::new(host, ad.port),
                                ttl,
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Local discovery: browse lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn resolve(
        &self,
        instance: &str,
        service_type: &str,
        domain: &str,
        deadline: Duration,
    ) -> SpineResult<SocketAddr> {
        let mut announcements = self.announcements.subscribe();
        if let Some(ad) = self.find(instance, service_type, domain) {
            return Ok(SocketAddr::new(self.host, ad.port));
        }

        let wait = async {
            loop {
                match announcements.recv().await {
                    Ok(ad) => {
                        if ad.instance == instance
                            && ad.service_type == service_type
                            && ad.domain == domain
                        {
                            return Ok(SocketAddr::new(self.host, ad.port));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(ad) = self.find(instance, service_type, domain) {
                            return Ok(SocketAddr::new(self.host, ad.port));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SpineError::Discovery("announcement channel closed".into()));
                    }
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(SpineError::DeadlineExceeded {
                stage: Stage::Resolve,
            }),
        }
    }
}
