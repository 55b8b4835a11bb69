//! Multicast DNS discovery transport (feature `mdns`).
//!
//! Logical service types such as `lab._spine._tcp` map onto the mDNS type
//! `_lab-spine._tcp.local.`. Only IPv4 addresses are reported.

use crate::discovery::{Advertisement, DiscoveryEvent, DiscoveryTransport, SERVICE_TYPE_SUFFIX};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use spine_types::{SpineError, SpineResult, Stage};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How often blocking browse loops check whether their consumer is gone.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// mDNS type for a logical service type in `domain`.
pub fn mdns_type(service_type: &str, domain: &str) -> String {
    let namespace = service_type
        .strip_suffix(SERVICE_TYPE_SUFFIX)
        .unwrap_or(service_type)
        .trim_start_matches('_');
    format!("_{namespace}-spine._tcp.{domain}")
}

fn mdns_err(e: mdns_sd::Error) -> SpineError {
    SpineError::Discovery(e.to_string())
}

fn ipv4_address(info: &ServiceInfo) -> Option<SocketAddr> {
    info.get_addresses()
        .iter()
        .find(|ip| ip.is_ipv4())
        .map(|ip| SocketAddr::new(*ip, info.get_port()))
}

fn instance_of(info: &ServiceInfo, ty: &str) -> String {
    let fullname = info.get_fullname();
    fullname
        .strip_suffix(ty)
        .map(|s| s.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// Discovery over the local network via mDNS-SD.
#[derive(Clone)]
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
}

impl MdnsDiscovery {
    pub fn new() -> SpineResult<Self> {
        let daemon = ServiceDaemon::new().map_err(mdns_err)?;
        info!("mDNS: daemon started");
        Ok(Self { daemon })
    }

    /// Stop the daemon. Advertisements made through it disappear.
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mDNS: failed to shut down daemon");
        }
    }
}

#[async_trait]
impl DiscoveryTransport for MdnsDiscovery {
    async fn advertise(&self, advertisement: Advertisement) -> SpineResult<()> {
        let ty = mdns_type(&advertisement.service_type, &advertisement.domain);
        let host = format!("{}.{}", advertisement.instance, advertisement.domain);
        let info = ServiceInfo::new(
            &ty,
            &advertisement.instance,
            &host,
            "",
            advertisement.port,
            &advertisement.metadata[..],
        )
        .map_err(mdns_err)?
        .enable_addr_auto();

        self.daemon.register(info).map_err(mdns_err)?;
        info!(
            instance = %advertisement.instance,
            service_type = %ty,
            port = advertisement.port,
            "mDNS: registered"
        );
        Ok(())
    }

    async fn withdraw(&self, instance: &str, service_type: &str, domain: &str) -> SpineResult<()> {
        let fullname = format!("{instance}.{}", mdns_type(service_type, domain));
        self.daemon.unregister(&fullname).map_err(mdns_err)?;
        debug!(fullname, "mDNS: unregistered");
        Ok(())
    }

    async fn browse(
        &self,
        service_type: &str,
        domain: &str,
    ) -> SpineResult<mpsc::Receiver<DiscoveryEvent>> {
        let ty = mdns_type(service_type, domain);
        let receiver = self.daemon.browse(&ty).map_err(mdns_err)?;
        let (tx, rx) = mpsc::channel(64);
        let daemon = self.daemon.clone();

        tokio::task::spawn_blocking(move || {
            while !tx.is_closed() {
                let event = match receiver.recv_timeout(POLL_INTERVAL) {
                    Ok(event) => event,
                    Err(_) if receiver.is_disconnected() => break,
                    Err(_) => continue,
                };
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let Some(address) = ipv4_address(&info) else {
                            continue;
                        };
                        let event = DiscoveryEvent {
                            instance: instance_of(&info, &ty),
                            address,
                            ttl: Duration::from_secs(u64::from(info.get_host_ttl())),
                        };
                        if tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!(fullname, "mDNS: service removed");
                    }
                    _ => {}
                }
            }
            let _ = daemon.stop_browse(&ty);
            debug!(service_type = %ty, "mDNS: browse stopped");
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
        let ty = mdns_type(service_type, domain);
        let receiver = self.daemon.browse(&ty).map_err(mdns_err)?;
        let daemon = self.daemon.clone();
        let wanted = instance.to_string();

        let found = tokio::task::spawn_blocking(move || {
            let until = Instant::now() + deadline;
            let mut found = None;
            while let Some(remaining) = until.checked_duration_since(Instant::now()) {
                match receiver.recv_timeout(remaining) {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        if instance_of(&info, &ty) == wanted {
                            found = ipv4_address(&info);
                            if found.is_some() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            let _ = daemon.stop_browse(&ty);
            found
        })
        .await
        .map_err(|e| SpineError::Discovery(e.to_string()))?;

        found.ok_or(SpineError::DeadlineExceeded {
            stage: Stage::Resolve,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mdns_type() {
        assert_eq!(mdns_type("lab._spine._tcp", "local."), "_lab-spine._tcp.local.");
        assert_eq!(mdns_type("odd", "local."), "_odd-spine._tcp.local.");
    }
}
