//! Fan-out of sealed, framed messages to every connected
//! subscriber.
//!
//! Each accepted subscriber gets an [`Outbox`] and one writer task. The
//! publisher never writes to sockets itself: [`Publisher::publish`] encodes
//! and seals the value once, then offers the same frame to every outbox
//! under the configured [`SlowConsumerPolicy`].

use crate::auth::Security;
use crate::codec::{Codec, MsgPackCodec};
use crate::discovery::{publisher_instance, Advertisement, DiscoveryTransport, DOMAIN};
use crate::frame::encode_frame;
use crate::header::Status;
use crate::namespace::Namespace;
use crate::outbox::{Offer, Outbox};
use serde::Serialize;
use spine_types::config::SlowConsumerPolicy;
use spine_types::{SpineError, SpineResult};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One connected subscriber as seen by the publisher.
#[derive(Debug)]
struct SubscriberConnection {
    id: u64,
    remote: SocketAddr,
    outbox: Arc<Outbox>,
}

type Connections = Arc<Mutex<Vec<SubscriberConnection>>>;

/// A named topic. Advertised under `_publisher{name}` until closed.
pub struct Publisher<T, C = MsgPackCodec> {
    name: String,
    port: u16,
    codec: C,
    security: Security,
    policy: SlowConsumerPolicy,
    connections: Connections,
    token: CancellationToken,
    _types: PhantomData<fn(&T)>,
}

impl<T: Serialize> Publisher<T, MsgPackCodec> {
    pub async fn bind(ns: &Arc<Namespace>, name: &str) -> SpineResult<Self> {
        Self::bind_with_codec(ns, name, MsgPackCodec).await
    }
}

impl<T: Serialize, C: Codec> Publisher<T, C> {
    /// Open the subscriber socket, advertise it and start accepting.
    pub async fn bind_with_codec(ns: &Arc<Namespace>, name: &str, codec: C) -> SpineResult<Self> {
        let socket = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
        let port = socket.local_addr()?.port();

        let advertisement = Advertisement {
            instance: publisher_instance(name),
            service_type: ns.service_type().to_string(),
            domain: DOMAIN.to_string(),
            port,
            metadata: vec![("id".to_string(), format!("spine_publisher_{name}"))],
        };
        ns.transport().advertise(advertisement.clone()).await?;

        let token = ns.child_token();
        let connections: Connections = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(accept_loop(
            socket,
            name.to_string(),
            ns.config().pubsub.queue_capacity,
            Arc::clone(&connections),
            Arc::clone(ns.transport()),
            advertisement,
            token.clone(),
        ));

        info!(publisher = name, port, "Publisher started");
        Ok(Self {
            name: name.to_string(),
            port,
            codec,
            security: ns.security().clone(),
            policy: ns.config().pubsub.slow_consumer,
            connections,
            token,
            _types: PhantomData,
        })
    }

    /// Offer `value` to every connected subscriber. Returns how many
    /// subscribers had it queued.
    pub async fn publish(&self, value: &T) -> SpineResult<usize> {
        if self.token.is_cancelled() {
            return Err(SpineError::Cancelled);
        }
        let encoded = self.codec.encode(value)?;
        let sealed = self.security.seal(&encoded)?;
        let frame = encode_frame(Status::Ok, &sealed)?;

        let targets: Vec<(u64, Arc<Outbox>)> = {
            let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections
                .iter()
                .map(|c| (c.id, Arc::clone(&c.outbox)))
                .collect()
        };

        let mut queued = 0;
        for (id, outbox) in targets {
            match outbox.offer(frame.clone(), self.policy).await {
                offer if offer.is_queued() => queued += 1,
                Offer::Disconnected => {
                    warn!(
                        publisher = %self.name,
                        subscriber_id = id,
                        failures = outbox.failures(),
                        "Disconnecting slow subscriber"
                    );
                }
                Offer::Rejected => {
                    debug!(publisher = %self.name, subscriber_id = id, "Subscriber queue full, message dropped");
                }
                _ => {}
            }
        }

        self.prune();
        Ok(queued)
    }

    /// Subscribers currently connected.
    pub fn subscriber_count(&self) -> usize {
        self.prune();
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.len()
    }
}

impl<T, C> Publisher<T, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, withdraw the advertisement and disconnect every
    /// subscriber once its queued messages are written.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    fn prune(&self) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.retain(|c| {
            let open = !c.outbox.is_closed();
            if !open {
                debug!(publisher = %self.name, subscriber_id = c.id, remote_addr = %c.remote, "Subscriber removed");
            }
            open
        });
    }
}

impl<T, C> Drop for Publisher<T, C> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn accept_loop(
    socket: TcpListener,
    name: String,
    queue_capacity: usize,
    connections: Connections,
    transport: Arc<dyn DiscoveryTransport>,
    advertisement: Advertisement,
    token: CancellationToken,
) {
    let next_id = AtomicU64::new(1);
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = socket.accept() => accepted,
        };
        match accepted {
            Ok((stream, remote)) => {
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let outbox = Arc::new(Outbox::new(queue_capacity));
                {
                    let mut connections = connections.lock().unwrap_or_else(|e| e.into_inner());
                    connections.push(SubscriberConnection {
                        id,
                        remote,
                        outbox: Arc::clone(&outbox),
                    });
                }
                debug!(publisher = %name, subscriber_id = id, remote_addr = %remote, "Subscriber connected");
                tokio::spawn(write_loop(stream, outbox, token.child_token()));
            }
            Err(e) => {
                warn!(publisher = %name, error = %e, "Publisher: accept error");
            }
        }
    }

    drop(socket);
    if let Err(e) = transport
        .withdraw(
            &advertisement.instance,
            &advertisement.service_type,
            &advertisement.domain,
        )
        .await
    {
        warn!(publisher = %name, error = %e, "Failed to withdraw publisher advertisement");
    }
    let connections = connections.lock().unwrap_or_else(|e| e.into_inner());
    for connection in connections.iter() {
        connection.outbox.close();
    }
    info!(publisher = %name, "Publisher stopped");
}

/// Drain one outbox onto its socket until the outbox closes or a write fails.
async fn write_loop(mut stream: TcpStream, outbox: Arc<Outbox>, token: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                outbox.close();
                outbox.next().await
            }
            next = outbox.next() => next,
        };
        let Some(frame) = next else {
            break;
        };
        if let Err(e) = stream.write_all(&frame).await {
            debug!(error = %e, "Subscriber write failed");
            break;
        }
    }
    outbox.close();
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::LocalDiscovery;
    use crate::frame::read_frame;
    use spine_types::SpineConfig;
    use std::time::Duration;

    async fn wait_for_subscribers<T: Serialize, C: Codec>(publisher: &Publisher<T, C>, n: usize) {
        for _ in 0..100 {
            if publisher.subscriber_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} subscribers");
    }

    #[tokio::test]
    async fn test_publish_frames_sealed_messages() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = Namespace::join(SpineConfig::new("lab", "meow", false), discovery.clone()).unwrap();
        let publisher: Publisher<u32> = Publisher::bind(&ns, "ticks").await.unwrap();
        assert_eq!(publisher.publish(&1).await.unwrap(), 0);

        let mut stream = TcpStream::connect(("127.0.0.1", publisher.port())).await.unwrap();
        wait_for_subscribers(&publisher, 1).await;
        assert_eq!(publisher.publish(&7).await.unwrap(), 1);

        let frame = read_frame(&mut stream, 1024).await.unwrap();
        assert_eq!(frame.status, Status::Ok);
        let opened = ns.security().open(&frame.payload).unwrap();
        let value: u32 = MsgPackCodec.decode(&opened).unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_close_withdraws_and_disconnects() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = Namespace::join(SpineConfig::new("lab", "meow", false), discovery.clone()).unwrap();
        let publisher: Publisher<u32> = Publisher::bind(&ns, "ticks").await.unwrap();
        assert_eq!(discovery.len(), 1);

        let mut stream = TcpStream::connect(("127.0.0.1", publisher.port())).await.unwrap();
        wait_for_subscribers(&publisher, 1).await;

        publisher.close();
        let err = read_frame(&mut stream, 1024).await.unwrap_err();
        assert!(matches!(err, SpineError::ConnectionClosed));
        assert!(matches!(publisher.publish(&1).await, Err(SpineError::Cancelled)));

        for _ in 0..100 {
            if discovery.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("publisher advertisement was not withdrawn");
    }

    #[tokio::test]
    async fn test_departed_subscriber_is_pruned() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = Namespace::join(SpineConfig::new("lab", "meow", false), discovery).unwrap();
        let publisher: Publisher<Vec<u8>> = Publisher::bind(&ns, "bulk").await.unwrap();

        let stream = TcpStream::connect(("127.0.0.1", publisher.port())).await.unwrap();
        wait_for_subscribers(&publisher, 1).await;
        drop(stream);

        // Writes to a closed peer fail within a few messages.
        for _ in 0..50 {
            publisher.publish(&vec![0u8; 64 * 1024]).await.unwrap();
            if publisher.subscriber_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("closed subscriber was never pruned");
    }
}
