//! One long-lived connection to a publisher.
//!
//! The subscriber keeps resolving the publisher until it shows up (or the
//! subscription is cancelled), connects once, and then reads frames until
//! the connection ends. A message that fails to open or decode is skipped
//! and counted; a connection-level read failure ends the subscription.

use crate::auth::Security;
use crate::codec::{Codec, MsgPackCodec};
use crate::discovery::publisher_instance;
use crate::frame::read_frame;
use crate::header::Status;
use crate::namespace::Namespace;
use crate::registry::Registry;
use serde::de::DeserializeOwned;
use spine_types::{SpineError, SpineResult};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Called for every message that is skipped.
pub type DropHook = Arc<dyn Fn(&SpineError) + Send + Sync>;

/// Per-subscription settings.
#[derive(Clone)]
pub struct SubscriberOptions<C = MsgPackCodec> {
    pub codec: C,
    /// How long each resolution attempt may wait on discovery.
    pub resolve_timeout: Duration,
    /// Pause between failed resolution attempts.
    pub retry_interval: Duration,
    pub on_drop: Option<DropHook>,
}

impl Default for SubscriberOptions<MsgPackCodec> {
    fn default() -> Self {
        Self::with_codec(MsgPackCodec)
    }
}

impl<C> SubscriberOptions<C> {
    pub fn with_codec(codec: C) -> Self {
        Self {
            codec,
            resolve_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(100),
            on_drop: None,
        }
    }

    pub fn on_drop(mut self, hook: impl Fn(&SpineError) + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Arc::new(hook));
        self
    }
}

#[derive(Debug, Default)]
struct State {
    connected: AtomicBool,
    dropped: AtomicU64,
}

/// A running subscription.
pub struct Subscriber<T> {
    publisher: String,
    state: Arc<State>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    _types: PhantomData<fn(T)>,
}

impl<T: DeserializeOwned + Send + 'static> Subscriber<T> {
    /// Subscribe to `publisher` with MessagePack payloads. `callback` runs
    /// once per message, in arrival order.
    pub fn subscribe<F>(ns: &Arc<Namespace>, publisher: &str, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::subscribe_with(ns, publisher, callback, SubscriberOptions::default())
    }

    pub fn subscribe_with<F, C>(
        ns: &Arc<Namespace>,
        publisher: &str,
        callback: F,
        options: SubscriberOptions<C>,
    ) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
        C: Codec,
    {
        let state = Arc::new(State::default());
        let token = ns.child_token();
        let feed = Feed {
            publisher: publisher.to_string(),
            instance: publisher_instance(publisher),
            registry: ns.registry().clone(),
            security: ns.security().clone(),
            max_message_size: ns.config().listener.max_message_size,
            options,
            state: Arc::clone(&state),
            token: token.clone(),
        };
        let task = tokio::spawn(feed.run(callback));

        Self {
            publisher: publisher.to_string(),
            state,
            token,
            task: Mutex::new(Some(task)),
            _types: PhantomData,
        }
    }
}

impl<T> Subscriber<T> {
    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    /// True while the connection to the publisher is open.
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Messages skipped because they failed to open or decode.
    pub fn dropped_messages(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Resolves once the subscription has ended.
    pub async fn finished(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(publisher = %self.publisher, error = %e, "Subscriber task ended abnormally");
            }
        }
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Feed<C> {
    publisher: String,
    instance: String,
    registry: Registry,
    security: Security,
    max_message_size: u32,
    options: SubscriberOptions<C>,
    state: Arc<State>,
    token: CancellationToken,
}

impl<C: Codec> Feed<C> {
    async fn run<T, F>(self, callback: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let Some(mut stream) = self.connect().await else {
            debug!(publisher = %self.publisher, "Subscription cancelled before connecting");
            return;
        };
        self.state.connected.store(true, Ordering::SeqCst);
        info!(publisher = %self.publisher, "Subscribed");

        loop {
            let frame = tokio::select! {
                _ = self.token.cancelled() => break,
                frame = read_frame(&mut stream, self.max_message_size) => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(publisher = %self.publisher, error = %e, "Subscription connection lost");
                    self.registry.remove_on_failure(&self.instance);
                    break;
                }
            };
            match self.unpack::<T>(frame.status, &frame.payload) {
                Ok(value) => callback(value),
                Err(e) => self.skip(&e),
            }
        }

        self.state.connected.store(false, Ordering::SeqCst);
        info!(
            publisher = %self.publisher,
            dropped = self.state.dropped.load(Ordering::Relaxed),
            "Subscription ended"
        );
    }

    /// Resolve and connect, retrying until it works or the token fires.
    async fn connect(&self) -> Option<TcpStream> {
        loop {
            let attempt = async {
                let address = self
                    .registry
                    .lookup(&self.instance, Some(self.options.resolve_timeout))
                    .await?;
                let stream = TcpStream::connect(address).await.map_err(|e| {
                    self.registry.remove_on_failure(&self.instance);
                    SpineError::from(e)
                })?;
                Ok::<(TcpStream, SocketAddr), SpineError>((stream, address))
            };
            let result = tokio::select! {
                _ = self.token.cancelled() => return None,
                result = attempt => result,
            };
            match result {
                Ok((stream, address)) => {
                    debug!(publisher = %self.publisher, %address, "Connected to publisher");
                    return Some(stream);
                }
                Err(e) => {
                    debug!(publisher = %self.publisher, error = %e, "Publisher not reachable yet");
                }
            }
            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = tokio::time::sleep(self.options.retry_interval) => {}
            }
        }
    }

    fn unpack<T: DeserializeOwned>(&self, status: Status, payload: &[u8]) -> SpineResult<T> {
        if status != Status::Ok {
            return Err(SpineError::RemoteStatus {
                status: status.into(),
            });
        }
        let opened = self.security.open(payload)?;
        self.options.codec.decode(&opened)
    }

    fn skip(&self, error: &SpineError) {
        self.state.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(publisher = %self.publisher, error = %error, "Skipping undecodable message");
        if let Some(hook) = &self.options.on_drop {
            hook(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{service_type, Advertisement, DiscoveryTransport, LocalDiscovery, DOMAIN};
    use crate::frame::write_frame;
    use spine_types::SpineConfig;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_skips_bad_messages_and_ends_on_close() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = Namespace::join(SpineConfig::new("lab", "meow", false), discovery.clone()).unwrap();

        // A hand-rolled publisher: one garbage frame, one good one, then EOF.
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let security = ns.security().clone();
        tokio::spawn(async move {
            let (mut stream, _) = socket.accept().await.unwrap();
            write_frame(&mut stream, Status::Ok, b"not sealed").await.unwrap();
            let good = security.seal(&MsgPackCodec.encode(&42u32).unwrap()).unwrap();
            write_frame(&mut stream, Status::Ok, &good).await.unwrap();
        });
        discovery
            .advertise(Advertisement {
                instance: publisher_instance("raw"),
                service_type: service_type("lab"),
                domain: DOMAIN.to_string(),
                port,
                metadata: vec![],
            })
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let hooked = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hooked);
        let subscriber = Subscriber::subscribe_with(
            &ns,
            "raw",
            move |value: u32| {
                let _ = tx.send(value);
            },
            SubscriberOptions::default().on_drop(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        );

        assert_eq!(rx.recv().await, Some(42));
        tokio::time::timeout(Duration::from_secs(2), subscriber.finished())
            .await
            .unwrap();
        assert_eq!(subscriber.dropped_messages(), 1);
        assert_eq!(hooked.load(Ordering::Relaxed), 1);
        assert!(!subscriber.is_connected());
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_publisher() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = Namespace::join(SpineConfig::new("lab", "meow", false), discovery).unwrap();
        let subscriber = Subscriber::subscribe(&ns, "nobody", |_: u32| {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!subscriber.is_connected());

        subscriber.stop();
        tokio::time::timeout(Duration::from_secs(1), subscriber.finished())
            .await
            .unwrap();
    }
}
