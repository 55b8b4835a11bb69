//! One authenticated request/response round trip.
//!
//! A call resolves the destination through the namespace registry, seals
//! the encoded request, exchanges exactly one frame in each direction and
//! opens the response. Any failure after resolution evicts the registry
//! entry so the next call re-resolves instead of hitting a dead peer.
//! Nothing is retried here; retry policy belongs to the caller.

use crate::codec::{Codec, Layout, MsgPackCodec};
use crate::discovery::service_instance;
use crate::frame::{read_frame, write_frame, Frame};
use crate::header::Status;
use crate::namespace::Namespace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use spine_types::{SpineError, SpineResult, Stage};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Call `service` with the default MessagePack codec.
pub async fn call<K, V>(ns: &Namespace, service: &str, payload: &K, deadline: Duration) -> SpineResult<V>
where
    K: Serialize + ?Sized,
    V: DeserializeOwned,
{
    call_with_codec(ns, &MsgPackCodec, service, payload, deadline).await
}

/// Call `service` with an explicit codec. The whole call, resolution
/// included, must finish within `deadline`.
pub async fn call_with_codec<C, K, V>(
    ns: &Namespace,
    codec: &C,
    service: &str,
    payload: &K,
    deadline: Duration,
) -> SpineResult<V>
where
    C: Codec,
    K: Serialize + ?Sized,
    V: DeserializeOwned,
{
    let instance = service_instance(service);
    let deadline_at = Instant::now() + deadline;

    let address = resolve(ns, service, &instance, deadline).await?;

    let started = std::time::Instant::now();
    let result = exchange(ns, codec, address, payload, deadline_at).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(_) => {
            debug!(target_service = service, duration_ms, "Service call successful");
        }
        Err(e) => {
            warn!(
                target_service = service,
                ip = %address,
                duration_ms,
                error = %e,
                "Service call failed"
            );
            ns.registry().remove_on_failure(&instance);
        }
    }
    result
}

async fn resolve(
    ns: &Namespace,
    service: &str,
    instance: &str,
    deadline: Duration,
) -> SpineResult<SocketAddr> {
    let token = ns.child_token();
    let lookup = tokio::select! {
        _ = token.cancelled() => Err(SpineError::Cancelled),
        lookup = ns.registry().lookup(instance, Some(deadline)) => lookup,
    };
    lookup.map_err(|e| {
        warn!(target_service = service, error = %e, "Service discovery failed");
        e
    })
}

async fn exchange<C, K, V>(
    ns: &Namespace,
    codec: &C,
    address: SocketAddr,
    payload: &K,
    deadline_at: Instant,
) -> SpineResult<V>
where
    C: Codec,
    K: Serialize + ?Sized,
    V: DeserializeOwned,
{
    let encoded = codec.encode(payload)?;
    let sealed = ns.security().seal(&encoded)?;

    let max = ns.config().listener.max_message_size;
    let frame = bounded(deadline_at, round_trip(address, Status::Ok, &sealed, max)).await?;
    if frame.status != Status::Ok {
        return Err(SpineError::RemoteStatus {
            status: frame.status.into(),
        });
    }

    let opened = ns.security().open(&frame.payload)?;
    codec.decode(&opened)
}

/// Run `fut` with an absolute deadline.
async fn bounded<T>(
    deadline_at: Instant,
    fut: impl std::future::Future<Output = SpineResult<T>>,
) -> SpineResult<T> {
    match timeout_at(deadline_at, fut).await {
        Ok(result) => result,
        Err(_) => Err(SpineError::DeadlineExceeded {
            stage: Stage::Exchange,
        }),
    }
}

/// Open a connection, send one frame, read one frame.
pub(crate) async fn round_trip(
    address: SocketAddr,
    status: Status,
    payload: &[u8],
    max_message_size: u32,
) -> SpineResult<Frame> {
    let mut stream = TcpStream::connect(address).await?;
    write_frame(&mut stream, status, payload).await?;
    read_frame(&mut stream, max_message_size).await
}

/// Typed handle to one service whose layout has been verified.
pub struct ServiceCaller<K, V, C = MsgPackCodec> {
    ns: Arc<Namespace>,
    service: String,
    codec: C,
    layout: Layout,
    _types: PhantomData<fn(K) -> V>,
}

impl<K, V> ServiceCaller<K, V, MsgPackCodec>
where
    K: Serialize,
    V: DeserializeOwned,
{
    /// Resolve `service` and verify that it speaks `K -> V` over MessagePack.
    pub async fn connect(ns: &Arc<Namespace>, service: &str, deadline: Duration) -> SpineResult<Self> {
        Self::connect_with(ns, service, MsgPackCodec, None, deadline).await
    }
}

impl<K, V, C> ServiceCaller<K, V, C>
where
    K: Serialize,
    V: DeserializeOwned,
    C: Codec,
{
    /// Resolve `service` and run the layout handshake. `layout` overrides
    /// the descriptor derived from `K`, `V` and the codec.
    pub async fn connect_with(
        ns: &Arc<Namespace>,
        service: &str,
        codec: C,
        layout: Option<Layout>,
        deadline: Duration,
    ) -> SpineResult<Self> {
        let layout = layout.unwrap_or_else(|| Layout::of::<K, V>(&codec));
        let instance = service_instance(service);
        let deadline_at = Instant::now() + deadline;

        let address = resolve(ns, service, &instance, deadline).await?;
        let found = match bounded(deadline_at, probe(ns, address, &layout)).await {
            Ok(found) => found,
            Err(e) => {
                ns.registry().remove_on_failure(&instance);
                return Err(e);
            }
        };

        if found != layout {
            warn!(
                target_service = service,
                expected = %layout,
                found = %found,
                "Service layout does not match caller layout"
            );
            return Err(SpineError::LayoutMismatch {
                expected: layout.to_string(),
                found: found.to_string(),
            });
        }

        debug!(target_service = service, layout = %layout, "Service caller ready");
        Ok(Self {
            ns: Arc::clone(ns),
            service: service.to_string(),
            codec,
            layout,
            _types: PhantomData,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// One call with the verified layout.
    pub async fn call(&self, payload: &K, deadline: Duration) -> SpineResult<V> {
        call_with_codec(&self.ns, &self.codec, &self.service, payload, deadline).await
    }
}

async fn probe(ns: &Namespace, address: SocketAddr, layout: &Layout) -> SpineResult<Layout> {
    let sealed = ns.security().seal(&layout.to_bytes()?)?;
    let max = ns.config().listener.max_message_size;
    let frame = round_trip(address, Status::LayoutProbe, &sealed, max).await?;
    if frame.status != Status::LayoutProbe {
        return Err(SpineError::RemoteStatus {
            status: frame.status.into(),
        });
    }
    let opened = ns.security().open(&frame.payload)?;
    Layout::from_bytes(&opened)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Security;
    use crate::discovery::{service_type, Advertisement, DiscoveryTransport, LocalDiscovery, DOMAIN};
    use spine_types::SpineConfig;
    use tokio::net::TcpListener;

    const SECRET: &str = "test-secret-for-unit-tests";

    fn join(discovery: &Arc<LocalDiscovery>) -> Arc<Namespace> {
        Namespace::join(SpineConfig::new("lab", SECRET, false), discovery.clone()).unwrap()
    }

    /// Serve one connection with a canned response frame.
    async fn canned_peer(
        discovery: &Arc<LocalDiscovery>,
        name: &str,
        status: Status,
        payload: Vec<u8>,
    ) {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = socket.accept().await.unwrap();
            let _ = read_frame(&mut stream, 1 << 20).await.unwrap();
            write_frame(&mut stream, status, &payload).await.unwrap();
        });
        discovery
            .advertise(Advertisement {
                instance: service_instance(name),
                service_type: service_type("lab"),
                domain: DOMAIN.to_string(),
                port,
                metadata: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_evicted_and_times_out() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = join(&discovery);
        let started = std::time::Instant::now();
        let err = call::<_, u32>(&ns, "ghost", "amir", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(
            matches!(err, SpineError::DeadlineExceeded { stage: Stage::Resolve }),
            "got {err:?}"
        );
        assert!(err.is_discovery());
        assert!(started.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_tampered_response_is_authentication_failure() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = join(&discovery);

        let mut sealed = Security::hmac(SECRET.as_bytes())
            .unwrap()
            .seal(&MsgPackCodec.encode(&4u32).unwrap())
            .unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        canned_peer(&discovery, "forged", Status::Ok, sealed).await;

        let err = call::<_, u32>(&ns, "forged", "amir", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_authentication(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_short_response_is_corrupt() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = join(&discovery);
        canned_peer(&discovery, "short", Status::Ok, vec![1, 2, 3]).await;

        let err = call::<_, u32>(&ns, "short", "amir", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SpineError::CorruptResponse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_non_ok_status_short_circuits() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = join(&discovery);
        canned_peer(&discovery, "failing", Status::HandlerInternalError, Vec::new()).await;

        let err = call::<_, u32>(&ns, "failing", "amir", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SpineError::RemoteStatus { status: 253 }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_dead_peer_evicted() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = join(&discovery);

        // Grab a port that nothing listens on.
        let port = {
            let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            socket.local_addr().unwrap().port()
        };
        ns.registry().upsert(
            "_servicedead",
            SocketAddr::from(([127, 0, 0, 1], port)),
            Duration::from_secs(60),
        );

        let err = call::<_, u32>(&ns, "dead", "amir", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_transport(), "got {err:?}");
        assert!(ns.registry().get("_servicedead").is_none());
    }

    #[tokio::test]
    async fn test_silent_peer_hits_deadline() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = join(&discovery);

        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = socket.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        ns.registry().upsert(
            "_servicesilent",
            SocketAddr::from(([127, 0, 0, 1], port)),
            Duration::from_secs(60),
        );

        let started = std::time::Instant::now();
        let err = call::<_, u32>(&ns, "silent", "amir", Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(
            matches!(err, SpineError::DeadlineExceeded { stage: Stage::Exchange }),
            "got {err:?}"
        );
        assert!(!err.is_discovery());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(ns.registry().get("_servicesilent").is_none());
    }

    #[tokio::test]
    async fn test_disconnected_namespace_cancels_lookup() {
        let discovery = Arc::new(LocalDiscovery::new());
        let ns = join(&discovery);
        ns.disconnect();
        let err = call::<_, u32>(&ns, "anything", "amir", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SpineError::Cancelled));
    }
}
