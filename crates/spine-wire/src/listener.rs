//! Bounded-concurrency TCP server for one service.
//!
//! A [`Listener`] accepts connections and hands each one to a worker task,
//! but only while holding a [`WorkerSlot`] from a fixed-size pool. When all
//! slots are busy the accept loop waits for one to free up, so excess
//! connections queue in the kernel backlog instead of being rejected.
//!
//! Each connection carries exactly one exchange: read one frame, open its
//! security envelope, decode the request, run the handler once, write one
//! response frame. Any failure before the handler returns closes the
//! connection without a response; the caller observes a read failure.

use crate::auth::Security;
use crate::codec::{Codec, Layout, MsgPackCodec};
use crate::frame::{read_frame, write_frame};
use crate::header::Status;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use spine_types::config::{ListenerConfig, DEFAULT_MAX_MESSAGE_SIZE};
use spine_types::{SpineError, SpineResult, Stage};
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after an unexpected accept error before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// User logic behind a service.
///
/// Implemented automatically for async closures returning
/// `Result<V, E>` where `E: Display`.
#[async_trait]
pub trait ServiceHandler<K, V>: Send + Sync + 'static {
    /// Produce the response for one request. An `Err` is logged and the
    /// connection is closed without a response.
    async fn handle(&self, request: K) -> Result<V, String>;
}

#[async_trait]
impl<K, V, E, F, Fut> ServiceHandler<K, V> for F
where
    K: Send + 'static,
    V: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
{
    async fn handle(&self, request: K) -> Result<V, String> {
        (self)(request).await.map_err(|e| e.to_string())
    }
}

/// Settings for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Address to bind; port 0 picks a free port.
    pub bind_addr: SocketAddr,
    /// Connections handled at once.
    pub max_concurrency: u32,
    /// Inactivity deadline for reading the request and writing the response.
    pub connection_timeout: Duration,
    /// Largest request payload accepted.
    pub max_message_size: u32,
    /// Payload protection shared with callers.
    pub security: Security,
    /// Layout reported to probing callers; derived from the types if unset.
    pub layout: Option<Layout>,
    /// Cancelling this token has the same effect as [`Listener::kill`].
    pub shutdown: CancellationToken,
}

impl ListenerOptions {
    pub fn new(security: Security) -> Self {
        Self::from_config(&ListenerConfig::default(), security)
    }

    pub fn from_config(config: &ListenerConfig, security: Security) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            max_concurrency: config.max_concurrency,
            connection_timeout: config.connection_timeout(),
            max_message_size: config.max_message_size,
            security,
            layout: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }
}

/// Token proving a connection may be handled. Returned to the pool on drop,
/// including when the handling task panics.
#[derive(Debug)]
pub struct WorkerSlot {
    id: usize,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        // The id goes back before the permit field is released.
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(self.id);
    }
}

/// Fixed pool of worker slots.
#[derive(Debug)]
struct WorkerPool {
    size: u32,
    semaphore: Arc<Semaphore>,
    free: Arc<Mutex<Vec<usize>>>,
}

impl WorkerPool {
    fn new(size: u32) -> Self {
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size as usize)),
            free: Arc::new(Mutex::new((0..size as usize).rev().collect())),
        }
    }

    /// Wait for a free slot. `None` once the pool has been drained.
    async fn acquire(&self) -> Option<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        let id = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()?
        };
        Some(WorkerSlot {
            id,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }

    /// Wait until every slot is back, then refuse further acquisitions.
    async fn drain(&self) {
        if let Ok(all) = self.semaphore.acquire_many(self.size).await {
            all.forget();
        }
        self.semaphore.close();
    }

    fn active(&self) -> usize {
        if self.semaphore.is_closed() {
            return 0;
        }
        self.size as usize - self.semaphore.available_permits()
    }
}

struct Shared<K, V, C> {
    handler: Box<dyn ServiceHandler<K, V>>,
    codec: C,
    security: Security,
    layout: Layout,
    connection_timeout: Duration,
    max_message_size: u32,
}

impl<K, V, C> Shared<K, V, C>
where
    K: DeserializeOwned + Send + 'static,
    V: Serialize + Send + 'static,
    C: Codec,
{
    async fn handle_connection(&self, mut stream: TcpStream, remote: SocketAddr, slot: WorkerSlot) {
        let worker_id = slot.id();
        let deadline = Instant::now() + self.connection_timeout;

        match self.serve(&mut stream, deadline).await {
            Ok(()) => {}
            Err(e) if e.is_authentication() => {
                warn!(
                    remote_addr = %remote,
                    worker_id,
                    error = %e,
                    "Listener: rejected request that failed authentication"
                );
            }
            Err(e) => {
                warn!(remote_addr = %remote, worker_id, error = %e, "Listener: connection dropped");
            }
        }
        drop(slot);
    }

    async fn serve(&self, stream: &mut TcpStream, deadline: Instant) -> SpineResult<()> {
        let frame = timeout_at(deadline, read_frame(stream, self.max_message_size))
            .await
            .map_err(|_| SpineError::DeadlineExceeded {
                stage: Stage::Exchange,
            })??;
        let payload = self.security.open(&frame.payload)?;

        match frame.status {
            Status::Ok => {}
            Status::LayoutProbe => return self.answer_probe(stream, &payload, deadline).await,
            other => {
                return Err(SpineError::CorruptPayload(format!(
                    "unexpected request status {other}"
                )));
            }
        }

        let request: K = self.codec.decode(&payload)?;

        let started = std::time::Instant::now();
        let response = match self.handler.handle(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    error = %e,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Listener: handler logic error"
                );
                return Ok(());
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let encoded = self.codec.encode(&response)?;
        let sealed = self.security.seal(&encoded)?;
        timeout_at(deadline, write_frame(stream, Status::Ok, &sealed))
            .await
            .map_err(|_| SpineError::DeadlineExceeded {
                stage: Stage::Exchange,
            })??;

        debug!(duration_ms, "Listener: request processed successfully");
        Ok(())
    }

    async fn answer_probe(
        &self,
        stream: &mut TcpStream,
        payload: &[u8],
        deadline: Instant,
    ) -> SpineResult<()> {
        let theirs = Layout::from_bytes(payload)?;
        if theirs != self.layout {
            debug!(
                caller = %theirs,
                service = %self.layout,
                "Listener: caller layout differs"
            );
        }
        let sealed = self.security.seal(&self.layout.to_bytes()?)?;
        timeout_at(deadline, write_frame(stream, Status::LayoutProbe, &sealed))
            .await
            .map_err(|_| SpineError::DeadlineExceeded {
                stage: Stage::Exchange,
            })??;
        Ok(())
    }
}

/// TCP server that runs a [`ServiceHandler`] for each connection with at
/// most `max_concurrency` connections in flight.
pub struct Listener<K, V, C = MsgPackCodec> {
    shared: Arc<Shared<K, V, C>>,
    socket: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    pool: WorkerPool,
    alive: AtomicBool,
    shutdown: CancellationToken,
    _types: PhantomData<fn(K) -> V>,
}

impl<K, V, C> Listener<K, V, C>
where
    K: DeserializeOwned + Send + 'static,
    V: Serialize + Send + 'static,
    C: Codec,
{
    /// Bind the socket. Nothing is accepted until [`Listener::start`] runs.
    pub async fn bind<H>(handler: H, codec: C, options: ListenerOptions) -> SpineResult<Self>
    where
        H: ServiceHandler<K, V>,
    {
        if options.max_concurrency == 0 {
            return Err(SpineError::Config("max_concurrency must be at least 1".into()));
        }

        let socket = TcpListener::bind(options.bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let layout = options
            .layout
            .unwrap_or_else(|| Layout::of::<K, V>(&codec));

        Ok(Self {
            shared: Arc::new(Shared {
                handler: Box::new(handler),
                codec,
                security: options.security,
                layout,
                connection_timeout: options.connection_timeout,
                max_message_size: if options.max_message_size == 0 {
                    DEFAULT_MAX_MESSAGE_SIZE
                } else {
                    options.max_message_size
                },
            }),
            socket: Mutex::new(Some(socket)),
            local_addr,
            pool: WorkerPool::new(options.max_concurrency),
            alive: AtomicBool::new(true),
            shutdown: options.shutdown,
            _types: PhantomData,
        })
    }

    /// Run the accept loop until killed, then wait for every in-flight
    /// connection to finish before returning.
    pub async fn start(&self) {
        let Some(socket) = self.take_socket() else {
            warn!(port = self.port(), "Listener: start called without an open socket");
            return;
        };

        info!(
            port = self.port(),
            max_concurrency = self.pool.size,
            "Listener starting"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = socket.accept() => accepted,
            };

            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Listener: accept error");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                    }
                }
            };

            let slot = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                slot = self.pool.acquire() => slot,
            };
            let Some(slot) = slot else {
                break;
            };

            debug!(remote_addr = %remote, worker_id = slot.id(), "Listener: accepted connection");
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                shared.handle_connection(stream, remote, slot).await;
            });
        }

        drop(socket);
        info!(port = self.port(), "Listener closed, draining workers");
        self.pool.drain().await;
        self.alive.store(false, Ordering::SeqCst);
        info!(port = self.port(), "Listener stopped");
    }
}

impl<K, V, C> Listener<K, V, C> {
    /// Close the accept socket. A running [`Listener::start`] drains and returns.
    pub fn kill(&self) {
        self.shutdown.cancel();
        drop(self.take_socket());
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// True until a started listener has fully drained.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Slots currently held by connections.
    pub fn active_workers(&self) -> usize {
        self.pool.active()
    }

    pub fn layout(&self) -> &Layout {
        &self.shared.layout
    }

    fn take_socket(&self) -> Option<TcpListener> {
        let mut socket = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        socket.take()
    }
}
