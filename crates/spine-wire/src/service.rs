//! A named, advertised [`Listener`].

use crate::codec::{Codec, MsgPackCodec};
use crate::discovery::{service_instance, Advertisement, DOMAIN};
use crate::listener::{Listener, ListenerOptions, ServiceHandler};
use crate::namespace::Namespace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use spine_types::SpineResult;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A running service. Advertised under `_service{name}` until closed.
pub struct Service<K, V, C = MsgPackCodec> {
    name: String,
    listener: Arc<Listener<K, V, C>>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> Service<K, V, MsgPackCodec>
where
    K: DeserializeOwned + Send + 'static,
    V: Serialize + Send + 'static,
{
    /// Bind, advertise and start serving `name` with MessagePack payloads.
    pub async fn bind<H>(ns: &Arc<Namespace>, name: &str, handler: H) -> SpineResult<Self>
    where
        H: ServiceHandler<K, V>,
    {
        Self::bind_with_codec(ns, name, handler, MsgPackCodec).await
    }
}

impl<K, V, C> Service<K, V, C>
where
    K: DeserializeOwned + Send + 'static,
    V: Serialize + Send + 'static,
    C: Codec,
{
    pub async fn bind_with_codec<H>(
        ns: &Arc<Namespace>,
        name: &str,
        handler: H,
        codec: C,
    ) -> SpineResult<Self>
    where
        H: ServiceHandler<K, V>,
    {
        let options = ListenerOptions::from_config(&ns.config().listener, ns.security().clone());
        Self::bind_with_options(ns, name, handler, codec, options).await
    }

    /// Bind with explicit listener options. The shutdown token is replaced
    /// by one scoped to the namespace.
    pub async fn bind_with_options<H>(
        ns: &Arc<Namespace>,
        name: &str,
        handler: H,
        codec: C,
        options: ListenerOptions,
    ) -> SpineResult<Self>
    where
        H: ServiceHandler<K, V>,
    {
        let token = ns.child_token();
        let listener = Listener::bind(handler, codec, options.shutdown(token.clone())).await?;
        let listener = Arc::new(listener);

        let advertisement = Advertisement {
            instance: service_instance(name),
            service_type: ns.service_type().to_string(),
            domain: DOMAIN.to_string(),
            port: listener.port(),
            metadata: vec![("id".to_string(), format!("spine_service_{name}"))],
        };
        ns.transport().advertise(advertisement.clone()).await?;

        info!(
            service = name,
            port = listener.port(),
            layout = %listener.layout(),
            "Service started"
        );

        let running = Arc::clone(&listener);
        let transport = Arc::clone(ns.transport());
        let cancelled = token.clone();
        let service = name.to_string();
        let task = tokio::spawn(async move {
            let withdraw = async {
                cancelled.cancelled().await;
                if let Err(e) = transport
                    .withdraw(
                        &advertisement.instance,
                        &advertisement.service_type,
                        &advertisement.domain,
                    )
                    .await
                {
                    warn!(service = %service, error = %e, "Failed to withdraw service advertisement");
                }
            };
            tokio::join!(running.start(), withdraw);
            info!(service = %service, "Service stopped");
        });

        Ok(Self {
            name: name.to_string(),
            listener,
            token,
            task: Mutex::new(Some(task)),
        })
    }
}

impl<K, V, C> Service<K, V, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    /// True until the listener has drained after [`Service::close`].
    pub fn is_alive(&self) -> bool {
        self.listener.is_alive()
    }

    pub fn active_workers(&self) -> usize {
        self.listener.active_workers()
    }

    /// Stop accepting and withdraw the advertisement. In-flight requests
    /// still complete; await [`Service::closed`] to wait for them.
    pub fn close(&self) {
        self.listener.kill();
        self.token.cancel();
    }

    /// Resolves once the listener has stopped and every in-flight request
    /// has finished.
    pub async fn closed(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(service = %self.name, error = %e, "Service task ended abnormally");
            }
        }
    }
}

impl<K, V, C> Drop for Service<K, V, C> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
