//! The context every service, publisher and subscriber lives in.
//!
//! A [`Namespace`] binds a name, the payload security derived from the
//! shared secret, a [`Registry`], and a cancellation scope. Components
//! created under it take child tokens, so [`Namespace::disconnect`] tears
//! all of them down.

use crate::auth::Security;
use crate::discovery::{publisher_instance, service_instance, service_type, DiscoveryTransport};
use crate::registry::Registry;
use spine_types::{SpineConfig, SpineResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared context for a group of cooperating components.
pub struct Namespace {
    id: uuid::Uuid,
    config: SpineConfig,
    security: Security,
    transport: Arc<dyn DiscoveryTransport>,
    registry: Registry,
    token: CancellationToken,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("id", &self.id)
            .field("name", &self.config.namespace.name)
            .field("security", &self.security)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

impl Namespace {
    /// Validate `config`, build the registry and start its browse and
    /// janitor tasks. Must be called from within a Tokio runtime.
    pub fn join(
        config: SpineConfig,
        transport: Arc<dyn DiscoveryTransport>,
    ) -> SpineResult<Arc<Self>> {
        config.validate()?;
        let security = Security::from_config(&config.namespace)?;
        let registry = Registry::new(
            service_type(&config.namespace.name),
            Arc::clone(&transport),
            &config.registry,
        );
        let token = CancellationToken::new();
        registry.spawn_background(token.child_token(), config.registry.janitor_interval());

        let id = uuid::Uuid::new_v4();
        info!(
            namespace = %config.namespace.name,
            %id,
            encrypted = security.is_encrypted(),
            "Joined namespace"
        );

        Ok(Arc::new(Self {
            id,
            config,
            security,
            transport,
            registry,
            token,
        }))
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.namespace.name
    }

    pub fn config(&self) -> &SpineConfig {
        &self.config
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn DiscoveryTransport> {
        &self.transport
    }

    /// Discovery service type shared by everything in this namespace.
    pub fn service_type(&self) -> &str {
        self.registry.service_type()
    }

    /// Token cancelled when the namespace is torn down.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Resolve a service by its unprefixed name.
    pub async fn get_service(
        &self,
        name: &str,
        deadline: Option<Duration>,
    ) -> SpineResult<SocketAddr> {
        self.registry.lookup(&service_instance(name), deadline).await
    }

    /// Resolve a publisher by its unprefixed name.
    pub async fn get_publisher(
        &self,
        name: &str,
        deadline: Option<Duration>,
    ) -> SpineResult<SocketAddr> {
        self.registry.lookup(&publisher_instance(name), deadline).await
    }

    /// Cancel every component created under this namespace.
    pub fn disconnect(&self) {
        if !self.token.is_cancelled() {
            info!(namespace = %self.name(), "Disconnecting namespace");
        }
        self.token.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
