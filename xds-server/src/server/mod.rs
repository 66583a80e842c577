//! The discovery server: connection registry, push scheduling and the
//! entry points the transports call into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::generator::{Generator, GeneratorRegistry};
use crate::message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
    ErrorDetail, Node, Resource,
};
use crate::metrics;
use crate::model::config_store::{ConfigEvent, ConfigKey, ConfigStore, Kind};
use crate::model::proxy::Proxy;
use crate::model::push_context::{MeshSettings, PushContext};
use crate::model::push_request::{PushRequest, TriggerReason};
use crate::model::workload::WorkloadRegistrar;
use crate::push::debounce::{DebounceOptions, debounce};
use crate::push::queue::{PushEvent, PushQueue, dispatch};
use crate::push::sweep_flow_control;
use crate::registry::{ConnectionObserver, ConnectionRegistry};
use crate::transport::{RequestStream, ResponseSink};

pub mod ads;
pub mod config;
mod delta;
mod sotw;
mod stream;

use config::ServerConfig;

/// Resolves the authenticated identities of a stream's caller.
pub trait Authenticator: Send + Sync + 'static {
    /// Return the caller's identities, e.g. SPIFFE IDs from its certificate.
    fn authenticate(&self, metadata: &tonic::metadata::MetadataMap) -> Result<Vec<String>>;
}

/// Builder for [`DiscoveryServer`].
pub struct DiscoveryServerBuilder {
    config: ServerConfig,
    store: Arc<dyn ConfigStore>,
    generators: GeneratorRegistry,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl std::fmt::Debug for DiscoveryServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryServerBuilder")
            .field("config", &self.config)
            .field("generators", &self.generators)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl DiscoveryServerBuilder {
    /// Create a builder serving configuration from `store`.
    pub fn new(config: ServerConfig, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            config,
            store,
            generators: GeneratorRegistry::new(),
            observers: Vec::new(),
            authenticator: None,
        }
    }

    /// Register the generator for a type URL.
    pub fn with_generator(mut self, type_url: impl Into<String>, generator: Arc<dyn Generator>) -> Self {
        self.generators.insert(type_url, generator);
        self
    }

    /// Add a connection observer.
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Authenticate callers of the tonic service.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Build the server and start its background tasks.
    ///
    /// This spawns the debouncer, the push dispatcher, the configuration
    /// watcher and, with flow control enabled, the flow-control sweeper. They
    /// run until [`DiscoveryServer::shutdown`] is called. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> Result<DiscoveryServer> {
        self.config.validate()?;

        let mesh = MeshSettings {
            root_namespace: self.config.root_namespace.clone(),
            trust_domain: self.config.trust_domain.clone(),
        };
        let initial = PushContext::init(self.store.as_ref(), mesh.clone(), "0");
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            workloads: WorkloadRegistrar::new(Arc::clone(&self.store)),
            config: self.config,
            mesh,
            store: self.store,
            generators: self.generators,
            observers: self.observers,
            authenticator: self.authenticator,
            registry: Arc::new(ConnectionRegistry::new()),
            push_context: ArcSwap::from_pointee(initial),
            queue: Arc::new(PushQueue::new()),
            updates: updates_tx,
            snapshots: Mutex::new(HashMap::new()),
            rebuild: Mutex::new(()),
            version: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        let server = DiscoveryServer { inner };
        server.spawn_tasks(updates_rx);
        Ok(server)
    }
}

struct Inner {
    config: ServerConfig,
    mesh: MeshSettings,
    store: Arc<dyn ConfigStore>,
    generators: GeneratorRegistry,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    registry: Arc<ConnectionRegistry>,
    push_context: ArcSwap<PushContext>,
    queue: Arc<PushQueue>,
    updates: mpsc::UnboundedSender<PushRequest>,
    workloads: WorkloadRegistrar,
    snapshots: Mutex<HashMap<String, Vec<Resource>>>,
    /// Serializes push context rebuilds so versions are stored in order.
    rebuild: Mutex<()>,
    version: AtomicU64,
    shutdown: CancellationToken,
}

/// The xDS discovery server.
///
/// This is a handle to shared server state; cloning it is cheap. Serve it
/// over tonic with [`DiscoveryServer::into_service`], or drive streams
/// directly with [`serve_sotw`](Self::serve_sotw) and
/// [`serve_delta`](Self::serve_delta).
#[derive(Clone)]
pub struct DiscoveryServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DiscoveryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryServer")
            .field("connections", &self.inner.registry.len())
            .field("version", &self.push_context().version())
            .finish_non_exhaustive()
    }
}

impl DiscoveryServer {
    /// Create a builder serving configuration from `store`.
    pub fn builder(config: ServerConfig, store: Arc<dyn ConfigStore>) -> DiscoveryServerBuilder {
        DiscoveryServerBuilder::new(config, store)
    }

    fn spawn_tasks(&self, updates: mpsc::UnboundedReceiver<PushRequest>) {
        let config = &self.inner.config;
        let stop = self.inner.shutdown.clone();

        let server = self.clone();
        let options = DebounceOptions {
            after: config.debounce_after,
            max: config.debounce_max,
            enable_eds_debounce: config.enable_eds_debounce,
        };
        tokio::spawn(debounce(updates, stop.clone(), options, move |request| {
            let server = server.clone();
            async move { server.push(request).await }
        }));

        tokio::spawn(dispatch(
            Arc::clone(&self.inner.queue),
            Arc::new(Semaphore::new(config.push_throttle)),
            stop.clone(),
        ));

        if config.enable_flow_control {
            tokio::spawn(sweep_flow_control(
                Arc::clone(&self.inner.registry),
                Arc::clone(&self.inner.queue),
                config.flow_control_timeout,
                stop.clone(),
            ));
        }

        let mut events = self.inner.store.watch();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    event = events.recv() => match event {
                        Some(event) => server.handle_config_event(&event),
                        None => return,
                    },
                }
            }
        });
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// The configuration store the server reads from.
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.inner.store
    }

    /// Live connections.
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// The push context the latest push was computed from.
    pub fn push_context(&self) -> Arc<PushContext> {
        self.inner.push_context.load_full()
    }

    pub(crate) fn generator(&self, type_url: &str) -> Option<&Arc<dyn Generator>> {
        self.inner.generators.get(type_url)
    }

    /// Stop the background tasks and every connection.
    pub fn shutdown(&self) {
        info!(connections = self.inner.registry.len(), "shutting down discovery server");
        self.inner.shutdown.cancel();
        self.inner.queue.shut_down();
        for con in self.inner.registry.snapshot() {
            con.stop();
        }
    }

    /// Returns true once [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Schedule a push. Requests are debounced and merged before they run.
    pub fn config_update(&self, request: PushRequest) {
        if self.inner.updates.send(request).is_err() {
            debug!("push scheduler stopped, dropping update");
        }
    }

    /// Schedule an incremental push for changed endpoints of a service.
    pub fn endpoint_update(&self, hostname: &str, namespace: &str) {
        self.config_update(PushRequest::incremental(
            TriggerReason::EndpointUpdate,
            [ConfigKey::new(Kind::Service, hostname, namespace)],
        ));
    }

    /// Replace the pre-built resources of a type and schedule a full push.
    ///
    /// These are the resources [`SnapshotGenerator`](crate::SnapshotGenerator)
    /// serves.
    pub fn set_resources(&self, type_url: impl Into<String>, resources: Vec<Resource>) {
        let type_url = type_url.into();
        {
            let mut snapshots = self
                .inner
                .snapshots
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            snapshots.insert(type_url.clone(), resources);
        }
        debug!(type_url, "snapshot resources replaced");
        self.config_update(PushRequest::full(TriggerReason::ConfigUpdate));
    }

    /// Translate a configuration store event into a push.
    pub fn handle_config_event(&self, event: &ConfigEvent) {
        let key = event.key();
        let request = match key.kind {
            Kind::WorkloadEntry => PushRequest::incremental(TriggerReason::EndpointUpdate, [key]),
            Kind::Service => PushRequest::for_configs(TriggerReason::ServiceUpdate, [key]),
            Kind::EnvoyFilter | Kind::PeerAuthentication | Kind::Secret => {
                PushRequest::for_configs(TriggerReason::ConfigUpdate, [key])
            }
        };
        self.config_update(request);
    }

    /// Build a new push context from the current store contents.
    ///
    /// Rebuilds run one at a time: a context built from an older read of the
    /// store never replaces a newer one.
    fn init_push_context(&self) -> Arc<PushContext> {
        let _rebuild = self
            .inner
            .rebuild
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let started = std::time::Instant::now();
        let version = self.inner.version.fetch_add(1, Ordering::Relaxed) + 1;
        let mut push = PushContext::init(
            self.inner.store.as_ref(),
            self.inner.mesh.clone(),
            version.to_string(),
        );
        {
            let snapshots = self
                .inner
                .snapshots
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (type_url, resources) in snapshots.iter() {
                push = push.with_resources(type_url.clone(), resources.clone());
            }
        }
        metrics::push_context_init(started.elapsed());
        let push = Arc::new(push);
        self.inner.push_context.store(Arc::clone(&push));
        push
    }

    /// Run a (debounced) push: refresh the push context if configuration
    /// changed and queue the push for every connection.
    pub(crate) async fn push(&self, mut request: PushRequest) {
        let push = if request.full || !request.configs_updated.is_empty() {
            self.init_push_context()
        } else {
            self.push_context()
        };
        let connections = self.inner.registry.snapshot();
        info!(
            version = push.version(),
            full = request.full,
            reason = %request.reason_summary(),
            connections = connections.len(),
            "pushing"
        );
        request.push = Some(push);
        for con in connections {
            self.inner.queue.enqueue(con, request.clone());
        }
    }

    /// Turn the first request of a stream into a registered connection.
    pub(crate) fn initialize_connection(
        &self,
        node: Option<&Node>,
        peer_addr: String,
        identities: Vec<String>,
        push_tx: mpsc::Sender<PushEvent>,
        stop: CancellationToken,
    ) -> Result<Arc<Connection>> {
        let node = node.filter(|n| !n.id.is_empty()).ok_or(Error::MissingNode)?;
        let mut proxy = Proxy::from_node(node)?;
        if proxy.cluster_id.is_empty() {
            proxy.cluster_id = self.inner.config.cluster_id.clone();
        }
        if self.inner.config.identity_check {
            authorize(&proxy, &identities, &self.inner.config.trust_domain)?;
        }
        proxy.set_service_instances(&self.push_context());

        let con = Arc::new(Connection::new(proxy, peer_addr, identities, push_tx, stop));
        self.inner
            .workloads
            .register(&con.proxy(), con.id(), con.connected_at())?;
        self.inner.registry.store(Arc::clone(&con));
        metrics::connected_proxies(self.inner.registry.len());
        for observer in &self.inner.observers {
            observer.on_connect(&con);
        }
        info!(
            con_id = con.id(),
            peer = con.peer_addr(),
            version = con.proxy().version(),
            "new connection"
        );
        Ok(con)
    }

    /// Tear down a connection's registrations. Runs once per connection.
    pub(crate) fn close_connection(&self, con: &Connection) {
        if !con.mark_closed() {
            return;
        }
        self.inner.registry.delete(con.id());
        self.inner.queue.remove(con.id());
        metrics::connected_proxies(self.inner.registry.len());
        if let Err(err) = self
            .inner
            .workloads
            .unregister(&con.proxy(), con.id(), SystemTime::now())
        {
            warn!(con_id = con.id(), error = %err, "failed to unregister workload");
        }
        for observer in &self.inner.observers {
            observer.on_disconnect(con);
        }
        info!(con_id = con.id(), "connection closed");
    }

    pub(crate) fn notify_nack(&self, con: &Connection, type_url: &str, error: &ErrorDetail) {
        for observer in &self.inner.observers {
            observer.on_nack(con, type_url, error);
        }
    }

    pub(crate) fn authenticate(&self, metadata: &tonic::metadata::MetadataMap) -> Result<Vec<String>> {
        match &self.inner.authenticator {
            Some(authenticator) => authenticator.authenticate(metadata),
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Serve one state-of-the-world stream until it ends.
    pub async fn serve_sotw<R, S>(
        &self,
        requests: R,
        sink: S,
        peer_addr: String,
        identities: Vec<String>,
    ) -> Result<()>
    where
        R: RequestStream<DiscoveryRequest>,
        S: ResponseSink<DiscoveryResponse>,
    {
        stream::serve::<sotw::Sotw, R, S>(self.clone(), requests, sink, peer_addr, identities).await
    }

    /// Serve one delta stream until it ends.
    pub async fn serve_delta<R, S>(
        &self,
        requests: R,
        sink: S,
        peer_addr: String,
        identities: Vec<String>,
    ) -> Result<()>
    where
        R: RequestStream<DeltaDiscoveryRequest>,
        S: ResponseSink<DeltaDiscoveryResponse>,
    {
        stream::serve::<delta::Delta, R, S>(self.clone(), requests, sink, peer_addr, identities).await
    }
}

/// Check that the proxy claims an identity its caller holds.
fn authorize(proxy: &Proxy, identities: &[String], trust_domain: &str) -> Result<()> {
    let Some(expected) = proxy.spiffe_identity(trust_domain) else {
        return Err(Error::Unauthenticated(format!(
            "proxy {} does not declare a service account",
            proxy.id
        )));
    };
    if identities.iter().any(|id| *id == expected) {
        Ok(())
    } else {
        Err(Error::Unauthenticated(format!(
            "identities {identities:?} do not match {expected}"
        )))
    }
}
