//! One proxy's discovery stream.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::message::{DeltaDiscoveryRequest, DiscoveryRequest};
use crate::model::proxy::Proxy;
use crate::model::push_request::PushRequest;
use crate::push::queue::PushEvent;
use crate::resource::push_order;

pub mod watch;

pub use watch::{RequestDecision, WatchedResource};

/// Global counter for generating unique connection IDs.
static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct ConnectionState {
    watched: HashMap<String, WatchedResource>,
    blocked: HashMap<String, PushRequest>,
}

/// A live proxy session.
///
/// The receive task creates the connection once the first request identified
/// the proxy; afterwards only the connection's event loop mutates its watch
/// state. The state mutex is only ever held for the duration of a single
/// method call.
#[derive(Debug)]
pub struct Connection {
    id: String,
    peer_addr: String,
    identities: Vec<String>,
    connected_at: SystemTime,
    proxy: ArcSwap<Proxy>,
    push_tx: mpsc::Sender<PushEvent>,
    stop: CancellationToken,
    closed: AtomicBool,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(
        proxy: Proxy,
        peer_addr: String,
        identities: Vec<String>,
        push_tx: mpsc::Sender<PushEvent>,
        stop: CancellationToken,
    ) -> Self {
        let id = format!(
            "{}-{}",
            proxy.id,
            NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            id,
            peer_addr,
            identities,
            connected_at: SystemTime::now(),
            proxy: ArcSwap::from_pointee(proxy),
            push_tx,
            stop,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connection ID, `<proxy-id>-<counter>`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote address of the stream.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Authenticated identities of the peer.
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    /// When the connection was established.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// The current proxy state.
    pub fn proxy(&self) -> Arc<Proxy> {
        self.proxy.load_full()
    }

    /// Replace the proxy state, e.g. after recomputing its services.
    pub fn set_proxy(&self, proxy: Proxy) {
        self.proxy.store(Arc::new(proxy));
    }

    /// The signal that ends this connection.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Ask the connection to terminate. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn push_sender(&self) -> &mpsc::Sender<PushEvent> {
        &self.push_tx
    }

    /// Returns true the first time it is called.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Classify a state-of-the-world request, updating the watch state.
    pub fn should_respond(&self, request: &DiscoveryRequest) -> RequestDecision {
        let mut state = self.state();
        let decision = watch::classify_sotw(&mut state.watched, request);
        if decision == RequestDecision::Unsubscribe {
            state.blocked.remove(&request.type_url);
        }
        decision
    }

    /// Classify a delta request, updating the watch state.
    pub fn should_respond_delta(&self, request: &DeltaDiscoveryRequest) -> RequestDecision {
        let mut state = self.state();
        watch::classify_delta(&mut state.watched, request)
    }

    /// A copy of the watch state for one type.
    pub fn watched(&self, type_url: &str) -> Option<WatchedResource> {
        self.state().watched.get(type_url).cloned()
    }

    /// Copies of every watched type, in push order.
    pub fn watched_resources(&self) -> Vec<WatchedResource> {
        let mut watched: Vec<WatchedResource> = self.state().watched.values().cloned().collect();
        watched.sort_by(|a, b| {
            (push_order(&a.type_url), &a.type_url).cmp(&(push_order(&b.type_url), &b.type_url))
        });
        watched
    }

    /// Record a response that was written to the stream.
    ///
    /// When `sent_names` is given it replaces the subscribed names, which is
    /// how wildcard subscriptions track what the proxy holds.
    pub fn record_sent(
        &self,
        type_url: &str,
        nonce: &str,
        version: &str,
        size: usize,
        sent_names: Option<BTreeSet<String>>,
    ) {
        let mut state = self.state();
        let watched = state
            .watched
            .entry(type_url.to_string())
            .or_insert_with(|| WatchedResource::new(type_url, BTreeSet::new(), false));
        watched.nonce_sent = nonce.to_string();
        watched.version_sent = version.to_string();
        watched.last_sent = Some(Instant::now());
        watched.last_size = size;
        if let Some(names) = sent_names {
            watched.resource_names = names;
        }
    }

    /// Whether a push of this type may go out now: `(synced, timed_out)`.
    ///
    /// A type is synced once the proxy answered the last response. It times
    /// out when the last response is older than `timeout`.
    pub fn flow_state(&self, type_url: &str, timeout: Duration) -> (bool, bool) {
        let state = self.state();
        match state.watched.get(type_url) {
            Some(w) => (
                w.is_synced(),
                w.last_sent.is_some_and(|sent| sent.elapsed() > timeout),
            ),
            None => (true, false),
        }
    }

    /// Park a push until the type is synced, merging with any parked push.
    pub fn block_push(&self, type_url: &str, request: PushRequest) {
        let mut state = self.state();
        let merged = crate::model::push_request::merge_into(state.blocked.remove(type_url), request);
        state.blocked.insert(type_url.to_string(), merged);
    }

    /// Take the parked push for a type.
    pub fn take_blocked(&self, type_url: &str) -> Option<PushRequest> {
        self.state().blocked.remove(type_url)
    }

    /// Types with a parked push, in push order.
    pub fn blocked_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.state().blocked.keys().cloned().collect();
        types.sort_by_key(|t| (push_order(t), t.clone()));
        types
    }

    /// Returns true if some parked push could be released now.
    pub fn has_releasable_push(&self, timeout: Duration) -> bool {
        let state = self.state();
        state.blocked.keys().any(|type_url| match state.watched.get(type_url) {
            Some(w) => w.is_synced() || w.last_sent.is_some_and(|sent| sent.elapsed() > timeout),
            None => true,
        })
    }
}
