//! Per-connection push queue.
//!
//! Fan-out enqueues every connection; the queue merges requests for the same
//! connection and keeps at most one push per connection in flight. A request
//! arriving while its connection is being pushed is held back and re-queued
//! once that push is done.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::model::push_request::{PushRequest, merge_into};

/// A push handed to a connection's event loop.
#[derive(Debug)]
pub(crate) struct PushEvent {
    pub(crate) request: PushRequest,
    pub(crate) done: PushDone,
}

/// Completion signal for a push.
///
/// Dropping it marks the connection done in the queue and returns the
/// concurrency permit, so a push is accounted for on every exit path.
#[derive(Debug)]
pub(crate) struct PushDone {
    queue: Arc<PushQueue>,
    con_id: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PushDone {
    fn drop(&mut self) {
        self.queue.mark_done(&self.con_id);
    }
}

#[derive(Debug, Default)]
struct QueueState {
    order: VecDeque<String>,
    pending: HashMap<String, (Arc<Connection>, PushRequest)>,
    // Connections being pushed, with any request that arrived meanwhile.
    processing: HashMap<String, (Arc<Connection>, Option<PushRequest>)>,
    shutting_down: bool,
}

/// FIFO of connections awaiting a push.
#[derive(Debug, Default)]
pub(crate) struct PushQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PushQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a push for a connection, merging with anything already queued.
    pub(crate) fn enqueue(&self, con: Arc<Connection>, request: PushRequest) {
        let mut state = self.state();
        if state.shutting_down {
            return;
        }
        let id = con.id().to_string();

        if let Some((_, held)) = state.processing.get_mut(&id) {
            *held = Some(merge_into(held.take(), request));
            return;
        }
        if let Some((_, pending)) = state.pending.get_mut(&id) {
            let merged = pending.clone().merge(request);
            *pending = merged;
            return;
        }
        state.pending.insert(id.clone(), (con, request));
        state.order.push_back(id);
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next connection to push. Returns `None` after shutdown.
    pub(crate) async fn dequeue(&self) -> Option<(Arc<Connection>, PushRequest)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                while let Some(id) = state.order.pop_front() {
                    if let Some((con, request)) = state.pending.remove(&id) {
                        state.processing.insert(id, (Arc::clone(&con), None));
                        return Some((con, request));
                    }
                }
            }
            notified.await;
        }
    }

    /// Finish a connection's push, re-queueing anything that arrived during it.
    pub(crate) fn mark_done(&self, con_id: &str) {
        let mut state = self.state();
        let Some((con, held)) = state.processing.remove(con_id) else {
            return;
        };
        let Some(request) = held else {
            return;
        };
        if state.shutting_down || con.stop_token().is_cancelled() {
            return;
        }
        trace!(con_id, "re-queueing push that arrived during processing");
        state.pending.insert(con_id.to_string(), (con, request));
        state.order.push_back(con_id.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Drop queued work for a connection that went away.
    pub(crate) fn remove(&self, con_id: &str) {
        let mut state = self.state();
        state.pending.remove(con_id);
        if let Some((_, held)) = state.processing.get_mut(con_id) {
            *held = None;
        }
    }

    /// Stop handing out work. Pending requests are discarded.
    pub(crate) fn shut_down(&self) {
        let mut state = self.state();
        state.shutting_down = true;
        state.order.clear();
        state.pending.clear();
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of connections waiting for a push.
    pub(crate) fn pending(&self) -> usize {
        self.state().pending.len()
    }
}

/// Hand queued pushes to connections, holding one `throttle` permit per push
/// until its [`PushDone`] drops.
///
/// Delivery to each connection runs on its own task so a connection that is
/// slow to accept the event never holds up the others.
pub(crate) async fn dispatch(queue: Arc<PushQueue>, throttle: Arc<Semaphore>, stop: CancellationToken) {
    loop {
        let permit = tokio::select! {
            _ = stop.cancelled() => return,
            permit = Arc::clone(&throttle).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            next = queue.dequeue() => next,
        };
        let Some((con, request)) = next else {
            return;
        };

        let done = PushDone {
            queue: Arc::clone(&queue),
            con_id: con.id().to_string(),
            _permit: permit,
        };
        tokio::spawn(async move {
            let event = PushEvent { request, done };
            tokio::select! {
                _ = con.stop_token().cancelled() => {
                    debug!(con_id = con.id(), "connection closed before push was delivered");
                }
                sent = con.push_sender().send(event) => {
                    if sent.is_err() {
                        debug!(con_id = con.id(), "connection stopped reading pushes");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Node;
    use crate::model::config_store::{ConfigKey, Kind};
    use crate::model::proxy::Proxy;
    use crate::model::push_request::TriggerReason;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connection(ip: &str) -> (Arc<Connection>, mpsc::Receiver<PushEvent>) {
        let node = Node::new(format!("sidecar~{ip}~pod.default~default.svc.cluster.local"));
        let (push_tx, push_rx) = mpsc::channel(1);
        let con = Connection::new(
            Proxy::from_node(&node).unwrap(),
            "peer".into(),
            vec![],
            push_tx,
            CancellationToken::new(),
        );
        (Arc::new(con), push_rx)
    }

    fn key(name: &str) -> ConfigKey {
        ConfigKey::new(Kind::Service, name, "default")
    }

    #[tokio::test]
    async fn merges_pending_requests() {
        let queue = PushQueue::new();
        let (con, _rx) = connection("10.0.0.1");
        queue.enqueue(con.clone(), PushRequest::incremental(TriggerReason::EndpointUpdate, [key("a")]));
        queue.enqueue(con.clone(), PushRequest::incremental(TriggerReason::EndpointUpdate, [key("b")]));
        assert_eq!(queue.pending(), 1);

        let (got, request) = queue.dequeue().await.unwrap();
        assert_eq!(got.id(), con.id());
        assert_eq!(request.configs_updated.len(), 2);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn requeues_after_processing() {
        let queue = PushQueue::new();
        let (con, _rx) = connection("10.0.0.1");
        queue.enqueue(con.clone(), PushRequest::full(TriggerReason::ConfigUpdate));
        let _ = queue.dequeue().await.unwrap();

        queue.enqueue(con.clone(), PushRequest::incremental(TriggerReason::EndpointUpdate, [key("a")]));
        queue.enqueue(con.clone(), PushRequest::incremental(TriggerReason::EndpointUpdate, [key("b")]));
        assert_eq!(queue.pending(), 0, "held while in flight");

        queue.mark_done(con.id());
        assert_eq!(queue.pending(), 1);
        let (_, request) = queue.dequeue().await.unwrap();
        assert!(!request.full);
        assert_eq!(request.configs_updated.len(), 2);

        queue.mark_done(con.id());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn fifo_across_connections() {
        let queue = PushQueue::new();
        let (a, _ra) = connection("10.0.0.1");
        let (b, _rb) = connection("10.0.0.2");
        queue.enqueue(a.clone(), PushRequest::full(TriggerReason::ConfigUpdate));
        queue.enqueue(b.clone(), PushRequest::full(TriggerReason::ConfigUpdate));
        queue.enqueue(a.clone(), PushRequest::full(TriggerReason::ConfigUpdate));

        assert_eq!(queue.dequeue().await.unwrap().0.id(), a.id());
        assert_eq!(queue.dequeue().await.unwrap().0.id(), b.id());
    }

    #[tokio::test]
    async fn shutdown_wakes_dequeue() {
        let queue = Arc::new(PushQueue::new());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.dequeue().await.is_none() }
        });
        tokio::task::yield_now().await;
        queue.shut_down();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn throttle_bounds_in_flight_pushes() {
        let queue = Arc::new(PushQueue::new());
        let throttle = Arc::new(Semaphore::new(1));
        let stop = CancellationToken::new();
        tokio::spawn(dispatch(Arc::clone(&queue), Arc::clone(&throttle), stop.clone()));

        let (a, mut ra) = connection("10.0.0.1");
        let (b, mut rb) = connection("10.0.0.2");
        queue.enqueue(a.clone(), PushRequest::full(TriggerReason::ConfigUpdate));
        queue.enqueue(b.clone(), PushRequest::full(TriggerReason::ConfigUpdate));

        let first = ra.recv().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rb.recv())
                .await
                .is_err(),
            "second push must wait for a permit"
        );
        drop(first);
        assert!(rb.recv().await.is_some());
        stop.cancel();
    }
}
