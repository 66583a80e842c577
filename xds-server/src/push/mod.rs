//! Push scheduling: debounce, fan-out queue and flow-control release.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::model::push_request::PushRequest;
use crate::registry::ConnectionRegistry;

pub(crate) mod debounce;
pub(crate) mod queue;

use queue::PushQueue;

/// Periodically re-queue connections whose parked pushes became releasable
/// because the proxy stopped answering for longer than `timeout`.
pub(crate) async fn sweep_flow_control(
    registry: Arc<ConnectionRegistry>,
    queue: Arc<PushQueue>,
    timeout: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(timeout);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {}
        }
        for con in registry.snapshot() {
            if con.has_releasable_push(timeout) {
                trace!(con_id = con.id(), "releasing flow-controlled push");
                queue.enqueue(con, PushRequest::flow_control_release());
            }
        }
    }
}
