//! Coalescing of configuration changes into pushes.
//!
//! Every change resets a quiet timer of `after`; a window is cut short once
//! `max` has passed since its first change. Only one debounced push runs at a
//! time; changes arriving during it start the next window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics;
use crate::model::push_request::{PushRequest, merge_into};

/// Debounce settings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DebounceOptions {
    pub(crate) after: Duration,
    pub(crate) max: Duration,
    pub(crate) enable_eds_debounce: bool,
}

#[derive(Debug)]
enum Next {
    Push(PushRequest),
    Wait(Duration),
    Idle,
}

/// The state of one debounce window.
#[derive(Debug)]
struct Window {
    options: DebounceOptions,
    request: Option<PushRequest>,
    start: Instant,
    last_update: Instant,
    events: usize,
    free: bool,
}

impl Window {
    fn new(options: DebounceOptions) -> Self {
        let now = Instant::now();
        Self {
            options,
            request: None,
            start: now,
            last_update: now,
            events: 0,
            free: true,
        }
    }

    /// Add a change. Returns true if it opened a new window.
    fn add(&mut self, request: PushRequest) -> bool {
        let now = Instant::now();
        self.last_update = now;
        let opened = self.events == 0;
        if opened {
            self.start = now;
        }
        self.events += 1;
        self.request = Some(merge_into(self.request.take(), request));
        opened
    }

    /// Decide whether the window is ready to push.
    fn poll(&mut self) -> Next {
        if self.events == 0 {
            return Next::Idle;
        }
        let now = Instant::now();
        let quiet = now - self.last_update;
        let elapsed = now - self.start;
        if elapsed >= self.options.max || quiet >= self.options.after {
            if !self.free {
                // The running push re-polls when it finishes.
                return Next::Idle;
            }
            let Some(request) = self.request.take() else {
                self.events = 0;
                return Next::Idle;
            };
            debug!(
                events = self.events,
                elapsed_ms = elapsed.as_millis() as u64,
                quiet_ms = quiet.as_millis() as u64,
                full = request.full,
                "push debounce stable"
            );
            metrics::debounce_time(elapsed, self.events);
            self.events = 0;
            self.free = false;
            Next::Push(request)
        } else {
            Next::Wait(self.options.after - quiet)
        }
    }
}

/// Run the debounce loop until `stop` fires or every sender is gone.
pub(crate) async fn debounce<F, Fut>(
    mut updates: mpsc::UnboundedReceiver<PushRequest>,
    stop: CancellationToken,
    options: DebounceOptions,
    push_fn: F,
) where
    F: Fn(PushRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let push_fn = Arc::new(push_fn);
    let (free_tx, mut free_rx) = mpsc::channel::<()>(1);
    let mut window = Window::new(options);

    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    let mut armed = false;

    loop {
        let next = tokio::select! {
            _ = stop.cancelled() => return,
            Some(()) = free_rx.recv() => {
                window.free = true;
                window.poll()
            }
            () = &mut timer, if armed => {
                armed = false;
                window.poll()
            }
            update = updates.recv() => {
                let Some(request) = update else {
                    return;
                };
                if !options.enable_eds_debounce && !request.full {
                    tokio::spawn(push_fn(request));
                    continue;
                }
                if window.add(request) {
                    Next::Wait(options.after)
                } else {
                    continue;
                }
            }
        };

        match next {
            Next::Push(request) => {
                let push_fn = Arc::clone(&push_fn);
                let free_tx = free_tx.clone();
                tokio::spawn(async move {
                    push_fn(request).await;
                    let _ = free_tx.send(()).await;
                });
            }
            Next::Wait(delay) => {
                timer.as_mut().reset(Instant::now() + delay);
                armed = true;
            }
            Next::Idle => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config_store::{ConfigKey, Kind};
    use crate::model::push_request::TriggerReason;

    const AFTER: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(1);

    fn start(
        enable_eds_debounce: bool,
    ) -> (
        mpsc::UnboundedSender<PushRequest>,
        mpsc::UnboundedReceiver<PushRequest>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let options = DebounceOptions {
            after: AFTER,
            max: MAX,
            enable_eds_debounce,
        };
        tokio::spawn(debounce(rx, stop.clone(), options, move |request| {
            let out_tx = out_tx.clone();
            async move {
                let _ = out_tx.send(request);
            }
        }));
        (tx, out_rx, stop)
    }

    fn key(name: &str) -> ConfigKey {
        ConfigKey::new(Kind::Service, name, "default")
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_merged_into_one_push() {
        let (tx, mut out, stop) = start(true);
        for name in ["a", "b", "c"] {
            tx.send(PushRequest::for_configs(TriggerReason::ServiceUpdate, [key(name)]))
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let pushed = out.recv().await.unwrap();
        assert_eq!(pushed.configs_updated.len(), 3);
        assert_eq!(pushed.reason.len(), 3);
        assert!(out.try_recv().is_err());
        stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_is_honored() {
        let (tx, mut out, stop) = start(true);
        let begin = Instant::now();
        tx.send(PushRequest::full(TriggerReason::ConfigUpdate)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(PushRequest::full(TriggerReason::ConfigUpdate)).unwrap();

        out.recv().await.unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(160));
        stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn max_delay_bounds_a_busy_window() {
        let (tx, mut out, stop) = start(true);
        let begin = Instant::now();
        let sender = tokio::spawn(async move {
            for _ in 0..40 {
                let _ = tx.send(PushRequest::full(TriggerReason::ConfigUpdate));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        out.recv().await.unwrap();
        let waited = begin.elapsed();
        assert!(waited >= MAX, "pushed after {waited:?}");
        assert!(waited < MAX + AFTER, "pushed after {waited:?}");
        sender.abort();
        stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn incremental_bypasses_debounce_when_disabled() {
        let (tx, mut out, stop) = start(false);
        let begin = Instant::now();
        tx.send(PushRequest::incremental(TriggerReason::EndpointUpdate, [key("a")]))
            .unwrap();
        let pushed = out.recv().await.unwrap();
        assert!(!pushed.full);
        assert!(begin.elapsed() < AFTER);
        stop.cancel();
    }

    #[test]
    fn window_waits_for_running_push() {
        let options = DebounceOptions {
            after: Duration::ZERO,
            max: MAX,
            enable_eds_debounce: true,
        };
        let mut window = Window::new(options);
        assert!(matches!(window.poll(), Next::Idle));

        window.add(PushRequest::full(TriggerReason::ConfigUpdate));
        assert!(matches!(window.poll(), Next::Push(_)));

        window.add(PushRequest::full(TriggerReason::ConfigUpdate));
        assert!(matches!(window.poll(), Next::Idle), "one push in flight");

        window.free = true;
        assert!(matches!(window.poll(), Next::Push(_)));
    }
}
