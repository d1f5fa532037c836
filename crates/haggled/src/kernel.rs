//! Kernel & event loop (spec §4.1).
//!
//! The original runs one control thread combining a min-heap of timed
//! events with a watch set of readable/writable descriptors, dispatching
//! both synchronously. This crate's runtime is `tokio`, which already owns
//! an efficient, correctly-ordered timer wheel and reactor, so the kernel
//! doesn't reimplement one: `EventBus` is the fan-out/subscription registry
//! spec §4.1 calls the "public event" half, and `Kernel::schedule_after`
//! stands in for the min-heap by handing a single timed re-publish to
//! `tokio::time::sleep` (Open Question resolution, see DESIGN.md). Each
//! manager owns its `handle` loop as a `tokio::spawn`ed task reading its own
//! subscription channel — the spec's "allowing worker tasks to run in
//! parallel while serialising work" per component, rather than a single OS
//! thread running every handler body.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::event::{Event, EventKind, Phase};

/// Fan-out registry: one subscriber list per `EventKind`, preserving
/// registration order so spec §8's "handlers registered at scheduling time
/// are invoked before handlers registered afterwards on the same instant"
/// holds for any single publish.
#[derive(Default)]
struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventBus {
    fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock();
        for kind in kinds {
            subs.entry(*kind).or_default().push(tx.clone());
        }
        rx
    }

    fn publish(&self, event: Event) {
        let subs = self.subscribers.lock();
        if let Some(senders) = subs.get(&event.kind()) {
            for sender in senders {
                // An unbounded send only fails if the receiving manager's
                // task has already exited; that manager no longer cares.
                let _ = sender.send(event.clone());
            }
        }
    }
}

/// Tracks which managers have acknowledged the current shutdown phase, so
/// the kernel can cross into the next phase only once every manager that
/// registered for lifecycle tracking has signalled ready (spec §4.1
/// "the kernel waits for every manager to signal 'ready'").
struct ReadyBarrier {
    expected: Vec<&'static str>,
    seen: Mutex<std::collections::HashSet<&'static str>>,
    notify: tokio::sync::Notify,
}

impl ReadyBarrier {
    fn new(expected: Vec<&'static str>) -> Self {
        Self {
            expected,
            seen: Mutex::new(std::collections::HashSet::new()),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn reset(&self) {
        self.seen.lock().clear();
    }

    fn ack(&self, manager: &'static str) {
        self.seen.lock().insert(manager);
        self.notify.notify_waiters();
    }

    fn is_satisfied(&self) -> bool {
        let seen = self.seen.lock();
        self.expected.iter().all(|m| seen.contains(m))
    }

    async fn wait(&self) {
        while !self.is_satisfied() {
            self.notify.notified().await;
        }
    }
}

/// A cloneable front door managers use to publish events, subscribe, and
/// schedule delayed re-publishes. Kept distinct from `Kernel` itself: the
/// kernel owns the bus and the shutdown sequencing, while a `KernelHandle`
/// is what every manager actually holds.
#[derive(Clone)]
pub struct KernelHandle {
    bus: Arc<EventBus>,
    barrier: Arc<ReadyBarrier>,
    request_ids: Arc<std::sync::atomic::AtomicU64>,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl KernelHandle {
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<Event> {
        self.bus.subscribe(kinds)
    }

    pub fn publish(&self, event: Event) {
        debug!(kind = ?event.kind(), "kernel: publish");
        self.bus.publish(event);
    }

    /// Re-publish `event` after `delay`, as a stand-in for the original's
    /// timed min-heap entries (node-description retry, aging tick,
    /// periodic/delayed forwarding queries).
    pub fn schedule_after(&self, delay: std::time::Duration, event: Event) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.publish(event);
        });
    }

    /// A monotonically increasing id a manager can stamp onto an in-flight
    /// store query or send attempt so a later event (the query's
    /// completion) can be matched back to the request that caused it —
    /// the Rust-native replacement for a bound callback closure (spec §4.1
    /// "private event").
    pub fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Run blocking work (a sled call, a hash, a signature) on the blocking
    /// thread pool and await its result without tying up the calling
    /// manager's event loop. This is the kernel's "helper thread" contract
    /// (spec §5): helpers never touch shared state directly, they only
    /// return a value the caller folds into its own state.
    pub async fn run_blocking<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        match tokio::task::spawn_blocking(f).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("kernel: blocking task panicked: {e}");
                None
            }
        }
    }

    /// Acknowledge that `manager` has finished quiescing for the current
    /// shutdown phase.
    pub fn signal_ready(&self, manager: &'static str, phase: Phase) {
        self.publish(Event::ReadyForShutdown { manager, phase });
        self.barrier.ack(manager);
    }

    /// Request the daemon-wide shutdown sequence from inside a manager's own
    /// event loop (the application manager's `shutdown` control message, a
    /// caught signal re-published onto the bus). A no-op if shutdown has
    /// already been requested once.
    pub fn request_shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// The kernel proper: owns the bus, drives the two-phase shutdown sequence,
/// and exposes a `KernelHandle` for managers to register against.
pub struct Kernel {
    bus: Arc<EventBus>,
    barrier: Arc<ReadyBarrier>,
    request_ids: Arc<std::sync::atomic::AtomicU64>,
    shutdown_rx: Mutex<Option<oneshot::Receiver<()>>>,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl Kernel {
    /// `managers` lists every manager name expected to ack each shutdown
    /// phase; order doesn't matter, only membership.
    pub fn new(managers: Vec<&'static str>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            bus: Arc::new(EventBus::default()),
            barrier: Arc::new(ReadyBarrier::new(managers)),
            request_ids: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            shutdown_rx: Mutex::new(Some(rx)),
            shutdown_tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    pub fn handle(&self) -> KernelHandle {
        KernelHandle {
            bus: self.bus.clone(),
            barrier: self.barrier.clone(),
            request_ids: self.request_ids.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Request shutdown from outside the manager set (a CLI signal, the
    /// application manager's `shutdown` control message).
    pub fn request_shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Drive the two-phase teardown to completion: broadcast
    /// `PrepareShutdown`, wait for every manager to quiesce, broadcast
    /// `Shutdown`, wait again, then return. Call after `request_shutdown`
    /// fires (typically awaited alongside `tokio::signal::ctrl_c`).
    pub async fn run_shutdown_sequence(&self) {
        let rx = self.shutdown_rx.lock().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        debug!("kernel: entering prepare-shutdown phase");
        self.barrier.reset();
        self.bus.publish(Event::PrepareShutdown);
        let quiesce = tokio::time::timeout(std::time::Duration::from_secs(10), self.barrier.wait()).await;
        if quiesce.is_err() {
            warn!("kernel: prepare-shutdown quiescence window elapsed, proceeding anyway");
        }

        debug!("kernel: entering shutdown phase");
        self.barrier.reset();
        self.bus.publish(Event::Shutdown);
        let released = tokio::time::timeout(std::time::Duration::from_secs(10), self.barrier.wait()).await;
        if released.is_err() {
            warn!("kernel: shutdown quiescence window elapsed, forcing exit");
        }
        debug!("kernel: shutdown sequence complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_registration_order() {
        let kernel = Kernel::new(vec![]);
        let handle = kernel.handle();
        let mut first = handle.subscribe(&[EventKind::NodeUpdated]);
        let mut second = handle.subscribe(&[EventKind::NodeUpdated]);
        handle.publish(Event::NodeUpdated { node_id: "a".into() });

        let e1 = first.recv().await.unwrap();
        let e2 = second.recv().await.unwrap();
        assert!(matches!(e1, Event::NodeUpdated { .. }));
        assert!(matches!(e2, Event::NodeUpdated { .. }));
    }

    #[tokio::test]
    async fn scheduled_event_fires_after_delay() {
        let kernel = Kernel::new(vec![]);
        let handle = kernel.handle();
        let mut rx = handle.subscribe(&[EventKind::AgingTick]);
        handle.schedule_after(std::time::Duration::from_millis(5), Event::AgingTick);
        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, Event::AgingTick));
    }

    #[tokio::test]
    async fn shutdown_sequence_waits_for_every_manager() {
        let kernel = Kernel::new(vec!["alpha", "beta"]);
        let handle = kernel.handle();
        kernel.request_shutdown();

        let mut prepare_rx = handle.subscribe(&[EventKind::PrepareShutdown]);
        let ack_handle = handle.clone();
        tokio::spawn(async move {
            prepare_rx.recv().await.unwrap();
            ack_handle.signal_ready("alpha", Phase::PrepareShutdown);
            ack_handle.signal_ready("beta", Phase::PrepareShutdown);
        });

        let mut shutdown_rx = handle.subscribe(&[EventKind::Shutdown]);
        let ack_handle2 = handle.clone();
        tokio::spawn(async move {
            shutdown_rx.recv().await.unwrap();
            ack_handle2.signal_ready("alpha", Phase::Shutdown);
            ack_handle2.signal_ready("beta", Phase::Shutdown);
        });

        tokio::time::timeout(std::time::Duration::from_secs(2), kernel.run_shutdown_sequence())
            .await
            .unwrap();
    }
}
