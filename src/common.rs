// common.rs - Shared runtime primitives
//
//! Small building blocks used across the agency runtime:
//!
//! - `StateMachine`: watch-backed state with transition logging and
//!   `wait_for` support
//! - `ConnectionTracker`: edge-triggered connected/disconnected callback
//!   fan-out shared by the messaging and database glue
//! - `InFlight`: a counter that can be awaited down to zero (used by
//!   interests to drain spawned protocol instances)

use std::fmt::Debug;
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Callback fired on connectivity transitions.
pub type ConnectivityCallback = Arc<dyn Fn() + Send + Sync>;

/// A small watch-backed state machine.
///
/// Transitions are synchronous; waiting for a state suspends until some
/// writer reaches it.
pub struct StateMachine<S> {
    tx: watch::Sender<S>,
}

impl<S> StateMachine<S>
where
    S: Copy + PartialEq + Debug + Send + Sync + 'static,
{
    pub fn new(initial: S) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Current state.
    pub fn get(&self) -> S {
        *self.tx.borrow()
    }

    /// Transition to a new state.
    pub fn set(&self, state: S) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "state transition");
            *current = state;
            true
        });
    }

    pub fn is(&self, state: S) -> bool {
        self.get() == state
    }

    pub fn is_any(&self, states: &[S]) -> bool {
        let current = self.get();
        states.iter().any(|s| *s == current)
    }

    /// Suspend until the machine reaches `state`.
    pub async fn wait_for(&self, state: S) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so this cannot observe a closed channel
        // while the borrow is held.
        let _ = rx.wait_for(|current| *current == state).await;
    }
}

/// Edge-triggered connectivity fan-out.
///
/// `on_connected` / `on_disconnected` fire their callback lists only when
/// the tracked state actually changes.
#[derive(Default)]
pub struct ConnectionTracker {
    state: Mutex<Option<bool>>,
    connected_cbs: Mutex<Vec<ConnectivityCallback>>,
    disconnected_cbs: Mutex<Vec<ConnectivityCallback>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connected_callback(&self, cb: ConnectivityCallback) {
        self.connected_cbs.lock().push(cb);
    }

    pub fn add_disconnected_callback(&self, cb: ConnectivityCallback) {
        self.disconnected_cbs.lock().push(cb);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap_or(false)
    }

    pub fn on_connected(&self) {
        if self.transition(true) {
            let cbs = self.connected_cbs.lock().clone();
            for cb in cbs {
                cb();
            }
        }
    }

    pub fn on_disconnected(&self) {
        if self.transition(false) {
            let cbs = self.disconnected_cbs.lock().clone();
            for cb in cbs {
                cb();
            }
        }
    }

    fn transition(&self, to: bool) -> bool {
        let mut state = self.state.lock();
        if *state == Some(to) {
            return false;
        }
        *state = Some(to);
        true
    }
}

/// A counter of in-flight work items that can be awaited down to zero.
#[derive(Clone)]
pub struct InFlight {
    tx: watch::Sender<usize>,
}

impl InFlight {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    pub fn increment(&self) {
        self.tx.send_modify(|count| *count += 1);
    }

    pub fn decrement(&self) {
        self.tx.send_modify(|count| *count = count.saturating_sub(1));
    }

    pub fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Suspend until every tracked item has finished.
    pub async fn drained(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Idle,
        Busy,
        Done,
    }

    #[tokio::test]
    async fn state_machine_transitions_and_waits() {
        let machine = Arc::new(StateMachine::new(Phase::Idle));
        assert!(machine.is(Phase::Idle));

        let waiter = machine.clone();
        let handle = tokio::spawn(async move { waiter.wait_for(Phase::Done).await });

        machine.set(Phase::Busy);
        machine.set(Phase::Done);
        handle.await.unwrap();
        assert!(machine.is_any(&[Phase::Done]));
    }

    #[test]
    fn connection_tracker_is_edge_triggered() {
        let tracker = ConnectionTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        tracker.add_disconnected_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        tracker.on_disconnected();
        tracker.on_disconnected();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tracker.on_connected();
        tracker.on_disconnected();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn in_flight_drains() {
        let tracker = InFlight::new();
        tracker.increment();
        tracker.increment();
        assert_eq!(tracker.count(), 2);

        let waiter = tracker.clone();
        let handle = tokio::spawn(async move { waiter.drained().await });
        tracker.decrement();
        tracker.decrement();
        handle.await.unwrap();
        assert_eq!(tracker.count(), 0);
    }
}
