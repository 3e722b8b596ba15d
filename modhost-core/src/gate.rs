//! Readiness gate
//!
//! A resettable latch built on a [`tokio::sync::watch`] channel. Waiters
//! suspend while the gate is [`GateState::Loading`] and wake when it is
//! opened or closed for good.

use tokio::sync::watch;

/// Observable state of a [`ReadinessGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Closed; queries wait
    Loading,
    /// Open; queries proceed
    Ready,
    /// Permanently closed; waiters are released and should fail
    Disposed,
}

#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<GateState>,
}

impl ReadinessGate {
    /// Create a closed gate
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Loading);
        Self { tx }
    }

    pub fn state(&self) -> GateState {
        *self.tx.borrow()
    }

    /// Open the gate. Once disposed the gate stays disposed.
    ///
    /// Returns `true` if this call changed the state.
    pub fn open(&self) -> bool {
        self.transition(GateState::Ready)
    }

    /// Close the gate again so new waiters suspend.
    pub fn reset(&self) -> bool {
        self.transition(GateState::Loading)
    }

    /// Close the gate permanently and release every waiter.
    pub fn dispose(&self) -> bool {
        self.tx.send_if_modified(|state| {
            let changed = *state != GateState::Disposed;
            *state = GateState::Disposed;
            changed
        })
    }

    /// Wait until the gate leaves [`GateState::Loading`].
    pub async fn wait(&self) -> GateState {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|state| *state != GateState::Loading).await {
            Ok(state) => *state,
            Err(_) => GateState::Disposed,
        }
    }

    fn transition(&self, next: GateState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == GateState::Disposed || *state == next {
                return false;
            }
            *state = next;
            true
        })
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}
