//! Readiness/failure broadcaster for long-lived async capabilities.
//!
//! A gate settles exactly once, either ready or failed. Callbacks registered
//! before settlement are queued and fired exactly once, in registration
//! order; callbacks registered afterwards fire immediately with the settled
//! state.

use std::sync::Mutex;

type ReadyCallback = Box<dyn FnOnce() + Send>;
type Errback = Box<dyn FnOnce(String) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    Pending,
    Ready,
    Failed(String),
}

struct GateInner {
    state: GateState,
    ready_callbacks: Vec<ReadyCallback>,
    errbacks: Vec<Errback>,
}

/// Tracks whether a capability (codec engine, capture device) is available
/// and notifies waiters once the answer is known.
pub struct CapabilityGate {
    inner: Mutex<GateInner>,
}

impl CapabilityGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: GateState::Pending,
                ready_callbacks: Vec::new(),
                errbacks: Vec::new(),
            }),
        }
    }

    /// Register a callback for settlement. If the gate has already settled,
    /// the matching handler is invoked synchronously before returning.
    pub fn on_ready(&self, callback: ReadyCallback, errback: Option<Errback>) {
        let mut inner = self.inner.lock().unwrap();
        match &inner.state {
            GateState::Ready => {
                drop(inner);
                callback();
            }
            GateState::Failed(reason) => {
                let reason = reason.clone();
                drop(inner);
                if let Some(errback) = errback {
                    errback(reason);
                }
            }
            GateState::Pending => {
                inner.ready_callbacks.push(callback);
                if let Some(errback) = errback {
                    inner.errbacks.push(errback);
                }
            }
        }
    }

    /// Settle the gate as ready. First settlement wins; later calls are
    /// ignored silently.
    pub fn mark_ready(&self) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != GateState::Pending {
                return;
            }
            inner.state = GateState::Ready;
            inner.errbacks.clear();
            std::mem::take(&mut inner.ready_callbacks)
        };
        // fire outside the lock so a callback may re-register
        for callback in callbacks {
            callback();
        }
    }

    /// Settle the gate as failed with a reason. First settlement wins.
    pub fn mark_failed(&self, reason: &str) {
        let errbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != GateState::Pending {
                return;
            }
            inner.state = GateState::Failed(reason.to_string());
            inner.ready_callbacks.clear();
            std::mem::take(&mut inner.errbacks)
        };
        for errback in errbacks {
            errback(reason.to_string());
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().unwrap().state == GateState::Ready
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, GateState::Failed(_))
    }
}

impl Default for CapabilityGate {
    fn default() -> Self {
        Self::new()
    }
}
