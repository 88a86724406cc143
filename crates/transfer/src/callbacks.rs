//! Rate-limited progress callback delivery.
//!
//! Each registered callback gets its own [`CallbackTracker`], which delivers
//! at most once per period. Calls arriving inside the period collapse into a
//! single deferred delivery; because callbacks read live transfer state when
//! they run, the deferred delivery always reports the latest progress.
//!
//! The scheduling rule itself is the pure function [`decide`], so it can be
//! tested without timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_protocol::TransferId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::TransferError;

/// Callback driven by a tracker. Receives the error that triggered the call,
/// if any.
pub type TrackedCallback = Arc<dyn Fn(Option<&TransferError>) + Send + Sync>;

/// Time source used for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads Tokio's clock, which tests can pause and advance.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Scheduling record of one tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerState {
    pub period: Duration,
    pub last_call: Option<Instant>,
    pub scheduled: bool,
    /// Set once an error has been reported; nothing is delivered after.
    pub complete: bool,
}

impl TrackerState {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_call: None,
            scheduled: false,
            complete: false,
        }
    }
}

/// What a tracker does with one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    /// Run the callback now.
    Deliver,
    /// Run the callback once after the given delay.
    Schedule(Duration),
    /// A delivery is already pending; it will cover this call.
    Coalesce,
    /// The tracker is complete.
    Suppress,
}

/// Decides how to handle a call arriving at `now`.
pub fn decide(state: &TrackerState, now: Instant) -> CallAction {
    if state.complete {
        return CallAction::Suppress;
    }
    if state.scheduled {
        return CallAction::Coalesce;
    }
    match state.last_call {
        None => CallAction::Deliver,
        Some(last) => {
            let elapsed = now.saturating_duration_since(last);
            if elapsed > state.period {
                CallAction::Deliver
            } else {
                CallAction::Schedule(state.period - elapsed)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CallbackTracker
// ---------------------------------------------------------------------------

/// Rate limiter for one registered callback.
///
/// Deferred deliveries run on a spawned Tokio task, so calls must be made
/// from within a runtime.
#[derive(Clone)]
pub struct CallbackTracker {
    shared: Arc<TrackerShared>,
}

struct TrackerShared {
    callback: TrackedCallback,
    clock: Arc<dyn Clock>,
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    state: TrackerState,
    pending: Option<Pending>,
}

struct Pending {
    err: Option<Arc<TransferError>>,
    cancel: CancellationToken,
}

impl CallbackTracker {
    pub fn new(callback: TrackedCallback, period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                callback,
                clock,
                inner: Mutex::new(TrackerInner {
                    state: TrackerState::new(period),
                    pending: None,
                }),
            }),
        }
    }

    /// Requests a delivery. An error marks the tracker complete once it has
    /// been delivered.
    pub fn call(&self, err: Option<Arc<TransferError>>) {
        let now = self.shared.clock.now();
        let mut inner = self.shared.inner.lock().unwrap();

        match decide(&inner.state, now) {
            CallAction::Suppress => {}
            CallAction::Coalesce => {
                if err.is_some() {
                    inner.state.complete = true;
                    if let Some(pending) = inner.pending.as_mut() {
                        pending.err = err;
                    }
                }
            }
            CallAction::Deliver => {
                inner.state.last_call = Some(now);
                inner.state.complete = err.is_some();
                drop(inner);
                (self.shared.callback)(err.as_deref());
            }
            CallAction::Schedule(delay) => {
                let cancel = CancellationToken::new();
                inner.state.scheduled = true;
                inner.state.complete = err.is_some();
                inner.pending = Some(Pending {
                    err,
                    cancel: cancel.clone(),
                });
                drop(inner);

                trace!(?delay, "callback deferred");
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => shared.fire(),
                    }
                });
            }
        }
    }

    /// Fires any pending delivery immediately, then stops the tracker.
    pub fn stop(&self) {
        let pending = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.state.complete = true;
            inner.state.scheduled = false;
            inner.pending.take()
        };
        if let Some(pending) = pending {
            pending.cancel.cancel();
            (self.shared.callback)(pending.err.as_deref());
        }
    }

    pub fn state(&self) -> TrackerState {
        self.shared.inner.lock().unwrap().state.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.shared.inner.lock().unwrap().state.complete
    }
}

impl TrackerShared {
    fn fire(&self) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            let pending = inner.pending.take();
            if pending.is_some() {
                inner.state.scheduled = false;
                inner.state.last_call = Some(self.clock.now());
            }
            pending
        };
        // `None` means stop() already flushed this delivery.
        if let Some(pending) = pending {
            (self.callback)(pending.err.as_deref());
        }
    }
}

// ---------------------------------------------------------------------------
// CallbackManager
// ---------------------------------------------------------------------------

/// Groups trackers by transfer.
pub struct CallbackManager {
    trackers: Mutex<HashMap<TransferId, Vec<CallbackTracker>>>,
    clock: Arc<dyn Clock>,
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            trackers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Registers a callback and calls it once so it sees the current state.
    pub fn add_callback(&self, file_id: TransferId, callback: TrackedCallback, period: Duration) {
        let tracker = CallbackTracker::new(callback, period, Arc::clone(&self.clock));
        self.trackers
            .lock()
            .unwrap()
            .entry(file_id)
            .or_default()
            .push(tracker.clone());
        tracker.call(None);
    }

    /// Calls every tracker registered for `file_id`.
    pub fn call(&self, file_id: &TransferId, err: Option<Arc<TransferError>>) {
        let trackers = self
            .trackers
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .unwrap_or_default();
        for tracker in trackers {
            tracker.call(err.clone());
        }
    }

    /// Flushes and stops every tracker of `file_id`.
    pub fn delete(&self, file_id: &TransferId) {
        let trackers = self.trackers.lock().unwrap().remove(file_id);
        for tracker in trackers.into_iter().flatten() {
            tracker.stop();
        }
    }

    pub fn num_callbacks(&self, file_id: &TransferId) -> usize {
        self.trackers
            .lock()
            .unwrap()
            .get(file_id)
            .map_or(0, Vec::len)
    }
}
