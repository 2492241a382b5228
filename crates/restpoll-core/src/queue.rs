//! Time-ordered queue of pending calls.
//!
//! The queue also tracks how many popped calls are still executing, so the
//! dispatcher can tell "nothing due yet" apart from "nothing left to do":
//! a run is over only when the heap is empty and no call is in flight, and
//! both are checked under the same lock.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::endpoint::BoundEndpoint;
use crate::http_url::HttpUrl;

/// One concrete request waiting to be executed.
#[derive(Clone)]
pub struct PendingCall {
    pub endpoint: BoundEndpoint,
    pub url: HttpUrl,
    /// Earliest time the call may start; `None` means immediately.
    pub not_before: Option<Instant>,
}

impl PendingCall {
    pub fn now(endpoint: BoundEndpoint, url: HttpUrl) -> Self {
        Self {
            endpoint,
            url,
            not_before: None,
        }
    }

    pub fn at(endpoint: BoundEndpoint, url: HttpUrl, not_before: Instant) -> Self {
        Self {
            endpoint,
            url,
            not_before: Some(not_before),
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

struct Entry {
    call: PendingCall,
    seq: u64,
}

impl Entry {
    fn key(&self) -> (Option<Instant>, u64) {
        (self.call.not_before, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest call first. `None` sorts
    // before every `Some`, so ready-now calls always win.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    in_flight: usize,
    next_seq: u64,
}

/// Outcome of [`CallQueue::pop_ready`].
pub enum Pop {
    /// A due call. The in-flight count already includes it.
    Ready(PendingCall),
    /// Nothing queued and nothing executing.
    Idle,
    /// Nothing became due before the timeout.
    Timeout,
}

/// Thread-safe min-queue of pending calls ordered by not-before time.
#[derive(Clone, Default)]
pub struct CallQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl CallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned call queue mutex");
            PoisonError::into_inner(poisoned)
        })
    }

    pub fn push(&self, call: PendingCall) {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry { call, seq });
        }
        self.notify.notify_one();
    }

    /// Number of calls waiting, due or not.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every waiting call, due or not.
    pub fn drain(&self) -> Vec<PendingCall> {
        let mut state = self.lock();
        let mut entries = std::mem::take(&mut state.heap).into_sorted_vec();
        // Sorted ascending by the reversed order, so the latest call is first.
        entries.reverse();
        entries.into_iter().map(|entry| entry.call).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Mark a call returned by [`pop_ready`](Self::pop_ready) as finished.
    pub fn finish_call(&self) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify.notify_one();
    }

    /// A guard that calls [`finish_call`](Self::finish_call) when dropped,
    /// including on panic.
    pub fn in_flight_guard(&self) -> InFlightGuard {
        InFlightGuard {
            queue: self.clone(),
        }
    }

    /// Wait up to `timeout` for a call to become due.
    pub async fn pop_ready(&self, timeout: Duration) -> Pop {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a push between the
            // check and the await is not missed.
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                let now = Instant::now();
                match state.heap.peek() {
                    Some(top) if top.call.is_due(now) => {
                        if let Some(entry) = state.heap.pop() {
                            state.in_flight += 1;
                            return Pop::Ready(entry.call);
                        }
                        deadline
                    }
                    Some(top) => top.call.not_before.map_or(deadline, |t| t.min(deadline)),
                    None if state.in_flight == 0 => return Pop::Idle,
                    None => deadline,
                }
            };

            if Instant::now() >= deadline {
                return Pop::Timeout;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

/// Decrements the in-flight count of a [`CallQueue`] on drop.
pub struct InFlightGuard {
    queue: CallQueue,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.queue.finish_call();
    }
}
