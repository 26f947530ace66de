// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Graceful-drain bookkeeping.
//!
//! In-flight invocations are never cancelled at shutdown. Instead each
//! invocation holds an RAII guard while it runs; shutdown flips a flag so no
//! new invocation starts, then awaits the guard count reaching zero.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

struct TrackerInner {
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    idle: Notify,
}

/// Counts running invocations and coordinates the graceful drain.
#[derive(Clone)]
pub(crate) struct InFlightTracker {
    inner: Arc<TrackerInner>,
}

impl InFlightTracker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                in_flight: AtomicUsize::new(0),
                shutting_down: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Begin an invocation. Returns `None` once shutdown has been initiated.
    pub(crate) fn begin(&self) -> Option<InFlightGuard> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return None;
        }
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        // Re-check after incrementing so a racing shutdown cannot miss us:
        // either it sees our count, or we see its flag and back out.
        if self.inner.shutting_down.load(Ordering::Acquire) {
            self.release();
            return None;
        }
        Some(InFlightGuard {
            inner: self.inner.clone(),
        })
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Stop admitting new invocations.
    pub(crate) fn initiate_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
    }

    /// Wait until no invocation is in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Held for the duration of one invocation.
pub(crate) struct InFlightGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
