// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded-parallelism FIFO work queue.
//!
//! Tasks are nullary async blocks; up to `max_parallelism` worker loops run
//! concurrently, each draining one task to completion before pulling the
//! next. Worker count shrinks to zero once the queue empties, so an idle
//! queue holds no tasks on the runtime. A panicking task is caught and
//! discarded: each task owns its own error reporting.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::trace;

type QueuedTask = BoxFuture<'static, ()>;

struct QueueState {
    queue: VecDeque<QueuedTask>,
    workers: usize,
}

struct QueueInner {
    max_parallelism: usize,
    state: Mutex<QueueState>,
}

/// FIFO queue executing tasks with bounded parallelism.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    /// Create a queue running at most `max_parallelism` tasks concurrently.
    /// A bound of zero is treated as one.
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_parallelism: max_parallelism.max(1),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    workers: 0,
                }),
            }),
        }
    }

    /// Enqueue a task, spawning a worker loop if a parallelism slot is free.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let spawn_worker = {
            let mut state = self.lock();
            state.queue.push_back(Box::pin(task));
            if state.workers < self.inner.max_parallelism {
                state.workers += 1;
                true
            } else {
                false
            }
        };

        if spawn_worker {
            let inner = self.inner.clone();
            tokio::spawn(worker_loop(inner));
        }
    }

    /// Number of tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let task = {
            let mut state = inner
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match state.queue.pop_front() {
                Some(task) => task,
                None => {
                    state.workers -= 1;
                    return;
                }
            }
        };

        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            trace!("work queue task panicked; discarded");
        }
    }
}
