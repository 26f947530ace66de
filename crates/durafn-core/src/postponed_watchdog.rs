// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for reinvoking postponed functions when they fall due.
//!
//! Every `check_frequency` the watchdog scans for `Postponed` instances due
//! within the next interval - the lookahead window keeps instances from being
//! missed between two polls. Each candidate gets its own task that waits out
//! the remaining time, takes a permit from the shared reinvocation semaphore,
//! and then performs the `Postponed → Executing` leader election before
//! handing the instance to the invoker. Losing the election just means some
//! other poller got there first.
//!
//! The permit is an owned semaphore permit released on drop, so every exit
//! path - success, lost election, store error - returns it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::engine::ExceptionSink;
use crate::error::{StoreError, UnhandledError};
use crate::invoker::{Invoker, RegisteredFunction};
use crate::storage::{FunctionId, FunctionStore, Status};

/// Background worker scheduling due postponed functions for reinvocation.
pub(crate) struct PostponedWatchdog {
    func: Arc<RegisteredFunction>,
    store: Arc<dyn FunctionStore>,
    invoker: Arc<Invoker>,
    semaphore: Arc<Semaphore>,
    check_frequency: Duration,
    delay_startup: Duration,
    sink: ExceptionSink,
    shutdown: Arc<Notify>,
}

impl PostponedWatchdog {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        func: Arc<RegisteredFunction>,
        store: Arc<dyn FunctionStore>,
        invoker: Arc<Invoker>,
        semaphore: Arc<Semaphore>,
        check_frequency: Duration,
        delay_startup: Duration,
        sink: ExceptionSink,
    ) -> Self {
        Self {
            func,
            store,
            invoker,
            semaphore,
            check_frequency,
            delay_startup,
            sink,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub(crate) fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the watchdog loop.
    ///
    /// A zero check frequency disables postponed retries permanently. The
    /// optional startup delay runs before the first poll and is interruptible
    /// by shutdown.
    pub(crate) async fn run(self) {
        let function_type = self.func.function_type.clone();
        if self.check_frequency.is_zero() {
            info!(function_type = %function_type, "Postponed watchdog disabled (zero check frequency)");
            return;
        }

        info!(
            function_type = %function_type,
            check_frequency_ms = self.check_frequency.as_millis() as u64,
            delay_startup_ms = self.delay_startup.as_millis() as u64,
            "Postponed watchdog started"
        );

        if !self.delay_startup.is_zero() {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!(function_type = %function_type, "Postponed watchdog received shutdown signal");
                    return;
                }
                _ = tokio::time::sleep(self.delay_startup) => {}
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(function_type = %function_type, "Postponed watchdog received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.check_frequency) => {
                    if let Err(e) = self.tick().await {
                        self.sink.report(UnhandledError::Framework {
                            component: "postponed_watchdog".to_string(),
                            function_type: function_type.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        info!(function_type = %function_type, "Postponed watchdog stopped");
    }

    /// One poll: fetch instances due within the lookahead window and spawn a
    /// waiter task per candidate.
    async fn tick(&self) -> Result<(), StoreError> {
        let window_end = Utc::now()
            + chrono::Duration::from_std(self.check_frequency).unwrap_or(chrono::Duration::zero());
        let due = self
            .store
            .get_functions_with_status(&self.func.function_type, Status::Postponed, Some(window_end))
            .await?;

        if due.is_empty() {
            debug!(function_type = %self.func.function_type, "No postponed functions due");
            return Ok(());
        }

        debug!(
            function_type = %self.func.function_type,
            count = due.len(),
            "Scheduling due postponed functions"
        );

        for candidate in due {
            let Some(due_at) = candidate.postponed_until else {
                // Postponed rows always carry a due time; skip rather than
                // guess one.
                warn!(
                    function_type = %self.func.function_type,
                    instance = %candidate.instance,
                    "Postponed function without due time; skipping"
                );
                continue;
            };

            let invoker = self.invoker.clone();
            let func = self.func.clone();
            let store = self.store.clone();
            let sink = self.sink.clone();
            let semaphore = self.semaphore.clone();
            let id = FunctionId::new(self.func.function_type.clone(), candidate.instance);
            let expected_epoch = candidate.epoch;

            tokio::spawn(async move {
                wait_until(due_at).await;

                let Ok(_permit) = semaphore.acquire_owned().await else {
                    // Semaphore closed: engine is gone.
                    return;
                };
                if invoker.tracker().is_shutting_down() {
                    return;
                }
                // Waiting for the permit may have outrun the timer wheel;
                // the due time must have genuinely passed before election.
                wait_until(due_at).await;

                let new_epoch = expected_epoch + 1;
                let elected = store
                    .try_to_become_leader(&id, Status::Executing, expected_epoch, new_epoch)
                    .await;
                match elected {
                    Ok(outcome) if outcome.applied() => {
                        match invoker
                            .reinvoke(&id, &func, &[Status::Executing], new_epoch)
                            .await
                        {
                            Ok(_) => {}
                            Err(e) => sink.report(UnhandledError::Framework {
                                component: "postponed_watchdog".to_string(),
                                function_type: func.function_type.clone(),
                                message: format!("reinvocation of '{}' failed: {}", id, e),
                            }),
                        }
                    }
                    // Lost election: another poller or process owns it now.
                    Ok(_) => {
                        debug!(function_id = %id, "lost postponed election");
                    }
                    Err(e) => sink.report(UnhandledError::Framework {
                        component: "postponed_watchdog".to_string(),
                        function_type: func.function_type.clone(),
                        message: format!("election for '{}' failed: {}", id, e),
                    }),
                }
            });
        }

        Ok(())
    }
}

/// Sleep until `deadline`, finishing with a tight wait loop that corrects for
/// timer granularity.
async fn wait_until(deadline: DateTime<Utc>) {
    let now = Utc::now();
    if deadline > now
        && let Ok(remaining) = (deadline - now).to_std()
    {
        tokio::time::sleep(remaining).await;
    }
    while Utc::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
