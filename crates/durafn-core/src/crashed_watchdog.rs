// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for detecting and reinvoking crashed executors.
//!
//! An executor that owns an epoch advances the instance's sign of life on a
//! timer. This watchdog snapshots all `Executing` instances of one function
//! type every `check_frequency` and compares against the previous snapshot:
//! an instance whose `(epoch, sign_of_life)` did not move across one full
//! interval has a dead or stalled executor. Detection is deliberately this
//! simple - two samples, one interval apart. A slow-but-alive executor can be
//! misjudged and draw a concurrent reinvocation attempt, which stays safe
//! because leader election still admits exactly one owner per epoch.
//!
//! Hanging instances are enqueued in randomized order on a bounded work
//! queue; each work item performs its own leader election through the
//! invoker, so duplicate detections collapse to one winner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::engine::ExceptionSink;
use crate::error::{StoreError, UnhandledError};
use crate::invoker::{Invoker, RegisteredFunction};
use crate::storage::{FunctionId, FunctionStore, Status};
use crate::work_queue::WorkQueue;

/// Background worker reinvoking instances whose executor stopped heartbeating.
pub(crate) struct CrashedWatchdog {
    func: Arc<RegisteredFunction>,
    store: Arc<dyn FunctionStore>,
    invoker: Arc<Invoker>,
    work_queue: WorkQueue,
    check_frequency: Duration,
    sink: ExceptionSink,
    shutdown: Arc<Notify>,
}

impl CrashedWatchdog {
    pub(crate) fn new(
        func: Arc<RegisteredFunction>,
        store: Arc<dyn FunctionStore>,
        invoker: Arc<Invoker>,
        work_queue: WorkQueue,
        check_frequency: Duration,
        sink: ExceptionSink,
    ) -> Self {
        Self {
            func,
            store,
            invoker,
            work_queue,
            check_frequency,
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
    /// A zero check frequency disables crash detection permanently: the loop
    /// never starts. Per-tick store failures are reported to the sink and the
    /// loop proceeds; only the shutdown signal ends it.
    pub(crate) async fn run(self) {
        let function_type = self.func.function_type.clone();
        if self.check_frequency.is_zero() {
            info!(function_type = %function_type, "Crashed watchdog disabled (zero check frequency)");
            return;
        }

        info!(
            function_type = %function_type,
            check_frequency_ms = self.check_frequency.as_millis() as u64,
            "Crashed watchdog started"
        );

        let mut previous: HashMap<String, (i32, i32)> = HashMap::new();
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(function_type = %function_type, "Crashed watchdog received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.check_frequency) => {
                    if let Err(e) = self.tick(&mut previous).await {
                        self.sink.report(UnhandledError::Framework {
                            component: "crashed_watchdog".to_string(),
                            function_type: function_type.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        info!(function_type = %function_type, "Crashed watchdog stopped");
    }

    /// One poll: snapshot `Executing` instances, join against the previous
    /// snapshot, and enqueue reinvocation work for every hanging instance.
    async fn tick(&self, previous: &mut HashMap<String, (i32, i32)>) -> Result<(), StoreError> {
        let executing = self
            .store
            .get_functions_with_status(&self.func.function_type, Status::Executing, None)
            .await?;

        let current: HashMap<String, (i32, i32)> = executing
            .into_iter()
            .map(|f| (f.instance, (f.epoch, f.sign_of_life)))
            .collect();

        // Hanging = identical (instance, epoch, sign_of_life) across one full
        // poll interval.
        let mut hanging: Vec<(String, i32)> = current
            .iter()
            .filter(|(instance, signature)| previous.get(*instance) == Some(signature))
            .map(|(instance, (epoch, _))| (instance.clone(), *epoch))
            .collect();
        *previous = current;

        if hanging.is_empty() {
            debug!(function_type = %self.func.function_type, "No hanging functions found");
            return Ok(());
        }

        // Randomized order so contiguous instance ids do not get a systematic
        // head start across ticks.
        fastrand::shuffle(&mut hanging);

        info!(
            function_type = %self.func.function_type,
            count = hanging.len(),
            "Found hanging functions to reinvoke"
        );

        for (instance, epoch) in hanging {
            let invoker = self.invoker.clone();
            let func = self.func.clone();
            let sink = self.sink.clone();
            let id = FunctionId::new(self.func.function_type.clone(), instance);

            self.work_queue.enqueue(async move {
                match invoker
                    .reinvoke(&id, &func, &[Status::Executing], epoch)
                    .await
                {
                    // Benign outcomes (lost election, instance progressed,
                    // engine draining) need no action: the instance is owned
                    // or gone either way.
                    Ok(_) => {}
                    Err(e) => sink.report(UnhandledError::Framework {
                        component: "crashed_watchdog".to_string(),
                        function_type: func.function_type.clone(),
                        message: format!("reinvocation of '{}' failed: {}", id, e),
                    }),
                }
            });
        }

        Ok(())
    }
}
