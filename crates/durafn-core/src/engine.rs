// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine runtime.
//!
//! [`Engine`] ties the pieces together: it holds the store, the codec
//! registry, the unhandled-error sink and the invoker, and spawns one crashed
//! watchdog and one postponed watchdog per registered function type. The
//! engine embeds into an existing tokio application; nothing here owns a
//! process.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use durafn_core::engine::Engine;
//! use durafn_core::invoker::Verdict;
//! use durafn_core::storage::InMemoryFunctionStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::builder()
//!         .store(Arc::new(InMemoryFunctionStore::new()))
//!         .build()?;
//!
//!     let orders = engine.register("order-processing", |ctx| async move {
//!         Ok(Verdict::Succeed(ctx.param))
//!     })?;
//!     orders.invoke("order-17", serde_json::json!({"amount": 42})).await?;
//!
//!     // Graceful shutdown: drains in-flight invocations first.
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Settings;
use crate::crashed_watchdog::CrashedWatchdog;
use crate::error::{StoreError, UnhandledError};
use crate::invoker::{InvocationContext, InvokeOutcome, Invoker, RegisteredFunction, Verdict};
use crate::postponed_watchdog::PostponedWatchdog;
use crate::serializer::{Codec, CodecRegistry};
use crate::shutdown::InFlightTracker;
use crate::storage::{FunctionId, FunctionStore, Status, StoredFunction};
use crate::work_queue::WorkQueue;

/// The single registered callback receiving unhandled errors.
///
/// Framework failures and user-code failures arrive as distinct
/// [`UnhandledError`] variants. The default sink logs through `tracing`.
#[derive(Clone)]
pub struct ExceptionSink {
    callback: Arc<dyn Fn(UnhandledError) + Send + Sync>,
}

impl ExceptionSink {
    /// Create a sink from a callback.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(UnhandledError) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// A sink that only logs.
    pub fn log_only() -> Self {
        Self::new(|err| {
            error!(error = %err, framework = err.is_framework(), "Unhandled durable-function error");
        })
    }

    pub(crate) fn report(&self, err: UnhandledError) {
        (self.callback)(err);
    }
}

impl Default for ExceptionSink {
    fn default() -> Self {
        Self::log_only()
    }
}

impl std::fmt::Debug for ExceptionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionSink").finish_non_exhaustive()
    }
}

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    store: Option<Arc<dyn FunctionStore>>,
    settings: Settings,
    codecs: CodecRegistry,
    sink: ExceptionSink,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            settings: Settings::default(),
            codecs: CodecRegistry::new(),
            sink: ExceptionSink::log_only(),
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function store (required).
    pub fn store(mut self, store: Arc<dyn FunctionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the engine settings.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a payload codec under its tag.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.register(codec);
        self
    }

    /// Install the unhandled-error sink callback.
    pub fn on_unhandled<F>(mut self, callback: F) -> Self
    where
        F: Fn(UnhandledError) + Send + Sync + 'static,
    {
        self.sink = ExceptionSink::new(callback);
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> anyhow::Result<Engine> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        let codecs = Arc::new(self.codecs);
        let tracker = InFlightTracker::new();
        let invoker = Arc::new(Invoker::new(
            store.clone(),
            codecs.clone(),
            self.sink.clone(),
            tracker.clone(),
            self.settings.sign_of_life_frequency,
        ));

        let max_parallel = self.settings.max_parallel_reinvocations.max(1);
        Ok(Engine {
            inner: Arc::new(EngineInner {
                store,
                settings: self.settings,
                sink: self.sink,
                invoker,
                tracker,
                work_queue: WorkQueue::new(max_parallel),
                semaphore: Arc::new(Semaphore::new(max_parallel)),
                registrations: Mutex::new(HashMap::new()),
                watchdogs: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct WatchdogHandle {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct EngineInner {
    store: Arc<dyn FunctionStore>,
    settings: Settings,
    sink: ExceptionSink,
    invoker: Arc<Invoker>,
    tracker: InFlightTracker,
    /// Shared by the crashed watchdogs of all function types.
    work_queue: WorkQueue,
    /// Shared by the postponed watchdogs of all function types.
    semaphore: Arc<Semaphore>,
    registrations: Mutex<HashMap<String, Arc<RegisteredFunction>>>,
    watchdogs: Mutex<Vec<WatchdogHandle>>,
}

/// The durable-execution engine.
///
/// Cloneable handle; all clones share the same store, watchdogs and drain
/// state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Get a reference to the function store.
    pub fn store(&self) -> &Arc<dyn FunctionStore> {
        &self.inner.store
    }

    /// Register a function type and start its watchdogs.
    ///
    /// Must be called from within a tokio runtime. Payloads of the default
    /// registration use the plain JSON tag; custom codecs registered on the
    /// builder apply to instances created with matching tags.
    ///
    /// Returns an error when the type is already registered or the engine is
    /// shutting down.
    pub fn register<F, Fut>(&self, function_type: &str, func: F) -> anyhow::Result<FunctionHandle>
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
    {
        if self.inner.tracker.is_shutting_down() {
            anyhow::bail!("engine is shutting down");
        }

        let registered = Arc::new(RegisteredFunction::new(function_type, func));

        {
            let mut registrations = lock(&self.inner.registrations);
            if registrations.contains_key(function_type) {
                anyhow::bail!("function type '{}' is already registered", function_type);
            }
            registrations.insert(function_type.to_string(), registered.clone());
        }

        self.spawn_watchdogs(&registered);
        info!(function_type = %function_type, "Registered function type");

        Ok(FunctionHandle {
            invoker: self.inner.invoker.clone(),
            store: self.inner.store.clone(),
            func: registered,
        })
    }

    fn spawn_watchdogs(&self, registered: &Arc<RegisteredFunction>) {
        let crashed = CrashedWatchdog::new(
            registered.clone(),
            self.inner.store.clone(),
            self.inner.invoker.clone(),
            self.inner.work_queue.clone(),
            self.inner.settings.crashed_check_frequency,
            self.inner.sink.clone(),
        );
        let postponed = PostponedWatchdog::new(
            registered.clone(),
            self.inner.store.clone(),
            self.inner.invoker.clone(),
            self.inner.semaphore.clone(),
            self.inner.settings.postponed_check_frequency,
            self.inner.settings.delay_startup,
            self.inner.sink.clone(),
        );

        let mut watchdogs = lock(&self.inner.watchdogs);
        watchdogs.push(WatchdogHandle {
            shutdown: crashed.shutdown_handle(),
            handle: self.spawn_monitored(crashed.run(), "crashed_watchdog", registered),
        });
        watchdogs.push(WatchdogHandle {
            shutdown: postponed.shutdown_handle(),
            handle: self.spawn_monitored(postponed.run(), "postponed_watchdog", registered),
        });
    }

    /// Spawn a watchdog and a monitor that reports its death-by-panic to the
    /// sink. A panic ends only that watchdog's loop; siblings keep running.
    fn spawn_monitored<F>(
        &self,
        watchdog: F,
        component: &str,
        registered: &Arc<RegisteredFunction>,
    ) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let inner = tokio::spawn(watchdog);
        let sink = self.inner.sink.clone();
        let component = component.to_string();
        let function_type = registered.function_type.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.await
                && e.is_panic()
            {
                sink.report(UnhandledError::Framework {
                    component,
                    function_type,
                    message: "watchdog task panicked; its loop is terminated".to_string(),
                });
            }
        })
    }

    /// Gracefully shut down the engine.
    ///
    /// Stops admitting new invocations, signals every watchdog, then waits
    /// for all in-flight invocations to finish. Running invocations are never
    /// cancelled.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Engine shutting down...");
        self.inner.tracker.initiate_shutdown();
        self.inner.semaphore.close();

        let handles: Vec<WatchdogHandle> = std::mem::take(&mut *lock(&self.inner.watchdogs));
        for watchdog in &handles {
            watchdog.shutdown.notify_one();
        }

        self.inner.tracker.wait_idle().await;

        for watchdog in handles {
            if let Err(e) = watchdog.handle.await {
                error!(error = %e, "Watchdog monitor task failed during shutdown");
            }
        }

        info!("Engine shutdown complete");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one registered function type.
#[derive(Clone)]
pub struct FunctionHandle {
    invoker: Arc<Invoker>,
    store: Arc<dyn FunctionStore>,
    func: Arc<RegisteredFunction>,
}

impl FunctionHandle {
    /// The registered function type.
    pub fn function_type(&self) -> &str {
        &self.func.function_type
    }

    /// Invoke the function for `instance`, running it to its first verdict.
    ///
    /// A failed verdict is reflected in the returned outcome and the stored
    /// state; it is not reported to the unhandled-error sink.
    pub async fn invoke(&self, instance: &str, param: Value) -> Result<InvokeOutcome, StoreError> {
        let id = FunctionId::new(self.func.function_type.clone(), instance);
        self.invoker.invoke(&id, &self.func, param).await
    }

    /// Create the instance without running it.
    ///
    /// The crashed watchdog observes the never-beating heartbeat and performs
    /// the first execution; latency is about two check intervals. Returns
    /// `false` if the instance already exists.
    pub async fn schedule(&self, instance: &str, param: Value) -> Result<bool, StoreError> {
        let id = FunctionId::new(self.func.function_type.clone(), instance);
        let payload = self
            .invoker
            .codecs()
            .encode(&self.func.param_tag, &param)
            .map_err(|e| StoreError::Payload(e.to_string()))?;
        let created = self
            .store
            .create_function(
                &id,
                &payload,
                self.func.scrapbook_tag.as_deref(),
                Status::Executing,
                0,
                0,
            )
            .await?;
        Ok(created)
    }

    /// Full snapshot of one instance, `None` if it was never created.
    pub async fn get(&self, instance: &str) -> Result<Option<StoredFunction>, StoreError> {
        let id = FunctionId::new(self.func.function_type.clone(), instance);
        self.store.get_function(&id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryFunctionStore;
    use serde_json::json;
    use std::time::Duration;

    fn test_settings() -> Settings {
        Settings {
            crashed_check_frequency: Duration::from_millis(50),
            postponed_check_frequency: Duration::from_millis(50),
            delay_startup: Duration::ZERO,
            sign_of_life_frequency: Duration::from_millis(20),
            max_parallel_reinvocations: 4,
        }
    }

    #[test]
    fn test_builder_missing_store() {
        let result = EngineBuilder::new().build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("store is required"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_register_duplicate_type_fails() {
        let engine = Engine::builder()
            .store(Arc::new(InMemoryFunctionStore::new()))
            .settings(test_settings())
            .build()
            .unwrap();

        engine
            .register("t", |_| async { Ok(Verdict::Succeed(json!(null))) })
            .unwrap();
        let duplicate = engine.register("t", |_| async { Ok(Verdict::Succeed(json!(null))) });
        assert!(duplicate.is_err());

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invoke_through_handle() {
        let engine = Engine::builder()
            .store(Arc::new(InMemoryFunctionStore::new()))
            .settings(test_settings())
            .build()
            .unwrap();

        let handle = engine
            .register("greeter", |ctx| async move {
                let name = ctx.param.as_str().unwrap_or("world").to_string();
                Ok(Verdict::Succeed(json!(format!("hello {name}"))))
            })
            .unwrap();

        let outcome = handle.invoke("i", json!("durafn")).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::Completed(Status::Succeeded));

        let snapshot = handle.get("i").await.unwrap().unwrap();
        assert_eq!(snapshot.result.unwrap().json, "\"hello durafn\"");

        engine.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_drains_in_flight_invocation() {
        let engine = Engine::builder()
            .store(Arc::new(InMemoryFunctionStore::new()))
            .settings(test_settings())
            .build()
            .unwrap();

        let handle = engine
            .register("slow", |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(Verdict::Succeed(json!("finished")))
            })
            .unwrap();

        let invocation = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.invoke("i", json!(null)).await })
        };
        // Let the invocation get admitted before shutting down.
        tokio::time::sleep(Duration::from_millis(50)).await;

        engine.shutdown().await.unwrap();

        // Shutdown returned only after the invocation finished.
        let outcome = invocation.await.unwrap().unwrap();
        assert_eq!(outcome, InvokeOutcome::Completed(Status::Succeeded));
        let snapshot = handle.get("i").await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Succeeded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invoke_after_shutdown_is_denied() {
        let engine = Engine::builder()
            .store(Arc::new(InMemoryFunctionStore::new()))
            .settings(test_settings())
            .build()
            .unwrap();
        let handle = engine
            .register("t", |_| async { Ok(Verdict::Succeed(json!(null))) })
            .unwrap();

        engine.shutdown().await.unwrap();

        let outcome = handle.invoke("i", json!(null)).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::ShuttingDown);
        assert!(handle.get("i").await.unwrap().is_none());

        let late_registration = engine.register("late", |_| async {
            Ok(Verdict::Succeed(json!(null)))
        });
        assert!(late_registration.is_err());
    }
}
