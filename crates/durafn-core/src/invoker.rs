// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation state machine.
//!
//! One invocation moves through `NotLeader` (abort, no side effects) →
//! `Executing` → `Completed`. Leadership is decided solely by the store's
//! epoch CAS, so any number of duplicate triggers - watchdog-driven and
//! caller-driven - collapse to exactly one running executor. While user code
//! runs, a background heartbeat advances the instance's sign of life; the
//! declared verdict is persisted with exactly one `set_function_state` call
//! at the owned epoch.
//!
//! User code can fail however it wants - an `Err`, a panic - and the failure
//! is contained here and mapped to a `Failed` verdict. Nothing user code does
//! propagates past this module.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::ExceptionSink;
use crate::error::{StoreError, UnhandledError};
use crate::serializer::{CodecRegistry, JSON_TAG};
use crate::shutdown::{InFlightGuard, InFlightTracker};
use crate::storage::{CasOutcome, FunctionId, FunctionStore, Payload, Status};

/// Outcome declared by user code for one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The invocation is done; persist the result and stop retrying.
    Succeed(Value),
    /// Retry at or after the given time.
    Postpone(DateTime<Utc>),
    /// The invocation failed terminally; persist the failure.
    Fail(String),
}

/// Outcome of a caller-driven invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// The function ran and its verdict was persisted with this status.
    Completed(Status),
    /// An instance with this id already exists; nothing was run.
    AlreadyExists,
    /// Another executor took over the epoch mid-run; its outcome, not this
    /// one, is the persisted truth.
    Superseded,
    /// The engine is draining; the instance was not created.
    ShuttingDown,
}

/// Outcome of an unattended (watchdog-driven) reinvocation. Every variant
/// except `Completed` is a benign race and is simply dropped by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReinvokeOutcome {
    /// The function ran and its verdict was persisted with this status.
    Completed(Status),
    /// Lost the leader election.
    NotLeader,
    /// The instance progressed since it was scanned.
    UnexpectedState,
    /// The instance does not exist.
    NotFound,
    /// Another executor took over the epoch mid-run.
    Superseded,
    /// The engine is draining.
    ShuttingDown,
}

/// Type-erased user function.
pub(crate) type UserFunction =
    Arc<dyn Fn(InvocationContext) -> BoxFuture<'static, anyhow::Result<Verdict>> + Send + Sync>;

/// A registered function type: the user code plus its payload tags.
pub(crate) struct RegisteredFunction {
    pub function_type: String,
    pub run: UserFunction,
    pub param_tag: String,
    pub result_tag: String,
    pub scrapbook_tag: Option<String>,
}

impl RegisteredFunction {
    /// Wrap an async closure with the default JSON payload tags.
    pub(crate) fn new<F, Fut>(function_type: &str, func: F) -> Self
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
    {
        Self {
            function_type: function_type.to_string(),
            run: Arc::new(move |ctx| {
                let fut: BoxFuture<'static, anyhow::Result<Verdict>> = Box::pin(func(ctx));
                fut
            }),
            param_tag: JSON_TAG.to_string(),
            result_tag: JSON_TAG.to_string(),
            scrapbook_tag: Some(JSON_TAG.to_string()),
        }
    }
}

/// Everything user code receives for one execution attempt.
pub struct InvocationContext {
    /// The invocation this attempt belongs to.
    pub id: FunctionId,
    /// The decoded invocation parameter.
    pub param: Value,
    /// Durable user state; survives crashes once saved.
    pub scrapbook: Scrapbook,
}

struct ScrapbookInner {
    id: FunctionId,
    epoch: i32,
    store: Arc<dyn FunctionStore>,
    value: Mutex<Value>,
}

/// Durable user-defined state for one instance.
///
/// Mutations are in-memory until [`save`](Self::save) persists them under the
/// current epoch, independent of the final result commit. The value as of the
/// final commit is persisted together with the verdict either way.
#[derive(Clone)]
pub struct Scrapbook {
    inner: Arc<ScrapbookInner>,
}

impl Scrapbook {
    fn new(id: FunctionId, epoch: i32, store: Arc<dyn FunctionStore>, initial: Value) -> Self {
        Self {
            inner: Arc::new(ScrapbookInner {
                id,
                epoch,
                store,
                value: Mutex::new(initial),
            }),
        }
    }

    /// Current in-memory value. `Null` until first set or saved value loaded.
    pub fn get(&self) -> Value {
        self.lock().clone()
    }

    /// Replace the in-memory value. Not persisted until [`save`](Self::save).
    pub fn set(&self, value: Value) {
        *self.lock() = value;
    }

    /// Persist the current value immediately under the owning epoch.
    ///
    /// Returns [`CasOutcome::Stale`] if the epoch has moved on, in which case
    /// the write did not happen; the final `set_function_state` is the
    /// authoritative failure signal for that situation.
    pub async fn save(&self) -> Result<CasOutcome, StoreError> {
        let json = self.to_json();
        self.inner
            .store
            .update_scrapbook(&self.inner.id, &json, self.inner.epoch)
            .await
    }

    fn to_json(&self) -> String {
        serde_json::to_string(&*self.lock()).unwrap_or_else(|_| "null".to_string())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Value> {
        self.inner
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs invocations: elects a leader, executes user code, persists the verdict.
pub(crate) struct Invoker {
    store: Arc<dyn FunctionStore>,
    codecs: Arc<CodecRegistry>,
    sink: ExceptionSink,
    tracker: InFlightTracker,
    sign_of_life_frequency: Duration,
}

impl Invoker {
    pub(crate) fn new(
        store: Arc<dyn FunctionStore>,
        codecs: Arc<CodecRegistry>,
        sink: ExceptionSink,
        tracker: InFlightTracker,
        sign_of_life_frequency: Duration,
    ) -> Self {
        Self {
            store,
            codecs,
            sink,
            tracker,
            sign_of_life_frequency,
        }
    }

    pub(crate) fn tracker(&self) -> &InFlightTracker {
        &self.tracker
    }

    pub(crate) fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Caller-driven invocation: create the instance at epoch 0 and run it.
    ///
    /// A `Failed` verdict is returned to the caller here, not reported to the
    /// sink; the sink is reserved for unattended reinvocations.
    pub(crate) async fn invoke(
        &self,
        id: &FunctionId,
        func: &RegisteredFunction,
        param: Value,
    ) -> Result<InvokeOutcome, StoreError> {
        let Some(guard) = self.tracker.begin() else {
            return Ok(InvokeOutcome::ShuttingDown);
        };

        let payload = self
            .codecs
            .encode(&func.param_tag, &param)
            .map_err(|e| StoreError::Payload(e.to_string()))?;
        let created = self
            .store
            .create_function(
                id,
                &payload,
                func.scrapbook_tag.as_deref(),
                Status::Executing,
                0,
                0,
            )
            .await?;
        if !created {
            return Ok(InvokeOutcome::AlreadyExists);
        }
        debug!(function_id = %id, "created function instance");

        match self
            .execute(id, func, &payload, None, 0, 0, false, guard)
            .await?
        {
            Some(status) => Ok(InvokeOutcome::Completed(status)),
            None => Ok(InvokeOutcome::Superseded),
        }
    }

    /// Unattended reinvocation of an existing instance at a known epoch.
    pub(crate) async fn reinvoke(
        &self,
        id: &FunctionId,
        func: &RegisteredFunction,
        expected_statuses: &[Status],
        expected_epoch: i32,
    ) -> Result<ReinvokeOutcome, StoreError> {
        let Some(guard) = self.tracker.begin() else {
            return Ok(ReinvokeOutcome::ShuttingDown);
        };

        let Some(snapshot) = self.store.get_function(id).await? else {
            return Ok(ReinvokeOutcome::NotFound);
        };
        if !expected_statuses.contains(&snapshot.status) || snapshot.epoch != expected_epoch {
            return Ok(ReinvokeOutcome::UnexpectedState);
        }

        let new_epoch = expected_epoch + 1;
        let elected = self
            .store
            .try_to_become_leader(id, Status::Executing, expected_epoch, new_epoch)
            .await?;
        if !elected.applied() {
            return Ok(ReinvokeOutcome::NotLeader);
        }
        debug!(function_id = %id, epoch = new_epoch, "became leader for reinvocation");

        match self
            .execute(
                id,
                func,
                &snapshot.parameter,
                snapshot.scrapbook.as_ref(),
                snapshot.sign_of_life,
                new_epoch,
                true,
                guard,
            )
            .await?
        {
            Some(status) => Ok(ReinvokeOutcome::Completed(status)),
            None => Ok(ReinvokeOutcome::Superseded),
        }
    }

    /// Run user code at an owned epoch and persist the verdict.
    ///
    /// Returns `Ok(None)` when the final CAS lost, meaning another executor
    /// took over the instance and this attempt's outcome was discarded.
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        id: &FunctionId,
        func: &RegisteredFunction,
        parameter: &Payload,
        scrapbook_payload: Option<&Payload>,
        sign_of_life: i32,
        epoch: i32,
        unattended: bool,
        _guard: InFlightGuard,
    ) -> Result<Option<Status>, StoreError> {
        let heartbeat = Heartbeat::start(
            self.store.clone(),
            id.clone(),
            epoch,
            sign_of_life,
            self.sign_of_life_frequency,
        );

        let decoded = self.codecs.decode(parameter).and_then(|param| {
            let scrapbook = match scrapbook_payload {
                None => Value::Null,
                Some(payload) => self.codecs.decode(payload)?,
            };
            Ok((param, scrapbook))
        });

        // A payload that cannot be decoded fails the invocation terminally;
        // leaving it `Executing` would make the crashed watchdog retry a
        // permanently broken instance forever.
        let (verdict, scrapbook_json) = match decoded {
            Err(e) => (Verdict::Fail(e.to_string()), None),
            Ok((param, initial)) => {
                let scrapbook = Scrapbook::new(id.clone(), epoch, self.store.clone(), initial);
                let ctx = InvocationContext {
                    id: id.clone(),
                    param,
                    scrapbook: scrapbook.clone(),
                };
                let verdict = run_user_code((func.run)(ctx)).await;
                (verdict, Some(scrapbook.to_json()))
            }
        };

        let (verdict, result_payload) = match verdict {
            Verdict::Succeed(value) => match self.codecs.encode(&func.result_tag, &value) {
                Ok(payload) => (Verdict::Succeed(value), Some(payload)),
                Err(e) => (Verdict::Fail(format!("result encoding failed: {e}")), None),
            },
            other => (other, None),
        };

        let cas = match &verdict {
            Verdict::Succeed(_) => {
                self.store
                    .set_function_state(
                        id,
                        Status::Succeeded,
                        scrapbook_json.as_deref(),
                        result_payload.as_ref(),
                        None,
                        None,
                        epoch,
                    )
                    .await?
            }
            Verdict::Postpone(until) => {
                self.store
                    .set_function_state(
                        id,
                        Status::Postponed,
                        scrapbook_json.as_deref(),
                        None,
                        None,
                        Some(*until),
                        epoch,
                    )
                    .await?
            }
            Verdict::Fail(message) => {
                let failure = serde_json::json!({ "message": message }).to_string();
                self.store
                    .set_function_state(
                        id,
                        Status::Failed,
                        scrapbook_json.as_deref(),
                        None,
                        Some(&failure),
                        None,
                        epoch,
                    )
                    .await?
            }
        };
        heartbeat.stop();

        if !cas.applied() {
            debug!(function_id = %id, epoch, "function state advanced elsewhere; outcome discarded");
            return Ok(None);
        }

        let status = match verdict {
            Verdict::Succeed(_) => Status::Succeeded,
            Verdict::Postpone(until) => {
                debug!(function_id = %id, postponed_until = %until, "function postponed");
                Status::Postponed
            }
            Verdict::Fail(message) => {
                if unattended {
                    self.sink.report(UnhandledError::UserCode {
                        function_id: id.clone(),
                        message,
                    });
                }
                Status::Failed
            }
        };
        Ok(Some(status))
    }
}

/// Run the user future in its own task so a panic is contained as a verdict.
async fn run_user_code(fut: BoxFuture<'static, anyhow::Result<Verdict>>) -> Verdict {
    match tokio::spawn(fut).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(error)) => Verdict::Fail(error.to_string()),
        Err(join_error) => {
            if join_error.is_panic() {
                Verdict::Fail(panic_message(join_error.into_panic()))
            } else {
                Verdict::Fail("user task was cancelled".to_string())
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("user code panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("user code panicked: {message}")
    } else {
        "user code panicked".to_string()
    }
}

/// Background heartbeat for one owned epoch. Aborted on stop or drop so a
/// stray write cannot land after the terminal state is recorded.
struct Heartbeat {
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn start(
        store: Arc<dyn FunctionStore>,
        id: FunctionId,
        epoch: i32,
        mut counter: i32,
        frequency: Duration,
    ) -> Self {
        if frequency.is_zero() {
            return Self { handle: None };
        }
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(frequency).await;
                counter += 1;
                match store.update_sign_of_life(&id, epoch, counter).await {
                    Ok(CasOutcome::Applied) => {}
                    Ok(_) => {
                        debug!(function_id = %id, epoch, "epoch no longer owned; heartbeat stopped");
                        break;
                    }
                    Err(e) => {
                        // Transient; the next beat retries.
                        warn!(function_id = %id, error = %e, "heartbeat write failed");
                    }
                }
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    fn stop(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryFunctionStore;
    use serde_json::json;

    struct Harness {
        invoker: Invoker,
        store: Arc<dyn FunctionStore>,
        reported: Arc<Mutex<Vec<UnhandledError>>>,
    }

    fn harness() -> Harness {
        let store: Arc<dyn FunctionStore> = Arc::new(InMemoryFunctionStore::new());
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let reported = reported.clone();
            ExceptionSink::new(move |error| reported.lock().unwrap().push(error))
        };
        let invoker = Invoker::new(
            store.clone(),
            Arc::new(CodecRegistry::new()),
            sink,
            InFlightTracker::new(),
            Duration::from_millis(20),
        );
        Harness {
            invoker,
            store,
            reported,
        }
    }

    fn function<F, Fut>(f: F) -> RegisteredFunction
    where
        F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Verdict>> + Send + 'static,
    {
        RegisteredFunction::new("t", f)
    }

    #[tokio::test]
    async fn test_invoke_success_persists_result() {
        let h = harness();
        let func = function(|ctx| async move {
            let name = ctx.param.as_str().unwrap_or("world").to_string();
            Ok(Verdict::Succeed(json!(format!("hello {name}"))))
        });
        let id = FunctionId::new("t", "i");

        let outcome = h.invoker.invoke(&id, &func, json!("durafn")).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::Completed(Status::Succeeded));

        let snapshot = h.store.get_function(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Succeeded);
        assert_eq!(snapshot.result.unwrap().json, "\"hello durafn\"");
        assert_eq!(snapshot.epoch, 1);
        assert!(h.reported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_duplicate_instance() {
        let h = harness();
        let func = function(|_| async { Ok(Verdict::Succeed(json!(null))) });
        let id = FunctionId::new("t", "i");

        h.invoker.invoke(&id, &func, json!(1)).await.unwrap();
        let outcome = h.invoker.invoke(&id, &func, json!(2)).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn test_invoke_user_error_fails_without_sink_report() {
        let h = harness();
        let func = function(|_| async { Err(anyhow::anyhow!("payment declined")) });
        let id = FunctionId::new("t", "i");

        let outcome = h.invoker.invoke(&id, &func, json!("hello")).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::Completed(Status::Failed));

        let snapshot = h.store.get_function(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Failed);
        let failure: Value = serde_json::from_str(&snapshot.failure.unwrap()).unwrap();
        assert_eq!(failure["message"], "payment declined");

        // Caller-driven failures go to the caller, not the sink.
        assert!(h.reported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_contains_user_panic() {
        let h = harness();
        let func = function(|_| async { panic!("boom") });
        let id = FunctionId::new("t", "i");

        let outcome = h.invoker.invoke(&id, &func, json!(null)).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::Completed(Status::Failed));

        let snapshot = h.store.get_function(&id).await.unwrap().unwrap();
        assert!(snapshot.failure.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_reinvoke_benign_aborts() {
        let h = harness();
        let func = function(|_| async { Ok(Verdict::Succeed(json!(null))) });
        let id = FunctionId::new("t", "i");

        // Never created.
        assert_eq!(
            h.invoker
                .reinvoke(&id, &func, &[Status::Executing], 0)
                .await
                .unwrap(),
            ReinvokeOutcome::NotFound
        );

        // Already terminal.
        h.invoker.invoke(&id, &func, json!(null)).await.unwrap();
        assert_eq!(
            h.invoker
                .reinvoke(&id, &func, &[Status::Executing], 1)
                .await
                .unwrap(),
            ReinvokeOutcome::UnexpectedState
        );
    }

    #[tokio::test]
    async fn test_reinvoke_runs_stuck_instance_and_bumps_epoch() {
        let h = harness();
        let func = function(|_| async { Ok(Verdict::Succeed(json!("recovered"))) });
        let id = FunctionId::new("t", "i");

        // Simulate a crashed executor: row exists at epoch 0, nobody running.
        h.store
            .create_function(
                &id,
                &Payload::new("\"hello\"", "json"),
                None,
                Status::Executing,
                0,
                0,
            )
            .await
            .unwrap();

        let outcome = h
            .invoker
            .reinvoke(&id, &func, &[Status::Executing], 0)
            .await
            .unwrap();
        assert_eq!(outcome, ReinvokeOutcome::Completed(Status::Succeeded));

        let snapshot = h.store.get_function(&id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, Status::Succeeded);
        // Leader election bumped to 1, the commit to 2.
        assert_eq!(snapshot.epoch, 2);
    }

    #[tokio::test]
    async fn test_reinvoke_user_failure_reports_to_sink() {
        let h = harness();
        let func = function(|_| async { Err(anyhow::anyhow!("still broken")) });
        let id = FunctionId::new("t", "i");
        h.store
            .create_function(
                &id,
                &Payload::new("\"hello\"", "json"),
                None,
                Status::Executing,
                0,
                0,
            )
            .await
            .unwrap();

        let outcome = h
            .invoker
            .reinvoke(&id, &func, &[Status::Executing], 0)
            .await
            .unwrap();
        assert_eq!(outcome, ReinvokeOutcome::Completed(Status::Failed));

        let reported = h.reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        match &reported[0] {
            UnhandledError::UserCode {
                function_id,
                message,
            } => {
                assert_eq!(function_id, &id);
                assert_eq!(message, "still broken");
            }
            other => panic!("expected user-code error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scrapbook_saved_mid_run_and_at_commit() {
        let h = harness();
        let func = function(|ctx| async move {
            ctx.scrapbook.set(json!({"step": 1}));
            let saved = ctx.scrapbook.save().await?;
            assert!(saved.applied());
            ctx.scrapbook.set(json!({"step": 2}));
            Ok(Verdict::Succeed(json!(null)))
        });
        let id = FunctionId::new("t", "i");

        h.invoker.invoke(&id, &func, json!(null)).await.unwrap();

        let snapshot = h.store.get_function(&id).await.unwrap().unwrap();
        // The commit persisted the final in-memory value.
        assert_eq!(snapshot.scrapbook.unwrap().json, "{\"step\":2}");
    }

    #[tokio::test]
    async fn test_heartbeat_advances_sign_of_life() {
        let h = harness();
        let func = function(|_| async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok(Verdict::Succeed(json!(null)))
        });
        let id = FunctionId::new("t", "i");

        h.invoker.invoke(&id, &func, json!(null)).await.unwrap();

        let snapshot = h.store.get_function(&id).await.unwrap().unwrap();
        // sign_of_life_frequency is 20ms; a 120ms run must have beaten at least once.
        assert!(snapshot.sign_of_life >= 1);
    }

    #[tokio::test]
    async fn test_invoke_denied_during_shutdown() {
        let h = harness();
        let func = function(|_| async { Ok(Verdict::Succeed(json!(null))) });
        h.invoker.tracker().initiate_shutdown();

        let outcome = h
            .invoker
            .invoke(&FunctionId::new("t", "i"), &func, json!(null))
            .await
            .unwrap();
        assert_eq!(outcome, InvokeOutcome::ShuttingDown);
    }
}
