// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for durafn-core integration tests.
//!
//! Provides a TestContext wiring an engine to an in-memory store with fast
//! watchdog settings and a capturing unhandled-error sink.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use durafn_core::config::Settings;
use durafn_core::engine::Engine;
use durafn_core::error::UnhandledError;
use durafn_core::storage::{
    FunctionId, FunctionStore, InMemoryFunctionStore, Status, StoredFunction,
};

/// Engine plus the hooks tests need to observe it.
pub struct TestContext {
    pub engine: Engine,
    pub store: Arc<dyn FunctionStore>,
    pub reported: Arc<Mutex<Vec<UnhandledError>>>,
}

/// Millisecond-scale settings so watchdog behavior is observable in tests.
pub fn fast_settings() -> Settings {
    Settings {
        crashed_check_frequency: Duration::from_millis(50),
        postponed_check_frequency: Duration::from_millis(100),
        delay_startup: Duration::ZERO,
        sign_of_life_frequency: Duration::from_millis(20),
        max_parallel_reinvocations: 4,
    }
}

impl TestContext {
    pub fn new(settings: Settings) -> Self {
        // Honor RUST_LOG when debugging tests; ignore the error when another
        // test in the process already installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let store: Arc<dyn FunctionStore> = Arc::new(InMemoryFunctionStore::new());
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink_log = reported.clone();
        let engine = Engine::builder()
            .store(store.clone())
            .settings(settings)
            .on_unhandled(move |error| sink_log.lock().unwrap().push(error))
            .build()
            .expect("engine build failed");
        Self {
            engine,
            store,
            reported,
        }
    }

    pub fn user_failures(&self) -> Vec<UnhandledError> {
        self.reported
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !e.is_framework())
            .cloned()
            .collect()
    }

    pub fn framework_failures(&self) -> Vec<UnhandledError> {
        self.reported
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_framework())
            .cloned()
            .collect()
    }
}

/// Poll the store until `id` reaches `status` or the timeout elapses.
pub async fn wait_for_status(
    store: &Arc<dyn FunctionStore>,
    id: &FunctionId,
    status: Status,
    timeout: Duration,
) -> StoredFunction {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(snapshot) = store.get_function(id).await.expect("store read failed")
            && snapshot.status == status
        {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {status:?} on {id}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
