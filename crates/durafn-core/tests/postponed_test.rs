// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for postponed functions and their scheduled retries.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use common::*;
use durafn_core::invoker::{InvokeOutcome, Verdict};
use durafn_core::storage::{FunctionId, Status};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_postponed_function_retries_at_due_time() {
    let ctx = TestContext::new(fast_settings());
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_fn = attempts.clone();

    let handle = ctx
        .engine
        .register("retrying", move |_| {
            let attempts = attempts_in_fn.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Verdict::Postpone(
                        Utc::now() + chrono::Duration::milliseconds(400),
                    ))
                } else {
                    Ok(Verdict::Succeed(json!("second attempt")))
                }
            }
        })
        .unwrap();

    let postponed_at = Utc::now();
    let outcome = handle.invoke("i-1", json!(null)).await.unwrap();
    assert_eq!(outcome, InvokeOutcome::Completed(Status::Postponed));

    // Halfway to the due time the function is still postponed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = handle.get("i-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, Status::Postponed);
    assert!(snapshot.postponed_until.unwrap() > postponed_at);

    // Terminal within due time + one poll interval (plus scheduling slack).
    let id = FunctionId::new("retrying", "i-1");
    let snapshot = wait_for_status(&ctx.store, &id, Status::Succeeded, Duration::from_secs(5)).await;
    assert_eq!(snapshot.result.unwrap().json, "\"second attempt\"");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(snapshot.postponed_until.is_none());

    ctx.engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_is_not_early() {
    let ctx = TestContext::new(fast_settings());
    let retried_at = Arc::new(std::sync::Mutex::new(None));
    let retried_at_in_fn = retried_at.clone();

    let handle = ctx
        .engine
        .register("punctual", move |invocation| {
            let retried_at = retried_at_in_fn.clone();
            async move {
                if invocation.scrapbook.get().is_null() {
                    invocation.scrapbook.set(json!({"postponed": true}));
                    invocation.scrapbook.save().await?;
                    Ok(Verdict::Postpone(
                        Utc::now() + chrono::Duration::milliseconds(500),
                    ))
                } else {
                    *retried_at.lock().unwrap() = Some(Utc::now());
                    Ok(Verdict::Succeed(json!(null)))
                }
            }
        })
        .unwrap();

    handle.invoke("i-1", json!(null)).await.unwrap();
    let due = handle
        .get("i-1")
        .await
        .unwrap()
        .unwrap()
        .postponed_until
        .expect("postponed function must carry a due time");

    let id = FunctionId::new("punctual", "i-1");
    wait_for_status(&ctx.store, &id, Status::Succeeded, Duration::from_secs(5)).await;

    let retried = retried_at.lock().unwrap().expect("retry never ran");
    assert!(
        retried >= due,
        "retry ran before the persisted due time: {retried} < {due}"
    );

    ctx.engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_postponed_watchdog_leaves_functions_postponed() {
    let mut settings = fast_settings();
    settings.postponed_check_frequency = Duration::ZERO;
    let ctx = TestContext::new(settings);

    let handle = ctx
        .engine
        .register("parked", |_| async {
            Ok(Verdict::Postpone(
                Utc::now() + chrono::Duration::milliseconds(50),
            ))
        })
        .unwrap();

    handle.invoke("i-1", json!(null)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let snapshot = handle.get("i-1").await.unwrap().unwrap();
    assert_eq!(snapshot.status, Status::Postponed);

    ctx.engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_due_functions_bounded_by_permit_pool() {
    let mut settings = fast_settings();
    settings.max_parallel_reinvocations = 2;
    let ctx = TestContext::new(settings);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let running_in_fn = running.clone();
    let peak_in_fn = peak.clone();

    let handle = ctx
        .engine
        .register("throttled", move |invocation| {
            let running = running_in_fn.clone();
            let peak = peak_in_fn.clone();
            async move {
                if invocation.scrapbook.get().is_null() {
                    invocation.scrapbook.set(json!({"attempt": 1}));
                    invocation.scrapbook.save().await?;
                    return Ok(Verdict::Postpone(
                        Utc::now() + chrono::Duration::milliseconds(150),
                    ));
                }
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(Verdict::Succeed(json!(null)))
            }
        })
        .unwrap();

    for n in 0..6 {
        handle.invoke(&format!("i-{n}"), json!(null)).await.unwrap();
    }

    for n in 0..6 {
        let id = FunctionId::new("throttled", format!("i-{n}"));
        wait_for_status(&ctx.store, &id, Status::Succeeded, Duration::from_secs(10)).await;
    }
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "reinvocation concurrency exceeded the permit pool"
    );

    ctx.engine.shutdown().await.unwrap();
}
