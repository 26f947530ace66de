// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durafn Core - Durable Function Execution Engine
//!
//! This crate provides the recovery and coordination engine for durable
//! functions: register a function, invoke it by an instance id, and the
//! engine guarantees it eventually runs to completion even across process
//! crashes, by persisting progress externally and automatically retrying.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Embedding Application                    │
//! │            (register / invoke / schedule / shutdown)         │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌───────────────────────┐          ┌─────────────────────────┐
//! │        Engine         │ spawns   │  CrashedWatchdog        │
//! │  registry, sink,      │─────────►│  PostponedWatchdog      │
//! │  graceful drain       │          │  (one pair per type)    │
//! └───────────────────────┘          └─────────────────────────┘
//!                │                                  │
//!                ▼                                  ▼
//! ┌───────────────────────┐          ┌─────────────────────────┐
//! │        Invoker        │◄─────────│  WorkQueue / Semaphore  │
//! │  leader election,     │ bounded  │  (parallelism bounds)   │
//! │  heartbeat, verdict   │          └─────────────────────────┘
//! └───────────────────────┘
//!                │
//!                ▼
//! ┌───────────────────────┐
//! │     FunctionStore     │
//! │  (SQLite, in-memory,  │
//! │   or your backend)    │
//! └───────────────────────┘
//! ```
//!
//! # Coordination Model
//!
//! There is no lock service and no consensus protocol. Each stored function
//! carries a monotonically increasing `epoch`; every mutating store call is a
//! compare-and-swap conditioned on the expected epoch, and exactly one of any
//! number of concurrent claimants wins. Whoever wins an epoch owns the
//! instance until the epoch moves again.
//!
//! While an executor runs, it periodically advances the instance's
//! `sign_of_life`. The crashed watchdog compares two consecutive snapshots of
//! all `Executing` instances one poll interval apart: an unchanged
//! `(epoch, sign_of_life)` pair means the executor died, and the instance is
//! reinvoked under a fresh epoch. The postponed watchdog polls for `Postponed`
//! instances falling due within the next interval and reinvokes them at their
//! due time under a concurrency cap.
//!
//! # Status State Machine
//!
//! ```text
//!              create / election
//!                     │
//!                     ▼
//!               ┌───────────┐  postpone   ┌───────────┐
//!               │ EXECUTING │────────────►│ POSTPONED │
//!               │           │◄────────────│           │
//!               └─────┬─────┘  election   └───────────┘
//!                     │
//!            ┌────────┴────────┐
//!        succeed             fail
//!            │                 │
//!            ▼                 ▼
//!      ┌───────────┐    ┌───────────┐
//!      │ SUCCEEDED │    │  FAILED   │
//!      └───────────┘    └───────────┘
//! ```
//!
//! `Succeeded` and `Failed` are terminal. At-least-once execution is the
//! contract: user code may run more than once per instance and should be
//! idempotent; the epoch fence guarantees at most one *active* executor and
//! exactly one persisted outcome per epoch.
//!
//! # Error Routing
//!
//! | Failure | Route |
//! |---------|-------|
//! | Lost CAS race | Sum-typed outcome, swallowed everywhere |
//! | Store error during a watchdog tick | Reported to the sink, next tick proceeds |
//! | User code failure (caller-driven invoke) | Returned to the caller, persisted |
//! | User code failure (watchdog reinvoke) | Persisted, reported once to the sink |
//! | Watchdog task panic | That loop ends, reported to the sink |
//!
//! # Modules
//!
//! - [`config`]: Engine settings with environment-variable loading
//! - [`engine`]: Builder, registry, sink, graceful shutdown
//! - [`error`]: Store errors and the sink's typed error
//! - [`invoker`]: Per-invocation state machine and the scrapbook
//! - [`serializer`]: Payload codecs keyed by stable type tags
//! - [`storage`]: The function-store contract plus SQLite and in-memory backends
//! - [`work_queue`]: Bounded-parallelism FIFO task queue

#![deny(missing_docs)]

/// Engine settings loaded from explicit values or environment variables.
pub mod config;

/// Unhandled-error taxonomy and transient store errors.
pub mod error;

/// The engine runtime: builder, function registry, sink, graceful shutdown.
pub mod engine;

/// Per-invocation state machine: leader election, heartbeat, verdict commit.
pub mod invoker;

/// Payload codec registry keyed by stable type tags.
pub mod serializer;

/// Function-store contract and backends.
pub mod storage;

/// Bounded-parallelism FIFO work queue.
pub mod work_queue;

mod crashed_watchdog;
mod postponed_watchdog;
mod shutdown;
