// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for durafn-core.
//!
//! Two families exist on purpose. [`StoreError`] is the transient failure a
//! storage backend can produce; it flows back through `Result` like any other
//! error. [`UnhandledError`] is the typed payload delivered to the registered
//! unhandled-error sink: it distinguishes framework-internal failures from
//! failures of user code, because the two are handled very differently by
//! operators. Lost CAS races are neither - they are ordinary
//! [`CasOutcome`](crate::storage::CasOutcome) tags, never errors.

use crate::storage::FunctionId;

/// Result type using StoreError.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A failure inside a storage backend.
///
/// Always treated as transient by the watchdogs: the tick that hit it is
/// reported to the sink and the loop proceeds.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend rejected or failed an operation.
    #[error("storage backend error during '{operation}': {details}")]
    Backend {
        /// The store operation that failed.
        operation: String,
        /// Backend-specific details.
        details: String,
    },

    /// A stored payload could not be produced or interpreted.
    #[error("payload error: {0}")]
    Payload(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Payload(err.to_string())
    }
}

/// Typed error delivered to the unhandled-error sink.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum UnhandledError {
    /// A framework component failed (watchdog tick, reinvocation plumbing,
    /// watchdog task death). Operators should treat these as engine issues.
    #[error("framework failure in {component} for function type '{function_type}': {message}")]
    Framework {
        /// The component that failed (e.g. "crashed_watchdog").
        component: String,
        /// The function type the component was serving.
        function_type: String,
        /// Failure details.
        message: String,
    },

    /// User code produced a failed verdict during an unattended reinvocation.
    /// The failure is already persisted; this is the operator notification.
    #[error("user code failed for '{function_id}': {message}")]
    UserCode {
        /// The invocation that failed.
        function_id: FunctionId,
        /// The failure message, as persisted.
        message: String,
    },
}

impl UnhandledError {
    /// True for failures of the engine itself rather than of user code.
    pub fn is_framework(&self) -> bool {
        matches!(self, UnhandledError::Framework { .. })
    }
}
