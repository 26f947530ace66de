//! Function-store contract and persistent state model.
//!
//! This module defines the persistence abstraction every backend implements
//! and the record types that cross it. The contract is deliberately small:
//! one row per invocation, compare-and-swap mutations fenced by the `epoch`
//! counter, and a scan per (type, status) for the watchdogs. The epoch CAS is
//! the system's only mutual-exclusion mechanism; there is no lock service.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryFunctionStore;
pub use self::sqlite::SqliteFunctionStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Identifies one durable invocation; stable for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionId {
    /// The registered function type.
    pub function_type: String,
    /// The caller-chosen instance id within the type.
    pub instance: String,
}

impl FunctionId {
    /// Create a new function id.
    pub fn new(function_type: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            function_type: function_type.into(),
            instance: instance.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.function_type, self.instance)
    }
}

/// Lifecycle status of a stored function.
///
/// `Succeeded` and `Failed` are terminal. `Executing` may move to any of the
/// other three; `Postponed` moves back to `Executing` only through leader
/// election. No other transition is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// An executor owns (or owned) the current epoch and is expected to be
    /// making progress.
    Executing,
    /// The invocation completed; the result payload is persisted.
    Succeeded,
    /// The invocation asked to be retried at or after `postponed_until`.
    Postponed,
    /// The invocation failed; the failure payload is persisted.
    Failed,
}

impl Status {
    /// Integer representation used by SQL backends.
    pub fn as_int(self) -> i32 {
        match self {
            Status::Executing => 0,
            Status::Succeeded => 1,
            Status::Postponed => 2,
            Status::Failed => 3,
        }
    }

    /// Inverse of [`as_int`](Self::as_int).
    pub fn from_int(value: i32) -> Option<Status> {
        match value {
            0 => Some(Status::Executing),
            1 => Some(Status::Succeeded),
            2 => Some(Status::Postponed),
            3 => Some(Status::Failed),
            _ => None,
        }
    }

    /// True once no further transition is valid.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Executing => "executing",
            Status::Succeeded => "succeeded",
            Status::Postponed => "postponed",
            Status::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A serialized value plus the application-chosen stable type tag that names
/// how to interpret it. The store never looks inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// The serialized JSON document.
    pub json: String,
    /// Stable tag resolved through the codec registry.
    pub type_tag: String,
}

impl Payload {
    /// Create a payload from its parts.
    pub fn new(json: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            json: json.into(),
            type_tag: type_tag.into(),
        }
    }
}

/// Full snapshot of one stored function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFunction {
    /// The invocation this row belongs to.
    pub id: FunctionId,
    /// The invocation parameter.
    pub parameter: Payload,
    /// Durable user state saved explicitly mid-execution, if any.
    pub scrapbook: Option<Payload>,
    /// Current lifecycle status.
    pub status: Status,
    /// Result payload once `Succeeded`.
    pub result: Option<Payload>,
    /// Failure payload (JSON) once `Failed`.
    pub failure: Option<String>,
    /// Absolute due time while `Postponed`.
    pub postponed_until: Option<DateTime<Utc>>,
    /// Monotonic fencing counter; a successful CAS increments it.
    pub epoch: i32,
    /// Heartbeat counter incremented by the current epoch owner.
    pub sign_of_life: i32,
}

/// Slim per-instance view returned by the watchdog scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFunctionStatus {
    /// Instance id within the scanned function type.
    pub instance: String,
    /// Current lifecycle status.
    pub status: Status,
    /// Current epoch.
    pub epoch: i32,
    /// Current heartbeat counter.
    pub sign_of_life: i32,
    /// Due time while `Postponed`.
    pub postponed_until: Option<DateTime<Utc>>,
}

/// Outcome of an epoch-fenced compare-and-swap.
///
/// Lost races are expected traffic in this system, so they are tags the
/// caller branches on rather than errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The mutation was applied; this caller won the epoch.
    Applied,
    /// The row exists but its epoch no longer matches `expected_epoch`.
    Stale,
    /// No row exists for the id.
    NotFound,
}

impl CasOutcome {
    /// True iff the mutation was applied.
    pub fn applied(self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Persistence boundary of the engine.
///
/// Every backend must provide these operations with identical CAS semantics:
/// among concurrent callers presenting the same `expected_epoch`, exactly one
/// observes [`CasOutcome::Applied`] (`UPDATE ... WHERE epoch = ?`, success iff
/// exactly one row affected). All operations are async and may fail with a
/// transient [`StoreError`].
#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// Insert a new row for `id`.
    ///
    /// Returns `false` (not an error) when the id already exists, so that
    /// duplicate invocations of the same instance collapse to one creation.
    async fn create_function(
        &self,
        id: &FunctionId,
        param: &Payload,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: i32,
        initial_sign_of_life: i32,
    ) -> Result<bool, StoreError>;

    /// Claim ownership of `id` at `new_epoch`, resetting status to
    /// `new_status`, iff the stored epoch still equals `expected_epoch`.
    async fn try_to_become_leader(
        &self,
        id: &FunctionId,
        new_status: Status,
        expected_epoch: i32,
        new_epoch: i32,
    ) -> Result<CasOutcome, StoreError>;

    /// Heartbeat write: set `sign_of_life` iff the epoch still matches.
    /// Does not change the epoch.
    async fn update_sign_of_life(
        &self,
        id: &FunctionId,
        expected_epoch: i32,
        new_sign_of_life: i32,
    ) -> Result<CasOutcome, StoreError>;

    /// Mid-execution scrapbook save iff the epoch still matches. Does not
    /// change the epoch; independent of the final result commit.
    async fn update_scrapbook(
        &self,
        id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: i32,
    ) -> Result<CasOutcome, StoreError>;

    /// Scan used by the watchdogs: all instances of `function_type` with
    /// `status`, optionally restricted to `postponed_until <= postponed_before`.
    async fn get_functions_with_status(
        &self,
        function_type: &str,
        status: Status,
        postponed_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>, StoreError>;

    /// Persist the invocation outcome and bump the epoch, iff the stored
    /// epoch still equals `expected_epoch`.
    #[allow(clippy::too_many_arguments)]
    async fn set_function_state(
        &self,
        id: &FunctionId,
        status: Status,
        scrapbook_json: Option<&str>,
        result: Option<&Payload>,
        failure: Option<&str>,
        postponed_until: Option<DateTime<Utc>>,
        expected_epoch: i32,
    ) -> Result<CasOutcome, StoreError>;

    /// Full snapshot read; `None` if the id was never created.
    async fn get_function(&self, id: &FunctionId) -> Result<Option<StoredFunction>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_id_display() {
        let id = FunctionId::new("billing", "invoice-42");
        assert_eq!(id.to_string(), "billing/invoice-42");
    }

    #[test]
    fn test_status_int_round_trip() {
        for status in [
            Status::Executing,
            Status::Succeeded,
            Status::Postponed,
            Status::Failed,
        ] {
            assert_eq!(Status::from_int(status.as_int()), Some(status));
        }
        assert_eq!(Status::from_int(4), None);
        assert_eq!(Status::from_int(-1), None);
    }

    #[test]
    fn test_status_terminal() {
        assert!(Status::Succeeded.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Executing.is_terminal());
        assert!(!Status::Postponed.is_terminal());
    }

    #[test]
    fn test_cas_outcome_applied() {
        assert!(CasOutcome::Applied.applied());
        assert!(!CasOutcome::Stale.applied());
        assert!(!CasOutcome::NotFound.applied());
    }
}
