//! In-memory function store.
//!
//! Reference implementation of the [`FunctionStore`] contract, used by the
//! test suite and for embedding the engine without any external database.
//! All state lives in a single `Mutex<HashMap>`; no `.await` ever happens
//! while the lock is held, so the guard is always short-lived.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;

use super::{
    CasOutcome, FunctionId, FunctionStore, Payload, Status, StoredFunction, StoredFunctionStatus,
};

/// One stored row plus the scrapbook type registered at creation, which is
/// tracked even while no scrapbook value has been saved yet.
struct Row {
    function: StoredFunction,
    scrapbook_type: Option<String>,
}

impl Row {
    fn scrapbook_tag(&self) -> String {
        self.scrapbook_type
            .clone()
            .unwrap_or_else(|| "json".to_string())
    }
}

/// In-memory backend for the function store.
#[derive(Default)]
pub struct InMemoryFunctionStore {
    functions: Mutex<HashMap<FunctionId, Row>>,
}

impl InMemoryFunctionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FunctionId, Row>> {
        // A poisoned lock means a panic while holding the guard; the map is
        // plain data, so continuing with it is sound.
        self.functions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl FunctionStore for InMemoryFunctionStore {
    async fn create_function(
        &self,
        id: &FunctionId,
        param: &Payload,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: i32,
        initial_sign_of_life: i32,
    ) -> Result<bool, StoreError> {
        let mut functions = self.lock();
        if functions.contains_key(id) {
            return Ok(false);
        }
        functions.insert(
            id.clone(),
            Row {
                function: StoredFunction {
                    id: id.clone(),
                    parameter: param.clone(),
                    scrapbook: None,
                    status: initial_status,
                    result: None,
                    failure: None,
                    postponed_until: None,
                    epoch: initial_epoch,
                    sign_of_life: initial_sign_of_life,
                },
                scrapbook_type: scrapbook_type.map(str::to_string),
            },
        );
        Ok(true)
    }

    async fn try_to_become_leader(
        &self,
        id: &FunctionId,
        new_status: Status,
        expected_epoch: i32,
        new_epoch: i32,
    ) -> Result<CasOutcome, StoreError> {
        let mut functions = self.lock();
        let Some(row) = functions.get_mut(id) else {
            return Ok(CasOutcome::NotFound);
        };
        if row.function.epoch != expected_epoch {
            return Ok(CasOutcome::Stale);
        }
        row.function.status = new_status;
        row.function.epoch = new_epoch;
        row.function.postponed_until = None;
        Ok(CasOutcome::Applied)
    }

    async fn update_sign_of_life(
        &self,
        id: &FunctionId,
        expected_epoch: i32,
        new_sign_of_life: i32,
    ) -> Result<CasOutcome, StoreError> {
        let mut functions = self.lock();
        let Some(row) = functions.get_mut(id) else {
            return Ok(CasOutcome::NotFound);
        };
        if row.function.epoch != expected_epoch {
            return Ok(CasOutcome::Stale);
        }
        row.function.sign_of_life = new_sign_of_life;
        Ok(CasOutcome::Applied)
    }

    async fn update_scrapbook(
        &self,
        id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: i32,
    ) -> Result<CasOutcome, StoreError> {
        let mut functions = self.lock();
        let Some(row) = functions.get_mut(id) else {
            return Ok(CasOutcome::NotFound);
        };
        if row.function.epoch != expected_epoch {
            return Ok(CasOutcome::Stale);
        }
        let tag = row.scrapbook_tag();
        row.function.scrapbook = Some(Payload::new(scrapbook_json, tag));
        Ok(CasOutcome::Applied)
    }

    async fn get_functions_with_status(
        &self,
        function_type: &str,
        status: Status,
        postponed_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>, StoreError> {
        let functions = self.lock();
        let matching = functions
            .values()
            .map(|row| &row.function)
            .filter(|function| {
                function.id.function_type == function_type && function.status == status
            })
            .filter(|function| match postponed_before {
                None => true,
                Some(before) => function
                    .postponed_until
                    .map(|due| due <= before)
                    .unwrap_or(false),
            })
            .map(|function| StoredFunctionStatus {
                instance: function.id.instance.clone(),
                status: function.status,
                epoch: function.epoch,
                sign_of_life: function.sign_of_life,
                postponed_until: function.postponed_until,
            })
            .collect();
        Ok(matching)
    }

    async fn set_function_state(
        &self,
        id: &FunctionId,
        status: Status,
        scrapbook_json: Option<&str>,
        result: Option<&Payload>,
        failure: Option<&str>,
        postponed_until: Option<DateTime<Utc>>,
        expected_epoch: i32,
    ) -> Result<CasOutcome, StoreError> {
        let mut functions = self.lock();
        let Some(row) = functions.get_mut(id) else {
            return Ok(CasOutcome::NotFound);
        };
        if row.function.epoch != expected_epoch {
            return Ok(CasOutcome::Stale);
        }
        if let Some(json) = scrapbook_json {
            let tag = row.scrapbook_tag();
            row.function.scrapbook = Some(Payload::new(json, tag));
        }
        row.function.status = status;
        row.function.result = result.cloned();
        row.function.failure = failure.map(str::to_string);
        row.function.postponed_until = postponed_until;
        row.function.epoch = expected_epoch + 1;
        Ok(CasOutcome::Applied)
    }

    async fn get_function(&self, id: &FunctionId) -> Result<Option<StoredFunction>, StoreError> {
        Ok(self.lock().get(id).map(|row| row.function.clone()))
    }
}
