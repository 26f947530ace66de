//! SQLite-backed function store.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::StoreError;

use super::{
    CasOutcome, FunctionId, FunctionStore, Payload, Status, StoredFunction, StoredFunctionStatus,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed function store.
///
/// Every CAS is a single `UPDATE ... WHERE epoch = ?`; the affected-row count
/// decides the winner, so the contract holds for any number of concurrent
/// callers sharing the pool.
#[derive(Clone)]
pub struct SqliteFunctionStore {
    pool: SqlitePool,
}

impl SqliteFunctionStore {
    /// Create a store from an existing pool. Migrations must already have run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if missing, connects
    /// with sensible defaults, and runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteFunctionStore::from_path(".data/durafn.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend {
                operation: "create_dir".to_string(),
                details: format!("failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| StoreError::Backend {
                operation: "connect".to_string(),
                details: format!("failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| StoreError::Backend {
            operation: "migrate".to_string(),
            details: format!("failed to run migrations: {}", e),
        })?;

        Ok(Self { pool })
    }

    /// Split a failed CAS into `Stale` (row exists at another epoch) vs
    /// `NotFound` (row absent).
    async fn classify_lost_cas(&self, id: &FunctionId) -> Result<CasOutcome, StoreError> {
        let exists: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM functions
            WHERE function_type = ? AND function_instance = ?
            "#,
        )
        .bind(&id.function_type)
        .bind(&id.instance)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if exists.is_some() {
            CasOutcome::Stale
        } else {
            CasOutcome::NotFound
        })
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Backend {
            operation: "decode_timestamp".to_string(),
            details: format!("postponed_until out of range: {}", ms),
        })
}

fn status_from_row(value: i32) -> Result<Status, StoreError> {
    Status::from_int(value).ok_or_else(|| StoreError::Backend {
        operation: "decode_status".to_string(),
        details: format!("unknown status value: {}", value),
    })
}

#[async_trait::async_trait]
impl FunctionStore for SqliteFunctionStore {
    async fn create_function(
        &self,
        id: &FunctionId,
        param: &Payload,
        scrapbook_type: Option<&str>,
        initial_status: Status,
        initial_epoch: i32,
        initial_sign_of_life: i32,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO functions
                (function_type, function_instance, param_json, param_type,
                 scrapbook_type, status, epoch, sign_of_life)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (function_type, function_instance) DO NOTHING
            "#,
        )
        .bind(&id.function_type)
        .bind(&id.instance)
        .bind(&param.json)
        .bind(&param.type_tag)
        .bind(scrapbook_type)
        .bind(initial_status.as_int())
        .bind(initial_epoch)
        .bind(initial_sign_of_life)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_to_become_leader(
        &self,
        id: &FunctionId,
        new_status: Status,
        expected_epoch: i32,
        new_epoch: i32,
    ) -> Result<CasOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET status = ?, epoch = ?, postponed_until = NULL
            WHERE function_type = ? AND function_instance = ? AND epoch = ?
            "#,
        )
        .bind(new_status.as_int())
        .bind(new_epoch)
        .bind(&id.function_type)
        .bind(&id.instance)
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            self.classify_lost_cas(id).await
        }
    }

    async fn update_sign_of_life(
        &self,
        id: &FunctionId,
        expected_epoch: i32,
        new_sign_of_life: i32,
    ) -> Result<CasOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET sign_of_life = ?
            WHERE function_type = ? AND function_instance = ? AND epoch = ?
            "#,
        )
        .bind(new_sign_of_life)
        .bind(&id.function_type)
        .bind(&id.instance)
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            self.classify_lost_cas(id).await
        }
    }

    async fn update_scrapbook(
        &self,
        id: &FunctionId,
        scrapbook_json: &str,
        expected_epoch: i32,
    ) -> Result<CasOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE functions
            SET scrapbook_json = ?
            WHERE function_type = ? AND function_instance = ? AND epoch = ?
            "#,
        )
        .bind(scrapbook_json)
        .bind(&id.function_type)
        .bind(&id.instance)
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            self.classify_lost_cas(id).await
        }
    }

    async fn get_functions_with_status(
        &self,
        function_type: &str,
        status: Status,
        postponed_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredFunctionStatus>, StoreError> {
        let rows: Vec<(String, i32, i32, i32, Option<i64>)> = match postponed_before {
            None => {
                sqlx::query_as(
                    r#"
                    SELECT function_instance, status, epoch, sign_of_life, postponed_until
                    FROM functions
                    WHERE function_type = ? AND status = ?
                    "#,
                )
                .bind(function_type)
                .bind(status.as_int())
                .fetch_all(&self.pool)
                .await?
            }
            Some(before) => {
                sqlx::query_as(
                    r#"
                    SELECT function_instance, status, epoch, sign_of_life, postponed_until
                    FROM functions
                    WHERE function_type = ? AND status = ?
                      AND postponed_until IS NOT NULL AND postponed_until <= ?
                    "#,
                )
                .bind(function_type)
                .bind(status.as_int())
                .bind(before.timestamp_millis())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .map(|(instance, status, epoch, sign_of_life, postponed_ms)| {
                Ok(StoredFunctionStatus {
                    instance,
                    status: status_from_row(status)?,
                    epoch,
                    sign_of_life,
                    postponed_until: postponed_ms.map(millis_to_datetime).transpose()?,
                })
            })
            .collect()
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
        let updated = sqlx::query(
            r#"
            UPDATE functions
            SET status = ?,
                scrapbook_json = COALESCE(?, scrapbook_json),
                result_json = ?,
                result_type = ?,
                error_json = ?,
                postponed_until = ?,
                epoch = epoch + 1
            WHERE function_type = ? AND function_instance = ? AND epoch = ?
            "#,
        )
        .bind(status.as_int())
        .bind(scrapbook_json)
        .bind(result.map(|payload| payload.json.as_str()))
        .bind(result.map(|payload| payload.type_tag.as_str()))
        .bind(failure)
        .bind(postponed_until.map(|due| due.timestamp_millis()))
        .bind(&id.function_type)
        .bind(&id.instance)
        .bind(expected_epoch)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            Ok(CasOutcome::Applied)
        } else {
            self.classify_lost_cas(id).await
        }
    }

    async fn get_function(&self, id: &FunctionId) -> Result<Option<StoredFunction>, StoreError> {
        type Row = (
            String,
            String,
            Option<String>,
            Option<String>,
            i32,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<i64>,
            i32,
            i32,
        );

        let row: Option<Row> = sqlx::query_as(
            r#"
            SELECT param_json, param_type, scrapbook_json, scrapbook_type,
                   status, result_json, result_type, error_json,
                   postponed_until, epoch, sign_of_life
            FROM functions
            WHERE function_type = ? AND function_instance = ?
            "#,
        )
        .bind(&id.function_type)
        .bind(&id.instance)
        .fetch_optional(&self.pool)
        .await?;

        let Some((
            param_json,
            param_type,
            scrapbook_json,
            scrapbook_type,
            status,
            result_json,
            result_type,
            error_json,
            postponed_ms,
            epoch,
            sign_of_life,
        )) = row
        else {
            return Ok(None);
        };

        let scrapbook = match (scrapbook_json, scrapbook_type) {
            (Some(json), Some(tag)) => Some(Payload::new(json, tag)),
            // Type registered at creation but never saved.
            (None, Some(_)) | (None, None) => None,
            (Some(json), None) => Some(Payload::new(json, "json")),
        };
        let result = match (result_json, result_type) {
            (Some(json), Some(tag)) => Some(Payload::new(json, tag)),
            (Some(json), None) => Some(Payload::new(json, "json")),
            (None, _) => None,
        };

        Ok(Some(StoredFunction {
            id: id.clone(),
            parameter: Payload::new(param_json, param_type),
            scrapbook,
            status: status_from_row(status)?,
            result,
            failure: error_json,
            postponed_until: postponed_ms.map(millis_to_datetime).transpose()?,
            epoch,
            sign_of_life,
        }))
    }
}
