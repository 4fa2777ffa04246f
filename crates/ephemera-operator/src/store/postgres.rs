//! Postgres-backed request store
//!
//! Shared by every operator instance. Status writes are single `UPDATE`
//! statements whose `WHERE` clause carries the transition's guard, so the
//! database arbitrates between concurrent writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

use ephemera_common::model::{
    far_future, EphemeralRequest, LogEntry, Project, ProjectId, RequestId, RequestSpec,
    RequestStatus,
};
use ephemera_common::retry::{retry_with_backoff_if, RetryConfig};
use ephemera_common::Error;

use super::{Clock, RequestStore, Transition};

const MAX_CONNECTIONS: u32 = 10;
const CONNECT_ATTEMPTS: u32 = 5;

const COLUMNS: &str = "id, project_id, spec, status, generation, workload_name, service_name, \
     secret_name, error_message, log, created_at, updated_at, started_at, expire_at";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ephemeral_requests (
        id UUID PRIMARY KEY,
        project_id UUID NOT NULL,
        path TEXT NOT NULL,
        spec JSONB NOT NULL,
        status TEXT NOT NULL,
        generation BIGINT NOT NULL DEFAULT 1,
        workload_name TEXT NOT NULL,
        service_name TEXT NOT NULL,
        secret_name TEXT,
        error_message TEXT,
        log JSONB NOT NULL DEFAULT '[]'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ,
        expire_at TIMESTAMPTZ NOT NULL
    )",
    // Deleted rows wait for the purge; they must not hold their path
    "DROP INDEX IF EXISTS ephemeral_requests_project_path",
    "CREATE UNIQUE INDEX IF NOT EXISTS ephemeral_requests_project_live_path
        ON ephemeral_requests (project_id, path) WHERE status <> 'deleted'",
    "CREATE INDEX IF NOT EXISTS ephemeral_requests_status_expire
        ON ephemeral_requests (status, expire_at)",
];

fn store_err(context: &'static str) -> impl Fn(sqlx::Error) -> Error {
    move |e| Error::store(context, e)
}

/// A malformed URL will not get better by retrying
fn connect_err(e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Configuration(cause) => {
            Error::validation_for_field("database_url", cause.to_string())
        }
        other => Error::store("connect", other),
    }
}

fn status_names(statuses: &[RequestStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn from_row(row: &PgRow) -> Result<EphemeralRequest, Error> {
    let decode = store_err("decode_row");
    let status: String = row.try_get("status").map_err(&decode)?;
    let Json(spec): Json<RequestSpec> = row.try_get("spec").map_err(&decode)?;
    let Json(log): Json<Vec<LogEntry>> = row.try_get("log").map_err(&decode)?;
    Ok(EphemeralRequest {
        id: row.try_get("id").map_err(&decode)?,
        project_id: row.try_get("project_id").map_err(&decode)?,
        spec,
        status: status.parse()?,
        generation: row.try_get("generation").map_err(&decode)?,
        workload_name: row.try_get("workload_name").map_err(&decode)?,
        service_name: row.try_get("service_name").map_err(&decode)?,
        secret_name: row.try_get("secret_name").map_err(&decode)?,
        error_message: row.try_get("error_message").map_err(&decode)?,
        log,
        created_at: row.try_get("created_at").map_err(&decode)?,
        updated_at: row.try_get("updated_at").map_err(&decode)?,
        started_at: row.try_get("started_at").map_err(&decode)?,
        expire_at: row.try_get("expire_at").map_err(&decode)?,
    })
}

fn from_rows(rows: &[PgRow]) -> Result<Vec<EphemeralRequest>, Error> {
    rows.iter().map(from_row).collect()
}

/// Request store on a Postgres pool
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and make sure the tables exist
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = retry_with_backoff_if(
            &RetryConfig::with_max_attempts(CONNECT_ATTEMPTS),
            "connect_store",
            Error::is_retryable,
            move || async move {
                PgPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .connect(database_url)
                    .await
                    .map_err(connect_err)
            },
        )
        .await?;
        let store = Self::with_pool(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they are missing
    pub async fn ensure_schema(&self) -> Result<(), Error> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err("ensure_schema"))?;
        }
        info!("Request store schema ready");
        Ok(())
    }
}

#[async_trait]
impl RequestStore for PostgresStore {
    async fn project(&self, id: &ProjectId) -> Result<Option<Project>, Error> {
        let row = sqlx::query("SELECT id, name FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err("project"))?;
        row.map(|row| {
            Ok(Project {
                id: row.try_get("id").map_err(store_err("project"))?,
                name: row.try_get("name").map_err(store_err("project"))?,
            })
        })
        .transpose()
    }

    async fn insert(&self, request: &EphemeralRequest) -> Result<(), Error> {
        let result = sqlx::query(
            "INSERT INTO ephemeral_requests
                (id, project_id, path, spec, status, generation, workload_name, service_name,
                 secret_name, error_message, log, created_at, updated_at, started_at, expire_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(request.id)
        .bind(request.project_id)
        .bind(&request.spec.path)
        .bind(Json(&request.spec))
        .bind(request.status.as_str())
        .bind(request.generation)
        .bind(&request.workload_name)
        .bind(&request.service_name)
        .bind(&request.secret_name)
        .bind(&request.error_message)
        .bind(Json(&request.log))
        .bind(request.created_at)
        .bind(request.updated_at)
        .bind(request.started_at)
        .bind(request.expire_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(Error::conflict(
                format!(
                    "path {} is already in use in project {}",
                    request.spec.path, request.project_id
                ),
            )),
            Err(e) => Err(Error::store("insert", e)),
        }
    }

    async fn get(&self, id: &RequestId) -> Result<Option<EphemeralRequest>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM ephemeral_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("get"))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn update_spec(
        &self,
        request: &EphemeralRequest,
        restart_expiry: Option<DateTime<Utc>>,
        entry: LogEntry,
    ) -> Result<Option<EphemeralRequest>, Error> {
        let row = sqlx::query(&format!(
            "UPDATE ephemeral_requests
             SET spec = $2, secret_name = $3,
                 expire_at = CASE
                     WHEN $4::timestamptz IS NOT NULL AND status = 'active' THEN $4
                     ELSE expire_at
                 END,
                 log = log || $5::jsonb, updated_at = NOW()
             WHERE id = $1
             RETURNING {COLUMNS}"
        ))
        .bind(request.id)
        .bind(Json(&request.spec))
        .bind(&request.secret_name)
        .bind(restart_expiry)
        .bind(Json(vec![entry]))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("update_spec"))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn transition(
        &self,
        id: &RequestId,
        transition: &Transition,
    ) -> Result<Option<EphemeralRequest>, Error> {
        // $6 selects the clock effect: 0 keep, 1 start, 2 reset
        let (clock_mode, started_at, expire_at): (i32, Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            match transition.clock {
                Clock::Keep => (0, None, None),
                Clock::Start {
                    started_at,
                    expire_at,
                } => (1, Some(started_at), Some(expire_at)),
                Clock::Reset => (2, None, Some(far_future())),
            };

        let row = sqlx::query(&format!(
            "UPDATE ephemeral_requests
             SET status = $2,
                 generation = generation + $3,
                 started_at = CASE $6 WHEN 0 THEN started_at ELSE $7 END,
                 expire_at = CASE $6 WHEN 0 THEN expire_at ELSE $8 END,
                 error_message = $4,
                 log = log || $5::jsonb,
                 updated_at = NOW()
             WHERE id = $1
               AND status = ANY($9)
               AND ($10::BIGINT IS NULL OR generation = $10)
             RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(transition.to.as_str())
        .bind(if transition.bump_generation { 1i64 } else { 0i64 })
        .bind(&transition.error)
        .bind(Json(vec![transition.entry.clone()]))
        .bind(clock_mode)
        .bind(started_at)
        .bind(expire_at)
        .bind(status_names(&transition.from))
        .bind(transition.expected_generation)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("transition"))?;
        row.as_ref().map(from_row).transpose()
    }

    async fn append_log(&self, id: &RequestId, entry: LogEntry) -> Result<(), Error> {
        sqlx::query(
            "UPDATE ephemeral_requests SET log = log || $2::jsonb, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(vec![entry]))
        .execute(&self.pool)
        .await
        .map_err(store_err("append_log"))?;
        Ok(())
    }

    async fn list_by_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<EphemeralRequest>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM ephemeral_requests WHERE status = ANY($1) ORDER BY created_at"
        ))
        .bind(status_names(statuses))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("list_by_status"))?;
        from_rows(&rows)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EphemeralRequest>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM ephemeral_requests
             WHERE status = ANY($1) AND expire_at <= $2
             ORDER BY expire_at
             LIMIT $3"
        ))
        .bind(status_names(&RequestStatus::RECLAIMABLE))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("list_expired"))?;
        from_rows(&rows)
    }

    async fn list_stuck(
        &self,
        status: RequestStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<EphemeralRequest>, Error> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM ephemeral_requests
             WHERE status = $1 AND updated_at < $2
             ORDER BY created_at"
        ))
        .bind(status.as_str())
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("list_stuck"))?;
        from_rows(&rows)
    }

    async fn delete_orphans(&self) -> Result<Vec<RequestId>, Error> {
        let rows = sqlx::query(
            "DELETE FROM ephemeral_requests r
             WHERE NOT EXISTS (SELECT 1 FROM projects p WHERE p.id = r.project_id)
             RETURNING r.id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err("delete_orphans"))?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(store_err("delete_orphans")))
            .collect()
    }

    async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let result =
            sqlx::query("DELETE FROM ephemeral_requests WHERE status = $1 AND updated_at < $2")
                .bind(RequestStatus::Deleted.as_str())
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(store_err("purge_deleted"))?;
        Ok(result.rows_affected())
    }

    async fn count_active_in_project(&self, project_id: &ProjectId) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ephemeral_requests WHERE project_id = $1 AND status <> $2",
        )
        .bind(project_id)
        .bind(RequestStatus::Deleted.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("count_active_in_project"))?;
        Ok(count as u64)
    }
}
