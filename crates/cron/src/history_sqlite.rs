//! SQLite-backed history store using sqlx.

use std::time::Duration;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
};

use crate::{
    Error, Result,
    history::{HistoryStore, age_cutoff},
    invocation::InvocationRecord,
    output::OutputBuffer,
};

/// History in the `job_invocations` table.
pub struct SqliteHistory {
    pool: SqlitePool,
}

impl SqliteHistory {
    /// Open a dedicated pool and run migrations.
    ///
    /// For a pool shared with other tables, use [`SqliteHistory::with_pool`]
    /// after calling [`crate::run_migrations`].
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `:memory:` opens a separate database, so keep
        // exactly one alive for the lifetime of the pool.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Use an existing pool; migrations must already have run.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply retention as of `now`.
    ///
    /// The count filter ranks every record of the job by start time, newest
    /// first, and deletes ranks beyond `max_count`; the age filter deletes
    /// records that started before the cutoff. A record must survive both.
    pub async fn cull_at(
        &self,
        job_name: &str,
        max_count: usize,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        if max_count > 0 {
            let result = sqlx::query(
                "DELETE FROM job_invocations WHERE rowid IN (
                     SELECT rowid FROM (
                         SELECT rowid, ROW_NUMBER() OVER (
                             ORDER BY started_ms DESC, rowid DESC
                         ) AS rn
                         FROM job_invocations
                         WHERE job_name = ?
                     ) WHERE rn > ?
                 )",
            )
            .bind(job_name)
            .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
            .execute(&mut *tx)
            .await?;
            removed += result.rows_affected();
        }

        if let Some(cutoff) = age_cutoff(max_age, now) {
            let result =
                sqlx::query("DELETE FROM job_invocations WHERE job_name = ? AND started_ms < ?")
                    .bind(job_name)
                    .bind(cutoff.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
            removed += result.rows_affected();
        }

        tx.commit().await?;
        Ok(usize::try_from(removed).unwrap_or(usize::MAX))
    }
}

fn from_row(row: &SqliteRow) -> Result<InvocationRecord> {
    let started_ms: i64 = row.get("started_ms");
    let complete_ms: Option<i64> = row.get("complete_ms");
    let status: String = row.get("status");
    let parameters: String = row.get("parameters");
    let output: String = row.get("output");

    Ok(InvocationRecord {
        id: row.get("id"),
        job_name: row.get("job_name"),
        started: millis_to_datetime(started_ms)?,
        complete: complete_ms.map(millis_to_datetime).transpose()?,
        status: status.parse()?,
        error: row.get("error"),
        parameters: serde_json::from_str(&parameters)?,
        output: serde_json::from_str::<OutputBuffer>(&output)?,
    })
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::message(format!("timestamp out of range: {ms}")))
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    async fn add(&self, record: &InvocationRecord) -> Result<()> {
        let parameters = serde_json::to_string(&record.parameters)?;
        let output = serde_json::to_string(&record.output)?;
        sqlx::query(
            "INSERT INTO job_invocations
                 (id, job_name, started_ms, complete_ms, status, error, parameters, output)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 complete_ms = excluded.complete_ms,
                 status = excluded.status,
                 error = excluded.error,
                 output = excluded.output",
        )
        .bind(&record.id)
        .bind(&record.job_name)
        .bind(record.started.timestamp_millis())
        .bind(record.complete.map(|c| c.timestamp_millis()))
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(&parameters)
        .bind(&output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, job_name: &str) -> Result<Vec<InvocationRecord>> {
        let rows = sqlx::query(
            "SELECT id, job_name, started_ms, complete_ms, status, error, parameters, output
             FROM job_invocations
             WHERE job_name = ?
             ORDER BY started_ms ASC, rowid ASC",
        )
        .bind(job_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(from_row).collect()
    }

    async fn get_by_id(&self, job_name: &str, id: &str) -> Result<InvocationRecord> {
        let row = sqlx::query(
            "SELECT id, job_name, started_ms, complete_ms, status, error, parameters, output
             FROM job_invocations
             WHERE job_name = ? AND id = ?",
        )
        .bind(job_name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => from_row(&row),
            None => Err(Error::invocation_not_found(job_name, id)),
        }
    }

    async fn cull(&self, job_name: &str, max_count: usize, max_age: Duration) -> Result<usize> {
        self.cull_at(job_name, max_count, max_age, Utc::now()).await
    }
}
