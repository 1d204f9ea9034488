//! PostgreSQL job store
//!
//! Executions live in `job_executions`, one row per partition in
//! `partition_executions`. Status changes lock the execution row first so
//! concurrent managers cannot race a transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quake_common::messages::{ExecutionFailure, JobRequest, JobStatus, JobStatusResponse, WorkReply};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::debug;

use super::{
    describe_failure, ensure_transition, exit_code, partition_status, JobStore, TrackerError,
    NO_REPLY_DIAGNOSTIC,
};
use crate::ingest::partition::Partition;

#[derive(Debug, sqlx::FromRow)]
struct StatusRow {
    job_id: String,
    execution_id: i64,
    status: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    worker_count: i64,
}

impl TryFrom<StatusRow> for JobStatusResponse {
    type Error = TrackerError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        Ok(Self {
            job_id: row.job_id,
            execution_id: row.execution_id,
            status: row.status.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            worker_count: row.worker_count,
        })
    }
}

#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock the execution row and return its current status
    async fn lock_status(
        tx: &mut Transaction<'_, Postgres>,
        execution_id: i64,
    ) -> Result<JobStatus, TrackerError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM job_executions WHERE execution_id = $1 FOR UPDATE")
                .bind(execution_id)
                .fetch_optional(&mut **tx)
                .await?;

        match status {
            Some(status) => Ok(status.parse()?),
            None => Err(TrackerError::NotFound(execution_id)),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_execution(&self, request: &JobRequest) -> Result<i64, TrackerError> {
        let execution_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_executions (job_id, job_type, data_directory, status)
            VALUES ($1, $2, $3, $4)
            RETURNING execution_id
            "#,
        )
        .bind(&request.job_id)
        .bind(&request.job_type)
        .bind(&request.data_directory)
        .bind(JobStatus::Starting.as_str())
        .fetch_one(&self.pool)
        .await?;

        debug!(execution_id, job_id = %request.job_id, "Created job execution");
        Ok(execution_id)
    }

    async fn mark_started(&self, execution_id: i64) -> Result<(), TrackerError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_status(&mut tx, execution_id).await?;
        ensure_transition(execution_id, current, JobStatus::Started)?;

        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2, start_time = NOW(), updated_at = NOW()
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(JobStatus::Started.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_partitions(&self, execution_id: i64, partitions: &[Partition]) -> Result<(), TrackerError> {
        if partitions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let current = Self::lock_status(&mut tx, execution_id).await?;
        if current != JobStatus::Started {
            return Err(TrackerError::InvalidTransition {
                execution_id,
                from: current,
                to: JobStatus::Started,
            });
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO partition_executions (execution_id, partition_id, ordinal, source_path, status) ",
        );
        builder.push_values(partitions, |mut row, partition| {
            row.push_bind(execution_id)
                .push_bind(&partition.id)
                .push_bind(partition.ordinal as i32)
                .push_bind(partition.source_path.to_string_lossy().into_owned())
                .push_bind(JobStatus::Started.as_str());
        });
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_reply(&self, execution_id: i64, reply: &WorkReply) -> Result<bool, TrackerError> {
        let updated = sqlx::query(
            r#"
            UPDATE partition_executions p
            SET status = $3,
                worker_identity = $4,
                read_count = $5,
                processed_count = $6,
                written_count = $7,
                skipped_count = $8,
                diagnostics = $9,
                end_time = NOW()
            FROM job_executions e
            WHERE p.execution_id = $1
              AND p.partition_id = $2
              AND p.status = 'STARTED'
              AND e.execution_id = p.execution_id
              AND e.status = 'STARTED'
            "#,
        )
        .bind(execution_id)
        .bind(&reply.partition_id)
        .bind(partition_status(reply).as_str())
        .bind(&reply.worker_identity)
        .bind(reply.counts.read as i64)
        .bind(reply.counts.processed as i64)
        .bind(reply.counts.written as i64)
        .bind(reply.counts.skipped as i64)
        .bind(reply.diagnostics.as_deref())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(true);
        }

        let exists: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM partition_executions WHERE execution_id = $1 AND partition_id = $2",
        )
        .bind(execution_id)
        .bind(&reply.partition_id)
        .fetch_optional(&self.pool)
        .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(TrackerError::UnknownPartition {
                execution_id,
                partition_id: reply.partition_id.clone(),
            }),
        }
    }

    async fn finish(
        &self,
        execution_id: i64,
        status: JobStatus,
        exit_description: Option<&str>,
    ) -> Result<(), TrackerError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::lock_status(&mut tx, execution_id).await?;
        ensure_transition(execution_id, current, status)?;

        sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2,
                exit_code = $2,
                exit_description = $3,
                end_time = NOW(),
                updated_at = NOW()
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(exit_description)
        .execute(&mut *tx)
        .await?;

        let no_reply = (status == JobStatus::Failed).then_some(NO_REPLY_DIAGNOSTIC);
        sqlx::query(
            r#"
            UPDATE partition_executions
            SET status = $2,
                diagnostics = COALESCE(diagnostics, $3),
                end_time = NOW()
            WHERE execution_id = $1 AND status = 'STARTED'
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(no_reply)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(execution_id, status = %status, "Execution finished");
        Ok(())
    }

    async fn latest_by_job_id(&self, job_id: &str) -> Result<Option<JobStatusResponse>, TrackerError> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT e.job_id,
                   e.execution_id,
                   e.status,
                   e.start_time,
                   e.end_time,
                   (
                       SELECT COUNT(DISTINCT p.worker_identity)
                       FROM partition_executions p
                       WHERE p.execution_id = e.execution_id
                   ) AS worker_count
            FROM job_executions e
            WHERE e.job_id = $1
            ORDER BY e.execution_id DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobStatusResponse::try_from).transpose()
    }

    async fn failure_by_execution(&self, execution_id: i64) -> Result<Option<ExecutionFailure>, TrackerError> {
        let execution: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT status, exit_description FROM job_executions WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, exit_description)) = execution else {
            return Ok(None);
        };
        let status: JobStatus = status.parse()?;

        let failed: Vec<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT partition_id, diagnostics
            FROM partition_executions
            WHERE execution_id = $1 AND status = 'FAILED'
            ORDER BY ordinal
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(ExecutionFailure {
            exit_code: exit_code(status),
            exit_description: describe_failure(exit_description.as_deref(), &failed),
        }))
    }

    async fn ping(&self) -> Result<(), TrackerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
