//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence:
//! - optimistic concurrency on history appends via event ids
//! - task claiming with FOR UPDATE SKIP LOCKED
//! - per-type value columns for search-attribute predicates
//! - per-principal inbox sequences assigned under a row lock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::router::TaskQueue;
use crate::workflow::attributes::{AttributeFilter, AttributeMap, AttributeValue};
use crate::workflow::signal::SIGNAL_CHANNEL_CAPACITY;
use crate::workflow::{ActivityOptions, EventKind, HistoryEvent, Signal, TimeoutKind, WorkflowError};

/// PostgreSQL implementation of ExecutionStore
///
/// # Example
///
/// ```ignore
/// use tessera_durable::PostgresExecutionStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect(&database_url).await?;
/// sqlx::migrate!("./migrations").run(&pool).await?;
/// let store = PostgresExecutionStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, StoreError> {
    let status: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");
    let parent_workflow_id: Option<String> = row.get("parent_workflow_id");
    let parent_run_id: Option<Uuid> = row.get("parent_run_id");
    let run_timeout_ms: Option<i64> = row.get("run_timeout_ms");

    Ok(ExecutionRecord {
        workflow_id: row.get("workflow_id"),
        run_id: row.get("run_id"),
        workflow_type: row.get("workflow_type"),
        tenant: row.get("tenant"),
        status: status.parse().map_err(StoreError::Serialization)?,
        input: row.get("input"),
        result: row.get("result"),
        error: error_json.and_then(|v| serde_json::from_value::<WorkflowError>(v).ok()),
        parent: parent_workflow_id.zip(parent_run_id).map(|(workflow_id, run_id)| ParentRef {
            workflow_id,
            run_id,
        }),
        started_at: row.get("start_time"),
        closed_at: row.get("close_time"),
        run_timeout: run_timeout_ms.map(|ms| std::time::Duration::from_millis(ms as u64)),
    })
}

fn row_to_claimed(row: &sqlx::postgres::PgRow) -> Result<ClaimedTask, StoreError> {
    let queue: String = row.get("queue");
    let options: serde_json::Value = row.get("options");

    Ok(ClaimedTask {
        task_id: row.get("task_id"),
        workflow_id: row.get("workflow_id"),
        run_id: row.get("run_id"),
        scheduled_event_id: row.get("scheduled_event_id"),
        activity_id: row.get("activity_id"),
        activity_type: row.get("activity_type"),
        queue: queue.parse().map_err(StoreError::Serialization)?,
        input: row.get("input"),
        options: serde_json::from_value::<ActivityOptions>(options).map_err(ser_err)?,
        attempt: row.get::<i32, _>("attempt") as u32,
    })
}

fn row_to_inbox(row: &sqlx::postgres::PgRow) -> Result<InboxSignal, StoreError> {
    let kind: String = row.get("kind");
    Ok(InboxSignal {
        principal: row.get("principal"),
        sequence: row.get("sequence"),
        workflow_id: row.get("workflow_id"),
        kind: serde_json::from_value(serde_json::Value::String(kind)).map_err(ser_err)?,
        payload: row.get("payload"),
        created_at: row.get("created_at"),
        read_at: row.get("read_at"),
    })
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn stage_report_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        task_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
        scheduled_event_id: i64,
        activity_id: &str,
        attempt: u32,
        outcome: &TaskOutcome,
    ) -> Result<(), StoreError> {
        let outcome_json = serde_json::to_value(outcome).map_err(ser_err)?;

        sqlx::query(
            r#"
            INSERT INTO completion_reports
                (task_id, workflow_id, run_id, scheduled_event_id, activity_id, attempt, outcome)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(task_id)
        .bind(workflow_id)
        .bind(run_id)
        .bind(scheduled_event_id)
        .bind(activity_id)
        .bind(attempt as i32)
        .bind(&outcome_json)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    /// Load the row needed to decide a failure outcome, locked for update.
    async fn lock_task(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        task_id: Uuid,
    ) -> Result<sqlx::postgres::PgRow, StoreError> {
        sqlx::query(
            r#"
            SELECT task_id, workflow_id, run_id, scheduled_event_id, activity_id, activity_type,
                   queue, input, options, status, attempt, scheduled_at
            FROM activity_tasks
            WHERE task_id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::TaskNotFound(task_id))
    }

    fn decide_retry(
        options: &ActivityOptions,
        scheduled_at: DateTime<Utc>,
        attempt: u32,
        retryable: bool,
        error_type: Option<&str>,
    ) -> Option<std::time::Duration> {
        let policy = &options.retry_policy;

        if !retryable || !policy.should_retry(error_type) {
            return None;
        }
        if !policy.has_attempts_remaining(attempt) {
            return None;
        }
        if let Some(s2c) = options.schedule_to_close_timeout {
            let deadline = scheduled_at + chrono::Duration::from_std(s2c).unwrap_or_default();
            if Utc::now() >= deadline {
                return None;
            }
        }

        Some(policy.delay_after_attempt(attempt))
    }

    async fn apply_failure(
        &self,
        task_id: Uuid,
        retryable: bool,
        error_type: Option<&str>,
        outcome_of: impl Fn(bool) -> TaskOutcome,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = Self::lock_task(&mut tx, task_id).await?;

        let status: String = row.get("status");
        if status != "claimed" && status != "pending" {
            tx.rollback().await.map_err(db_err)?;
            return Ok(TaskFailureOutcome::Exhausted);
        }

        let attempt = row.get::<i32, _>("attempt") as u32;
        let options: ActivityOptions =
            serde_json::from_value(row.get("options")).map_err(ser_err)?;
        let scheduled_at: DateTime<Utc> = row.get("scheduled_at");
        let workflow_id: String = row.get("workflow_id");
        let run_id: Uuid = row.get("run_id");
        let scheduled_event_id: i64 = row.get("scheduled_event_id");
        let activity_id: String = row.get("activity_id");

        let retry = Self::decide_retry(&options, scheduled_at, attempt, retryable, error_type);

        let (next_status, visible_at) = match retry {
            Some(delay) => (
                "pending",
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()),
            ),
            None => ("failed", None),
        };

        sqlx::query(
            r#"
            UPDATE activity_tasks
            SET status = $2,
                claimed_by = NULL,
                started_at = NULL,
                visible_at = COALESCE($3, visible_at)
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(next_status)
        .bind(visible_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let will_retry = retry.is_some();
        Self::stage_report_tx(
            &mut tx,
            task_id,
            &workflow_id,
            run_id,
            scheduled_event_id,
            &activity_id,
            attempt,
            &outcome_of(will_retry),
        )
        .await?;

        tx.commit().await.map_err(db_err)?;

        match retry {
            Some(delay) => Ok(TaskFailureOutcome::WillRetry {
                next_attempt: attempt + 1,
                delay,
            }),
            None => Ok(TaskFailureOutcome::Exhausted),
        }
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, new), fields(workflow_id = %new.workflow_id))]
    async fn create_execution(&self, new: NewExecution) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let prior = sqlx::query(
            r#"
            SELECT status FROM executions
            WHERE workflow_id = $1
            ORDER BY start_time DESC, run_id DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&new.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = prior {
            let status: WorkflowStatus = row
                .get::<String, _>("status")
                .parse()
                .map_err(StoreError::Serialization)?;

            let rejected = if !status.is_terminal() {
                true
            } else {
                match new.id_reuse_policy {
                    IdReusePolicy::AllowDuplicate => false,
                    IdReusePolicy::AllowDuplicateFailedOnly => status == WorkflowStatus::Completed,
                    IdReusePolicy::RejectDuplicate => true,
                }
            };

            if rejected {
                tx.rollback().await.map_err(db_err)?;
                return Err(StoreError::AlreadyStarted(new.workflow_id));
            }
        }

        let (parent_workflow_id, parent_run_id) = new
            .parent
            .map(|p| (Some(p.workflow_id), Some(p.run_id)))
            .unwrap_or((None, None));

        sqlx::query(
            r#"
            INSERT INTO executions
                (workflow_id, run_id, workflow_type, tenant, status, input,
                 parent_workflow_id, parent_run_id, run_timeout_ms)
            VALUES ($1, $2, $3, $4, 'running', $5, $6, $7, $8)
            "#,
        )
        .bind(&new.workflow_id)
        .bind(new.run_id)
        .bind(&new.workflow_type)
        .bind(&new.tenant)
        .bind(&new.input)
        .bind(&parent_workflow_id)
        .bind(parent_run_id)
        .bind(new.run_timeout.map(|d| d.as_millis() as i64))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        debug!(workflow_id = %new.workflow_id, run_id = %new.run_id, "created execution");
        Ok(())
    }

    async fn get_execution(&self, workflow_id: &str) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE workflow_id = $1
            ORDER BY start_time DESC, run_id DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))?;

        row_to_record(&row)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(run_id))?;

        row_to_record(&row)
    }

    #[instrument(skip(self, result, error))]
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
    ) -> Result<(), StoreError> {
        let error_json = error.map(serde_json::to_value).transpose().map_err(ser_err)?;
        let close_time = status.is_terminal().then(Utc::now);

        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2,
                result = COALESCE($3, result),
                error = COALESCE($4, error),
                close_time = COALESCE($5, close_time)
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(status.to_string())
        .bind(&result)
        .bind(&error_json)
        .bind(close_time)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn runs_past_timeout(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM executions
            WHERE status = 'running'
              AND run_timeout_ms IS NOT NULL
              AND start_time + make_interval(secs => run_timeout_ms / 1000.0) <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn list_executions(
        &self,
        tenant: Option<&str>,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (workflow_id) *
            FROM executions
            WHERE ($1::text IS NULL OR tenant = $1)
            ORDER BY workflow_id, start_time DESC, run_id DESC
            "#,
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut records: Vec<ExecutionRecord> =
            rows.iter().map(row_to_record).collect::<Result<_, _>>()?;
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    #[instrument(skip(self, events))]
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_next_event_id: i64,
        events: Vec<EventKind>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(event_id) + 1, 0) AS next_event_id
            FROM history
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let current: i64 = row.get("next_event_id");
        if current != expected_next_event_id {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_next_event_id,
                actual: current,
            });
        }

        let mut next = current;
        for kind in events {
            let payload = serde_json::to_value(&kind).map_err(ser_err)?;
            let kind_name = payload
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();

            sqlx::query(
                r#"
                INSERT INTO history (run_id, event_id, kind, timestamp, payload)
                VALUES ($1, $2, $3, now(), $4)
                "#,
            )
            .bind(run_id)
            .bind(next)
            .bind(&kind_name)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A concurrent appender winning the race surfaces as a
                // primary-key violation on (run_id, event_id).
                if e.as_database_error().is_some_and(|dbe| dbe.is_unique_violation()) {
                    StoreError::ConcurrencyConflict {
                        expected: next,
                        actual: next + 1,
                    }
                } else {
                    db_err(e)
                }
            })?;

            next += 1;
        }

        tx.commit().await.map_err(db_err)?;

        debug!(%run_id, next, "appended events");
        Ok(next)
    }

    async fn load_history(&self, run_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, timestamp, payload
            FROM history
            WHERE run_id = $1
            ORDER BY event_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.get("payload");
            events.push(HistoryEvent {
                event_id: row.get("event_id"),
                timestamp: row.get("timestamp"),
                kind: serde_json::from_value(payload).map_err(ser_err)?,
            });
        }

        Ok(events)
    }

    #[instrument(skip(self, task), fields(activity_type = %task.activity_type))]
    async fn enqueue_task(
        &self,
        task: TaskDefinition,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, StoreError> {
        let task_id = Uuid::now_v7();
        let options = serde_json::to_value(&task.options).map_err(ser_err)?;

        sqlx::query(
            r#"
            INSERT INTO activity_tasks
                (task_id, workflow_id, run_id, scheduled_event_id, activity_id, activity_type,
                 queue, input, options, status, visible_at,
                 schedule_to_start_ms, start_to_close_ms, schedule_to_close_ms, heartbeat_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, $11, $12, $13, $14)
            "#,
        )
        .bind(task_id)
        .bind(&task.workflow_id)
        .bind(task.run_id)
        .bind(task.scheduled_event_id)
        .bind(&task.activity_id)
        .bind(&task.activity_type)
        .bind(task.queue.as_str())
        .bind(&task.input)
        .bind(&options)
        .bind(visible_at)
        .bind(task.options.schedule_to_start_timeout.as_millis() as i64)
        .bind(task.options.start_to_close_timeout.as_millis() as i64)
        .bind(task.options.schedule_to_close_timeout.map(|d| d.as_millis() as i64))
        .bind(task.options.heartbeat_timeout.map(|d| d.as_millis() as i64))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(task_id)
    }

    #[instrument(skip(self, activity_types))]
    async fn claim_tasks(
        &self,
        queue: TaskQueue,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let rows = sqlx::query(
            r#"
            WITH picked AS (
                SELECT task_id FROM activity_tasks
                WHERE queue = $1
                  AND status = 'pending'
                  AND visible_at <= now()
                  AND (cardinality($2::text[]) = 0 OR activity_type = ANY($2))
                ORDER BY visible_at, task_id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE activity_tasks t
            SET status = 'claimed',
                claimed_by = $4,
                attempt = t.attempt + 1,
                started_at = now(),
                last_heartbeat_at = now()
            FROM picked
            WHERE t.task_id = picked.task_id
            RETURNING t.task_id, t.workflow_id, t.run_id, t.scheduled_event_id, t.activity_id,
                      t.activity_type, t.queue, t.input, t.options, t.attempt
            "#,
        )
        .bind(queue.as_str())
        .bind(activity_types)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let task = row_to_claimed(row)?;
            Self::stage_report_tx(
                &mut tx,
                task.task_id,
                &task.workflow_id,
                task.run_id,
                task.scheduled_event_id,
                &task.activity_id,
                task.attempt,
                &TaskOutcome::Started {
                    worker_id: worker_id.to_string(),
                },
            )
            .await?;
            claimed.push(task);
        }

        tx.commit().await.map_err(db_err)?;

        if !claimed.is_empty() {
            debug!(queue = %queue, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    async fn record_heartbeat(
        &self,
        task_id: Uuid,
        worker_id: &str,
        _details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE activity_tasks
            SET last_heartbeat_at = CASE
                    WHEN status = 'claimed' AND claimed_by = $2 THEN now()
                    ELSE last_heartbeat_at
                END
            WHERE task_id = $1
            RETURNING (status = 'claimed' AND claimed_by = $2) AS accepted, cancel_requested
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        Ok(HeartbeatResponse {
            accepted: row.get("accepted"),
            cancel_requested: row.get("cancel_requested"),
        })
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = Self::lock_task(&mut tx, task_id).await?;

        let status: String = row.get("status");
        if status != "claimed" {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        sqlx::query("UPDATE activity_tasks SET status = 'completed' WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let workflow_id: String = row.get("workflow_id");
        let activity_id: String = row.get("activity_id");
        Self::stage_report_tx(
            &mut tx,
            task_id,
            &workflow_id,
            row.get("run_id"),
            row.get("scheduled_event_id"),
            &activity_id,
            row.get::<i32, _>("attempt") as u32,
            &TaskOutcome::Completed { result },
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let error = error.clone();
        let retryable = error.retryable;
        let error_type = error.error_type.clone();
        self.apply_failure(
            task_id,
            retryable,
            error_type.as_deref(),
            move |will_retry| TaskOutcome::Failed {
                error: error.clone(),
                will_retry,
            },
        )
        .await
    }

    async fn time_out_task(
        &self,
        task_id: Uuid,
        timeout: TimeoutKind,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let retryable = matches!(timeout, TimeoutKind::StartToClose | TimeoutKind::Heartbeat);
        self.apply_failure(task_id, retryable, None, move |will_retry| {
            TaskOutcome::TimedOut { timeout, will_retry }
        })
        .await
    }

    async fn request_cancel(&self, run_id: Uuid, activity_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT task_id, workflow_id, scheduled_event_id, status, attempt
            FROM activity_tasks
            WHERE run_id = $1 AND activity_id = $2 AND status IN ('pending', 'claimed')
            ORDER BY task_id DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .bind(activity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        };

        let task_id: Uuid = row.get("task_id");
        let status: String = row.get("status");

        if status == "pending" {
            sqlx::query("UPDATE activity_tasks SET status = 'cancelled' WHERE task_id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            let workflow_id: String = row.get("workflow_id");
            Self::stage_report_tx(
                &mut tx,
                task_id,
                &workflow_id,
                run_id,
                row.get("scheduled_event_id"),
                activity_id,
                row.get::<i32, _>("attempt") as u32,
                &TaskOutcome::Failed {
                    error: ActivityError::cancelled("cancelled before start"),
                    will_retry: false,
                },
            )
            .await?;
        } else {
            sqlx::query("UPDATE activity_tasks SET cancel_requested = TRUE WHERE task_id = $1")
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn find_timed_out_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimedOutTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT task_id, run_id, activity_id,
                   CASE
                       WHEN status = 'pending' AND schedule_to_close_ms IS NOT NULL
                            AND scheduled_at + make_interval(secs => schedule_to_close_ms / 1000.0) < $1
                           THEN 'schedule_to_close'
                       WHEN status = 'pending' AND attempt = 0
                            AND scheduled_at + make_interval(secs => schedule_to_start_ms / 1000.0) < $1
                           THEN 'schedule_to_start'
                       WHEN status = 'claimed' AND heartbeat_ms IS NOT NULL
                            AND last_heartbeat_at + make_interval(secs => heartbeat_ms / 1000.0) < $1
                           THEN 'heartbeat'
                       WHEN status = 'claimed'
                            AND started_at + make_interval(secs => start_to_close_ms / 1000.0) < $1
                           THEN 'start_to_close'
                   END AS timeout_kind
            FROM activity_tasks
            WHERE status IN ('pending', 'claimed')
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut timed_out = vec![];
        for row in rows {
            let Some(kind) = row.get::<Option<String>, _>("timeout_kind") else {
                continue;
            };
            let timeout: TimeoutKind =
                serde_json::from_value(serde_json::Value::String(kind)).map_err(ser_err)?;

            timed_out.push(TimedOutTask {
                task_id: row.get("task_id"),
                run_id: row.get("run_id"),
                activity_id: row.get("activity_id"),
                timeout,
            });
        }

        Ok(timed_out)
    }

    async fn queue_depth(&self, queue: TaskQueue) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS depth FROM activity_tasks WHERE queue = $1 AND status = 'pending'",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("depth") as usize)
    }

    async fn take_completion_reports(
        &self,
        max: usize,
    ) -> Result<Vec<CompletionReport>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM completion_reports
            WHERE id IN (
                SELECT id FROM completion_reports
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING task_id, workflow_id, run_id, scheduled_event_id, activity_id, attempt, outcome
            "#,
        )
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut reports = Vec::with_capacity(rows.len());
        for row in rows {
            let outcome: serde_json::Value = row.get("outcome");
            reports.push(CompletionReport {
                task_id: row.get("task_id"),
                workflow_id: row.get("workflow_id"),
                run_id: row.get("run_id"),
                scheduled_event_id: row.get("scheduled_event_id"),
                activity_id: row.get("activity_id"),
                attempt: row.get::<i32, _>("attempt") as u32,
                outcome: serde_json::from_value(outcome).map_err(ser_err)?,
            });
        }

        Ok(reports)
    }

    async fn schedule_timer(
        &self,
        run_id: Uuid,
        timer_id: &str,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO timers (run_id, timer_id, fire_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (run_id, timer_id) DO UPDATE SET fire_at = EXCLUDED.fire_at
            "#,
        )
        .bind(run_id)
        .bind(timer_id)
        .bind(fire_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn pop_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<DueTimer>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM timers
            WHERE (run_id, timer_id) IN (
                SELECT run_id, timer_id FROM timers
                WHERE fire_at <= $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING run_id, timer_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| DueTimer {
                run_id: row.get("run_id"),
                timer_id: row.get("timer_id"),
            })
            .collect())
    }

    async fn push_signal(&self, run_id: Uuid, signal: Signal) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT e.workflow_id, (SELECT COUNT(*) FROM signals s WHERE s.run_id = $1) AS pending
            FROM executions e
            WHERE e.run_id = $1
            FOR UPDATE
            "#,
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::RunNotFound(run_id))?;

        let pending: i64 = row.get("pending");
        if pending as usize >= SIGNAL_CHANNEL_CAPACITY {
            let workflow_id: String = row.get("workflow_id");
            tx.rollback().await.map_err(db_err)?;
            return Err(StoreError::ChannelFull(workflow_id));
        }

        sqlx::query(
            r#"
            INSERT INTO signals (run_id, name, payload, sent_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(run_id)
        .bind(&signal.name)
        .bind(&signal.payload)
        .bind(signal.sent_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn pending_signals(&self, run_id: Uuid) -> Result<Vec<Signal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT name, payload, sent_at FROM signals
            WHERE run_id = $1
            ORDER BY id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| Signal {
                name: row.get("name"),
                payload: row.get("payload"),
                sent_at: row.get("sent_at"),
            })
            .collect())
    }

    async fn mark_signals_processed(&self, run_id: Uuid, count: usize) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM signals
            WHERE id IN (
                SELECT id FROM signals WHERE run_id = $1 ORDER BY id LIMIT $2
            )
            "#,
        )
        .bind(run_id)
        .bind(count as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn upsert_search_attributes(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        attributes: &AttributeMap,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for (name, value) in attributes {
            let (value_text, value_number, value_time) = match value {
                AttributeValue::Text(s) => (Some(s.clone()), None, None),
                AttributeValue::Number(n) => (None, Some(*n), None),
                AttributeValue::Time(t) => (None, None, Some(*t)),
            };

            sqlx::query(
                r#"
                INSERT INTO search_attributes
                    (run_id, workflow_id, attribute_name, value_text, value_number, value_time)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (run_id, attribute_name) DO UPDATE
                SET value_text = EXCLUDED.value_text,
                    value_number = EXCLUDED.value_number,
                    value_time = EXCLUDED.value_time
                "#,
            )
            .bind(run_id)
            .bind(workflow_id)
            .bind(name)
            .bind(&value_text)
            .bind(value_number)
            .bind(value_time)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_search_attributes(&self, run_id: Uuid) -> Result<AttributeMap, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT attribute_name, value_text, value_number, value_time
            FROM search_attributes
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut attributes = AttributeMap::new();
        for row in rows {
            let name: String = row.get("attribute_name");
            let value = if let Some(text) = row.get::<Option<String>, _>("value_text") {
                AttributeValue::Text(text)
            } else if let Some(number) = row.get::<Option<f64>, _>("value_number") {
                AttributeValue::Number(number)
            } else if let Some(time) = row.get::<Option<DateTime<Utc>>, _>("value_time") {
                AttributeValue::Time(time)
            } else {
                continue;
            };
            attributes.insert(name, value);
        }

        Ok(attributes)
    }

    async fn query_executions(
        &self,
        filter: &AttributeFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT e.* FROM executions e WHERE TRUE");

        for (name, value) in &filter.equals {
            builder.push(
                " AND EXISTS (SELECT 1 FROM search_attributes sa WHERE sa.run_id = e.run_id \
                 AND sa.attribute_name = ",
            );
            builder.push_bind(name.clone());
            match value {
                AttributeValue::Text(s) => {
                    builder.push(" AND sa.value_text = ");
                    builder.push_bind(s.clone());
                }
                AttributeValue::Number(n) => {
                    builder.push(" AND sa.value_number = ");
                    builder.push_bind(*n);
                }
                AttributeValue::Time(t) => {
                    builder.push(" AND sa.value_time = ");
                    builder.push_bind(*t);
                }
            }
            builder.push(")");
        }

        builder.push(" ORDER BY e.start_time DESC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn append_inbox(
        &self,
        principal: &str,
        workflow_id: &str,
        kind: InboxKind,
        payload: serde_json::Value,
    ) -> Result<InboxSignal, StoreError> {
        let kind_str = serde_json::to_value(kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "status".to_string());

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Serialize sequence assignment per principal; sequences must be
        // strictly increasing with no duplicates under concurrent publishes.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(principal)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let row = sqlx::query(
            r#"
            INSERT INTO signal_inbox (principal, sequence, workflow_id, kind, payload)
            SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3, $4
            FROM signal_inbox
            WHERE principal = $1
            RETURNING principal, sequence, workflow_id, kind, payload, created_at, read_at
            "#,
        )
        .bind(principal)
        .bind(workflow_id)
        .bind(&kind_str)
        .bind(&payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let signal = row_to_inbox(&row)?;
        tx.commit().await.map_err(db_err)?;
        Ok(signal)
    }

    async fn list_inbox(
        &self,
        principal: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<InboxSignal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM signal_inbox
            WHERE principal = $1
            ORDER BY sequence DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(principal)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_inbox).collect()
    }

    async fn inbox_after(
        &self,
        principal: &str,
        after_sequence: i64,
    ) -> Result<Vec<InboxSignal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM signal_inbox
            WHERE principal = $1 AND sequence > $2
            ORDER BY sequence
            "#,
        )
        .bind(principal)
        .bind(after_sequence)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_inbox).collect()
    }

    async fn mark_inbox_read(&self, principal: &str, sequence: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE signal_inbox
            SET read_at = COALESCE(read_at, now())
            WHERE principal = $1 AND sequence = $2
            "#,
        )
        .bind(principal)
        .bind(sequence)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn unread_inbox_count(&self, principal: &str) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unread FROM signal_inbox WHERE principal = $1 AND read_at IS NULL",
        )
        .bind(principal)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("unread") as u64)
    }

    async fn register_worker(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        let activity_types = serde_json::to_value(&worker.activity_types).map_err(ser_err)?;

        sqlx::query(
            r#"
            INSERT INTO workers
                (id, queue, activity_types, max_concurrency, current_load, accepting_tasks)
            VALUES ($1, $2, $3, $4, 0, TRUE)
            ON CONFLICT (id) DO UPDATE
            SET queue = EXCLUDED.queue,
                activity_types = EXCLUDED.activity_types,
                max_concurrency = EXCLUDED.max_concurrency,
                last_heartbeat_at = now()
            "#,
        )
        .bind(&worker.id)
        .bind(worker.queue.as_str())
        .bind(&activity_types)
        .bind(worker.max_concurrency as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn worker_heartbeat(
        &self,
        worker_id: &str,
        current_load: usize,
        accepting_tasks: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE workers
            SET current_load = $2, accepting_tasks = $3, last_heartbeat_at = now()
            WHERE id = $1
            "#,
        )
        .bind(worker_id)
        .bind(current_load as i32)
        .bind(accepting_tasks)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workers")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut workers = Vec::with_capacity(rows.len());
        for row in rows {
            let queue: String = row.get("queue");
            let activity_types: serde_json::Value = row.get("activity_types");
            workers.push(WorkerInfo {
                id: row.get("id"),
                queue: queue.parse().map_err(StoreError::Serialization)?,
                activity_types: serde_json::from_value(activity_types).map_err(ser_err)?,
                max_concurrency: row.get::<i32, _>("max_concurrency") as u32,
                current_load: row.get::<i32, _>("current_load") as u32,
                accepting_tasks: row.get("accepting_tasks"),
                started_at: row.get("started_at"),
                last_heartbeat_at: row.get("last_heartbeat_at"),
            });
        }

        Ok(workers)
    }
}
