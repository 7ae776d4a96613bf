//! PostgreSQL implementation of FollowupStore
//!
//! - Optimistic concurrency via the instance `version` column
//! - Step units run in one transaction; the compare-and-set `UPDATE` holds
//!   the row lock until commit, so a duplicate job blocks and then conflicts
//! - Natural-key upsert via `ON CONFLICT ... DO UPDATE`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::definition::{Channel, Step, WorkflowDefinition};
use crate::instance::{
    ExecutionLogEntry, FollowupInstance, InstanceKey, InstanceState, InstanceStatus, LogStatus,
    StateColumns,
};

const INSTANCE_COLUMNS: &str = r#"
    id, tenant_id, recipient_id, workflow_id, status, current_step_id, next_run_at,
    completed_at, halted_at, started_at, last_step_run_at, metadata, version
"#;

/// PostgreSQL implementation of FollowupStore
///
/// # Example
///
/// ```ignore
/// use steward_followup::PostgresFollowupStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/steward").await?;
/// let store = PostgresFollowupStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresFollowupStore {
    pool: PgPool,
}

impl PostgresFollowupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

#[async_trait]
impl FollowupStore for PostgresFollowupStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        workflow.validate()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO followup_workflows (id, tenant_id, name, active, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, active = EXCLUDED.active
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.tenant_id)
        .bind(&workflow.name)
        .bind(workflow.active)
        .bind(workflow.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to save workflow: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let step_ids: Vec<Uuid> = workflow.steps.iter().map(|s| s.id).collect();
        sqlx::query("DELETE FROM followup_steps WHERE workflow_id = $1 AND id <> ALL($2)")
            .bind(workflow.id)
            .bind(&step_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for step in &workflow.steps {
            sqlx::query(
                r#"
                INSERT INTO followup_steps
                    (id, workflow_id, sequence, delay_seconds, channel, template_id, active, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (id) DO UPDATE
                SET sequence = EXCLUDED.sequence,
                    delay_seconds = EXCLUDED.delay_seconds,
                    channel = EXCLUDED.channel,
                    template_id = EXCLUDED.template_id,
                    active = EXCLUDED.active,
                    metadata = EXCLUDED.metadata
                "#,
            )
            .bind(step.id)
            .bind(workflow.id)
            .bind(step.sequence)
            .bind(i64::try_from(step.delay.as_secs()).unwrap_or(i64::MAX))
            .bind(step.channel.as_str())
            .bind(step.template_id)
            .bind(step.active)
            .bind(&step.metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to save step: {}", e);
                StoreError::Database(e.to_string())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(steps = workflow.steps.len(), "saved workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let Some(row) = sqlx::query(
            r#"
            SELECT id, tenant_id, name, active, created_at
            FROM followup_workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get workflow: {}", e);
            StoreError::Database(e.to_string())
        })?
        else {
            return Ok(None);
        };

        let step_rows = sqlx::query(
            r#"
            SELECT id, workflow_id, sequence, delay_seconds, channel, template_id, active, metadata
            FROM followup_steps
            WHERE workflow_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load steps: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(Some(WorkflowDefinition {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            name: row.get("name"),
            active: row.get("active"),
            created_at: row.get("created_at"),
            steps: step_rows.iter().map(step_from_row).collect(),
        }))
    }

    #[instrument(skip(self))]
    async fn set_workflow_active(
        &self,
        workflow_id: Uuid,
        active: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE followup_workflows SET active = $2 WHERE id = $1")
            .bind(workflow_id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_step_active(&self, step_id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE followup_steps SET active = $2 WHERE id = $1")
            .bind(step_id)
            .bind(active)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(step_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<FollowupInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM followup_instances WHERE id = $1",
            INSTANCE_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_instance(
        &self,
        key: InstanceKey,
    ) -> Result<Option<FollowupInstance>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM followup_instances
            WHERE tenant_id = $1 AND recipient_id = $2 AND workflow_id = $3
            "#,
            INSTANCE_COLUMNS
        ))
        .bind(key.tenant_id)
        .bind(key.recipient_id)
        .bind(key.workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(instance_from_row).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn list_instances(
        &self,
        tenant_id: Uuid,
        filter: &InstanceFilter,
        pagination: Pagination,
    ) -> Result<Vec<FollowupInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM followup_instances
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR workflow_id = $3)
              AND ($4::uuid IS NULL OR recipient_id = $4)
            ORDER BY id ASC
            OFFSET $5 LIMIT $6
            "#,
            INSTANCE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.workflow_id)
        .bind(filter.recipient_id)
        .bind(i64::from(pagination.offset))
        .bind(i64::from(pagination.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to list instances: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(instance_from_row).collect()
    }

    #[instrument(skip(self, instance, log), fields(instance_id = %instance.id))]
    async fn upsert_instance(
        &self,
        instance: FollowupInstance,
        log: Option<ExecutionLogEntry>,
    ) -> Result<Upserted, StoreError> {
        let columns = instance.state.columns();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO followup_instances
                (id, tenant_id, recipient_id, workflow_id, status, current_step_id, next_run_at,
                 completed_at, halted_at, started_at, last_step_run_at, metadata, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 0)
            ON CONFLICT (tenant_id, recipient_id, workflow_id) DO UPDATE
            SET status = EXCLUDED.status,
                current_step_id = EXCLUDED.current_step_id,
                next_run_at = EXCLUDED.next_run_at,
                completed_at = EXCLUDED.completed_at,
                halted_at = EXCLUDED.halted_at,
                started_at = EXCLUDED.started_at,
                last_step_run_at = EXCLUDED.last_step_run_at,
                version = followup_instances.version + 1,
                updated_at = NOW()
            RETURNING {}, (xmax = 0) AS created
            "#,
            INSTANCE_COLUMNS
        ))
        .bind(instance.id)
        .bind(instance.tenant_id)
        .bind(instance.recipient_id)
        .bind(instance.workflow_id)
        .bind(columns.status.to_string())
        .bind(columns.current_step_id)
        .bind(columns.next_run_at)
        .bind(columns.completed_at)
        .bind(columns.halted_at)
        .bind(instance.started_at)
        .bind(instance.last_step_run_at)
        .bind(&instance.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to upsert instance: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let created: bool = row.get("created");
        let stored = instance_from_row(&row)?;

        if let Some(mut entry) = log {
            entry.instance_id = stored.id;
            insert_log(&mut tx, &entry).await?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(instance_id = %stored.id, created, version = stored.version, "upserted instance");
        Ok(Upserted {
            instance: stored,
            created,
        })
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.id))]
    async fn update_instance(
        &self,
        instance: &FollowupInstance,
        expected_version: i64,
    ) -> Result<FollowupInstance, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        compare_and_set(&mut conn, instance, expected_version).await
    }

    #[instrument(skip(self))]
    async fn due_instances(
        &self,
        tenant_id: Option<Uuid>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM followup_instances
            WHERE status IN ('pending', 'in_progress')
              AND (next_run_at <= $1 OR (status = 'in_progress' AND next_run_at IS NULL))
              AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY next_run_at ASC NULLS FIRST
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(tenant_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to select due instances: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn begin_step(&self) -> Result<Box<dyn StepTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Box::new(PgStepTransaction { tx }))
    }

    #[instrument(skip(self))]
    async fn execution_log(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ExecutionLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, step_id, status, channel, run_at, note, metadata
            FROM followup_execution_log
            WHERE instance_id = $1
            ORDER BY run_at ASC, id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load execution log: {}", e);
            StoreError::Database(e.to_string())
        })?;

        rows.iter().map(log_from_row).collect()
    }
}

/// Step unit backed by a database transaction; dropping it rolls back
struct PgStepTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StepTransaction for PgStepTransaction {
    async fn update_instance(
        &mut self,
        instance: &FollowupInstance,
        expected_version: i64,
    ) -> Result<FollowupInstance, StoreError> {
        compare_and_set(&mut self.tx, instance, expected_version).await
    }

    async fn append_log(&mut self, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
        insert_log(&mut self.tx, entry).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

async fn compare_and_set(
    conn: &mut PgConnection,
    instance: &FollowupInstance,
    expected_version: i64,
) -> Result<FollowupInstance, StoreError> {
    let columns = instance.state.columns();

    let row = sqlx::query(&format!(
        r#"
        UPDATE followup_instances
        SET status = $3,
            current_step_id = $4,
            next_run_at = $5,
            completed_at = $6,
            halted_at = $7,
            last_step_run_at = $8,
            metadata = $9,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1 AND version = $2
        RETURNING {}
        "#,
        INSTANCE_COLUMNS
    ))
    .bind(instance.id)
    .bind(expected_version)
    .bind(columns.status.to_string())
    .bind(columns.current_step_id)
    .bind(columns.next_run_at)
    .bind(columns.completed_at)
    .bind(columns.halted_at)
    .bind(instance.last_step_run_at)
    .bind(&instance.metadata)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to update instance: {}", e);
        StoreError::Database(e.to_string())
    })?;

    if let Some(row) = row {
        return instance_from_row(&row);
    }

    let actual: Option<i64> =
        sqlx::query_scalar("SELECT version FROM followup_instances WHERE id = $1")
            .bind(instance.id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

    match actual {
        Some(actual) => Err(StoreError::ConcurrencyConflict {
            expected: expected_version,
            actual,
        }),
        None => Err(StoreError::InstanceNotFound(instance.id)),
    }
}

async fn insert_log(conn: &mut PgConnection, entry: &ExecutionLogEntry) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO followup_execution_log
            (id, instance_id, step_id, status, channel, run_at, note, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id)
    .bind(entry.instance_id)
    .bind(entry.step_id)
    .bind(entry.status.to_string())
    .bind(entry.channel.as_ref().map(|c| c.as_str().to_string()))
    .bind(entry.run_at)
    .bind(&entry.note)
    .bind(&entry.metadata)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to append execution log: {}", e);
        StoreError::Database(e.to_string())
    })?;

    Ok(())
}

fn instance_from_row(row: &PgRow) -> Result<FollowupInstance, StoreError> {
    let status: String = row.get("status");
    let state = InstanceState::from_columns(StateColumns {
        status: parse_instance_status(&status)?,
        current_step_id: row.get("current_step_id"),
        next_run_at: row.get("next_run_at"),
        completed_at: row.get("completed_at"),
        halted_at: row.get("halted_at"),
    })?;

    Ok(FollowupInstance {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        recipient_id: row.get("recipient_id"),
        workflow_id: row.get("workflow_id"),
        state,
        started_at: row.get("started_at"),
        last_step_run_at: row.get("last_step_run_at"),
        metadata: row.get("metadata"),
        version: row.get("version"),
    })
}

fn step_from_row(row: &PgRow) -> Step {
    let delay_seconds: i64 = row.get("delay_seconds");
    let channel: String = row.get("channel");

    Step {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        sequence: row.get("sequence"),
        delay: Duration::from_secs(u64::try_from(delay_seconds).unwrap_or(0)),
        channel: Channel::from(channel),
        template_id: row.get("template_id"),
        active: row.get("active"),
        metadata: row.get("metadata"),
    }
}

fn log_from_row(row: &PgRow) -> Result<ExecutionLogEntry, StoreError> {
    let status: String = row.get("status");
    let channel: Option<String> = row.get("channel");

    Ok(ExecutionLogEntry {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        step_id: row.get("step_id"),
        status: parse_log_status(&status)?,
        channel: channel.map(Channel::from),
        run_at: row.get("run_at"),
        note: row.get("note"),
        metadata: row.get("metadata"),
    })
}

fn parse_instance_status(status: &str) -> Result<InstanceStatus, StoreError> {
    status.parse().map_err(StoreError::from)
}

fn parse_log_status(status: &str) -> Result<LogStatus, StoreError> {
    status.parse().map_err(StoreError::Database)
}
