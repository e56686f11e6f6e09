use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{ExecutionCommit, Provider, ProviderError};
use crate::{
    ActionType, DEFAULT_EXECUTOR_GROUP, ExecutorInfo, ExternalChange, InstanceStatus, NewWorkflowInstance,
    WorkflowInstance, WorkflowInstanceAction,
};

const INSTANCE_COLUMNS: &str = "id, workflow_type, external_id, business_key, executor_group, state, state_text, \
     status, executor_id, next_activation, retries, parent_workflow_id, parent_action_id, priority, \
     state_variables, created, modified, started";

const ACTION_COLUMNS: &str = "id, workflow_instance_id, executor_id, action_type, state, state_text, retry_no, \
     execution_start, execution_end, updated_state_variables";

const EXECUTOR_COLUMNS: &str = "id, host, pid, executor_group, started, active, expires, stopped, recovered";

static EXTERNAL_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Configuration options for SqliteProvider
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Pool size for file-backed databases. In-memory databases use one
    /// connection.
    pub max_connections: u32,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(60),
        }
    }
}

/// SQLite-backed provider with full transactional support.
///
/// Every claim, release and wakeup is a single conditional `UPDATE` whose
/// affected-row count decides the outcome. Multi-row writes (`persist`,
/// recovery, external changes) run in one transaction that starts with a
/// write so the database lock is taken up front.
pub struct SqliteProvider {
    pool: SqlitePool,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::unavailable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::conflict(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") || error_msg.contains("pool") {
            return ProviderError::unavailable(operation, format!("Connection error: {error_msg}"));
        }

        ProviderError::unavailable(operation, error_msg)
    }

    /// Create a new SQLite provider
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db?mode=rwc" or "sqlite::memory:")
    /// * `options` - Optional pool configuration
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let busy_timeout_ms = options.busy_timeout.as_millis() as i64;

        let mut pool_options = SqlitePoolOptions::new();
        if is_memory {
            // A single long-lived connection keeps the in-memory database alive
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(options.max_connections.max(1));
        }

        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query(&format!("PRAGMA busy_timeout = {busy_timeout_ms}"))
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "durastate::providers::sqlite", database_url, is_memory, "SQLite provider ready");

        Ok(Self { pool })
    }

    /// Convenience: create a private in-memory SQLite store (tests, demos)
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:", None).await
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create schema directly; every statement is idempotent.
    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host TEXT NOT NULL,
                pid INTEGER NOT NULL,
                executor_group TEXT NOT NULL,
                started INTEGER NOT NULL,
                active INTEGER NOT NULL,
                expires INTEGER NOT NULL,
                stopped INTEGER,
                recovered INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_type TEXT NOT NULL,
                external_id TEXT NOT NULL,
                business_key TEXT,
                executor_group TEXT NOT NULL,
                state TEXT NOT NULL,
                state_text TEXT,
                status TEXT NOT NULL,
                executor_id INTEGER,
                next_activation INTEGER,
                retries INTEGER NOT NULL DEFAULT 0 CHECK(retries >= 0),
                parent_workflow_id INTEGER REFERENCES workflow_instances(id),
                parent_action_id INTEGER,
                priority INTEGER NOT NULL DEFAULT 0,
                state_variables TEXT NOT NULL DEFAULT '{}',
                created INTEGER NOT NULL,
                modified INTEGER NOT NULL,
                started INTEGER,
                UNIQUE (workflow_type, external_id, executor_group)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_actions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_instance_id INTEGER NOT NULL REFERENCES workflow_instances(id),
                executor_id INTEGER,
                action_type TEXT NOT NULL,
                state TEXT NOT NULL,
                state_text TEXT,
                retry_no INTEGER NOT NULL DEFAULT 0,
                execution_start INTEGER NOT NULL,
                execution_end INTEGER NOT NULL,
                updated_state_variables TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_poll ON workflow_instances(executor_group, next_activation) \
             WHERE executor_id IS NULL",
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_executor ON workflow_instances(executor_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_instances_parent ON workflow_instances(parent_workflow_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_actions_instance ON workflow_actions(workflow_instance_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executors_group ON executors(executor_group, expires)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Generate a unique external id for instances created without one
    fn generate_external_id() -> String {
        let seq = EXTERNAL_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        format!("{:x}-{:x}-{seq}", crate::now_millis(), std::process::id())
    }

    fn encode_variables(operation: &str, vars: &BTreeMap<String, String>) -> Result<String, ProviderError> {
        serde_json::to_string(vars)
            .map_err(|e| ProviderError::invalid(operation, format!("Serialization error: {e}")))
    }

    fn decode_variables(operation: &str, raw: &str) -> Result<BTreeMap<String, String>, ProviderError> {
        serde_json::from_str(raw)
            .map_err(|e| ProviderError::corrupt(operation, format!("Corrupt state variables: {e}")))
    }

    fn column<'r, T>(row: &'r SqliteRow, operation: &str, name: &str) -> Result<T, ProviderError>
    where
        T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
    {
        row.try_get(name)
            .map_err(|e| ProviderError::corrupt(operation, format!("Failed to decode {name}: {e}")))
    }

    fn row_to_instance(row: &SqliteRow, operation: &str) -> Result<WorkflowInstance, ProviderError> {
        let status: String = Self::column(row, operation, "status")?;
        let variables: String = Self::column(row, operation, "state_variables")?;
        Ok(WorkflowInstance {
            id: Self::column(row, operation, "id")?,
            workflow_type: Self::column(row, operation, "workflow_type")?,
            external_id: Self::column(row, operation, "external_id")?,
            business_key: Self::column(row, operation, "business_key")?,
            executor_group: Self::column(row, operation, "executor_group")?,
            state: Self::column(row, operation, "state")?,
            state_text: Self::column(row, operation, "state_text")?,
            status: status
                .parse::<InstanceStatus>()
                .map_err(|e| ProviderError::corrupt(operation, e))?,
            executor_id: Self::column(row, operation, "executor_id")?,
            next_activation: Self::column::<Option<i64>>(row, operation, "next_activation")?.map(|v| v as u64),
            retries: Self::column::<i64>(row, operation, "retries")? as u32,
            parent_workflow_id: Self::column(row, operation, "parent_workflow_id")?,
            parent_action_id: Self::column(row, operation, "parent_action_id")?,
            priority: Self::column::<i64>(row, operation, "priority")? as i32,
            state_variables: Self::decode_variables(operation, &variables)?,
            created: Self::column::<i64>(row, operation, "created")? as u64,
            modified: Self::column::<i64>(row, operation, "modified")? as u64,
            started: Self::column::<Option<i64>>(row, operation, "started")?.map(|v| v as u64),
        })
    }

    fn row_to_action(row: &SqliteRow, operation: &str) -> Result<WorkflowInstanceAction, ProviderError> {
        let action_type: String = Self::column(row, operation, "action_type")?;
        let variables: String = Self::column(row, operation, "updated_state_variables")?;
        Ok(WorkflowInstanceAction {
            id: Self::column(row, operation, "id")?,
            workflow_instance_id: Self::column(row, operation, "workflow_instance_id")?,
            executor_id: Self::column(row, operation, "executor_id")?,
            state: Self::column(row, operation, "state")?,
            state_text: Self::column(row, operation, "state_text")?,
            action_type: action_type
                .parse::<ActionType>()
                .map_err(|e| ProviderError::corrupt(operation, e))?,
            retry_no: Self::column::<i64>(row, operation, "retry_no")? as u32,
            execution_start: Self::column::<i64>(row, operation, "execution_start")? as u64,
            execution_end: Self::column::<i64>(row, operation, "execution_end")? as u64,
            updated_state_variables: Self::decode_variables(operation, &variables)?,
        })
    }

    fn row_to_executor(row: &SqliteRow, operation: &str) -> Result<ExecutorInfo, ProviderError> {
        Ok(ExecutorInfo {
            id: Self::column(row, operation, "id")?,
            host: Self::column(row, operation, "host")?,
            pid: Self::column::<i64>(row, operation, "pid")? as u32,
            executor_group: Self::column(row, operation, "executor_group")?,
            started: Self::column::<i64>(row, operation, "started")? as u64,
            active: Self::column::<i64>(row, operation, "active")? as u64,
            expires: Self::column::<i64>(row, operation, "expires")? as u64,
            stopped: Self::column::<Option<i64>>(row, operation, "stopped")?.map(|v| v as u64),
            recovered: Self::column::<Option<i64>>(row, operation, "recovered")?.map(|v| v as u64),
        })
    }

    /// Insert one instance inside an open transaction.
    ///
    /// With `ignore_duplicate` an existing `(type, external_id, group)` row is
    /// left untouched and its id returned; otherwise the duplicate is an error.
    async fn insert_instance_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance: &NewWorkflowInstance,
        now: u64,
        ignore_duplicate: bool,
    ) -> Result<i64, ProviderError> {
        let state = instance
            .state
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ProviderError::invalid(
                    operation,
                    format!("initial state of workflow type '{}' is not resolved", instance.workflow_type),
                )
            })?;
        let external_id = instance.external_id.clone().unwrap_or_else(Self::generate_external_id);
        let group = instance.executor_group.as_deref().unwrap_or(DEFAULT_EXECUTOR_GROUP);
        let variables = Self::encode_variables(operation, &instance.state_variables)?;
        let next_activation = instance.next_activation.unwrap_or(now);

        let conflict_clause = if ignore_duplicate {
            " ON CONFLICT(workflow_type, external_id, executor_group) DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            r#"
            INSERT INTO workflow_instances
            (workflow_type, external_id, business_key, executor_group, state, state_text, status,
             next_activation, retries, parent_workflow_id, parent_action_id, priority, state_variables,
             created, modified)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?){conflict_clause}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(&instance.workflow_type)
            .bind(&external_id)
            .bind(&instance.business_key)
            .bind(group)
            .bind(state)
            .bind(&instance.state_text)
            .bind(InstanceStatus::Created.as_str())
            .bind(next_activation as i64)
            .bind(instance.parent_workflow_id)
            .bind(instance.parent_action_id)
            .bind(instance.priority as i64)
            .bind(variables)
            .bind(now as i64)
            .bind(now as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;

        if result.rows_affected() == 1 {
            return Ok(result.last_insert_rowid());
        }

        let existing: i64 = sqlx::query_scalar(
            "SELECT id FROM workflow_instances WHERE workflow_type = ? AND external_id = ? AND executor_group = ?",
        )
        .bind(&instance.workflow_type)
        .bind(&external_id)
        .bind(group)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        debug!(
            target: "durastate::providers::sqlite",
            instance_id = existing,
            workflow_type = %instance.workflow_type,
            external_id = %external_id,
            "Instance already exists, returning existing id"
        );
        Ok(existing)
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_instance(&self, instance: NewWorkflowInstance) -> Result<i64, ProviderError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;
        let id = Self::insert_instance_in_tx(&mut tx, "create_instance", &instance, self.now(), true).await?;
        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;
        Ok(id)
    }

    async fn load_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, ProviderError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("load_instance", e))?;
        row.map(|r| Self::row_to_instance(&r, "load_instance")).transpose()
    }

    async fn list_actions(&self, instance_id: i64) -> Result<Vec<WorkflowInstanceAction>, ProviderError> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM workflow_actions WHERE workflow_instance_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(instance_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_actions", e))?;
        rows.iter().map(|r| Self::row_to_action(r, "list_actions")).collect()
    }

    async fn list_children(&self, parent_id: i64) -> Result<Vec<WorkflowInstance>, ProviderError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE parent_workflow_id = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_children", e))?;
        rows.iter().map(|r| Self::row_to_instance(r, "list_children")).collect()
    }

    async fn poll_claimable_ids(&self, group: &str, limit: usize) -> Result<Vec<i64>, ProviderError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM workflow_instances
            WHERE executor_group = ?
              AND executor_id IS NULL
              AND next_activation IS NOT NULL
              AND next_activation <= ?
            ORDER BY priority DESC, next_activation ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(group)
        .bind(self.now() as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("poll_claimable_ids", e))?;
        Ok(ids)
    }

    async fn claim(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError> {
        let now = self.now() as i64;
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET executor_id = ?, modified = ?
            WHERE id = ?
              AND executor_id IS NULL
              AND next_activation IS NOT NULL
              AND next_activation <= ?
            "#,
        )
        .bind(executor_id)
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("claim", e))?;

        let claimed = result.rows_affected() == 1;
        debug!(target: "durastate::providers::sqlite", instance_id = id, executor_id, claimed, "Claim attempt");
        Ok(claimed)
    }

    async fn release(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET executor_id = NULL,
                modified = ?,
                status = CASE WHEN status = 'executing' THEN 'inProgress' ELSE status END
            WHERE id = ? AND executor_id = ?
            "#,
        )
        .bind(self.now() as i64)
        .bind(id)
        .bind(executor_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("release", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn persist(&self, commit: ExecutionCommit) -> Result<Option<i64>, ProviderError> {
        let now = self.now();
        let variables = Self::encode_variables("persist", &commit.state_variables)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("persist", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = ?, state_text = ?, status = ?, executor_id = ?, next_activation = ?, retries = ?,
                business_key = ?, state_variables = ?, modified = ?, started = COALESCE(started, ?)
            WHERE id = ? AND executor_id = ?
            "#,
        )
        .bind(&commit.state)
        .bind(&commit.state_text)
        .bind(commit.status.as_str())
        .bind(commit.executor_id)
        .bind(commit.next_activation.map(|v| v as i64))
        .bind(commit.retries as i64)
        .bind(&commit.business_key)
        .bind(variables)
        .bind(now as i64)
        .bind(commit.started.map(|v| v as i64))
        .bind(commit.instance_id)
        .bind(commit.owner)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("persist", e))?;

        if updated.rows_affected() != 1 {
            tx.rollback().await.ok();
            return Err(ProviderError::not_owned("persist", commit.instance_id, commit.owner));
        }

        let action_id = if let Some(action) = &commit.action {
            let action_vars = Self::encode_variables("persist", &action.updated_state_variables)?;
            let inserted = sqlx::query(
                r#"
                INSERT INTO workflow_actions
                (workflow_instance_id, executor_id, action_type, state, state_text, retry_no,
                 execution_start, execution_end, updated_state_variables)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(commit.instance_id)
            .bind(action.executor_id)
            .bind(action.action_type.as_str())
            .bind(&action.state)
            .bind(&action.state_text)
            .bind(action.retry_no as i64)
            .bind(action.execution_start as i64)
            .bind(action.execution_end as i64)
            .bind(action_vars)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("persist", e))?;
            Some(inserted.last_insert_rowid())
        } else {
            None
        };

        for child in &commit.new_instances {
            let mut child = child.clone();
            if child.parent_workflow_id.is_some() && child.parent_action_id.is_none() {
                child.parent_action_id = action_id;
            }
            Self::insert_instance_in_tx(&mut tx, "persist", &child, now, false).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("persist", e))?;

        debug!(
            target: "durastate::providers::sqlite",
            instance_id = commit.instance_id,
            state = %commit.state,
            status = %commit.status,
            action_id = ?action_id,
            new_instances = commit.new_instances.len(),
            "Persisted execution"
        );
        Ok(action_id)
    }

    async fn wakeup_if_idle(&self, id: i64, expected_states: &[String]) -> Result<bool, ProviderError> {
        let now = self.now() as i64;
        let mut sql = String::from(
            r#"
            UPDATE workflow_instances
            SET next_activation = ?, modified = ?
            WHERE id = ?
              AND executor_id IS NULL
              AND (next_activation IS NULL OR next_activation > ?)
            "#,
        );
        if !expected_states.is_empty() {
            sql.push_str(&format!(" AND state IN ({})", Self::placeholders(expected_states.len())));
        }
        let mut query = sqlx::query(&sql).bind(now).bind(now).bind(id).bind(now);
        for state in expected_states {
            query = query.bind(state);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("wakeup_if_idle", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_external_change(&self, id: i64, change: ExternalChange) -> Result<bool, ProviderError> {
        let now = self.now() as i64;
        let status = if change.next_activation.is_some() {
            Some(InstanceStatus::InProgress)
        } else {
            change.status
        };
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("apply_external_change", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = COALESCE(?, state),
                state_text = ?,
                next_activation = ?,
                status = COALESCE(?, status),
                retries = CASE WHEN ? IS NULL THEN retries ELSE 0 END,
                modified = ?
            WHERE id = ? AND executor_id IS NULL
            "#,
        )
        .bind(&change.state)
        .bind(&change.state_text)
        .bind(change.next_activation.map(|v| v as i64))
        .bind(status.map(|s| s.as_str()))
        .bind(&change.state)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("apply_external_change", e))?;

        if updated.rows_affected() != 1 {
            tx.rollback().await.ok();
            return Ok(false);
        }

        let row = sqlx::query("SELECT state, state_variables FROM workflow_instances WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("apply_external_change", e))?;
        let state: String = Self::column(&row, "apply_external_change", "state")?;

        if !change.state_variables.is_empty() {
            let raw: String = Self::column(&row, "apply_external_change", "state_variables")?;
            let mut variables = Self::decode_variables("apply_external_change", &raw)?;
            variables.extend(change.state_variables.clone());
            sqlx::query("UPDATE workflow_instances SET state_variables = ? WHERE id = ?")
                .bind(Self::encode_variables("apply_external_change", &variables)?)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("apply_external_change", e))?;
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_actions
            (workflow_instance_id, executor_id, action_type, state, state_text, retry_no,
             execution_start, execution_end, updated_state_variables)
            VALUES (?, NULL, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(ActionType::ExternalChange.as_str())
        .bind(&state)
        .bind(&change.state_text)
        .bind(now)
        .bind(now)
        .bind(Self::encode_variables("apply_external_change", &change.state_variables)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("apply_external_change", e))?;

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("apply_external_change", e))?;
        Ok(true)
    }

    async fn register_executor(
        &self,
        group: &str,
        host: &str,
        pid: u32,
        timeout: Duration,
    ) -> Result<i64, ProviderError> {
        let now = self.now();
        let expires = now.saturating_add(timeout.as_millis() as u64);
        let result = sqlx::query(
            "INSERT INTO executors (host, pid, executor_group, started, active, expires) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(host)
        .bind(pid as i64)
        .bind(group)
        .bind(now as i64)
        .bind(now as i64)
        .bind(expires as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("register_executor", e))?;
        Ok(result.last_insert_rowid())
    }

    async fn heartbeat_executor(&self, executor_id: i64, timeout: Duration) -> Result<(), ProviderError> {
        let now = self.now();
        let expires = now.saturating_add(timeout.as_millis() as u64);
        let result = sqlx::query("UPDATE executors SET active = ?, expires = ? WHERE id = ?")
            .bind(now as i64)
            .bind(expires as i64)
            .bind(executor_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("heartbeat_executor", e))?;
        if result.rows_affected() != 1 {
            return Err(ProviderError::not_found(
                "heartbeat_executor",
                format!("executor {executor_id} is not registered"),
            ));
        }
        Ok(())
    }

    async fn mark_executor_stopped(&self, executor_id: i64, expire: bool) -> Result<(), ProviderError> {
        let now = self.now() as i64;
        sqlx::query("UPDATE executors SET stopped = ?, expires = CASE WHEN ? THEN MIN(expires, ?) ELSE expires END WHERE id = ?")
            .bind(now)
            .bind(expire)
            .bind(now)
            .bind(executor_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("mark_executor_stopped", e))?;
        Ok(())
    }

    async fn recover_expired_executors(&self, group: &str, self_id: i64) -> Result<Vec<i64>, ProviderError> {
        let now = self.now() as i64;
        let expired = "SELECT id FROM executors WHERE executor_group = ? AND id <> ? AND expires < ?";
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("recover_expired_executors", e))?;

        // Audit rows first: the first statement is a write so the lock is held for the rest.
        let audited = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_actions
            (workflow_instance_id, executor_id, action_type, state, state_text, retry_no,
             execution_start, execution_end, updated_state_variables)
            SELECT id, ?, ?, state, 'Recovered', retries, ?, ?, '{{}}'
            FROM workflow_instances
            WHERE executor_id IN ({expired})
            "#
        ))
        .bind(self_id)
        .bind(ActionType::Recovery.as_str())
        .bind(now)
        .bind(now)
        .bind(group)
        .bind(self_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("recover_expired_executors", e))?;

        if audited.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(Vec::new());
        }

        let dead_owners: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT DISTINCT executor_id FROM workflow_instances WHERE executor_id IN ({expired})"
        ))
        .bind(group)
        .bind(self_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("recover_expired_executors", e))?;

        let recovered: Vec<i64> = sqlx::query_scalar(&format!(
            r#"
            UPDATE workflow_instances
            SET executor_id = NULL,
                modified = ?,
                status = CASE WHEN status = 'executing' THEN 'inProgress' ELSE status END
            WHERE executor_id IN ({expired})
            RETURNING id
            "#
        ))
        .bind(now)
        .bind(group)
        .bind(self_id)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("recover_expired_executors", e))?;

        if !dead_owners.is_empty() {
            let sql = format!(
                "UPDATE executors SET recovered = ? WHERE id IN ({})",
                Self::placeholders(dead_owners.len())
            );
            let mut query = sqlx::query(&sql).bind(now);
            for owner in &dead_owners {
                query = query.bind(owner);
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error("recover_expired_executors", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("recover_expired_executors", e))?;

        debug!(
            target: "durastate::providers::sqlite",
            group,
            recovering_executor = self_id,
            dead_executors = ?dead_owners,
            instances = ?recovered,
            "Recovered instances from expired executors"
        );
        Ok(recovered)
    }

    async fn list_executors(&self, group: &str) -> Result<Vec<ExecutorInfo>, ProviderError> {
        let sql = format!("SELECT {EXECUTOR_COLUMNS} FROM executors WHERE executor_group = ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(group)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("list_executors", e))?;
        rows.iter().map(|r| Self::row_to_executor(r, "list_executors")).collect()
    }
}
