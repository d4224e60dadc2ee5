//! SQLite persistence layer for workflows and executions (the L3 tier).
//!
//! Workflow graphs are stored normalized (workflows, workflow_nodes,
//! workflow_connections, workflow_triggers) so child collections can be
//! replaced transactionally. Executions carry their context document as a
//! versioned JSON column; steps live in their own table, one row per active
//! node.

use crate::error::{EngineError, EngineResult};
use crate::workflow::types::{
    validate_graph, Connection, ConditionType, Execution, ExecutionStatus, ExecutionStep, Node,
    NodeType, Position, SortKey, StepStatus, Trigger, WorkflowDefinition, WorkflowFilters,
    WorkflowMetadata, WorkflowPage, WorkflowSpec, WorkflowStatus, WorkflowSummary,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePool, Row};
use uuid::Uuid;

/// Window aggregate over executions, input to the analytics report
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub avg_completion_secs: f64,
}

/// SQLite-backed workflow store
///
/// The authoritative data source behind the cache hierarchy. All multi-row
/// writes are transactional; a failed create/update leaves prior state intact.
#[derive(Debug, Clone)]
pub struct WorkflowStore {
    pool: SqlitePool,
}

impl WorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the schema. Safe to call multiple times (IF NOT EXISTS).
    pub async fn init_schema(&self) -> EngineResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                performance_score REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_nodes (
                id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                label TEXT NOT NULL DEFAULT '',
                config JSON NOT NULL DEFAULT '{}',
                pos_x REAL NOT NULL DEFAULT 0,
                pos_y REAL NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (workflow_id, id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_connections (
                id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                source_node_id TEXT NOT NULL,
                target_node_id TEXT NOT NULL,
                condition_type TEXT NOT NULL DEFAULT 'always',
                condition_value TEXT,
                PRIMARY KEY (workflow_id, id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_triggers (
                id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                condition JSON NOT NULL DEFAULT '{}',
                active INTEGER NOT NULL DEFAULT 1,
                fire_count INTEGER NOT NULL DEFAULT 0,
                last_fired_at TEXT,
                PRIMARY KEY (workflow_id, id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                context JSON NOT NULL DEFAULT '{}',
                context_version INTEGER NOT NULL DEFAULT 0,
                complexity REAL NOT NULL DEFAULT 0,
                estimated_duration_secs INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_steps (
                execution_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_for TEXT,
                duration_ms INTEGER,
                error_message TEXT,
                PRIMARY KEY (execution_id, step_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_workflows_user ON workflows(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_nodes_workflow ON workflow_nodes(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_connections_workflow ON workflow_connections(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_triggers_workflow ON workflow_triggers(workflow_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_pair ON executions(workflow_id, contact_id, status)",
            // At most one non-terminal execution per (workflow, contact) pair
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_active \
             ON executions(workflow_id, contact_id) \
             WHERE status IN ('pending', 'running')",
            "CREATE INDEX IF NOT EXISTS idx_executions_started ON executions(started_at)",
        ];

        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ---- workflow definitions ----

    /// Create a workflow with its node/connection/trigger sets in one
    /// transaction. Graph validation runs before any row is written.
    pub async fn create_workflow(&self, spec: &WorkflowSpec) -> EngineResult<WorkflowDefinition> {
        validate_graph(&spec.nodes, &spec.connections)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, user_id, name, description, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&spec.user_id)
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(spec.status.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        Self::insert_children(&mut tx, &id, spec).await?;

        tx.commit().await?;

        tracing::info!(workflow_id = %id, nodes = spec.nodes.len(), "created workflow");

        self.get_definition(&id, true)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(id))
    }

    /// Update a workflow; child collections use replace semantics: existing
    /// rows are deleted and the new set inserted in the same transaction.
    pub async fn update_workflow(
        &self,
        id: &str,
        spec: &WorkflowSpec,
    ) -> EngineResult<WorkflowDefinition> {
        validate_graph(&spec.nodes, &spec.connections)?;

        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE workflows SET name = ?, description = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(spec.status.as_str())
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(EngineError::WorkflowNotFound(id.to_string()));
        }

        for table in ["workflow_nodes", "workflow_connections", "workflow_triggers"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE workflow_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        Self::insert_children(&mut tx, id, spec).await?;

        tx.commit().await?;

        tracing::info!(workflow_id = %id, "updated workflow");

        self.get_definition(id, true)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(id.to_string()))
    }

    async fn insert_children(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        workflow_id: &str,
        spec: &WorkflowSpec,
    ) -> EngineResult<()> {
        for node in &spec.nodes {
            sqlx::query(
                r#"
                INSERT INTO workflow_nodes
                    (id, workflow_id, node_type, label, config, pos_x, pos_y, active)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.id)
            .bind(workflow_id)
            .bind(node.node_type.as_str())
            .bind(&node.label)
            .bind(serde_json::to_string(&node.config)?)
            .bind(node.position.x)
            .bind(node.position.y)
            .bind(node.active as i64)
            .execute(&mut **tx)
            .await?;
        }

        for conn in &spec.connections {
            sqlx::query(
                r#"
                INSERT INTO workflow_connections
                    (id, workflow_id, source_node_id, target_node_id, condition_type, condition_value)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&conn.id)
            .bind(workflow_id)
            .bind(&conn.source_node_id)
            .bind(&conn.target_node_id)
            .bind(conn.condition_type.as_str())
            .bind(&conn.condition_value)
            .execute(&mut **tx)
            .await?;
        }

        for trigger in &spec.triggers {
            sqlx::query(
                r#"
                INSERT INTO workflow_triggers
                    (id, workflow_id, node_id, trigger_type, condition, active, fire_count, last_fired_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&trigger.id)
            .bind(workflow_id)
            .bind(&trigger.node_id)
            .bind(&trigger.trigger_type)
            .bind(serde_json::to_string(&trigger.condition)?)
            .bind(trigger.active as i64)
            .bind(trigger.fire_count)
            .bind(&trigger.last_fired_at)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Assemble a full definition by joining child tables, computing derived
    /// metadata on the way out. `include_inactive` keeps disabled nodes and
    /// triggers in the result.
    pub async fn get_definition(
        &self,
        id: &str,
        include_inactive: bool,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, description, status, created_at, updated_at FROM workflows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let node_filter = if include_inactive { "" } else { " AND active = 1" };

        let node_rows = sqlx::query(&format!(
            "SELECT id, node_type, label, config, pos_x, pos_y, active \
             FROM workflow_nodes WHERE workflow_id = ?{node_filter}"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut nodes = Vec::with_capacity(node_rows.len());
        for n in node_rows {
            let config: String = n.get("config");
            nodes.push(Node {
                id: n.get("id"),
                node_type: NodeType::parse(&n.get::<String, _>("node_type")),
                label: n.get("label"),
                config: serde_json::from_str(&config)?,
                position: Position {
                    x: n.get("pos_x"),
                    y: n.get("pos_y"),
                },
                active: n.get::<i64, _>("active") != 0,
            });
        }

        let conn_rows = sqlx::query(
            "SELECT id, source_node_id, target_node_id, condition_type, condition_value \
             FROM workflow_connections WHERE workflow_id = ?",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let connections = conn_rows
            .into_iter()
            .map(|c| Connection {
                id: c.get("id"),
                source_node_id: c.get("source_node_id"),
                target_node_id: c.get("target_node_id"),
                condition_type: ConditionType::parse(&c.get::<String, _>("condition_type")),
                condition_value: c.get("condition_value"),
            })
            .collect();

        let trigger_filter = if include_inactive { "" } else { " AND active = 1" };

        let trigger_rows = sqlx::query(&format!(
            "SELECT id, node_id, trigger_type, condition, active, fire_count, last_fired_at \
             FROM workflow_triggers WHERE workflow_id = ?{trigger_filter}"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut triggers = Vec::with_capacity(trigger_rows.len());
        for t in trigger_rows {
            let condition: String = t.get("condition");
            triggers.push(Trigger {
                id: t.get("id"),
                node_id: t.get("node_id"),
                trigger_type: t.get("trigger_type"),
                condition: serde_json::from_str(&condition)?,
                active: t.get::<i64, _>("active") != 0,
                fire_count: t.get("fire_count"),
                last_fired_at: t.get("last_fired_at"),
            });
        }

        let mut definition = WorkflowDefinition {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            status: WorkflowStatus::parse(&row.get::<String, _>("status")),
            user_id: row.get("user_id"),
            nodes,
            connections,
            triggers,
            metadata: WorkflowMetadata {
                complexity: 0.0,
                node_count: 0,
                connection_count: 0,
                last_modified: String::new(),
            },
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        };
        definition.compute_metadata();

        Ok(Some(definition))
    }

    /// List workflows with filters, search, sorting, and offset/limit paging
    pub async fn list_workflows(&self, filters: &WorkflowFilters) -> EngineResult<WorkflowPage> {
        let mut conditions: Vec<String> = Vec::new();

        if filters.user_id.is_some() {
            conditions.push("w.user_id = ?".to_string());
        }
        if !filters.statuses.is_empty() {
            let placeholders = vec!["?"; filters.statuses.len()].join(", ");
            conditions.push(format!("w.status IN ({placeholders})"));
        }
        if filters.search.is_some() {
            conditions.push(
                "(LOWER(w.name) LIKE ? OR LOWER(COALESCE(w.description, '')) LIKE ?)".to_string(),
            );
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let order = match filters.sort {
            SortKey::Name => "w.name ASC",
            SortKey::CreatedAt => "w.created_at DESC",
            SortKey::UpdatedAt => "w.updated_at DESC",
            SortKey::PerformanceScore => "w.performance_score DESC",
        };

        let limit = filters.limit.max(1);

        let list_sql = format!(
            "SELECT w.id, w.name, w.description, w.status, w.performance_score, \
                    w.created_at, w.updated_at, \
                    (SELECT COUNT(*) FROM workflow_nodes n WHERE n.workflow_id = w.id) AS node_count \
             FROM workflows w{where_clause} ORDER BY {order} LIMIT ? OFFSET ?"
        );
        let count_sql = format!("SELECT COUNT(*) AS total FROM workflows w{where_clause}");

        let search_term = filters
            .search
            .as_ref()
            .map(|s| format!("%{}%", s.to_lowercase()));

        let mut list_query = sqlx::query(&list_sql);
        let mut count_query = sqlx::query(&count_sql);

        if let Some(user_id) = &filters.user_id {
            list_query = list_query.bind(user_id);
            count_query = count_query.bind(user_id);
        }
        for status in &filters.statuses {
            list_query = list_query.bind(status.as_str());
            count_query = count_query.bind(status.as_str());
        }
        if let Some(term) = &search_term {
            list_query = list_query.bind(term).bind(term);
            count_query = count_query.bind(term).bind(term);
        }

        let rows = list_query
            .bind(limit)
            .bind(filters.offset)
            .fetch_all(&self.pool)
            .await?;

        let total: i64 = count_query.fetch_one(&self.pool).await?.get("total");

        let items: Vec<WorkflowSummary> = rows
            .into_iter()
            .map(|r| WorkflowSummary {
                id: r.get("id"),
                name: r.get("name"),
                description: r.get("description"),
                status: WorkflowStatus::parse(&r.get::<String, _>("status")),
                node_count: r.get("node_count"),
                performance_score: r.get("performance_score"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect();

        let has_more = filters.offset + (items.len() as i64) < total;

        Ok(WorkflowPage {
            items,
            total,
            has_more,
        })
    }

    /// Persist the latest analytics score for performance-ranked listing
    pub async fn update_performance_score(&self, id: &str, score: f64) -> EngineResult<()> {
        sqlx::query("UPDATE workflows SET performance_score = ? WHERE id = ?")
            .bind(score)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump firing statistics for the triggers behind an entry node
    pub async fn record_trigger_fire(&self, workflow_id: &str, node_id: &str) -> EngineResult<()> {
        sqlx::query(
            "UPDATE workflow_triggers SET fire_count = fire_count + 1, last_fired_at = ? \
             WHERE workflow_id = ? AND node_id = ? AND active = 1",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(workflow_id)
        .bind(node_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- executions ----

    /// Insert the execution row and its step rows atomically.
    ///
    /// Returns `false` without inserting anything when the unique index on
    /// non-terminal (workflow, contact) executions rejects the row, meaning a
    /// concurrent start won the race. The caller deduplicates against the
    /// winner.
    pub async fn insert_execution_with_steps(
        &self,
        execution: &Execution,
        context: &Value,
        steps: &[ExecutionStep],
    ) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO executions
                (id, workflow_id, contact_id, status, context, context_version,
                 complexity, estimated_duration_secs, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, NULL)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(&execution.contact_id)
        .bind(execution.status.as_str())
        .bind(serde_json::to_string(context)?)
        .bind(execution.complexity)
        .bind(execution.estimated_duration_secs)
        .bind(&execution.started_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // The id is a fresh UUID, so this can only be the active
                // (workflow, contact) index
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO execution_steps (execution_id, step_id, node_type, status)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&step.execution_id)
            .bind(&step.step_id)
            .bind(step.node_type.as_str())
            .bind(step.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Find the non-terminal execution for a (workflow, contact) pair, if any
    pub async fn find_active_execution(
        &self,
        workflow_id: &str,
        contact_id: &str,
    ) -> EngineResult<Option<String>> {
        let row = sqlx::query(
            "SELECT id FROM executions \
             WHERE workflow_id = ? AND contact_id = ? AND status IN ('pending', 'running') \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(workflow_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("id")))
    }

    pub async fn get_execution(&self, id: &str) -> EngineResult<Option<Execution>> {
        let row = sqlx::query(
            "SELECT id, workflow_id, contact_id, status, complexity, \
                    estimated_duration_secs, started_at, completed_at \
             FROM executions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Execution {
            id: r.get("id"),
            workflow_id: r.get("workflow_id"),
            contact_id: r.get("contact_id"),
            status: ExecutionStatus::parse(&r.get::<String, _>("status")),
            complexity: r.get("complexity"),
            estimated_duration_secs: r.get("estimated_duration_secs"),
            started_at: r.get("started_at"),
            completed_at: r.get("completed_at"),
        }))
    }

    pub async fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
    ) -> EngineResult<()> {
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        sqlx::query("UPDATE executions SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ?")
            .bind(status.as_str())
            .bind(completed_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Load the context document and its version for an execution
    pub async fn load_context(&self, execution_id: &str) -> EngineResult<Option<(Value, i64)>> {
        let row = sqlx::query("SELECT context, context_version FROM executions WHERE id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let raw: String = r.get("context");
                Ok(Some((serde_json::from_str(&raw)?, r.get("context_version"))))
            }
            None => Ok(None),
        }
    }

    /// Optimistic context write. Returns false when the expected version no
    /// longer matches (a concurrent step won the race).
    pub async fn store_context(
        &self,
        execution_id: &str,
        context: &Value,
        expected_version: i64,
    ) -> EngineResult<bool> {
        let result = sqlx::query(
            "UPDATE executions SET context = ?, context_version = context_version + 1 \
             WHERE id = ? AND context_version = ?",
        )
        .bind(serde_json::to_string(context)?)
        .bind(execution_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // ---- steps ----

    pub async fn get_step(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> EngineResult<Option<ExecutionStep>> {
        let row = sqlx::query(
            "SELECT execution_id, step_id, node_type, status, scheduled_for, duration_ms, error_message \
             FROM execution_steps WHERE execution_id = ? AND step_id = ?",
        )
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::row_to_step))
    }

    pub async fn list_steps(&self, execution_id: &str) -> EngineResult<Vec<ExecutionStep>> {
        let rows = sqlx::query(
            "SELECT execution_id, step_id, node_type, status, scheduled_for, duration_ms, error_message \
             FROM execution_steps WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Self::row_to_step).collect())
    }

    fn row_to_step(r: sqlx::sqlite::SqliteRow) -> ExecutionStep {
        ExecutionStep {
            execution_id: r.get("execution_id"),
            step_id: r.get("step_id"),
            node_type: NodeType::parse(&r.get::<String, _>("node_type")),
            status: StepStatus::parse(&r.get::<String, _>("status")),
            scheduled_for: r.get("scheduled_for"),
            duration_ms: r.get("duration_ms"),
            error_message: r.get("error_message"),
        }
    }

    pub async fn update_step_status(
        &self,
        execution_id: &str,
        step_id: &str,
        status: StepStatus,
        scheduled_for: Option<String>,
        duration_ms: Option<i64>,
        error_message: Option<String>,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE execution_steps SET status = ?, \
                    scheduled_for = COALESCE(?, scheduled_for), \
                    duration_ms = COALESCE(?, duration_ms), \
                    error_message = COALESCE(?, error_message) \
             WHERE execution_id = ? AND step_id = ?",
        )
        .bind(status.as_str())
        .bind(scheduled_for)
        .bind(duration_ms)
        .bind(error_message)
        .bind(execution_id)
        .bind(step_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- analytics & warming queries ----

    /// Aggregate execution counts and average completion time for a window
    pub async fn execution_stats(
        &self,
        workflow_id: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<ExecutionStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                   SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                   AVG(CASE WHEN status = 'completed' AND completed_at IS NOT NULL
                            THEN (julianday(completed_at) - julianday(started_at)) * 86400.0
                       END) AS avg_secs
            FROM executions WHERE workflow_id = ? AND started_at >= ?
            "#,
        )
        .bind(workflow_id)
        .bind(since.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(ExecutionStats {
            total: row.get("total"),
            completed: row.get::<Option<i64>, _>("completed").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
            avg_completion_secs: row.get::<Option<f64>, _>("avg_secs").unwrap_or(0.0),
        })
    }

    /// Active workflows ranked by historical execution volume
    pub async fn most_executed_workflow_ids(&self, limit: i64) -> EngineResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT e.workflow_id, COUNT(*) AS runs FROM executions e \
             JOIN workflows w ON w.id = e.workflow_id AND w.status = 'active' \
             GROUP BY e.workflow_id ORDER BY runs DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("workflow_id")).collect())
    }

    /// Workflows with at least one execution since the given instant
    pub async fn workflows_executed_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT workflow_id FROM executions WHERE started_at >= ? LIMIT ?",
        )
        .bind(since.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("workflow_id")).collect())
    }

    /// Currently running executions as (execution_id, workflow_id) pairs
    pub async fn running_executions(&self, limit: i64) -> EngineResult<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT id, workflow_id FROM executions WHERE status = 'running' LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get("workflow_id")))
            .collect())
    }

    /// Users whose workflows were executed since the given instant
    pub async fn active_user_ids_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT w.user_id FROM executions e \
             JOIN workflows w ON w.id = e.workflow_id \
             WHERE e.started_at >= ? LIMIT ?",
        )
        .bind(since.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
    }
}
