//! Execution engine: starts executions and advances them step by step.
//!
//! `start_execution` is the only synchronous entry point; it materializes the
//! execution with all step rows in one transaction, then runs the entry nodes
//! inline. Every subsequent step arrives through the work queue, loads the
//! versioned context document, and persists its output before any connection
//! fires, so a crash between steps never loses completed work.

use crate::cache::{CacheHierarchy, DataClass};
use crate::config::RateLimitConfig;
use crate::contact::ContactDirectory;
use crate::error::{EngineError, EngineResult};
use crate::runtime::context::ExecutionContext;
use crate::runtime::executor::NodeExecutor;
use crate::runtime::expr;
use crate::runtime::limiter::{LimitCheck, RateLimiter};
use crate::runtime::queue::{step_priority, DelayedStepJob, StepJob, WorkQueue};
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{
    ConditionType, Execution, ExecutionStatus, ExecutionStep, NodeType, StepStatus,
    WorkflowStatus,
};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct ExecutionEngine {
    store: Arc<WorkflowStore>,
    cache: Arc<CacheHierarchy>,
    limiter: Arc<RateLimiter>,
    executor: NodeExecutor,
    queue: Arc<dyn WorkQueue>,
    directory: Arc<dyn ContactDirectory>,
    rate_limits: RateLimitConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<WorkflowStore>,
        cache: Arc<CacheHierarchy>,
        limiter: Arc<RateLimiter>,
        executor: NodeExecutor,
        queue: Arc<dyn WorkQueue>,
        directory: Arc<dyn ContactDirectory>,
        rate_limits: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            cache,
            limiter,
            executor,
            queue,
            directory,
            rate_limits,
        }
    }

    /// Start one execution of a workflow for a contact.
    ///
    /// Deduplicates against any non-terminal execution for the same
    /// (workflow, contact) pair, then checks the per-contact and system-wide
    /// start limiters as one batch before creating any state. Entry nodes run
    /// inline; everything downstream goes through the queue.
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        contact_id: &str,
        trigger_data: Value,
    ) -> EngineResult<Execution> {
        let store = Arc::clone(&self.store);
        let wf_id = workflow_id.to_string();
        let definition = self
            .cache
            .get_or_load(DataClass::Definitions, workflow_id, || async move {
                store.get_definition(&wf_id, false).await
            })
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        if definition.status != WorkflowStatus::Active {
            return Err(EngineError::InvalidWorkflow(format!(
                "workflow {workflow_id} is not active"
            )));
        }

        // Dedup before the limiter so a duplicate start consumes no allowance
        if let Some(existing_id) = self
            .store
            .find_active_execution(workflow_id, contact_id)
            .await?
        {
            tracing::info!(
                workflow_id = %workflow_id,
                contact_id = %contact_id,
                execution_id = %existing_id,
                "execution already in flight, returning existing"
            );
            return self
                .store
                .get_execution(&existing_id)
                .await?
                .ok_or(EngineError::ExecutionNotFound(existing_id));
        }

        let checks = [
            LimitCheck::new(
                format!("wf_start:contact:{contact_id}"),
                self.rate_limits.contact_starts_per_hour,
                Duration::from_secs(3600),
            ),
            LimitCheck::new(
                "wf_start:system",
                self.rate_limits.system_starts_per_minute,
                Duration::from_secs(60),
            ),
        ];
        if let Err(limiter) = self.limiter.check_batch(&checks).await {
            return Err(EngineError::RateLimitExceeded { limiter });
        }

        let contact = self
            .directory
            .get_contact(contact_id)
            .await?
            .ok_or_else(|| EngineError::ContactNotFound(contact_id.to_string()))?;

        let execution_id = Uuid::new_v4().to_string();
        let context = ExecutionContext::new(&execution_id, definition.clone(), &contact, &trigger_data);

        let mut execution = Execution {
            id: execution_id.clone(),
            workflow_id: workflow_id.to_string(),
            contact_id: contact_id.to_string(),
            status: ExecutionStatus::Pending,
            complexity: definition.metadata.complexity,
            estimated_duration_secs: definition.estimated_duration_secs(),
            started_at: Utc::now().to_rfc3339(),
            completed_at: None,
        };

        let steps: Vec<ExecutionStep> = definition
            .active_nodes()
            .map(|node| ExecutionStep {
                execution_id: execution_id.clone(),
                step_id: node.id.clone(),
                node_type: node.node_type,
                status: StepStatus::Pending,
                scheduled_for: None,
                duration_ms: None,
                error_message: None,
            })
            .collect();

        // The unique index on non-terminal (workflow, contact) executions
        // closes the race two concurrent starts would otherwise win together;
        // the loser resolves to the winner's row.
        if !self
            .store
            .insert_execution_with_steps(&execution, &serde_json::to_value(&context)?, &steps)
            .await?
        {
            tracing::info!(
                workflow_id = %workflow_id,
                contact_id = %contact_id,
                "concurrent start lost the insert race, returning winner"
            );
            let existing_id = self
                .store
                .find_active_execution(workflow_id, contact_id)
                .await?
                .ok_or_else(|| {
                    EngineError::ExecutionNotFound(format!(
                        "active execution for {workflow_id}/{contact_id}"
                    ))
                })?;
            return self
                .store
                .get_execution(&existing_id)
                .await?
                .ok_or(EngineError::ExecutionNotFound(existing_id));
        }
        self.cache
            .put(DataClass::Contexts, &execution_id, &context)
            .await;

        let entry_ids = definition.entry_node_ids();
        for node_id in &entry_ids {
            self.store.record_trigger_fire(workflow_id, node_id).await?;
        }

        self.store
            .update_execution_status(&execution_id, ExecutionStatus::Running)
            .await?;
        execution.status = ExecutionStatus::Running;

        tracing::info!(
            workflow_id = %workflow_id,
            contact_id = %contact_id,
            execution_id = %execution_id,
            entry_nodes = entry_ids.len(),
            "🚀 started workflow execution"
        );

        for node_id in &entry_ids {
            if let Err(e) = self.execute_step(&execution_id, node_id).await {
                tracing::warn!(
                    execution_id = %execution_id,
                    step_id = %node_id,
                    "entry step failed: {e}"
                );
            }
        }

        Ok(execution)
    }

    /// Execute (or resume) one step of an execution.
    ///
    /// Idempotent for terminal steps. A delay step parks itself as Scheduled
    /// on first execution and completes with a resume marker when the delayed
    /// continuation brings it back.
    pub async fn execute_step(&self, execution_id: &str, step_id: &str) -> EngineResult<()> {
        let step = self
            .store
            .get_step(execution_id, step_id)
            .await?
            .ok_or_else(|| {
                EngineError::ExecutionNotFound(format!("{execution_id} step {step_id}"))
            })?;

        if matches!(step.status, StepStatus::Completed | StepStatus::Failed) {
            tracing::debug!(
                execution_id = %execution_id,
                step_id = %step_id,
                status = step.status.as_str(),
                "step already terminal, skipping"
            );
            return Ok(());
        }
        let resuming = step.status == StepStatus::Scheduled;

        let mut context = self
            .load_context(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        let node = context
            .definition
            .node(step_id)
            .ok_or_else(|| {
                EngineError::InvalidWorkflow(format!("step {step_id} not in definition snapshot"))
            })?
            .clone();

        self.store
            .update_step_status(execution_id, step_id, StepStatus::Running, None, None, None)
            .await?;
        let started = Instant::now();

        let output = if resuming {
            Ok(json!({
                "delay_completed": true,
                "resumed_at": Utc::now().to_rfc3339(),
            }))
        } else {
            self.executor.execute(&node, &context).await
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as i64;
                self.store
                    .update_step_status(
                        execution_id,
                        step_id,
                        StepStatus::Failed,
                        None,
                        Some(elapsed),
                        Some(e.to_string()),
                    )
                    .await?;
                self.store
                    .update_execution_status(execution_id, ExecutionStatus::Failed)
                    .await?;
                tracing::warn!(
                    execution_id = %execution_id,
                    step_id = %step_id,
                    "❌ step failed, execution marked failed: {e}"
                );
                return Err(e);
            }
        };

        // First pass over a delay node: park the step and hand the
        // continuation to the delayed queue; connections fire on resume.
        if !resuming && node.node_type == NodeType::Delay {
            let scheduled_for = output
                .get("scheduled_for")
                .and_then(Value::as_str)
                .map(str::to_string);
            let delay_secs = output.get("delay_secs").and_then(Value::as_i64).unwrap_or(0);

            self.persist_output(&mut context, step_id, output).await?;
            self.store
                .update_step_status(
                    execution_id,
                    step_id,
                    StepStatus::Scheduled,
                    scheduled_for,
                    None,
                    None,
                )
                .await?;
            self.queue
                .enqueue_delayed(DelayedStepJob {
                    execution_id: execution_id.to_string(),
                    step_id: step_id.to_string(),
                    workflow_id: context.workflow_id.clone(),
                    contact_id: context.contact_id.clone(),
                    delay: Duration::from_secs(delay_secs.max(0) as u64),
                })
                .await?;
            return Ok(());
        }

        self.persist_output(&mut context, step_id, output.clone()).await?;

        let elapsed = started.elapsed().as_millis() as i64;
        self.store
            .update_step_status(
                execution_id,
                step_id,
                StepStatus::Completed,
                None,
                Some(elapsed),
                None,
            )
            .await?;
        tracing::debug!(
            execution_id = %execution_id,
            step_id = %step_id,
            duration_ms = elapsed,
            "step completed"
        );

        let enqueued = self
            .follow_connections(&context, step_id, &output)
            .await?;

        if enqueued == 0 {
            self.maybe_complete(execution_id).await?;
        }

        Ok(())
    }

    /// Load the context document, L1/L2 first, store as the source of truth.
    /// The version column is authoritative; a cached document can be behind
    /// it and the optimistic write resolves that on conflict.
    async fn load_context(&self, execution_id: &str) -> EngineResult<Option<ExecutionContext>> {
        let store = Arc::clone(&self.store);
        let id = execution_id.to_string();
        self.cache
            .get_or_load(DataClass::Contexts, execution_id, || async move {
                match store.load_context(&id).await? {
                    Some((document, version)) => {
                        let mut context: ExecutionContext = serde_json::from_value(document)?;
                        context.version = version;
                        Ok(Some(context))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    /// Record a step output and write the context back with an optimistic
    /// compare-and-swap. One retry on conflict: re-read the fresh document,
    /// re-apply this step's output, and swap again.
    async fn persist_output(
        &self,
        context: &mut ExecutionContext,
        step_id: &str,
        output: Value,
    ) -> EngineResult<()> {
        context.record_output(step_id, output.clone());

        for attempt in 0..2 {
            let document = serde_json::to_value(&*context)?;
            if self
                .store
                .store_context(&context.execution_id, &document, context.version)
                .await?
            {
                context.version += 1;
                self.cache
                    .put(DataClass::Contexts, &context.execution_id, context)
                    .await;
                return Ok(());
            }

            if attempt == 0 {
                tracing::debug!(
                    execution_id = %context.execution_id,
                    step_id = %step_id,
                    "context version conflict, retrying on fresh read"
                );
                let (document, version) = self
                    .store
                    .load_context(&context.execution_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::ExecutionNotFound(context.execution_id.clone())
                    })?;
                let mut fresh: ExecutionContext = serde_json::from_value(document)?;
                fresh.version = version;
                fresh.record_output(step_id, output.clone());
                *context = fresh;
            }
        }

        Err(EngineError::ContextConflict(context.execution_id.clone()))
    }

    /// Evaluate outgoing connections and enqueue satisfied targets.
    /// Returns how many jobs were enqueued.
    async fn follow_connections(
        &self,
        context: &ExecutionContext,
        step_id: &str,
        output: &Value,
    ) -> EngineResult<usize> {
        let condition_met = output
            .get("condition_met")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let scope = context.scope();

        let mut enqueued = 0;
        for connection in context.definition.outgoing(step_id) {
            let fire = match connection.condition_type {
                ConditionType::Always => true,
                ConditionType::Yes => condition_met,
                ConditionType::No => !condition_met,
                ConditionType::Custom => match connection.condition_value.as_deref() {
                    Some(expression) => match expr::evaluate(expression, &scope) {
                        Ok(met) => met,
                        Err(e) => {
                            tracing::warn!(
                                execution_id = %context.execution_id,
                                connection_id = %connection.id,
                                "custom connection condition failed, not firing: {e}"
                            );
                            false
                        }
                    },
                    None => false,
                },
            };

            if !fire {
                continue;
            }

            let Some(target) = context.definition.node(&connection.target_node_id) else {
                tracing::warn!(
                    execution_id = %context.execution_id,
                    connection_id = %connection.id,
                    "connection target missing from snapshot, skipping"
                );
                continue;
            };
            if !target.active {
                continue;
            }

            self.queue
                .enqueue(StepJob {
                    execution_id: context.execution_id.clone(),
                    step_id: target.id.clone(),
                    workflow_id: context.workflow_id.clone(),
                    priority: step_priority(target.node_type),
                })
                .await?;
            enqueued += 1;
        }

        Ok(enqueued)
    }

    /// A branch just ended without enqueuing work. If no step is still
    /// Running or Scheduled anywhere and nothing for this execution sits in
    /// the queue, the execution is done; Pending steps on untaken branches
    /// stay Pending.
    async fn maybe_complete(&self, execution_id: &str) -> EngineResult<()> {
        let steps = self.store.list_steps(execution_id).await?;
        let in_flight = steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Running | StepStatus::Scheduled));
        if in_flight {
            return Ok(());
        }

        // A sibling branch may have enqueued a step that is still Pending in
        // the database; it only looks idle until the consumer picks it up.
        if self.queue.has_pending(execution_id).await {
            return Ok(());
        }

        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(());
        };
        if execution.status.is_terminal() {
            return Ok(());
        }

        self.store
            .update_execution_status(execution_id, ExecutionStatus::Completed)
            .await?;
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %execution.workflow_id,
            "✅ execution completed"
        );
        Ok(())
    }
}
