//! Work queues decoupling step execution from the triggering call.
//!
//! Two entry points: immediate step execution (priority-ordered) and delayed
//! continuations produced by delay nodes. Both are accept-and-enqueue,
//! fire-and-forget from the engine's perspective; the trait seam lets a
//! deployment swap in an external queue service.

use crate::error::{EngineError, EngineResult};
use crate::runtime::engine::ExecutionEngine;
use crate::workflow::types::NodeType;
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

/// Immediate step-execution job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepJob {
    pub execution_id: String,
    pub step_id: String,
    pub workflow_id: String,
    pub priority: u8,
}

/// Delayed continuation job produced by a delay node
#[derive(Debug, Clone)]
pub struct DelayedStepJob {
    pub execution_id: String,
    pub step_id: String,
    pub workflow_id: String,
    pub contact_id: String,
    pub delay: Duration,
}

/// Queue priority derived from the target node's type: message sends first,
/// then conditions, delays last
pub fn step_priority(node_type: NodeType) -> u8 {
    match node_type {
        NodeType::MessageSend => 3,
        NodeType::Condition => 2,
        NodeType::Delay => 0,
        NodeType::Trigger | NodeType::Generic => 1,
    }
}

/// Work queue contract consumed by the engine
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, job: StepJob) -> EngineResult<()>;
    async fn enqueue_delayed(&self, job: DelayedStepJob) -> EngineResult<()>;
    /// Whether any queued job still belongs to the execution
    async fn has_pending(&self, execution_id: &str) -> bool;
}

#[derive(Debug, Eq, PartialEq)]
struct QueuedJob {
    job: StepJob,
    seq: u64,
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; FIFO within a priority
        self.job
            .priority
            .cmp(&other.job.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// In-process priority queue with a single consumer task
///
/// Step failures surface to the consumer, get logged, and stay recorded on
/// the step row; sibling branches already enqueued keep running.
pub struct InProcessQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    notify: Notify,
    seq: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    // Set at start(); delayed continuation tasks upgrade this to keep the
    // queue alive for the length of their sleep
    handle: Mutex<Weak<InProcessQueue>>,
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            worker: Mutex::new(None),
            handle: Mutex::new(Weak::new()),
        }
    }

    /// Spawn the consumer loop. Call once during service startup.
    pub async fn start(self: &Arc<Self>, engine: Arc<ExecutionEngine>) {
        *self.handle.lock().await = Arc::downgrade(self);

        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let next = queue.heap.lock().await.pop();
                match next {
                    Some(queued) => {
                        let job = queued.job;
                        tracing::debug!(
                            execution_id = %job.execution_id,
                            step_id = %job.step_id,
                            priority = job.priority,
                            "dequeued step job"
                        );
                        if let Err(e) = engine.execute_step(&job.execution_id, &job.step_id).await
                        {
                            tracing::warn!(
                                execution_id = %job.execution_id,
                                step_id = %job.step_id,
                                "step execution failed: {e}"
                            );
                        }
                    }
                    None => queue.notify.notified().await,
                }
            }
        });
        *self.worker.lock().await = Some(handle);
    }

    /// Abort the consumer loop
    pub async fn stop(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
    }

    async fn push(&self, job: StepJob) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().await.push(QueuedJob { job, seq });
        self.notify.notify_one();
    }
}

#[async_trait]
impl WorkQueue for InProcessQueue {
    async fn enqueue(&self, job: StepJob) -> EngineResult<()> {
        self.push(job).await;
        Ok(())
    }

    async fn enqueue_delayed(&self, job: DelayedStepJob) -> EngineResult<()> {
        let queue = self.handle.lock().await.upgrade().ok_or_else(|| {
            EngineError::QueueClosed("delayed continuation enqueued before queue start".to_string())
        })?;

        let step = StepJob {
            execution_id: job.execution_id.clone(),
            step_id: job.step_id.clone(),
            workflow_id: job.workflow_id.clone(),
            // Resumed steps continue at condition-level priority
            priority: 2,
        };

        tracing::info!(
            execution_id = %job.execution_id,
            step_id = %job.step_id,
            contact_id = %job.contact_id,
            delay = ?job.delay,
            "⏰ scheduled delayed continuation"
        );

        tokio::spawn(async move {
            tokio::time::sleep(job.delay).await;
            queue.push(step).await;
        });

        Ok(())
    }

    async fn has_pending(&self, execution_id: &str) -> bool {
        self.heap
            .lock()
            .await
            .iter()
            .any(|queued| queued.job.execution_id == execution_id)
    }
}
