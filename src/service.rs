//! Service facade assembling the store, cache hierarchy, queue, and engine.
//!
//! Embedders construct one `AutomationService`, call `start()`, and interact
//! through the `workflows()` and `engine()` surfaces. The contact directory
//! and message sender are injected so the engine stays decoupled from any
//! particular CRM or delivery provider.

use crate::cache::manager::default_list_filters;
use crate::cache::{CacheHierarchy, CacheMetrics, GzipCodec, SqliteCache};
use crate::config::Config;
use crate::contact::ContactDirectory;
use crate::error::EngineResult;
use crate::messaging::MessageSender;
use crate::runtime::engine::ExecutionEngine;
use crate::runtime::executor::NodeExecutor;
use crate::runtime::limiter::RateLimiter;
use crate::runtime::queue::InProcessQueue;
use crate::workflow::query::WorkflowQueryService;
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{
    AnalyticsRange, AnalyticsReport, Execution, WorkflowDefinition, WorkflowFilters, WorkflowPage,
    WorkflowSpec,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct AutomationService {
    store: Arc<WorkflowStore>,
    cache: Arc<CacheHierarchy>,
    queue: Arc<InProcessQueue>,
    engine: Arc<ExecutionEngine>,
    query: WorkflowQueryService,
}

impl AutomationService {
    /// Connect to the configured database and assemble the service
    pub async fn connect(
        config: Config,
        directory: Arc<dyn ContactDirectory>,
        sender: Arc<dyn MessageSender>,
    ) -> EngineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.database.url)
            .await?;
        Self::with_pool(config, pool, directory, sender).await
    }

    /// Assemble the service over an existing pool. Initializes the store and
    /// L2 cache schemas; safe against already-initialized databases.
    pub async fn with_pool(
        config: Config,
        pool: SqlitePool,
        directory: Arc<dyn ContactDirectory>,
        sender: Arc<dyn MessageSender>,
    ) -> EngineResult<Self> {
        let store = Arc::new(WorkflowStore::new(pool.clone()));
        store.init_schema().await?;

        let l2 = SqliteCache::new(pool);
        l2.init_schema().await?;

        let cache = Arc::new(CacheHierarchy::new(
            config.cache.clone(),
            Arc::new(l2),
            Arc::new(GzipCodec),
            Arc::clone(&store),
        ));

        let limiter = Arc::new(RateLimiter::new());
        let executor = NodeExecutor::new(
            Arc::clone(&limiter),
            sender,
            Arc::clone(&directory),
            config.rate_limits.clone(),
        );

        let queue = Arc::new(InProcessQueue::new());
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            limiter,
            executor,
            queue.clone(),
            directory,
            config.rate_limits,
        ));

        let query = WorkflowQueryService::new(Arc::clone(&store), Arc::clone(&cache));

        Ok(Self {
            store,
            cache,
            queue,
            engine,
            query,
        })
    }

    /// Start the queue consumer and the cache warming scheduler
    pub async fn start(&self) -> EngineResult<()> {
        self.queue.start(Arc::clone(&self.engine)).await;
        self.cache.start().await?;
        tracing::info!("🚀 automation service started");
        Ok(())
    }

    /// Stop background tasks and flush the in-process cache tier
    pub async fn shutdown(&self) {
        self.queue.stop().await;
        self.cache.shutdown().await;
        tracing::info!("automation service stopped");
    }

    // ---- exposed operations ----

    pub async fn get_workflow_definition(
        &self,
        id: &str,
        include_inactive: bool,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        self.query.get_by_id(id, include_inactive).await
    }

    /// List a user's workflows; `filters` defaults to the first page sorted
    /// by last update
    pub async fn get_user_workflows(
        &self,
        user_id: &str,
        filters: Option<WorkflowFilters>,
    ) -> EngineResult<WorkflowPage> {
        let mut filters = filters.unwrap_or_else(|| default_list_filters(user_id));
        filters.user_id = Some(user_id.to_string());
        self.query.list(&filters).await
    }

    pub async fn create_workflow(&self, spec: &WorkflowSpec) -> EngineResult<WorkflowDefinition> {
        self.query.create(spec).await
    }

    pub async fn update_workflow(
        &self,
        id: &str,
        spec: &WorkflowSpec,
    ) -> EngineResult<WorkflowDefinition> {
        self.query.update(id, spec).await
    }

    pub async fn get_workflow_analytics(
        &self,
        id: &str,
        range: AnalyticsRange,
    ) -> EngineResult<AnalyticsReport> {
        self.query.analytics(id, range).await
    }

    pub async fn start_workflow_execution(
        &self,
        workflow_id: &str,
        contact_id: &str,
        trigger_data: serde_json::Value,
    ) -> EngineResult<Execution> {
        self.engine
            .start_execution(workflow_id, contact_id, trigger_data)
            .await
    }

    pub async fn execute_step(&self, execution_id: &str, step_id: &str) -> EngineResult<()> {
        self.engine.execute_step(execution_id, step_id).await
    }

    // ---- component access ----

    pub fn workflows(&self) -> &WorkflowQueryService {
        &self.query
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CacheHierarchy> {
        &self.cache
    }

    pub async fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics().await
    }

    /// Drop every cache entry matching any of the patterns
    pub async fn invalidate_cache(&self, patterns: &[String]) {
        self.cache.invalidate(patterns).await;
    }

    /// Run one cache warming cycle immediately
    pub async fn warm_cache(&self) -> EngineResult<()> {
        self.cache.warm().await
    }
}
