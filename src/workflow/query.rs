//! Cached query surface over the workflow store.
//!
//! All definition reads, list pages, and analytics reports go through the
//! cache hierarchy; writes go straight to the store and invalidate the
//! affected cache keys before returning.

use crate::cache::{CacheHierarchy, DataClass};
use crate::error::{EngineError, EngineResult};
use crate::workflow::storage::WorkflowStore;
use crate::workflow::types::{
    AnalyticsRange, AnalyticsReport, WorkflowDefinition, WorkflowFilters, WorkflowPage,
    WorkflowSpec,
};
use chrono::Utc;
use std::sync::Arc;

/// Average completion time that scores zero on the time axis
const TIME_SCORE_BASELINE_SECS: f64 = 300.0;

pub struct WorkflowQueryService {
    store: Arc<WorkflowStore>,
    cache: Arc<CacheHierarchy>,
}

impl WorkflowQueryService {
    pub fn new(store: Arc<WorkflowStore>, cache: Arc<CacheHierarchy>) -> Self {
        Self { store, cache }
    }

    /// Fetch one definition through the cache.
    ///
    /// Active-only and include-inactive reads cache under separate keys so an
    /// editor view never poisons the execution path with inactive nodes.
    pub async fn get_by_id(
        &self,
        id: &str,
        include_inactive: bool,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        let key = if include_inactive {
            format!("{id}:all")
        } else {
            id.to_string()
        };

        let store = Arc::clone(&self.store);
        let workflow_id = id.to_string();
        self.cache
            .get_or_load(DataClass::Definitions, &key, || async move {
                store.get_definition(&workflow_id, include_inactive).await
            })
            .await
    }

    /// List workflows through the per-filter-signature list cache
    pub async fn list(&self, filters: &WorkflowFilters) -> EngineResult<WorkflowPage> {
        let store = Arc::clone(&self.store);
        let loader_filters = filters.clone();
        let page = self
            .cache
            .get_or_load(DataClass::UserLists, &filters.signature(), || async move {
                store.list_workflows(&loader_filters).await.map(Some)
            })
            .await?;

        Ok(page.unwrap_or(WorkflowPage {
            items: Vec::new(),
            total: 0,
            has_more: false,
        }))
    }

    /// Create a workflow and prime its definition cache entry
    pub async fn create(&self, spec: &WorkflowSpec) -> EngineResult<WorkflowDefinition> {
        let definition = self.store.create_workflow(spec).await?;

        self.cache
            .invalidate(&[format!("user:{}", definition.user_id)])
            .await;
        // The store returns the editor view, so prime only the `:all` key;
        // the active-only key fills lazily on first execution read
        self.cache
            .put(DataClass::Definitions, &format!("{}:all", definition.id), &definition)
            .await;

        tracing::info!(
            workflow_id = %definition.id,
            user_id = %definition.user_id,
            nodes = definition.metadata.node_count,
            "📋 workflow created"
        );
        Ok(definition)
    }

    /// Replace a workflow's graph and drop every cache entry derived from it
    pub async fn update(&self, id: &str, spec: &WorkflowSpec) -> EngineResult<WorkflowDefinition> {
        let definition = self.store.update_workflow(id, spec).await?;

        // The bare id pattern also matches the `{id}:all` editor-view key
        self.cache
            .invalidate(&[id.to_string(), format!("user:{}", definition.user_id)])
            .await;
        self.cache
            .put(DataClass::Definitions, &format!("{id}:all"), &definition)
            .await;

        tracing::info!(workflow_id = %id, "📋 workflow updated");
        Ok(definition)
    }

    /// Aggregated execution report over a trailing window, cached per
    /// (workflow, range). The derived performance score is written back to
    /// the workflow row so list sorting can use it without recomputing.
    pub async fn analytics(
        &self,
        workflow_id: &str,
        range: AnalyticsRange,
    ) -> EngineResult<AnalyticsReport> {
        let key = format!("{workflow_id}:{}", range.as_str());
        let store = Arc::clone(&self.store);
        let id = workflow_id.to_string();

        let report = self
            .cache
            .get_or_load(DataClass::Analytics, &key, || async move {
                if store.get_definition(&id, false).await?.is_none() {
                    return Ok(None);
                }

                let since = Utc::now() - range.duration();
                let stats = store.execution_stats(&id, since).await?;

                let completion_rate = if stats.total > 0 {
                    stats.completed as f64 / stats.total as f64
                } else {
                    0.0
                };
                let error_rate = if stats.total > 0 {
                    stats.failed as f64 / stats.total as f64
                } else {
                    0.0
                };
                let time_score =
                    (1.0 - stats.avg_completion_secs / TIME_SCORE_BASELINE_SECS).max(0.0);
                let performance_score = completion_rate * 0.7 + time_score * 0.3;

                store.update_performance_score(&id, performance_score).await?;

                Ok(Some(AnalyticsReport {
                    workflow_id: id.clone(),
                    range: range.as_str().to_string(),
                    total_executions: stats.total,
                    completed: stats.completed,
                    failed: stats.failed,
                    avg_completion_secs: stats.avg_completion_secs,
                    completion_rate,
                    error_rate,
                    performance_score,
                }))
            })
            .await?;

        report.ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }
}
