//! Embedded orchestrator facade.
//!
//! Wires the orchestration components together for in-process library
//! usage, with SQLite persistence by default.
//!
//! # Example
//!
//! ```ignore
//! use tandem::{Tandem, TandemConfig};
//!
//! let tandem = Tandem::builder(TandemConfig::in_memory())
//!     .with_collaborators(collaborators)
//!     .build()
//!     .await?;
//!
//! let result = tandem.submit_order(request).await?;
//! let timeline = tandem.history(order_id).await?;
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clients::http::http_collaborators;
use crate::clients::Collaborators;
use crate::compensation::CompensationOrchestrator;
use crate::config::SagaConfig;
use crate::executor::StepExecutor;
use crate::model::{OrderStatus, StepStatus};
use crate::orchestrator::{OrchestratorError, OrderRequest, SagaOrchestrator, SagaResult};
use crate::progress::{ProgressBus, ProgressStream};
use crate::retry::{Eligibility, RetryError, RetryPlanner, RetryRequest, SagaRetryResult};
use crate::steps::StepRegistry;
use crate::store::{SagaStore, SqliteSagaStore, StoreError};
use crate::timeline::{HistoryProjector, Timeline};

/// Configuration for a Tandem instance.
#[derive(Debug, Clone)]
pub struct TandemConfig {
    /// SQLite database path. Use `:memory:` for in-memory.
    pub database_path: String,
    /// Orchestration tunables.
    pub saga: SagaConfig,
}

impl TandemConfig {
    /// Create config for in-memory persistence (testing/embedded).
    pub fn in_memory() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            saga: SagaConfig::default(),
        }
    }

    /// Create config with file-based persistence.
    pub fn with_database(path: impl Into<String>) -> Self {
        Self {
            database_path: path.into(),
            saga: SagaConfig::default(),
        }
    }
}

impl Default for TandemConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Errors surfaced by the facade.
#[derive(Debug, thiserror::Error)]
pub enum TandemError {
    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestration(#[from] OrchestratorError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error("no collaborators available: call with_collaborators() or configure endpoints")]
    MissingCollaborators,
}

/// Builder for a Tandem instance.
pub struct TandemBuilder {
    config: TandemConfig,
    collaborators: Option<Collaborators>,
    store: Option<Arc<dyn SagaStore>>,
}

impl TandemBuilder {
    pub fn new(config: TandemConfig) -> Self {
        Self {
            config,
            collaborators: None,
            store: None,
        }
    }

    /// Supply the collaborator client set directly (tests use the
    /// in-memory mocks here).
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// Supply a store instead of the default SQLite one.
    pub fn with_store(mut self, store: Arc<dyn SagaStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the Tandem instance.
    pub async fn build(self) -> Result<Tandem, TandemError> {
        let saga = self.config.saga.clone();

        let store = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteSagaStore::connect(&self.config.database_path).await?)
                as Arc<dyn SagaStore>,
        };

        let collaborators = match self.collaborators {
            Some(collaborators) => collaborators,
            None => match &saga.collaborators {
                Some(endpoints) => http_collaborators(endpoints, &saga.step),
                None => return Err(TandemError::MissingCollaborators),
            },
        };

        let bus = Arc::new(ProgressBus::new(saga.progress.buffer_size));
        let registry = Arc::new(StepRegistry::standard(&collaborators, &saga.validity));
        let executor = StepExecutor::new(store.clone(), bus.clone(), saga.step.total_timeout());
        let compensation = CompensationOrchestrator::new(store.clone(), bus.clone());
        let orchestrator = Arc::new(SagaOrchestrator::new(
            store.clone(),
            registry.clone(),
            executor,
            compensation,
            bus.clone(),
        ));
        let retry = RetryPlanner::new(
            store.clone(),
            registry.clone(),
            orchestrator.clone(),
            saga.retry.clone(),
            saga.non_retryable_tokens.clone(),
        );
        let projector = HistoryProjector::new(store.clone());

        Ok(Tandem {
            store,
            bus,
            registry,
            orchestrator,
            retry,
            projector,
        })
    }
}

/// Per-step line of a status response.
#[derive(Debug, Clone)]
pub struct StepStatusView {
    pub name: String,
    pub order: u32,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time status of an order's saga.
#[derive(Debug, Clone)]
pub struct OrderStatusView {
    pub order_id: Uuid,
    pub overall_status: OrderStatus,
    pub current_step: Option<String>,
    pub steps: Vec<StepStatusView>,
    pub last_updated: DateTime<Utc>,
    pub trace_context: Option<String>,
}

/// Main orchestrator instance for library usage.
pub struct Tandem {
    store: Arc<dyn SagaStore>,
    bus: Arc<ProgressBus>,
    registry: Arc<StepRegistry>,
    orchestrator: Arc<SagaOrchestrator>,
    retry: RetryPlanner,
    projector: HistoryProjector,
}

impl std::fmt::Debug for Tandem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tandem").finish_non_exhaustive()
    }
}

impl Tandem {
    /// Start building an instance with the given config.
    pub fn builder(config: TandemConfig) -> TandemBuilder {
        TandemBuilder::new(config)
    }

    /// Run the full saga for a new order.
    pub async fn submit_order(&self, request: OrderRequest) -> Result<SagaResult, TandemError> {
        Ok(self.orchestrator.execute(request).await?)
    }

    /// Point-in-time view of an order's saga progress.
    pub async fn status(&self, order_id: Uuid) -> Result<OrderStatusView, TandemError> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or(TandemError::OrderNotFound(order_id))?;

        let execution = self.store.latest_execution(order_id).await?;
        let (steps, current_step, trace_context) = match &execution {
            Some(execution) => {
                let steps: Vec<StepStatusView> = self
                    .store
                    .step_results(execution.id)
                    .await?
                    .into_iter()
                    .map(|row| StepStatusView {
                        name: row.step_name,
                        order: row.step_order,
                        status: row.status,
                        started_at: row.started_at,
                        completed_at: row.completed_at,
                    })
                    .collect();
                let current_step = if execution.status.is_terminal() {
                    None
                } else {
                    self.registry
                        .at_index(execution.current_step_index as usize)
                        .map(|step| step.name().to_string())
                };
                (steps, current_step, Some(execution.correlation_id.clone()))
            }
            None => (Vec::new(), None, None),
        };

        Ok(OrderStatusView {
            order_id,
            overall_status: order.status,
            current_step,
            steps,
            last_updated: order.updated_at,
            trace_context,
        })
    }

    /// Live stream of progress events until a terminal marker.
    pub fn stream_status(&self, order_id: Uuid) -> ProgressStream {
        self.bus.subscribe(order_id)
    }

    /// Rendered timeline of everything that happened to an order.
    pub async fn history(&self, order_id: Uuid) -> Result<Timeline, TandemError> {
        if self.store.get_order(order_id).await?.is_none() {
            return Err(TandemError::OrderNotFound(order_id));
        }
        Ok(self.projector.timeline(order_id).await?)
    }

    /// Whether (and how) a failed order may be retried.
    pub async fn check_retry_eligibility(
        &self,
        order_id: Uuid,
    ) -> Result<Eligibility, TandemError> {
        Ok(self.retry.check_eligibility(order_id).await?)
    }

    /// Retry a failed order from its resume point.
    pub async fn retry_order(
        &self,
        order_id: Uuid,
        request: RetryRequest,
    ) -> Result<SagaRetryResult, TandemError> {
        Ok(self.retry.execute_retry(order_id, request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockCollaborators;
    use crate::model::Address;
    use crate::orchestrator::NewOrderItem;

    fn request() -> OrderRequest {
        OrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![NewOrderItem {
                product_id: Uuid::new_v4(),
                product_name: "Widget".to_string(),
                quantity: 2,
                unit_price_cents: 2_999,
            }],
            payment_method_id: "valid-card".to_string(),
            shipping_address: Address {
                street: "123 Main St".to_string(),
                city: "Springfield".to_string(),
                state: "IL".to_string(),
                postal_code: "62701".to_string(),
                country: "US".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_build_requires_collaborators() {
        let err = Tandem::builder(TandemConfig::in_memory())
            .build()
            .await
            .unwrap_err();
        assert!(matches!(err, TandemError::MissingCollaborators));
    }

    #[tokio::test]
    async fn test_submit_status_history_round_trip() {
        let mocks = MockCollaborators::new();
        let tandem = Tandem::builder(TandemConfig::in_memory())
            .with_collaborators(mocks.collaborators())
            .build()
            .await
            .unwrap();

        let result = tandem.submit_order(request()).await.unwrap();
        let SagaResult::Success { order_id, .. } = result else {
            panic!("expected success");
        };

        let status = tandem.status(order_id).await.unwrap();
        assert_eq!(status.overall_status, OrderStatus::Completed);
        assert_eq!(status.steps.len(), 3);
        assert!(status.current_step.is_none());
        assert!(status.trace_context.is_some());

        let timeline = tandem.history(order_id).await.unwrap();
        assert!(!timeline.entries.is_empty());
        assert_eq!(timeline.entries.last().unwrap().title, "Order confirmed");
    }

    #[tokio::test]
    async fn test_status_for_unknown_order() {
        let mocks = MockCollaborators::new();
        let tandem = Tandem::builder(TandemConfig::in_memory())
            .with_collaborators(mocks.collaborators())
            .build()
            .await
            .unwrap();

        let err = tandem.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TandemError::OrderNotFound(_)));
    }
}
