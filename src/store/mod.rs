//! Durable saga persistence.
//!
//! This module contains:
//! - `SagaStore` trait: transactional persistence of orders, executions,
//!   step results, retry attempts, and timeline events
//! - Storage error types
//! - Implementations: SQLite (`sqlite`), in-memory mock (`mock`)
//!
//! The single-writer-per-order invariant lives at this boundary:
//! `create_execution` fails when another non-terminal execution exists
//! for the same order, which serialises concurrent starts without a
//! shared lock.

pub mod mock;
pub mod schema;
pub mod sqlite;

pub use mock::MockSagaStore;
pub use sqlite::SqliteSagaStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    Order, OrderEvent, OrderStatus, RetryAttempt, SagaExecution, SagaStepResult, StepData,
};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("step result not found: {0}")]
    StepResultNotFound(Uuid),

    #[error("a non-terminal execution already exists for order {0}")]
    ExecutionAlreadyActive(Uuid),

    #[error("a retry attempt is already pending for order {0}")]
    RetryAlreadyPending(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid uuid: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid {column} value: {value}")]
    InvalidColumn { column: &'static str, value: String },
}

/// Interface for saga persistence.
///
/// Each method is a single transaction; reads reflect all prior
/// committed writes. Step rows within an execution preserve `step_order`
/// and event timestamps are monotone non-decreasing per order.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persist an order together with its items.
    async fn create_order_with_items(&self, order: &Order) -> Result<()>;

    /// Fetch an order with its items.
    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>>;

    /// Transition an order's status.
    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Persist a new execution. Fails with [`StoreError::ExecutionAlreadyActive`]
    /// when another non-terminal execution exists for the order.
    async fn create_execution(&self, execution: &SagaExecution) -> Result<()>;

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<SagaExecution>>;

    /// Most recently started execution for an order.
    async fn latest_execution(&self, order_id: Uuid) -> Result<Option<SagaExecution>>;

    /// All executions for an order, oldest first.
    async fn executions(&self, order_id: Uuid) -> Result<Vec<SagaExecution>>;

    /// Insert a step row in IN_PROGRESS state and advance the
    /// execution's `current_step_index`, atomically.
    async fn start_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<SagaStepResult>;

    /// Record a step's success and its opaque output document.
    async fn complete_step(
        &self,
        step_result_id: Uuid,
        step_data: &StepData,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record a step failure and fail its execution in one transaction,
    /// so the two rows can never disagree after a crash.
    async fn fail_step_and_execution(
        &self,
        step_result_id: Uuid,
        execution_id: Uuid,
        failed_step_index: u32,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert a SKIPPED step row at the expected order (retry path).
    async fn insert_skipped_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<SagaStepResult>;

    /// Step rows for an execution, ordered by `step_order`.
    async fn step_results(&self, execution_id: Uuid) -> Result<Vec<SagaStepResult>>;

    /// Terminal success transition for an execution.
    async fn complete_execution(&self, execution_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Transition an execution into COMPENSATING.
    async fn mark_compensation_started(&self, execution_id: Uuid, at: DateTime<Utc>)
        -> Result<()>;

    /// Record a successful compensation on a step row.
    async fn mark_step_compensated(&self, step_result_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Record a failed compensation attempt on a step row. The row's
    /// status is left untouched; only the message is recorded.
    async fn record_compensation_failure(&self, step_result_id: Uuid, message: &str)
        -> Result<()>;

    /// Terminal compensated transition for an execution.
    async fn mark_execution_compensated(
        &self,
        execution_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Append a timeline event. The stored timestamp is clamped to be
    /// monotone non-decreasing per order.
    async fn append_event(&self, event: &OrderEvent) -> Result<()>;

    /// Timeline events for an order, in append order.
    async fn events(&self, order_id: Uuid) -> Result<Vec<OrderEvent>>;

    /// Latest execution and its ordered step results, for retry
    /// planning.
    async fn find_resume_state(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(SagaExecution, Vec<SagaStepResult>)>>;

    /// Persist a retry attempt. Fails with [`StoreError::RetryAlreadyPending`]
    /// when a PENDING attempt exists for the order.
    async fn create_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()>;

    /// Update a retry attempt row (plan fields, outcome, completion).
    async fn update_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()>;

    /// Retry attempts for an order, ordered by attempt number.
    async fn retry_attempts(&self, order_id: Uuid) -> Result<Vec<RetryAttempt>>;
}
