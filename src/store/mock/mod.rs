//! In-memory SagaStore for tests.
//!
//! Keeps the same invariants as the SQLite implementation (single active
//! execution, exclusive pending retry attempt, monotone event
//! timestamps) so orchestration tests exercise the real protocol without
//! a database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Result, SagaStore, StoreError};
use crate::model::{
    ExecutionStatus, Order, OrderEvent, OrderStatus, RetryAttempt, RetryOutcome, SagaExecution,
    SagaStepResult, StepData, StepStatus,
};

/// In-memory implementation of [`SagaStore`].
#[derive(Default)]
pub struct MockSagaStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    orders: HashMap<Uuid, Order>,
    executions: HashMap<Uuid, SagaExecution>,
    steps: HashMap<Uuid, SagaStepResult>,
    events: Vec<OrderEvent>,
    attempts: HashMap<Uuid, RetryAttempt>,
}

impl MockSagaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn execution_mut(&mut self, execution_id: Uuid) -> Result<&mut SagaExecution> {
        self.executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    fn step_mut(&mut self, step_result_id: Uuid) -> Result<&mut SagaStepResult> {
        self.steps
            .get_mut(&step_result_id)
            .ok_or(StoreError::StepResultNotFound(step_result_id))
    }
}

#[async_trait]
impl SagaStore for MockSagaStore {
    async fn create_order_with_items(&self, order: &Order) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.orders.get(&order_id).cloned())
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or(StoreError::OrderNotFound(order_id))?;
        order.status = status;
        order.updated_at = at;
        Ok(())
    }

    async fn create_execution(&self, execution: &SagaExecution) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let active = inner.executions.values().any(|existing| {
            existing.order_id == execution.order_id && !existing.status.is_terminal()
        });
        if active {
            return Err(StoreError::ExecutionAlreadyActive(execution.order_id));
        }
        inner.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<SagaExecution>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.executions.get(&execution_id).cloned())
    }

    async fn latest_execution(&self, order_id: Uuid) -> Result<Option<SagaExecution>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .executions
            .values()
            .filter(|execution| execution.order_id == order_id)
            .max_by_key(|execution| execution.started_at)
            .cloned())
    }

    async fn executions(&self, order_id: Uuid) -> Result<Vec<SagaExecution>> {
        let inner = self.inner.lock().unwrap();
        let mut executions: Vec<SagaExecution> = inner
            .executions
            .values()
            .filter(|execution| execution.order_id == order_id)
            .cloned()
            .collect();
        executions.sort_by_key(|execution| execution.started_at);
        Ok(executions)
    }

    async fn start_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<SagaStepResult> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner.execution_mut(execution_id)?;
        execution.current_step_index = step_order - 1;

        let result = SagaStepResult {
            id: Uuid::new_v4(),
            execution_id,
            step_name: step_name.to_string(),
            step_order,
            status: StepStatus::InProgress,
            step_data: StepData::new(),
            error_message: None,
            started_at: Some(at),
            completed_at: None,
        };
        inner.steps.insert(result.id, result.clone());
        Ok(result)
    }

    async fn complete_step(
        &self,
        step_result_id: Uuid,
        step_data: &StepData,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.step_mut(step_result_id)?;
        step.status = StepStatus::Completed;
        step.step_data = step_data.clone();
        step.completed_at = Some(at);
        Ok(())
    }

    async fn fail_step_and_execution(
        &self,
        step_result_id: Uuid,
        execution_id: Uuid,
        failed_step_index: u32,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        {
            let step = inner.step_mut(step_result_id)?;
            step.status = StepStatus::Failed;
            step.error_message = Some(error_message.to_string());
            step.completed_at = Some(at);
        }
        let execution = inner.execution_mut(execution_id)?;
        execution.status = ExecutionStatus::Failed;
        execution.failed_step_index = Some(failed_step_index);
        execution.failure_reason = Some(error_message.to_string());
        execution.completed_at = Some(at);
        Ok(())
    }

    async fn insert_skipped_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<SagaStepResult> {
        let mut inner = self.inner.lock().unwrap();
        let result = SagaStepResult {
            id: Uuid::new_v4(),
            execution_id,
            step_name: step_name.to_string(),
            step_order,
            status: StepStatus::Skipped,
            step_data: StepData::new(),
            error_message: None,
            started_at: None,
            completed_at: Some(at),
        };
        inner.steps.insert(result.id, result.clone());
        Ok(result)
    }

    async fn step_results(&self, execution_id: Uuid) -> Result<Vec<SagaStepResult>> {
        let inner = self.inner.lock().unwrap();
        let mut results: Vec<SagaStepResult> = inner
            .steps
            .values()
            .filter(|step| step.execution_id == execution_id)
            .cloned()
            .collect();
        results.sort_by_key(|step| step.step_order);
        Ok(results)
    }

    async fn complete_execution(&self, execution_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner.execution_mut(execution_id)?;
        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(at);
        Ok(())
    }

    async fn mark_compensation_started(
        &self,
        execution_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner.execution_mut(execution_id)?;
        execution.status = ExecutionStatus::Compensating;
        execution.compensation_started_at = Some(at);
        Ok(())
    }

    async fn mark_step_compensated(&self, step_result_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.step_mut(step_result_id)?;
        step.status = StepStatus::Compensated;
        step.completed_at = Some(at);
        Ok(())
    }

    async fn record_compensation_failure(
        &self,
        step_result_id: Uuid,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner.step_mut(step_result_id)?;
        step.error_message = Some(message.to_string());
        Ok(())
    }

    async fn mark_execution_compensated(
        &self,
        execution_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner.execution_mut(execution_id)?;
        execution.status = ExecutionStatus::Compensated;
        execution.compensation_completed_at = Some(at);
        Ok(())
    }

    async fn append_event(&self, event: &OrderEvent) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut event = event.clone();
        // Same monotonicity clamp as the SQLite implementation.
        if let Some(latest) = inner
            .events
            .iter()
            .filter(|existing| existing.order_id == event.order_id)
            .map(|existing| existing.timestamp)
            .max()
        {
            if event.timestamp < latest {
                event.timestamp = latest;
            }
        }
        inner.events.push(event);
        Ok(())
    }

    async fn events(&self, order_id: Uuid) -> Result<Vec<OrderEvent>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|event| event.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn find_resume_state(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(SagaExecution, Vec<SagaStepResult>)>> {
        let Some(execution) = self.latest_execution(order_id).await? else {
            return Ok(None);
        };
        let results = self.step_results(execution.id).await?;
        Ok(Some((execution, results)))
    }

    async fn create_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pending = inner.attempts.values().any(|existing| {
            existing.order_id == attempt.order_id && existing.outcome == RetryOutcome::Pending
        });
        if pending {
            return Err(StoreError::RetryAlreadyPending(attempt.order_id));
        }
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn update_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn retry_attempts(&self, order_id: Uuid) -> Result<Vec<RetryAttempt>> {
        let inner = self.inner.lock().unwrap();
        let mut attempts: Vec<RetryAttempt> = inner
            .attempts
            .values()
            .filter(|attempt| attempt.order_id == order_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|attempt| attempt.attempt_number);
        Ok(attempts)
    }
}
