use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::*;
use crate::model::{
    Address, Order, OrderStatus, SagaExecution, StepData, StepStatus,
};
use crate::steps::{ResultValidity, StepFailure};

struct RecordingStep {
    name: &'static str,
    order: u32,
    fail_compensation: bool,
    compensate_calls: Arc<AtomicU64>,
}

#[async_trait]
impl crate::steps::SagaStep for RecordingStep {
    fn name(&self) -> &'static str {
        self.name
    }

    fn step_order(&self) -> u32 {
        self.order
    }

    async fn execute(
        &self,
        _ctx: &SagaContext,
    ) -> std::result::Result<StepData, StepFailure> {
        Ok(StepData::new())
    }

    async fn compensate(&self, _ctx: &SagaContext) -> std::result::Result<(), StepFailure> {
        self.compensate_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_compensation {
            Err(StepFailure::new("RELEASE_FAILED", "collaborator refused"))
        } else {
            Ok(())
        }
    }

    fn result_validity(
        &self,
        _stored: &StepData,
        _completed_at: DateTime<Utc>,
        _ctx: &SagaContext,
        _now: DateTime<Utc>,
    ) -> ResultValidity {
        ResultValidity::Valid
    }
}

struct Harness {
    store: Arc<dyn SagaStore>,
    orchestrator: CompensationOrchestrator,
    ctx: SagaContext,
    execution: SagaExecution,
}

async fn setup() -> Harness {
    let store: Arc<dyn SagaStore> = Arc::new(crate::store::MockSagaStore::new());
    let bus = Arc::new(ProgressBus::new(64));
    let orchestrator = CompensationOrchestrator::new(store.clone(), bus);

    let now = Utc::now();
    let address = Address {
        street: "123 Main St".to_string(),
        city: "Springfield".to_string(),
        state: "IL".to_string(),
        postal_code: "62701".to_string(),
        country: "US".to_string(),
    };
    let order = Order {
        id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        items: vec![],
        total_amount_cents: 5_998,
        status: OrderStatus::Processing,
        payment_method_id: "valid-card".to_string(),
        shipping_address: address.clone(),
        created_at: now,
        updated_at: now,
    };
    store.create_order_with_items(&order).await.unwrap();

    let execution = SagaExecution::begin(order.id, now);
    store.create_execution(&execution).await.unwrap();

    let ctx = SagaContext::new(
        order,
        execution.id,
        execution.correlation_id.clone(),
        "valid-card".to_string(),
        address,
    );

    Harness {
        store,
        orchestrator,
        ctx,
        execution,
    }
}

/// Drive two completed steps through the store so the rows exist.
async fn completed_steps(
    harness: &Harness,
    specs: Vec<(&'static str, u32, bool)>,
    calls: &Arc<AtomicU64>,
) -> Vec<CompletedStep> {
    let mut completed = Vec::new();
    for (name, order, fail_compensation) in specs {
        let row = harness
            .store
            .start_step(harness.execution.id, name, order, Utc::now())
            .await
            .unwrap();
        harness
            .store
            .complete_step(row.id, &StepData::new(), Utc::now())
            .await
            .unwrap();
        completed.push(CompletedStep {
            step: Arc::new(RecordingStep {
                name,
                order,
                fail_compensation,
                compensate_calls: calls.clone(),
            }),
            step_result_id: row.id,
        });
    }
    completed
}

#[tokio::test]
async fn test_reverse_order_full_compensation() {
    let harness = setup().await;
    let calls = Arc::new(AtomicU64::new(0));
    let completed = completed_steps(
        &harness,
        vec![("inventory", 1, false), ("payment", 2, false)],
        &calls,
    )
    .await;

    let summary = harness
        .orchestrator
        .compensate(
            &harness.ctx,
            CompensationRequest {
                execution_id: harness.execution.id,
                failed_step: "shipping".to_string(),
                failure_reason: "INVALID_ADDRESS: no carrier".to_string(),
                completed,
            },
        )
        .await
        .unwrap();

    assert!(summary.all_succeeded);
    assert!(!summary.already_compensated);
    // Reverse order: payment first, inventory second.
    assert_eq!(summary.compensated_steps, vec!["payment", "inventory"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let order = harness
        .store
        .get_order(harness.ctx.order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Compensated);

    let execution = harness
        .store
        .get_execution(harness.execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, crate::model::ExecutionStatus::Compensated);
    assert!(execution.compensation_started_at.is_some());
    assert!(execution.compensation_completed_at.is_some());

    let rows = harness
        .store
        .step_results(harness.execution.id)
        .await
        .unwrap();
    assert!(rows.iter().all(|row| row.status == StepStatus::Compensated));
    // Compensation timestamps run backwards along step order.
    assert!(rows[0].completed_at.unwrap() >= rows[1].completed_at.unwrap());
}

#[tokio::test]
async fn test_partial_failure_continues_sweep() {
    let harness = setup().await;
    let calls = Arc::new(AtomicU64::new(0));
    let completed = completed_steps(
        &harness,
        vec![("inventory", 1, false), ("payment", 2, true)],
        &calls,
    )
    .await;

    let summary = harness
        .orchestrator
        .compensate(
            &harness.ctx,
            CompensationRequest {
                execution_id: harness.execution.id,
                failed_step: "shipping".to_string(),
                failure_reason: "INVALID_ADDRESS: no carrier".to_string(),
                completed,
            },
        )
        .await
        .unwrap();

    assert!(!summary.all_succeeded);
    // Payment's compensation failed but inventory still ran.
    assert_eq!(summary.compensated_steps, vec!["inventory"]);
    assert_eq!(summary.failed_compensations.len(), 1);
    assert_eq!(summary.failed_compensations[0].step_name, "payment");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let order = harness
        .store
        .get_order(harness.ctx.order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Failed);

    // The execution is parked in COMPENSATING for the operator.
    let execution = harness
        .store
        .get_execution(harness.execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        execution.status,
        crate::model::ExecutionStatus::Compensating
    );

    let rows = harness
        .store
        .step_results(harness.execution.id)
        .await
        .unwrap();
    assert_eq!(rows[0].status, StepStatus::Compensated);
    assert_eq!(rows[1].status, StepStatus::Completed);
    assert!(rows[1].error_message.as_deref().unwrap().contains("RELEASE_FAILED"));
}

#[tokio::test]
async fn test_already_compensated_is_noop() {
    let harness = setup().await;
    let calls = Arc::new(AtomicU64::new(0));
    let completed = completed_steps(&harness, vec![("inventory", 1, false)], &calls).await;

    let first = harness
        .orchestrator
        .compensate(
            &harness.ctx,
            CompensationRequest {
                execution_id: harness.execution.id,
                failed_step: "payment".to_string(),
                failure_reason: "PAYMENT_DECLINED: no".to_string(),
                completed,
            },
        )
        .await
        .unwrap();
    assert!(first.all_succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Second sweep: zero collaborator calls, flagged as already done.
    let completed = completed_steps(&harness, vec![], &calls).await;
    let second = harness
        .orchestrator
        .compensate(
            &harness.ctx,
            CompensationRequest {
                execution_id: harness.execution.id,
                failed_step: "payment".to_string(),
                failure_reason: "PAYMENT_DECLINED: no".to_string(),
                completed,
            },
        )
        .await
        .unwrap();
    assert!(second.already_compensated);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_prefix_compensates_nothing() {
    let harness = setup().await;

    let summary = harness
        .orchestrator
        .compensate(
            &harness.ctx,
            CompensationRequest {
                execution_id: harness.execution.id,
                failed_step: "inventory".to_string(),
                failure_reason: "INVENTORY_UNAVAILABLE: out of stock".to_string(),
                completed: Vec::new(),
            },
        )
        .await
        .unwrap();

    assert!(summary.all_succeeded);
    assert!(summary.compensated_steps.is_empty());

    // An empty sweep still terminates cleanly as compensated.
    let order = harness
        .store
        .get_order(harness.ctx.order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Compensated);
}
