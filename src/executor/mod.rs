//! Step execution engine.
//!
//! Runs one step at a time against its collaborator, recording the
//! lifecycle rows and emitting events around the call. The executor
//! enforces the total-step deadline and maps panics out of step code
//! into ordinary step failures so a misbehaving collaborator client can
//! never take the orchestration task down.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use serde_json::json;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::clients::codes;
use crate::context::SagaContext;
use crate::model::{OrderEvent, OrderEventType};
use crate::progress::ProgressBus;
use crate::steps::{SagaStep, StepFailure};
use crate::store::{Result, SagaStore};

/// Outcome of driving a single step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success,
    Failed(StepFault),
}

/// Outcome of driving a full step sequence.
#[derive(Debug, Clone)]
pub enum SequenceOutcome {
    AllSucceeded,
    Failed(StepFault),
}

/// Details of a failed step.
#[derive(Debug, Clone)]
pub struct StepFault {
    pub step_name: String,
    /// 0-based index of the failed step.
    pub step_index: u32,
    pub error_code: String,
    pub error_message: String,
}

impl StepFault {
    /// Failure reason recorded on the execution row.
    pub fn reason(&self) -> String {
        format!("{}: {}", self.error_code, self.error_message)
    }
}

/// Drives individual steps and persists their lifecycle.
pub struct StepExecutor {
    store: Arc<dyn SagaStore>,
    bus: Arc<ProgressBus>,
    total_timeout: Duration,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn SagaStore>, bus: Arc<ProgressBus>, total_timeout: Duration) -> Self {
        Self {
            store,
            bus,
            total_timeout,
        }
    }

    /// Run one step: start row, invoke, record completion or failure.
    ///
    /// A step failure also fails the execution row in the same store
    /// transaction, so the two can never disagree after a crash.
    pub async fn execute_one(
        &self,
        step: &Arc<dyn SagaStep>,
        ctx: &mut SagaContext,
    ) -> Result<StepOutcome> {
        let row = self
            .store
            .start_step(ctx.execution_id, step.name(), step.step_order(), Utc::now())
            .await?;

        // Live signal only; the IN_PROGRESS row is the durable record.
        self.bus.publish(
            &OrderEvent::new(ctx.order.id, OrderEventType::StepStarted, Utc::now())
                .with_step(step.name()),
        );

        let started = Instant::now();
        let outcome = match timeout(
            self.total_timeout,
            AssertUnwindSafe(step.execute(ctx)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(StepFailure::new(
                "UNEXPECTED",
                format!("Unexpected error: {}", panic_detail(panic.as_ref())),
            )),
            Err(_) => Err(StepFailure::new(
                codes::TRANSIENT,
                format!(
                    "step timed out after {} seconds",
                    self.total_timeout.as_secs()
                ),
            )),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(data) => {
                ctx.merge(&data);
                let now = Utc::now();
                self.store.complete_step(row.id, &data, now).await?;

                let event = OrderEvent::new(ctx.order.id, OrderEventType::StepCompleted, now)
                    .with_step(step.name())
                    .with_outcome("SUCCESS")
                    .with_details(json!({ "durationMs": duration_ms }));
                self.store.append_event(&event).await?;
                self.bus.publish(&event);

                info!(
                    order_id = %ctx.order.id,
                    step = %step.name(),
                    duration_ms,
                    "step completed"
                );
                Ok(StepOutcome::Success)
            }
            Err(failure) => {
                let fault = StepFault {
                    step_name: step.name().to_string(),
                    step_index: step.step_order() - 1,
                    error_code: failure.code,
                    error_message: failure.message,
                };

                let now = Utc::now();
                self.store
                    .fail_step_and_execution(
                        row.id,
                        ctx.execution_id,
                        fault.step_index,
                        &fault.reason(),
                        now,
                    )
                    .await?;

                let event = OrderEvent::new(ctx.order.id, OrderEventType::StepFailed, now)
                    .with_step(step.name())
                    .with_outcome("FAILED")
                    .with_error(fault.error_code.clone(), fault.error_message.clone())
                    .with_details(json!({ "durationMs": duration_ms }));
                self.store.append_event(&event).await?;
                self.bus.publish(&event);

                warn!(
                    order_id = %ctx.order.id,
                    step = %step.name(),
                    error_code = %fault.error_code,
                    error = %fault.error_message,
                    duration_ms,
                    "step failed"
                );
                Ok(StepOutcome::Failed(fault))
            }
        }
    }

    /// Record a step as skipped without touching its collaborator
    /// (retry path for still-valid prior results).
    pub async fn skip_one(&self, step: &Arc<dyn SagaStep>, ctx: &SagaContext) -> Result<()> {
        let now = Utc::now();
        self.store
            .insert_skipped_step(ctx.execution_id, step.name(), step.step_order(), now)
            .await?;

        let event = OrderEvent::new(ctx.order.id, OrderEventType::StepSkipped, now)
            .with_step(step.name())
            .with_outcome("SKIPPED");
        self.store.append_event(&event).await?;
        self.bus.publish(&event);

        info!(order_id = %ctx.order.id, step = %step.name(), "step skipped");
        Ok(())
    }

    /// Drive a full sequence, skipping the named steps, stopping at the
    /// first failure.
    pub async fn execute_sequence(
        &self,
        steps: &[Arc<dyn SagaStep>],
        ctx: &mut SagaContext,
        skip: &HashSet<String>,
    ) -> Result<SequenceOutcome> {
        for step in steps {
            if skip.contains(step.name()) {
                self.skip_one(step, ctx).await?;
                continue;
            }
            match self.execute_one(step, ctx).await? {
                StepOutcome::Success => {}
                StepOutcome::Failed(fault) => return Ok(SequenceOutcome::Failed(fault)),
            }
        }
        Ok(SequenceOutcome::AllSucceeded)
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Address, ExecutionStatus, Order, OrderStatus, SagaExecution, StepData, StepStatus,
    };
    use crate::steps::ResultValidity;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    enum Behavior {
        Succeed,
        Fail,
        Panic,
        Stall,
    }

    struct ScriptedStep {
        name: &'static str,
        order: u32,
        behavior: Behavior,
    }

    #[async_trait]
    impl SagaStep for ScriptedStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn step_order(&self) -> u32 {
            self.order
        }

        async fn execute(&self, _ctx: &SagaContext) -> std::result::Result<StepData, StepFailure> {
            match self.behavior {
                Behavior::Succeed => {
                    let mut data = StepData::new();
                    data.insert("KEY".to_string(), format!("{}-output", self.name));
                    Ok(data)
                }
                Behavior::Fail => Err(StepFailure::new("PAYMENT_DECLINED", "card declined")),
                Behavior::Panic => panic!("collaborator client bug"),
                Behavior::Stall => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(StepData::new())
                }
            }
        }

        async fn compensate(&self, _ctx: &SagaContext) -> std::result::Result<(), StepFailure> {
            Ok(())
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

    async fn setup(
        behaviors: Vec<(&'static str, u32, Behavior)>,
    ) -> (
        Arc<dyn SagaStore>,
        StepExecutor,
        Vec<Arc<dyn SagaStep>>,
        SagaContext,
    ) {
        let store: Arc<dyn SagaStore> = Arc::new(crate::store::MockSagaStore::new());
        let bus = Arc::new(ProgressBus::new(64));
        let executor = StepExecutor::new(store.clone(), bus, Duration::from_millis(200));

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

        let steps: Vec<Arc<dyn SagaStep>> = behaviors
            .into_iter()
            .map(|(name, order, behavior)| {
                Arc::new(ScriptedStep {
                    name,
                    order,
                    behavior,
                }) as Arc<dyn SagaStep>
            })
            .collect();

        (store, executor, steps, ctx)
    }

    #[tokio::test]
    async fn test_sequence_all_succeed() {
        let (store, executor, steps, mut ctx) = setup(vec![
            ("first", 1, Behavior::Succeed),
            ("second", 2, Behavior::Succeed),
        ])
        .await;

        let outcome = executor
            .execute_sequence(&steps, &mut ctx, &HashSet::new())
            .await
            .unwrap();
        assert!(matches!(outcome, SequenceOutcome::AllSucceeded));
        assert_eq!(ctx.get("KEY"), Some("second-output"));

        let rows = store.step_results(ctx.execution_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_failure_stops_sequence_and_fails_execution() {
        let (store, executor, steps, mut ctx) = setup(vec![
            ("first", 1, Behavior::Succeed),
            ("second", 2, Behavior::Fail),
            ("third", 3, Behavior::Succeed),
        ])
        .await;

        let outcome = executor
            .execute_sequence(&steps, &mut ctx, &HashSet::new())
            .await
            .unwrap();
        let SequenceOutcome::Failed(fault) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(fault.step_name, "second");
        assert_eq!(fault.step_index, 1);
        assert_eq!(fault.error_code, "PAYMENT_DECLINED");

        // Third step never started.
        let rows = store.step_results(ctx.execution_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].status, StepStatus::Failed);

        let execution = store
            .get_execution(ctx.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failed_step_index, Some(1));
        assert!(execution.failure_reason.unwrap().contains("PAYMENT_DECLINED"));
    }

    #[tokio::test]
    async fn test_panic_maps_to_unexpected_failure() {
        let (store, executor, steps, mut ctx) =
            setup(vec![("explosive", 1, Behavior::Panic)]).await;

        let outcome = executor.execute_one(&steps[0], &mut ctx).await.unwrap();
        let StepOutcome::Failed(fault) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(fault.error_code, "UNEXPECTED");
        assert!(fault.error_message.starts_with("Unexpected error:"));

        let rows = store.step_results(ctx.execution_id).await.unwrap();
        assert_eq!(rows[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_total_deadline_fails_step() {
        let (_store, executor, steps, mut ctx) =
            setup(vec![("stalled", 1, Behavior::Stall)]).await;

        let outcome = executor.execute_one(&steps[0], &mut ctx).await.unwrap();
        let StepOutcome::Failed(fault) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(fault.error_code, codes::TRANSIENT);
        assert!(fault.error_message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_skip_records_row_without_execution() {
        let (store, executor, steps, mut ctx) = setup(vec![
            ("first", 1, Behavior::Succeed),
            ("second", 2, Behavior::Succeed),
        ])
        .await;

        let skip: HashSet<String> = ["first".to_string()].into_iter().collect();
        let outcome = executor
            .execute_sequence(&steps, &mut ctx, &skip)
            .await
            .unwrap();
        assert!(matches!(outcome, SequenceOutcome::AllSucceeded));

        let rows = store.step_results(ctx.execution_id).await.unwrap();
        assert_eq!(rows[0].status, StepStatus::Skipped);
        assert_eq!(rows[1].status, StepStatus::Completed);
        // The skipped step produced no context output.
        assert_eq!(ctx.get("KEY"), Some("second-output"));
    }
}
