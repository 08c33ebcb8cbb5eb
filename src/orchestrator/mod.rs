//! Top-level saga state machine.
//!
//! One orchestration task drives one `(order, execution)` pair: persist
//! the order and execution, walk the registry through the step executor,
//! and on failure hand the completed prefix to the compensation
//! orchestrator. The handoff is a plain [`CompensationRequest`] record,
//! so neither orchestrator owns the other.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compensation::{CompensationOrchestrator, CompensationRequest, CompletedStep};
use crate::context::{keys, SagaContext};
use crate::executor::{SequenceOutcome, StepExecutor};
use crate::model::{
    Address, Order, OrderEvent, OrderEventType, OrderItem, OrderStatus, SagaExecution, StepStatus,
};
use crate::progress::ProgressBus;
use crate::steps::StepRegistry;
use crate::store::{SagaStore, StoreError};

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that abort orchestration outright (as opposed to step
/// failures, which are part of the saga protocol).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// An order submission.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub customer_id: Uuid,
    pub items: Vec<NewOrderItem>,
    pub payment_method_id: String,
    pub shipping_address: Address,
}

/// One requested line item.
#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// Terminal outcome of one saga execution.
#[derive(Debug, Clone)]
pub enum SagaResult {
    /// Every step completed.
    Success {
        order_id: Uuid,
        confirmation_number: String,
        total_charged_cents: i64,
        tracking_number: Option<String>,
        estimated_delivery: Option<DateTime<Utc>>,
    },
    /// A step failed and the completed prefix was fully compensated.
    Compensated {
        order_id: Uuid,
        failed_step: String,
        reason: String,
        compensated_steps: Vec<String>,
    },
    /// A step failed with nothing to compensate, or compensation itself
    /// was incomplete; the order is FAILED.
    Failure {
        order_id: Uuid,
        failed_step: String,
        reason: String,
    },
}

impl SagaResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SagaResult::Success { .. })
    }
}

/// Coordinates one saga execution end to end.
pub struct SagaOrchestrator {
    store: Arc<dyn SagaStore>,
    registry: Arc<StepRegistry>,
    executor: StepExecutor,
    compensation: CompensationOrchestrator,
    bus: Arc<ProgressBus>,
}

impl SagaOrchestrator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        registry: Arc<StepRegistry>,
        executor: StepExecutor,
        compensation: CompensationOrchestrator,
        bus: Arc<ProgressBus>,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            compensation,
            bus,
        }
    }

    /// Execute a fresh saga for a new order.
    pub async fn execute(&self, request: OrderRequest) -> Result<SagaResult> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let items: Vec<OrderItem> = request
            .items
            .iter()
            .map(|item| OrderItem {
                id: Uuid::new_v4(),
                order_id,
                product_id: item.product_id,
                product_name: item.product_name.clone(),
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
            })
            .collect();
        let total_amount_cents = items
            .iter()
            .map(|item| i64::from(item.quantity) * item.unit_price_cents)
            .sum();

        let order = Order {
            id: order_id,
            customer_id: request.customer_id,
            items,
            total_amount_cents,
            status: OrderStatus::Processing,
            payment_method_id: request.payment_method_id.clone(),
            shipping_address: request.shipping_address.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_order_with_items(&order).await?;

        let execution = SagaExecution::begin(order_id, now);
        self.store.create_execution(&execution).await?;

        let ctx = SagaContext::new(
            order,
            execution.id,
            execution.correlation_id.clone(),
            request.payment_method_id,
            request.shipping_address,
        );

        self.drive(ctx, &execution, HashSet::new()).await
    }

    /// Drive an already-persisted execution through the registry,
    /// skipping the named steps (retry path).
    pub(crate) async fn drive(
        &self,
        mut ctx: SagaContext,
        execution: &SagaExecution,
        skip: HashSet<String>,
    ) -> Result<SagaResult> {
        let order_id = ctx.order.id;

        let started = OrderEvent::new(order_id, OrderEventType::SagaStarted, Utc::now())
            .with_details(json!({
                "executionId": execution.id,
                "correlationId": execution.correlation_id,
                "totalAmountCents": ctx.order.total_amount_cents,
                "skippedSteps": skip.iter().collect::<Vec<_>>(),
            }));
        self.store.append_event(&started).await?;
        self.bus.publish(&started);

        info!(
            order_id = %order_id,
            execution_id = %execution.id,
            correlation_id = %execution.correlation_id,
            "saga started"
        );

        let outcome = self
            .executor
            .execute_sequence(self.registry.ordered_steps(), &mut ctx, &skip)
            .await?;

        match outcome {
            SequenceOutcome::AllSucceeded => self.finish_success(ctx, execution).await,
            SequenceOutcome::Failed(fault) => {
                let completed = self.completed_prefix(execution.id).await?;

                if completed.is_empty() {
                    return self
                        .finish_failure(&ctx, &fault.step_name, &fault.reason(), "step failed")
                        .await;
                }

                let summary = self
                    .compensation
                    .compensate(
                        &ctx,
                        CompensationRequest {
                            execution_id: execution.id,
                            failed_step: fault.step_name.clone(),
                            failure_reason: fault.reason(),
                            completed,
                        },
                    )
                    .await?;

                if summary.all_succeeded {
                    self.bus.publish_terminal(order_id);
                    info!(
                        order_id = %order_id,
                        failed_step = %fault.step_name,
                        compensated = summary.compensated_steps.len(),
                        "saga compensated"
                    );
                    let reason = fault.reason();
                    Ok(SagaResult::Compensated {
                        order_id,
                        failed_step: fault.step_name,
                        reason,
                        compensated_steps: summary.compensated_steps,
                    })
                } else {
                    self.finish_failure(
                        &ctx,
                        &fault.step_name,
                        &fault.reason(),
                        "compensation incomplete",
                    )
                    .await
                }
            }
        }
    }

    /// Completed step rows paired with their registry steps, in
    /// execution order.
    async fn completed_prefix(&self, execution_id: Uuid) -> Result<Vec<CompletedStep>> {
        let rows = self.store.step_results(execution_id).await?;
        Ok(rows
            .into_iter()
            .filter(|row| row.status == StepStatus::Completed)
            .filter_map(|row| {
                self.registry.by_name(&row.step_name).map(|step| CompletedStep {
                    step: step.clone(),
                    step_result_id: row.id,
                })
            })
            .collect())
    }

    async fn finish_success(
        &self,
        ctx: SagaContext,
        execution: &SagaExecution,
    ) -> Result<SagaResult> {
        let order_id = ctx.order.id;
        let now = Utc::now();
        self.store.complete_execution(execution.id, now).await?;
        self.store
            .update_order_status(order_id, OrderStatus::Completed, now)
            .await?;

        let confirmation_number = confirmation_number(order_id);
        let tracking_number = ctx.get(keys::TRACKING_NUMBER).map(str::to_string);
        let estimated_delivery = ctx.get_timestamp(keys::ESTIMATED_DELIVERY);

        let event = OrderEvent::new(order_id, OrderEventType::SagaCompleted, now)
            .with_outcome("SUCCESS")
            .with_details(json!({
                "confirmationNumber": confirmation_number,
                "trackingNumber": tracking_number,
                "totalChargedCents": ctx.order.total_amount_cents,
            }));
        self.store.append_event(&event).await?;
        self.bus.publish(&event);
        self.bus.publish_terminal(order_id);

        info!(
            order_id = %order_id,
            confirmation = %confirmation_number,
            "saga completed"
        );

        Ok(SagaResult::Success {
            order_id,
            confirmation_number,
            total_charged_cents: ctx.order.total_amount_cents,
            tracking_number,
            estimated_delivery,
        })
    }

    async fn finish_failure(
        &self,
        ctx: &SagaContext,
        failed_step: &str,
        reason: &str,
        cause: &str,
    ) -> Result<SagaResult> {
        let order_id = ctx.order.id;
        let now = Utc::now();
        self.store
            .update_order_status(order_id, OrderStatus::Failed, now)
            .await?;

        let (code, message) = reason
            .split_once(": ")
            .unwrap_or(("UNEXPECTED", reason));
        let event = OrderEvent::new(order_id, OrderEventType::SagaFailed, now)
            .with_step(failed_step)
            .with_outcome("FAILED")
            .with_error(code, message)
            .with_details(json!({ "cause": cause }));
        self.store.append_event(&event).await?;
        self.bus.publish(&event);
        self.bus.publish_terminal(order_id);

        warn!(
            order_id = %order_id,
            failed_step = %failed_step,
            reason = %reason,
            cause = %cause,
            "saga failed"
        );

        Ok(SagaResult::Failure {
            order_id,
            failed_step: failed_step.to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Short human-readable confirmation derived from the order id.
fn confirmation_number(order_id: Uuid) -> String {
    let simple = order_id.simple().to_string();
    format!("CNF-{}", simple[..8].to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::{MockCollaborators, DECLINED_CARD};
    use crate::compensation::CompensationOrchestrator;
    use crate::config::ValidityPolicy;
    use crate::model::ExecutionStatus;
    use crate::store::MockSagaStore;
    use std::time::Duration;

    fn address() -> Address {
        Address {
            street: "123 Main St".to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            postal_code: "62701".to_string(),
            country: "US".to_string(),
        }
    }

    fn request(payment_method: &str) -> OrderRequest {
        OrderRequest {
            customer_id: Uuid::new_v4(),
            items: vec![NewOrderItem {
                product_id: Uuid::new_v4(),
                product_name: "Widget".to_string(),
                quantity: 2,
                unit_price_cents: 2_999,
            }],
            payment_method_id: payment_method.to_string(),
            shipping_address: address(),
        }
    }

    fn build(mocks: &MockCollaborators) -> (Arc<dyn SagaStore>, SagaOrchestrator) {
        let store: Arc<dyn SagaStore> = Arc::new(MockSagaStore::new());
        let bus = Arc::new(ProgressBus::new(64));
        let registry = Arc::new(StepRegistry::standard(
            &mocks.collaborators(),
            &ValidityPolicy::default(),
        ));
        let executor = StepExecutor::new(store.clone(), bus.clone(), Duration::from_secs(120));
        let compensation = CompensationOrchestrator::new(store.clone(), bus.clone());
        let orchestrator =
            SagaOrchestrator::new(store.clone(), registry, executor, compensation, bus);
        (store, orchestrator)
    }

    #[tokio::test]
    async fn test_happy_path_totals_and_rows() {
        let mocks = MockCollaborators::new();
        let (store, orchestrator) = build(&mocks);

        let result = orchestrator.execute(request("valid-card")).await.unwrap();
        let SagaResult::Success {
            order_id,
            total_charged_cents,
            tracking_number,
            ..
        } = result
        else {
            panic!("expected success");
        };
        assert_eq!(total_charged_cents, 5_998);
        assert!(tracking_number.is_some());

        let order = store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);

        let execution = store.latest_execution(order_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let rows = store.step_results(execution.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_declined_payment_compensates_inventory() {
        let mocks = MockCollaborators::new();
        let (store, orchestrator) = build(&mocks);

        let result = orchestrator.execute(request(DECLINED_CARD)).await.unwrap();
        let SagaResult::Compensated {
            order_id,
            failed_step,
            compensated_steps,
            ..
        } = result
        else {
            panic!("expected compensated outcome");
        };
        assert_eq!(failed_step, "Payment Authorization");
        assert_eq!(compensated_steps, vec!["Inventory Reservation"]);

        let order = store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Compensated);

        // The reservation was released; nothing is left held.
        assert!(mocks.inventory.open_reservations().is_empty());
        assert!(mocks.payment.open_authorizations().is_empty());
    }

    #[tokio::test]
    async fn test_first_step_failure_skips_compensation() {
        let mocks = MockCollaborators::new();
        let (store, orchestrator) = build(&mocks);

        let mut bad_request = request("valid-card");
        bad_request.items[0].product_id = Uuid::nil();

        let result = orchestrator.execute(bad_request).await.unwrap();
        let SagaResult::Failure {
            order_id,
            failed_step,
            reason,
        } = result
        else {
            panic!("expected failure");
        };
        assert_eq!(failed_step, "Inventory Reservation");
        assert!(reason.contains("INVENTORY_UNAVAILABLE"));

        let order = store.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Failed);

        // Nothing ran past step 1 and nothing was compensated.
        assert_eq!(mocks.inventory.release_calls(), 0);
        assert_eq!(mocks.payment.authorize_calls(), 0);

        let events = store.events(order_id).await.unwrap();
        assert!(!events
            .iter()
            .any(|event| matches!(
                event.event_type,
                OrderEventType::CompensationStarted | OrderEventType::CompensationCompleted
            )));
    }
}
