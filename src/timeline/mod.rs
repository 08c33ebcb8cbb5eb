//! Customer-facing timeline projection.
//!
//! Materializes persisted `OrderEvent` and step rows into a
//! chronological timeline. The projector holds no state of its own: the
//! same rows always produce the same timeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clients::codes;
use crate::model::{OrderEvent, OrderEventType, RetryOutcome, StepStatus};
use crate::store::{Result, SagaStore};

/// Outcome tag on a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineOutcome {
    Success,
    Failed,
    Compensated,
    Skipped,
}

/// Customer-facing error details for a failed entry.
#[derive(Debug, Clone)]
pub struct TimelineErrorDetail {
    pub code: String,
    pub message: String,
    pub suggested_action: String,
}

/// One rendered timeline entry.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub title: String,
    pub description: String,
    pub outcome: TimelineOutcome,
    pub timestamp: DateTime<Utc>,
    pub step_name: Option<String>,
    pub error: Option<TimelineErrorDetail>,
}

/// Per-retry execution summary, preserved for audit.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub attempt_number: u32,
    pub outcome: RetryOutcome,
    pub steps_completed: u32,
    pub resumed_from_step: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The full rendered history of an order.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub order_id: Uuid,
    pub entries: Vec<TimelineEntry>,
    pub attempts: Vec<ExecutionSummary>,
}

/// Renders persisted rows into timelines on demand.
pub struct HistoryProjector {
    store: Arc<dyn SagaStore>,
}

impl HistoryProjector {
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self { store }
    }

    pub async fn timeline(&self, order_id: Uuid) -> Result<Timeline> {
        // Events are returned in append order, which the store keeps
        // consistent with their (clamped) timestamps.
        let events = self.store.events(order_id).await?;
        let entries = events.iter().map(entry_for).collect();

        let mut attempts = Vec::new();
        for attempt in self.store.retry_attempts(order_id).await? {
            let steps_completed = match attempt.retry_execution_id {
                Some(execution_id) => self
                    .store
                    .step_results(execution_id)
                    .await?
                    .iter()
                    .filter(|row| row.status == StepStatus::Completed)
                    .count() as u32,
                None => 0,
            };
            attempts.push(ExecutionSummary {
                attempt_number: attempt.attempt_number,
                outcome: attempt.outcome,
                steps_completed,
                resumed_from_step: attempt.resumed_from_step,
                initiated_at: attempt.initiated_at,
                completed_at: attempt.completed_at,
            });
        }

        Ok(Timeline {
            order_id,
            entries,
            attempts,
        })
    }
}

fn entry_for(event: &OrderEvent) -> TimelineEntry {
    let step = event.step_name.as_deref();
    let (title, description, outcome) = match event.event_type {
        OrderEventType::SagaStarted => (
            "Order received".to_string(),
            "We received your order and started processing it.".to_string(),
            TimelineOutcome::Success,
        ),
        OrderEventType::StepStarted => (
            format!("{} started", step_label(step)),
            format!("{} is in progress.", step_label(step)),
            TimelineOutcome::Success,
        ),
        OrderEventType::StepCompleted => step_completed_copy(step),
        OrderEventType::StepFailed => (
            format!("{} failed", step_label(step)),
            "This step could not be completed.".to_string(),
            TimelineOutcome::Failed,
        ),
        OrderEventType::StepSkipped => (
            format!("{} reused", step_label(step)),
            "A still-valid result from a previous attempt was reused.".to_string(),
            TimelineOutcome::Skipped,
        ),
        OrderEventType::CompensationStarted => (
            "Reversing completed steps".to_string(),
            "We started undoing the steps that had already completed.".to_string(),
            TimelineOutcome::Compensated,
        ),
        OrderEventType::StepCompensated => (
            format!("{} reversed", step_label(step)),
            "This step was undone.".to_string(),
            TimelineOutcome::Compensated,
        ),
        OrderEventType::StepCompensationFailed => (
            format!("{} could not be reversed", step_label(step)),
            "Undoing this step failed; our team will follow up.".to_string(),
            TimelineOutcome::Failed,
        ),
        OrderEventType::CompensationCompleted => {
            if event.outcome.as_deref() == Some("SUCCESS") {
                (
                    "Order rolled back".to_string(),
                    "All completed steps were undone; you have not been charged.".to_string(),
                    TimelineOutcome::Compensated,
                )
            } else {
                (
                    "Rollback incomplete".to_string(),
                    "Some steps could not be undone automatically; our team will follow up."
                        .to_string(),
                    TimelineOutcome::Failed,
                )
            }
        }
        OrderEventType::SagaCompleted => (
            "Order confirmed".to_string(),
            "Your order completed successfully.".to_string(),
            TimelineOutcome::Success,
        ),
        OrderEventType::SagaFailed => (
            "Order failed".to_string(),
            "We could not complete your order.".to_string(),
            TimelineOutcome::Failed,
        ),
    };

    let error = event.error_code.as_ref().map(|code| TimelineErrorDetail {
        code: code.clone(),
        message: event.error_message.clone().unwrap_or_default(),
        suggested_action: suggested_action(code).to_string(),
    });

    TimelineEntry {
        title,
        description,
        outcome,
        timestamp: event.timestamp,
        step_name: event.step_name.clone(),
        error,
    }
}

fn step_label(step: Option<&str>) -> &str {
    step.unwrap_or("Step")
}

fn step_completed_copy(step: Option<&str>) -> (String, String, TimelineOutcome) {
    let (title, description) = match step {
        Some("Inventory Reservation") => (
            "Items reserved".to_string(),
            "Your items were set aside for this order.".to_string(),
        ),
        Some("Payment Authorization") => (
            "Payment authorized".to_string(),
            "Your payment method was authorized for the order total.".to_string(),
        ),
        Some("Shipping Arrangement") => (
            "Shipping arranged".to_string(),
            "A shipment was created and a tracking number assigned.".to_string(),
        ),
        other => (
            format!("{} completed", step_label(other)),
            "This step completed successfully.".to_string(),
        ),
    };
    (title, description, TimelineOutcome::Success)
}

/// Customer guidance derived from a collaborator error code.
fn suggested_action(code: &str) -> &'static str {
    match code {
        codes::PAYMENT_DECLINED | codes::FRAUD_DETECTED => "Update your payment method",
        codes::INVALID_ADDRESS | codes::SHIPPING_UNAVAILABLE => "Verify the shipping address",
        codes::INVENTORY_UNAVAILABLE => "Confirm item availability",
        codes::TRANSIENT => "Try again in a few minutes",
        _ => "Contact support",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Address, Order, OrderStatus};
    use crate::store::MockSagaStore;
    use serde_json::json;

    async fn seeded_store() -> (Arc<dyn SagaStore>, Uuid) {
        let store: Arc<dyn SagaStore> = Arc::new(MockSagaStore::new());
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = Order {
            id: order_id,
            customer_id: Uuid::new_v4(),
            items: vec![],
            total_amount_cents: 5_998,
            status: OrderStatus::Failed,
            payment_method_id: "declined-card".to_string(),
            shipping_address: Address {
                street: "123 Main St".to_string(),
                city: "Springfield".to_string(),
                state: "IL".to_string(),
                postal_code: "62701".to_string(),
                country: "US".to_string(),
            },
            created_at: now,
            updated_at: now,
        };
        store.create_order_with_items(&order).await.unwrap();
        (store, order_id)
    }

    #[tokio::test]
    async fn test_timeline_is_deterministic_over_rows() {
        let (store, order_id) = seeded_store().await;
        let now = Utc::now();

        store
            .append_event(&OrderEvent::new(order_id, OrderEventType::SagaStarted, now))
            .await
            .unwrap();
        store
            .append_event(
                &OrderEvent::new(order_id, OrderEventType::StepCompleted, now)
                    .with_step("Inventory Reservation")
                    .with_outcome("SUCCESS"),
            )
            .await
            .unwrap();
        store
            .append_event(
                &OrderEvent::new(order_id, OrderEventType::StepFailed, now)
                    .with_step("Payment Authorization")
                    .with_outcome("FAILED")
                    .with_error("PAYMENT_DECLINED", "card declined"),
            )
            .await
            .unwrap();

        let projector = HistoryProjector::new(store.clone());
        let first = projector.timeline(order_id).await.unwrap();
        let second = projector.timeline(order_id).await.unwrap();

        assert_eq!(first.entries.len(), 3);
        assert_eq!(first.entries.len(), second.entries.len());
        for (a, b) in first.entries.iter().zip(second.entries.iter()) {
            assert_eq!(a.title, b.title);
            assert_eq!(a.outcome, b.outcome);
            assert_eq!(a.timestamp, b.timestamp);
        }

        assert_eq!(first.entries[0].title, "Order received");
        assert_eq!(first.entries[1].title, "Items reserved");
        assert_eq!(first.entries[2].outcome, TimelineOutcome::Failed);

        let error = first.entries[2].error.as_ref().unwrap();
        assert_eq!(error.code, "PAYMENT_DECLINED");
        assert_eq!(error.suggested_action, "Update your payment method");
    }

    #[tokio::test]
    async fn test_entries_are_chronological() {
        let (store, order_id) = seeded_store().await;
        let base = Utc::now();

        for (offset, event_type) in [
            (0, OrderEventType::SagaStarted),
            (1, OrderEventType::StepCompleted),
            (2, OrderEventType::CompensationStarted),
            (3, OrderEventType::CompensationCompleted),
        ] {
            store
                .append_event(
                    &OrderEvent::new(
                        order_id,
                        event_type,
                        base + chrono::Duration::seconds(offset),
                    )
                    .with_outcome("SUCCESS"),
                )
                .await
                .unwrap();
        }

        let projector = HistoryProjector::new(store);
        let timeline = projector.timeline(order_id).await.unwrap();
        for pair in timeline.entries.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        assert_eq!(timeline.entries.last().unwrap().title, "Order rolled back");
    }

    #[tokio::test]
    async fn test_compensation_completed_failure_copy() {
        let (store, order_id) = seeded_store().await;
        store
            .append_event(
                &OrderEvent::new(order_id, OrderEventType::CompensationCompleted, Utc::now())
                    .with_outcome("FAILED")
                    .with_details(json!({ "allSucceeded": false })),
            )
            .await
            .unwrap();

        let projector = HistoryProjector::new(store);
        let timeline = projector.timeline(order_id).await.unwrap();
        assert_eq!(timeline.entries[0].title, "Rollback incomplete");
        assert_eq!(timeline.entries[0].outcome, TimelineOutcome::Failed);
    }
}
