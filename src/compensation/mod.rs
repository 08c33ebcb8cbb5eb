//! Compensation sweep for failed sagas.
//!
//! Drives the completed-steps prefix in reverse order, invoking each
//! step's paired compensation. A failed compensation is recorded and the
//! sweep continues; the engine never abandons remaining compensations
//! because one refused. A second invocation against an
//! already-compensated execution is a no-op that performs zero
//! collaborator calls.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::SagaContext;
use crate::model::{ExecutionStatus, OrderEvent, OrderEventType, OrderStatus};
use crate::progress::ProgressBus;
use crate::steps::SagaStep;
use crate::store::{Result, SagaStore};

/// Everything the sweep needs, passed across the orchestrator boundary
/// as a plain record so neither component owns the other.
pub struct CompensationRequest {
    pub execution_id: Uuid,
    pub failed_step: String,
    pub failure_reason: String,
    /// Completed steps in execution order; the sweep reverses them.
    pub completed: Vec<CompletedStep>,
}

/// A completed step paired with its durable row.
pub struct CompletedStep {
    pub step: Arc<dyn SagaStep>,
    pub step_result_id: Uuid,
}

/// One compensation that did not go through.
#[derive(Debug, Clone)]
pub struct FailedCompensation {
    pub step_name: String,
    pub message: String,
}

/// Result of a compensation sweep.
#[derive(Debug, Clone)]
pub struct CompensationSummary {
    pub compensated_steps: Vec<String>,
    pub failed_compensations: Vec<FailedCompensation>,
    pub all_succeeded: bool,
    /// True when the execution was already compensated and nothing ran.
    pub already_compensated: bool,
}

/// Drives reverse-order compensation for one execution.
pub struct CompensationOrchestrator {
    store: Arc<dyn SagaStore>,
    bus: Arc<ProgressBus>,
}

impl CompensationOrchestrator {
    pub fn new(store: Arc<dyn SagaStore>, bus: Arc<ProgressBus>) -> Self {
        Self { store, bus }
    }

    pub async fn compensate(
        &self,
        ctx: &SagaContext,
        request: CompensationRequest,
    ) -> Result<CompensationSummary> {
        if let Some(execution) = self.store.get_execution(request.execution_id).await? {
            if execution.status == ExecutionStatus::Compensated {
                info!(
                    order_id = %ctx.order.id,
                    execution_id = %request.execution_id,
                    "compensation already completed, nothing to do"
                );
                return Ok(CompensationSummary {
                    compensated_steps: Vec::new(),
                    failed_compensations: Vec::new(),
                    all_succeeded: true,
                    already_compensated: true,
                });
            }
        }

        let now = Utc::now();
        self.store
            .mark_compensation_started(request.execution_id, now)
            .await?;
        self.store
            .update_order_status(ctx.order.id, OrderStatus::Compensating, now)
            .await?;

        let steps_to_compensate: Vec<&str> = request
            .completed
            .iter()
            .rev()
            .map(|completed| completed.step.name())
            .collect();

        let started_event =
            OrderEvent::new(ctx.order.id, OrderEventType::CompensationStarted, now)
                .with_step(request.failed_step.clone())
                .with_details(json!({
                    "stepsToCompensate": steps_to_compensate,
                    "failureReason": request.failure_reason,
                }));
        self.store.append_event(&started_event).await?;
        self.bus.publish(&started_event);

        info!(
            order_id = %ctx.order.id,
            failed_step = %request.failed_step,
            steps = steps_to_compensate.len(),
            "compensation started"
        );

        let mut compensated_steps = Vec::new();
        let mut failed_compensations = Vec::new();

        for completed in request.completed.iter().rev() {
            let step_name = completed.step.name();
            match completed.step.compensate(ctx).await {
                Ok(()) => {
                    self.store
                        .mark_step_compensated(completed.step_result_id, Utc::now())
                        .await?;
                    compensated_steps.push(step_name.to_string());

                    self.bus.publish(
                        &OrderEvent::new(
                            ctx.order.id,
                            OrderEventType::StepCompensated,
                            Utc::now(),
                        )
                        .with_step(step_name)
                        .with_outcome("COMPENSATED"),
                    );
                    info!(order_id = %ctx.order.id, step = %step_name, "step compensated");
                }
                Err(failure) => {
                    // Record and keep sweeping; the remaining steps still
                    // deserve their compensation attempt.
                    let message = failure.to_string();
                    self.store
                        .record_compensation_failure(completed.step_result_id, &message)
                        .await?;
                    failed_compensations.push(FailedCompensation {
                        step_name: step_name.to_string(),
                        message: message.clone(),
                    });

                    self.bus.publish(
                        &OrderEvent::new(
                            ctx.order.id,
                            OrderEventType::StepCompensationFailed,
                            Utc::now(),
                        )
                        .with_step(step_name)
                        .with_outcome("FAILED")
                        .with_error(failure.code.clone(), failure.message.clone()),
                    );
                    error!(
                        order_id = %ctx.order.id,
                        step = %step_name,
                        error = %message,
                        "step compensation failed"
                    );
                }
            }
        }

        let all_succeeded = failed_compensations.is_empty();
        let completed_at = Utc::now();

        let completed_event = OrderEvent::new(
            ctx.order.id,
            OrderEventType::CompensationCompleted,
            completed_at,
        )
        .with_outcome(if all_succeeded { "SUCCESS" } else { "FAILED" })
        .with_details(json!({
            "compensatedSteps": compensated_steps,
            "failedCompensations": failed_compensations
                .iter()
                .map(|failed| json!({ "step": failed.step_name, "message": failed.message }))
                .collect::<Vec<_>>(),
            "allSucceeded": all_succeeded,
        }));
        self.store.append_event(&completed_event).await?;
        self.bus.publish(&completed_event);

        if all_succeeded {
            self.store
                .mark_execution_compensated(request.execution_id, completed_at)
                .await?;
            self.store
                .update_order_status(ctx.order.id, OrderStatus::Compensated, completed_at)
                .await?;
            info!(
                order_id = %ctx.order.id,
                compensated = compensated_steps.len(),
                "compensation completed"
            );
        } else {
            // Residue for operator action: the order is FAILED and the
            // execution stays COMPENSATING with per-step messages.
            self.store
                .update_order_status(ctx.order.id, OrderStatus::Failed, completed_at)
                .await?;
            warn!(
                order_id = %ctx.order.id,
                compensated = compensated_steps.len(),
                failed = failed_compensations.len(),
                "compensation incomplete, order left FAILED"
            );
        }

        Ok(CompensationSummary {
            compensated_steps,
            failed_compensations,
            all_succeeded,
            already_compensated: false,
        })
    }
}

#[cfg(test)]
mod tests;
