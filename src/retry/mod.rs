//! Retry planning and execution.
//!
//! A failed order may be retried from the failed step: completed steps
//! whose external side effects still hold are skipped, everything from
//! the resume point onward is re-executed. Eligibility is enforced
//! entirely from persisted rows; there is no in-memory rate-limit
//! state.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::context::{keys, SagaContext};
use crate::model::{
    Address, Order, RetryAttempt, RetryOutcome, SagaExecution, StepData, StepStatus,
};
use crate::orchestrator::{OrchestratorError, SagaOrchestrator, SagaResult};
use crate::steps::{ResultValidity, StepRegistry};
use crate::store::{SagaStore, StoreError};

/// Result type for retry operations.
pub type Result<T> = std::result::Result<T, RetryError>;

/// Errors raised by retry planning and execution.
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("orchestration error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// The retry request cannot produce a usable context. Raised before
    /// any execution or attempt row is written.
    #[error("invalid retry context: {field}: {reason}")]
    ContextValidation { field: String, reason: String },
}

/// Action the customer must take before the retry can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAction {
    UpdatePaymentMethod,
    VerifyAddress,
    ConfirmItemAvailability,
}

impl RequiredAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequiredAction::UpdatePaymentMethod => "UPDATE_PAYMENT_METHOD",
            RequiredAction::VerifyAddress => "VERIFY_ADDRESS",
            RequiredAction::ConfirmItemAvailability => "CONFIRM_ITEM_AVAILABILITY",
        }
    }
}

/// Why a retry is currently denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockerKind {
    OrderNotFound,
    OrderNotRetryable,
    NoPriorExecution,
    RetryInProgress,
    NonRetryableFailure,
    AttemptsExhausted,
    CooldownActive,
    WindowExpired,
}

/// One reason the retry is blocked; `resolvable` says whether waiting
/// or acting can clear it.
#[derive(Debug, Clone)]
pub struct Blocker {
    pub kind: BlockerKind,
    pub resolvable: bool,
    pub detail: String,
}

/// Outcome of an eligibility check.
#[derive(Debug, Clone)]
pub enum Eligibility {
    Eligible {
        attempts_remaining: u32,
        required_actions: Vec<RequiredAction>,
        expires_at: DateTime<Utc>,
    },
    NotEligible {
        reason: String,
        blockers: Vec<Blocker>,
    },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible { .. })
    }
}

/// Where a retry resumes and what it skips.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    /// 0-based index of the first step to re-execute.
    pub resume_step_index: u32,
    /// Name of the resume step; `None` when every step is still valid.
    pub resume_step_name: Option<String>,
    pub skipped_steps: Vec<String>,
    pub steps_to_reexecute: Vec<String>,
}

/// Customer-supplied corrections for a retry.
#[derive(Debug, Clone, Default)]
pub struct RetryRequest {
    pub updated_payment_method_id: Option<String>,
    pub updated_shipping_address: Option<Address>,
    pub acknowledged_changes: Vec<String>,
}

/// Result of `retry_order`.
#[derive(Debug)]
pub enum SagaRetryResult {
    /// A retry execution ran; its saga result is inside.
    Executed {
        attempt_number: u32,
        result: SagaResult,
    },
    /// The order is not eligible; nothing was written.
    NotEligible {
        reason: String,
        blockers: Vec<Blocker>,
    },
}

/// Completed step data merged across an order's execution chain.
type CompletedChain = HashMap<String, (StepData, DateTime<Utc>)>;

/// Plans and drives retries of failed orders.
pub struct RetryPlanner {
    store: Arc<dyn SagaStore>,
    registry: Arc<StepRegistry>,
    orchestrator: Arc<SagaOrchestrator>,
    policy: RetryPolicy,
    non_retryable_tokens: Vec<String>,
}

impl RetryPlanner {
    pub fn new(
        store: Arc<dyn SagaStore>,
        registry: Arc<StepRegistry>,
        orchestrator: Arc<SagaOrchestrator>,
        policy: RetryPolicy,
        non_retryable_tokens: Vec<String>,
    ) -> Self {
        Self {
            store,
            registry,
            orchestrator,
            policy,
            non_retryable_tokens,
        }
    }

    /// Check whether an order may be retried right now.
    pub async fn check_eligibility(&self, order_id: Uuid) -> Result<Eligibility> {
        self.eligibility_at(order_id, Utc::now()).await
    }

    async fn eligibility_at(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<Eligibility> {
        let Some(order) = self.store.get_order(order_id).await? else {
            return Ok(Eligibility::NotEligible {
                reason: format!("order {order_id} not found"),
                blockers: vec![Blocker {
                    kind: BlockerKind::OrderNotFound,
                    resolvable: false,
                    detail: order_id.to_string(),
                }],
            });
        };

        let mut blockers = Vec::new();

        if !order.status.is_retryable() {
            blockers.push(Blocker {
                kind: BlockerKind::OrderNotRetryable,
                resolvable: false,
                detail: format!("order status is {}", order.status),
            });
        }

        let latest = self.store.latest_execution(order_id).await?;
        if latest.is_none() {
            blockers.push(Blocker {
                kind: BlockerKind::NoPriorExecution,
                resolvable: false,
                detail: "no execution has ever run for this order".to_string(),
            });
        }

        let attempts = self.store.retry_attempts(order_id).await?;
        if attempts
            .iter()
            .any(|attempt| attempt.outcome == RetryOutcome::Pending)
        {
            blockers.push(Blocker {
                kind: BlockerKind::RetryInProgress,
                resolvable: true,
                detail: "a retry attempt is already pending".to_string(),
            });
        }

        let failure_reason = latest
            .as_ref()
            .and_then(|execution| execution.failure_reason.clone())
            .unwrap_or_default();
        if let Some(token) = self.matched_non_retryable_token(&failure_reason) {
            blockers.push(Blocker {
                kind: BlockerKind::NonRetryableFailure,
                resolvable: false,
                detail: token,
            });
        }

        if attempts.len() as u32 >= self.policy.max_attempts {
            blockers.push(Blocker {
                kind: BlockerKind::AttemptsExhausted,
                resolvable: false,
                detail: format!("{} attempts used", attempts.len()),
            });
        }

        if let Some(last) = attempts.last() {
            let ready_at = last.initiated_at + self.policy.cooldown();
            if now < ready_at {
                blockers.push(Blocker {
                    kind: BlockerKind::CooldownActive,
                    resolvable: true,
                    detail: format!(
                        "next attempt allowed in {} seconds",
                        (ready_at - now).num_seconds().max(0)
                    ),
                });
            }
        }

        let expires_at = order.created_at + self.policy.window();
        if now > expires_at {
            blockers.push(Blocker {
                kind: BlockerKind::WindowExpired,
                resolvable: false,
                detail: format!("retry window closed at {expires_at}"),
            });
        }

        if let Some(first) = blockers.first() {
            return Ok(Eligibility::NotEligible {
                reason: first.detail.clone(),
                blockers,
            });
        }

        Ok(Eligibility::Eligible {
            attempts_remaining: self.policy.max_attempts - attempts.len() as u32,
            required_actions: required_actions_for(&failure_reason),
            expires_at,
        })
    }

    fn matched_non_retryable_token(&self, failure_reason: &str) -> Option<String> {
        let upper = failure_reason.to_uppercase();
        self.non_retryable_tokens
            .iter()
            .find(|token| upper.contains(&token.to_uppercase()))
            .cloned()
    }

    /// Completed step rows merged across the order's execution chain,
    /// newest completion winning.
    ///
    /// Only COMPLETED rows participate: a compensated step's side effect
    /// was reversed, so its stored result can never justify a skip.
    async fn completed_chain(&self, order_id: Uuid) -> Result<CompletedChain> {
        let mut chain = CompletedChain::new();
        for execution in self.store.executions(order_id).await? {
            for row in self.store.step_results(execution.id).await? {
                if row.status == StepStatus::Completed {
                    if let Some(completed_at) = row.completed_at {
                        chain.insert(row.step_name, (row.step_data, completed_at));
                    }
                }
            }
        }
        Ok(chain)
    }

    /// Decide the resume point: skip while stored results classify as
    /// Valid, resume at the first step that does not.
    fn plan_resume(&self, ctx: &SagaContext, chain: &CompletedChain, now: DateTime<Utc>) -> ResumePlan {
        let steps = self.registry.ordered_steps();
        let mut skipped_steps = Vec::new();
        let mut resume_step_index = steps.len() as u32;
        let mut resume_step_name = None;

        for (index, step) in steps.iter().enumerate() {
            let Some((stored, completed_at)) = chain.get(step.name()) else {
                resume_step_index = index as u32;
                resume_step_name = Some(step.name().to_string());
                break;
            };
            match step.result_validity(stored, *completed_at, ctx, now) {
                ResultValidity::Valid => {
                    skipped_steps.push(step.name().to_string());
                }
                ResultValidity::Refreshable | ResultValidity::MustReexecute => {
                    resume_step_index = index as u32;
                    resume_step_name = Some(step.name().to_string());
                    break;
                }
            }
        }

        // Everything from the resume point onward re-executes; its
        // inputs may have changed.
        let steps_to_reexecute = steps
            .iter()
            .skip(resume_step_index as usize)
            .map(|step| step.name().to_string())
            .collect();

        ResumePlan {
            resume_step_index,
            resume_step_name,
            skipped_steps,
            steps_to_reexecute,
        }
    }

    /// Rebuild the saga context for a retry execution.
    ///
    /// Known identifier keys are re-imported from the completed chain;
    /// the effective address and payment method are validated with no
    /// silent defaults.
    fn build_context(
        &self,
        order: &Order,
        execution: &SagaExecution,
        request: &RetryRequest,
        chain: &CompletedChain,
    ) -> Result<SagaContext> {
        let payment_method_id = request
            .updated_payment_method_id
            .clone()
            .filter(|method| !method.trim().is_empty())
            .or_else(|| {
                Some(order.payment_method_id.clone())
                    .filter(|method| !method.trim().is_empty())
            })
            .or_else(|| self.policy.default_payment_method.clone())
            .ok_or_else(|| RetryError::ContextValidation {
                field: "payment_method_id".to_string(),
                reason: "no payment method available for retry".to_string(),
            })?;

        let shipping_address = request
            .updated_shipping_address
            .clone()
            .unwrap_or_else(|| order.shipping_address.clone());
        if let Some(field) = shipping_address.missing_field() {
            return Err(RetryError::ContextValidation {
                field: format!("shipping_address.{field}"),
                reason: "must not be empty".to_string(),
            });
        }

        let mut order = order.clone();
        order.payment_method_id = payment_method_id.clone();
        order.shipping_address = shipping_address.clone();

        let mut ctx = SagaContext::new(
            order,
            execution.id,
            execution.correlation_id.clone(),
            payment_method_id,
            shipping_address,
        );

        for (_, (stored, _)) in chain.iter() {
            for key in keys::IMPORTED {
                if let Some(value) = stored.get(*key) {
                    ctx.insert(*key, value.clone());
                }
            }
        }

        Ok(ctx)
    }

    /// The resume point must have its required inputs in the rebuilt
    /// context.
    fn validate_plan(&self, ctx: &SagaContext, plan: &ResumePlan) -> Result<()> {
        let Some(resume_name) = plan.resume_step_name.as_deref() else {
            return Ok(());
        };
        let Some(step) = self.registry.by_name(resume_name) else {
            return Ok(());
        };
        for key in step.required_context_keys() {
            if ctx.get(key).is_none() {
                return Err(RetryError::ContextValidation {
                    field: (*key).to_string(),
                    reason: format!("required to resume at {resume_name}"),
                });
            }
        }
        Ok(())
    }

    /// Eligibility check, context rebuild, plan, and a full retry drive.
    pub async fn execute_retry(
        &self,
        order_id: Uuid,
        request: RetryRequest,
    ) -> Result<SagaRetryResult> {
        if let Eligibility::NotEligible { reason, blockers } =
            self.check_eligibility(order_id).await?
        {
            info!(order_id = %order_id, reason = %reason, "retry not eligible");
            return Ok(SagaRetryResult::NotEligible { reason, blockers });
        }

        // Eligibility just confirmed both of these exist.
        let Some(order) = self.store.get_order(order_id).await? else {
            return Err(RetryError::Store(StoreError::OrderNotFound(order_id)));
        };
        let Some(original) = self.store.latest_execution(order_id).await? else {
            return Err(RetryError::Store(StoreError::ExecutionNotFound(order_id)));
        };

        let now = Utc::now();
        let chain = self.completed_chain(order_id).await?;
        let execution = SagaExecution::begin(order_id, now);

        // Context and plan are validated before any row is written, so
        // a bad request leaves no residue.
        let ctx = self.build_context(&order, &execution, &request, &chain)?;
        let plan = self.plan_resume(&ctx, &chain, now);
        self.validate_plan(&ctx, &plan)?;

        let attempts = self.store.retry_attempts(order_id).await?;
        let attempt_number = attempts.len() as u32 + 1;

        self.store
            .update_order_status(order_id, crate::model::OrderStatus::Retrying, now)
            .await?;
        match self.store.create_execution(&execution).await {
            Ok(()) => {}
            Err(StoreError::ExecutionAlreadyActive(_)) => {
                // Lost a race with a concurrent retry.
                warn!(order_id = %order_id, "concurrent retry detected at execution creation");
                return Ok(SagaRetryResult::NotEligible {
                    reason: "an execution is already in progress".to_string(),
                    blockers: vec![Blocker {
                        kind: BlockerKind::RetryInProgress,
                        resolvable: true,
                        detail: "an execution is already in progress".to_string(),
                    }],
                });
            }
            Err(e) => return Err(e.into()),
        }

        let mut attempt = RetryAttempt {
            id: Uuid::new_v4(),
            order_id,
            original_execution_id: original.id,
            retry_execution_id: Some(execution.id),
            attempt_number,
            resumed_from_step: plan.resume_step_name.clone(),
            skipped_steps: plan.skipped_steps.clone(),
            outcome: RetryOutcome::Pending,
            failure_reason: None,
            initiated_at: now,
            completed_at: None,
        };
        self.store.create_retry_attempt(&attempt).await?;
        self.store
            .update_order_status(order_id, crate::model::OrderStatus::Processing, now)
            .await?;

        info!(
            order_id = %order_id,
            attempt = attempt_number,
            resume_step = plan.resume_step_name.as_deref().unwrap_or("none"),
            skipped = plan.skipped_steps.len(),
            "retry execution starting"
        );

        let skip: HashSet<String> = plan.skipped_steps.iter().cloned().collect();
        let result = self.orchestrator.drive(ctx, &execution, skip).await?;

        attempt.outcome = if result.is_success() {
            RetryOutcome::Success
        } else {
            RetryOutcome::Failed
        };
        attempt.failure_reason = match &result {
            SagaResult::Success { .. } => None,
            SagaResult::Compensated { reason, .. } | SagaResult::Failure { reason, .. } => {
                Some(reason.clone())
            }
        };
        attempt.completed_at = Some(Utc::now());
        self.store.update_retry_attempt(&attempt).await?;

        Ok(SagaRetryResult::Executed {
            attempt_number,
            result,
        })
    }
}

/// Derive customer actions from a failure reason.
fn required_actions_for(failure_reason: &str) -> Vec<RequiredAction> {
    let upper = failure_reason.to_uppercase();
    let mut actions = Vec::new();
    if upper.contains("PAYMENT") || upper.contains("CARD") || upper.contains("FRAUD") {
        actions.push(RequiredAction::UpdatePaymentMethod);
    }
    if upper.contains("ADDRESS") || upper.contains("SHIPPING") {
        actions.push(RequiredAction::VerifyAddress);
    }
    if upper.contains("INVENTORY") || upper.contains("STOCK") {
        actions.push(RequiredAction::ConfirmItemAvailability);
    }
    actions
}
