//! Payment authorization step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{ResultValidity, SagaStep, StepFailure};
use crate::clients::PaymentClient;
use crate::context::{keys, SagaContext};
use crate::model::StepData;

/// Step 2: authorize the order total against the customer's payment
/// method.
///
/// Compensation voids the authorization. The payment method the
/// authorization was made against is stored with the result; if a retry
/// arrives with a different method the stored authorization is unusable
/// regardless of age.
pub struct PaymentAuthorization {
    client: Arc<dyn PaymentClient>,
    ttl: Duration,
}

impl PaymentAuthorization {
    pub const NAME: &'static str = "Payment Authorization";

    pub fn new(client: Arc<dyn PaymentClient>, ttl: Duration) -> Self {
        Self { client, ttl }
    }
}

#[async_trait]
impl SagaStep for PaymentAuthorization {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn step_order(&self) -> u32 {
        2
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepData, StepFailure> {
        let authorization = self
            .client
            .authorize(
                ctx.order.id,
                &ctx.payment_method_id,
                ctx.order.total_amount_cents,
                &ctx.idempotency_key(Self::NAME),
            )
            .await?;

        debug!(
            order_id = %ctx.order.id,
            authorization_id = %authorization.authorization_id,
            amount_cents = ctx.order.total_amount_cents,
            "payment authorized"
        );

        let mut data = StepData::new();
        data.insert(
            keys::AUTHORIZATION_ID.to_string(),
            authorization.authorization_id,
        );
        data.insert(
            keys::PAYMENT_METHOD_ID.to_string(),
            ctx.payment_method_id.clone(),
        );
        Ok(data)
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepFailure> {
        let authorization_id = ctx.get(keys::AUTHORIZATION_ID).ok_or_else(|| {
            StepFailure::new("MISSING_CONTEXT", "no authorization id recorded in context")
        })?;

        self.client
            .void(authorization_id, &ctx.idempotency_key("void-authorization"))
            .await?;

        debug!(order_id = %ctx.order.id, authorization_id, "authorization voided");
        Ok(())
    }

    fn result_validity(
        &self,
        stored: &StepData,
        completed_at: DateTime<Utc>,
        ctx: &SagaContext,
        now: DateTime<Utc>,
    ) -> ResultValidity {
        let method_changed = stored
            .get(keys::PAYMENT_METHOD_ID)
            .map(|method| method != &ctx.payment_method_id)
            .unwrap_or(true);
        if method_changed {
            return ResultValidity::MustReexecute;
        }

        if now - completed_at <= self.ttl {
            ResultValidity::Valid
        } else {
            ResultValidity::MustReexecute
        }
    }

    fn required_context_keys(&self) -> &'static [&'static str] {
        &[keys::RESERVATION_ID]
    }
}
