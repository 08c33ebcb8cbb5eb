//! Shipping arrangement step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{ResultValidity, SagaStep, StepFailure};
use crate::clients::ShippingClient;
use crate::context::{keys, SagaContext};
use crate::model::StepData;

/// Step 3: create a shipment for the order and record tracking details.
///
/// Compensation cancels the shipment. A fingerprint of the destination
/// address is stored with the result; a retry that changes the address
/// invalidates the stored shipment.
pub struct ShippingArrangement {
    client: Arc<dyn ShippingClient>,
    ttl: Duration,
}

impl ShippingArrangement {
    pub const NAME: &'static str = "Shipping Arrangement";

    pub fn new(client: Arc<dyn ShippingClient>, ttl: Duration) -> Self {
        Self { client, ttl }
    }
}

#[async_trait]
impl SagaStep for ShippingArrangement {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn step_order(&self) -> u32 {
        3
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepData, StepFailure> {
        let shipment = self
            .client
            .arrange(
                ctx.order.id,
                &ctx.shipping_address,
                &ctx.order.items,
                &ctx.idempotency_key(Self::NAME),
            )
            .await?;

        debug!(
            order_id = %ctx.order.id,
            shipment_id = %shipment.shipment_id,
            tracking_number = %shipment.tracking_number,
            "shipment arranged"
        );

        let mut data = StepData::new();
        data.insert(keys::SHIPMENT_ID.to_string(), shipment.shipment_id);
        data.insert(
            keys::TRACKING_NUMBER.to_string(),
            shipment.tracking_number,
        );
        data.insert(
            keys::ESTIMATED_DELIVERY.to_string(),
            shipment.estimated_delivery.to_rfc3339(),
        );
        data.insert(
            keys::ADDRESS_FINGERPRINT.to_string(),
            ctx.shipping_address.fingerprint(),
        );
        Ok(data)
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepFailure> {
        let shipment_id = ctx.get(keys::SHIPMENT_ID).ok_or_else(|| {
            StepFailure::new("MISSING_CONTEXT", "no shipment id recorded in context")
        })?;

        self.client
            .cancel(shipment_id, &ctx.idempotency_key("cancel-shipment"))
            .await?;

        debug!(order_id = %ctx.order.id, shipment_id, "shipment cancelled");
        Ok(())
    }

    fn result_validity(
        &self,
        stored: &StepData,
        completed_at: DateTime<Utc>,
        ctx: &SagaContext,
        now: DateTime<Utc>,
    ) -> ResultValidity {
        let address_changed = stored
            .get(keys::ADDRESS_FINGERPRINT)
            .map(|fingerprint| fingerprint != &ctx.shipping_address.fingerprint())
            .unwrap_or(true);
        if address_changed {
            return ResultValidity::MustReexecute;
        }

        if now - completed_at <= self.ttl {
            ResultValidity::Valid
        } else {
            ResultValidity::MustReexecute
        }
    }

    fn required_context_keys(&self) -> &'static [&'static str] {
        &[keys::RESERVATION_ID, keys::AUTHORIZATION_ID]
    }
}
