//! Inventory reservation step.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{ResultValidity, SagaStep, StepFailure};
use crate::clients::InventoryClient;
use crate::context::{keys, SagaContext};
use crate::model::StepData;

/// Step 1: reserve the order's items and record the reservation id.
///
/// Compensation releases the reservation. A stored result stays valid
/// while the reservation has not lapsed, is refreshable for a day after
/// completion, and must be re-executed beyond that.
pub struct InventoryReservation {
    client: Arc<dyn InventoryClient>,
    ttl: Duration,
    refresh_window: Duration,
}

impl InventoryReservation {
    pub const NAME: &'static str = "Inventory Reservation";

    pub fn new(client: Arc<dyn InventoryClient>, ttl: Duration, refresh_window: Duration) -> Self {
        Self {
            client,
            ttl,
            refresh_window,
        }
    }
}

#[async_trait]
impl SagaStep for InventoryReservation {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn step_order(&self) -> u32 {
        1
    }

    async fn execute(&self, ctx: &SagaContext) -> Result<StepData, StepFailure> {
        let reservation = self
            .client
            .reserve(
                ctx.order.id,
                &ctx.order.items,
                &ctx.idempotency_key(Self::NAME),
            )
            .await?;

        debug!(
            order_id = %ctx.order.id,
            reservation_id = %reservation.reservation_id,
            expires_at = %reservation.expires_at,
            "inventory reserved"
        );

        let mut data = StepData::new();
        data.insert(
            keys::RESERVATION_ID.to_string(),
            reservation.reservation_id,
        );
        data.insert(
            keys::RESERVATION_EXPIRES_AT.to_string(),
            reservation.expires_at.to_rfc3339(),
        );
        Ok(data)
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepFailure> {
        let reservation_id = ctx.get(keys::RESERVATION_ID).ok_or_else(|| {
            StepFailure::new("MISSING_CONTEXT", "no reservation id recorded in context")
        })?;

        self.client
            .release(reservation_id, &ctx.idempotency_key("release-reservation"))
            .await?;

        debug!(order_id = %ctx.order.id, reservation_id, "reservation released");
        Ok(())
    }

    fn result_validity(
        &self,
        stored: &StepData,
        completed_at: DateTime<Utc>,
        _ctx: &SagaContext,
        now: DateTime<Utc>,
    ) -> ResultValidity {
        // Prefer the collaborator's own expiry; fall back to the TTL.
        let expires_at = stored
            .get(keys::RESERVATION_EXPIRES_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or(completed_at + self.ttl);

        if now < expires_at {
            ResultValidity::Valid
        } else if now - completed_at <= self.refresh_window {
            ResultValidity::Refreshable
        } else {
            ResultValidity::MustReexecute
        }
    }
}
