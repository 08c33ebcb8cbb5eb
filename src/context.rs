//! Per-execution saga context.
//!
//! The orchestrator owns one [`SagaContext`] for the lifetime of an
//! execution. Steps read their inputs from it and the executor merges
//! each step's outputs back into `data`, so identifiers produced early
//! (reservation, authorization) are available to later steps and to
//! compensation.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Address, Order, StepData};

/// Data keys recognized by the core.
///
/// Steps may stash additional provenance under their own keys; only the
/// keys listed in [`keys::IMPORTED`] are re-imported when a retry
/// rebuilds context from persisted step rows.
pub mod keys {
    pub const RESERVATION_ID: &str = "RESERVATION_ID";
    pub const AUTHORIZATION_ID: &str = "AUTHORIZATION_ID";
    pub const SHIPMENT_ID: &str = "SHIPMENT_ID";
    pub const TRACKING_NUMBER: &str = "TRACKING_NUMBER";
    pub const ESTIMATED_DELIVERY: &str = "ESTIMATED_DELIVERY";

    /// Provenance: when the reservation lapses, stored by the inventory
    /// step for validity classification.
    pub const RESERVATION_EXPIRES_AT: &str = "RESERVATION_EXPIRES_AT";
    /// Provenance: payment method the authorization was made against.
    pub const PAYMENT_METHOD_ID: &str = "PAYMENT_METHOD_ID";
    /// Provenance: fingerprint of the address the shipment targets.
    pub const ADDRESS_FINGERPRINT: &str = "ADDRESS_FINGERPRINT";

    /// Keys re-imported from completed step rows during retry context
    /// reconstruction.
    pub const IMPORTED: &[&str] = &[
        RESERVATION_ID,
        AUTHORIZATION_ID,
        SHIPMENT_ID,
        TRACKING_NUMBER,
        ESTIMATED_DELIVERY,
    ];
}

/// Mutable state carried along the step pipeline for one execution.
#[derive(Debug, Clone)]
pub struct SagaContext {
    pub order: Order,
    pub execution_id: Uuid,
    pub correlation_id: String,
    pub customer_id: Uuid,
    pub payment_method_id: String,
    pub shipping_address: Address,
    pub data: StepData,
}

impl SagaContext {
    pub fn new(
        order: Order,
        execution_id: Uuid,
        correlation_id: String,
        payment_method_id: String,
        shipping_address: Address,
    ) -> Self {
        let customer_id = order.customer_id;
        Self {
            order,
            execution_id,
            correlation_id,
            customer_id,
            payment_method_id,
            shipping_address,
            data: StepData::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    /// Merge a step's output map into the context.
    pub fn merge(&mut self, data: &StepData) {
        for (key, value) in data {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// Timestamp value parsed out of a data key, when present and well
    /// formed.
    pub fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
    }

    /// Stable idempotency key for one step within this execution.
    ///
    /// At-least-once delivery to collaborators relies on this being
    /// identical when the same step is re-driven after a crash.
    pub fn idempotency_key(&self, step_name: &str) -> String {
        format!(
            "{}:{}:{}",
            self.order.id.simple(),
            self.execution_id.simple(),
            step_name.replace(' ', "-").to_ascii_lowercase()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderStatus, StepData};

    fn make_order() -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            items: vec![],
            total_amount_cents: 5_998,
            status: OrderStatus::Pending,
            payment_method_id: "valid-card".to_string(),
            shipping_address: Address {
                street: "123 Main St".to_string(),
                city: "Springfield".to_string(),
                state: "IL".to_string(),
                postal_code: "62701".to_string(),
                country: "US".to_string(),
            },
            created_at: now,
            updated_at: now,
        }
    }

    fn make_context() -> SagaContext {
        let order = make_order();
        let address = order.shipping_address.clone();
        SagaContext::new(
            order,
            Uuid::new_v4(),
            "corr-1".to_string(),
            "valid-card".to_string(),
            address,
        )
    }

    #[test]
    fn test_merge_overwrites_existing_keys() {
        let mut ctx = make_context();
        ctx.insert(keys::RESERVATION_ID, "rsv-old");

        let mut update = StepData::new();
        update.insert(keys::RESERVATION_ID.to_string(), "rsv-new".to_string());
        update.insert(keys::TRACKING_NUMBER.to_string(), "TRK1".to_string());
        ctx.merge(&update);

        assert_eq!(ctx.get(keys::RESERVATION_ID), Some("rsv-new"));
        assert_eq!(ctx.get(keys::TRACKING_NUMBER), Some("TRK1"));
    }

    #[test]
    fn test_get_timestamp_parses_rfc3339() {
        let mut ctx = make_context();
        ctx.insert(keys::RESERVATION_EXPIRES_AT, "2026-03-01T10:00:00Z");

        let parsed = ctx.get_timestamp(keys::RESERVATION_EXPIRES_AT).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T10:00:00+00:00");

        ctx.insert(keys::RESERVATION_EXPIRES_AT, "not a timestamp");
        assert!(ctx.get_timestamp(keys::RESERVATION_EXPIRES_AT).is_none());
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let ctx = make_context();
        let first = ctx.idempotency_key("Inventory Reservation");
        let second = ctx.idempotency_key("Inventory Reservation");
        assert_eq!(first, second);
        assert!(first.ends_with("inventory-reservation"));
    }
}
