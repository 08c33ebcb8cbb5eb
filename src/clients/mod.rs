//! Remote collaborator seams.
//!
//! The orchestrator talks to inventory, payment, and shipping through the
//! traits defined here. Callers supply an idempotency key with every
//! request; collaborators are treated as idempotent under that key, which
//! is what lets the engine promise at-least-once external effects.
//!
//! Transport faults are recovered inside the client implementations
//! (retry with backoff); only final failures surface to the step
//! executor.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{Address, OrderItem};

/// Stable collaborator error codes.
pub mod codes {
    pub const INVENTORY_UNAVAILABLE: &str = "INVENTORY_UNAVAILABLE";
    pub const PAYMENT_DECLINED: &str = "PAYMENT_DECLINED";
    pub const FRAUD_DETECTED: &str = "FRAUD_DETECTED";
    pub const INVALID_ADDRESS: &str = "INVALID_ADDRESS";
    pub const SHIPPING_UNAVAILABLE: &str = "SHIPPING_UNAVAILABLE";
    /// Transport-level fault that survived the client's own retries.
    pub const TRANSIENT: &str = "TRANSIENT";
}

/// Result type for collaborator calls.
pub type Result<T> = std::result::Result<T, CollaboratorError>;

/// Errors surfaced by collaborator clients.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    /// The collaborator answered with a domain error.
    #[error("{code}: {message}")]
    Domain { code: String, message: String },

    /// Network-level fault after the client exhausted its retries.
    #[error("transport fault: {0}")]
    Transport(String),

    /// The per-call deadline elapsed.
    #[error("call timed out after {0} seconds")]
    Timeout(u64),
}

impl CollaboratorError {
    pub fn domain(code: impl Into<String>, message: impl Into<String>) -> Self {
        CollaboratorError::Domain {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error code as recorded on step rows and events.
    pub fn code(&self) -> &str {
        match self {
            CollaboratorError::Domain { code, .. } => code,
            CollaboratorError::Transport(_) | CollaboratorError::Timeout(_) => codes::TRANSIENT,
        }
    }

    /// Whether the client's own retry loop may re-attempt the call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollaboratorError::Transport(_) | CollaboratorError::Timeout(_)
        )
    }
}

/// A confirmed inventory hold.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A confirmed payment authorization.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub authorization_id: String,
    pub captured_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A confirmed shipment arrangement.
#[derive(Debug, Clone)]
pub struct Shipment {
    pub shipment_id: String,
    pub tracking_number: String,
    pub estimated_delivery: DateTime<Utc>,
}

/// Inventory collaborator.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Reserve the order's items. Non-retryable failure:
    /// `INVENTORY_UNAVAILABLE`.
    async fn reserve(
        &self,
        order_id: Uuid,
        items: &[OrderItem],
        idempotency_key: &str,
    ) -> Result<Reservation>;

    /// Release a previously made reservation.
    async fn release(&self, reservation_id: &str, idempotency_key: &str) -> Result<()>;
}

/// Payment collaborator.
#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Authorize the order total against a payment method.
    /// Non-retryable failures: `PAYMENT_DECLINED`, `FRAUD_DETECTED`.
    async fn authorize(
        &self,
        order_id: Uuid,
        payment_method_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<Authorization>;

    /// Void a previously made authorization.
    async fn void(&self, authorization_id: &str, idempotency_key: &str) -> Result<()>;
}

/// Shipping collaborator.
#[async_trait]
pub trait ShippingClient: Send + Sync {
    /// Arrange a shipment to the given address. Non-retryable failures:
    /// `INVALID_ADDRESS`, `SHIPPING_UNAVAILABLE`.
    async fn arrange(
        &self,
        order_id: Uuid,
        address: &Address,
        items: &[OrderItem],
        idempotency_key: &str,
    ) -> Result<Shipment>;

    /// Cancel a previously arranged shipment.
    async fn cancel(&self, shipment_id: &str, idempotency_key: &str) -> Result<()>;
}

/// The full collaborator set the step registry is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub inventory: std::sync::Arc<dyn InventoryClient>,
    pub payment: std::sync::Arc<dyn PaymentClient>,
    pub shipping: std::sync::Arc<dyn ShippingClient>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let domain = CollaboratorError::domain(codes::PAYMENT_DECLINED, "card declined");
        assert_eq!(domain.code(), codes::PAYMENT_DECLINED);
        assert!(!domain.is_transient());

        let transport = CollaboratorError::Transport("connection reset".to_string());
        assert_eq!(transport.code(), codes::TRANSIENT);
        assert!(transport.is_transient());

        let timeout = CollaboratorError::Timeout(30);
        assert_eq!(timeout.code(), codes::TRANSIENT);
        assert!(timeout.is_transient());
    }
}
