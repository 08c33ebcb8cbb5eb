//! Scripted in-memory collaborators for tests.
//!
//! Behavior is keyed off request content so integration tests can drive
//! every saga path without a wire: a nil product id is unavailable
//! inventory, `declined-card` / `fraud-card` fail authorization, and
//! postal code `00000` is an invalid shipping address. Every mutating
//! call is recorded so tests can assert the no-partial-charges property.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use super::{
    codes, Authorization, CollaboratorError, Collaborators, InventoryClient, PaymentClient,
    Reservation, Result, Shipment, ShippingClient,
};
use crate::model::{Address, OrderItem};

/// Payment method that always declines.
pub const DECLINED_CARD: &str = "declined-card";
/// Payment method flagged by fraud screening.
pub const FRAUD_CARD: &str = "fraud-card";
/// Postal code rejected by the shipping collaborator.
pub const UNDELIVERABLE_POSTAL_CODE: &str = "00000";

/// In-memory inventory collaborator.
#[derive(Default)]
pub struct MockInventoryClient {
    counter: AtomicU64,
    state: Mutex<InventoryState>,
}

#[derive(Default)]
struct InventoryState {
    reserved: Vec<String>,
    released: Vec<String>,
    reserve_calls: u64,
    release_calls: u64,
}

impl MockInventoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reservation ids that were never released.
    pub fn open_reservations(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .reserved
            .iter()
            .filter(|id| !state.released.contains(id))
            .cloned()
            .collect()
    }

    pub fn released(&self) -> Vec<String> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn reserve_calls(&self) -> u64 {
        self.state.lock().unwrap().reserve_calls
    }

    pub fn release_calls(&self) -> u64 {
        self.state.lock().unwrap().release_calls
    }
}

#[async_trait]
impl InventoryClient for MockInventoryClient {
    async fn reserve(
        &self,
        _order_id: Uuid,
        items: &[OrderItem],
        _idempotency_key: &str,
    ) -> Result<Reservation> {
        let mut state = self.state.lock().unwrap();
        state.reserve_calls += 1;

        if let Some(unavailable) = items.iter().find(|item| item.product_id.is_nil()) {
            return Err(CollaboratorError::domain(
                codes::INVENTORY_UNAVAILABLE,
                format!("product {} is out of stock", unavailable.product_name),
            ));
        }

        let reservation_id = format!("rsv-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        state.reserved.push(reservation_id.clone());
        Ok(Reservation {
            reservation_id,
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn release(&self, reservation_id: &str, _idempotency_key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.release_calls += 1;
        // Releasing twice (or releasing an unknown id) is a no-op; the
        // collaborator contract is idempotent.
        if !state.released.iter().any(|id| id == reservation_id) {
            state.released.push(reservation_id.to_string());
        }
        Ok(())
    }
}

/// In-memory payment collaborator.
#[derive(Default)]
pub struct MockPaymentClient {
    counter: AtomicU64,
    state: Mutex<PaymentState>,
}

#[derive(Default)]
struct PaymentState {
    authorized: Vec<String>,
    voided: Vec<String>,
    authorize_calls: u64,
    void_calls: u64,
}

impl MockPaymentClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorization ids that were never voided.
    pub fn open_authorizations(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .authorized
            .iter()
            .filter(|id| !state.voided.contains(id))
            .cloned()
            .collect()
    }

    pub fn voided(&self) -> Vec<String> {
        self.state.lock().unwrap().voided.clone()
    }

    pub fn authorize_calls(&self) -> u64 {
        self.state.lock().unwrap().authorize_calls
    }

    pub fn void_calls(&self) -> u64 {
        self.state.lock().unwrap().void_calls
    }
}

#[async_trait]
impl PaymentClient for MockPaymentClient {
    async fn authorize(
        &self,
        _order_id: Uuid,
        payment_method_id: &str,
        amount_cents: i64,
        _idempotency_key: &str,
    ) -> Result<Authorization> {
        let mut state = self.state.lock().unwrap();
        state.authorize_calls += 1;

        match payment_method_id {
            DECLINED_CARD => Err(CollaboratorError::domain(
                codes::PAYMENT_DECLINED,
                format!("payment method declined for {amount_cents} cents"),
            )),
            FRAUD_CARD => Err(CollaboratorError::domain(
                codes::FRAUD_DETECTED,
                "authorization blocked by fraud screening",
            )),
            _ => {
                let authorization_id =
                    format!("auth-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
                state.authorized.push(authorization_id.clone());
                let now = Utc::now();
                Ok(Authorization {
                    authorization_id,
                    captured_at: now,
                    expires_at: now + Duration::hours(24),
                })
            }
        }
    }

    async fn void(&self, authorization_id: &str, _idempotency_key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.void_calls += 1;
        if !state.voided.iter().any(|id| id == authorization_id) {
            state.voided.push(authorization_id.to_string());
        }
        Ok(())
    }
}

/// In-memory shipping collaborator.
#[derive(Default)]
pub struct MockShippingClient {
    counter: AtomicU64,
    state: Mutex<ShippingState>,
}

#[derive(Default)]
struct ShippingState {
    arranged: Vec<String>,
    cancelled: Vec<String>,
    arrange_calls: u64,
    cancel_calls: u64,
}

impl MockShippingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shipment ids that were never cancelled.
    pub fn open_shipments(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .arranged
            .iter()
            .filter(|id| !state.cancelled.contains(id))
            .cloned()
            .collect()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn arrange_calls(&self) -> u64 {
        self.state.lock().unwrap().arrange_calls
    }

    pub fn cancel_calls(&self) -> u64 {
        self.state.lock().unwrap().cancel_calls
    }
}

#[async_trait]
impl ShippingClient for MockShippingClient {
    async fn arrange(
        &self,
        _order_id: Uuid,
        address: &Address,
        _items: &[OrderItem],
        _idempotency_key: &str,
    ) -> Result<Shipment> {
        let mut state = self.state.lock().unwrap();
        state.arrange_calls += 1;

        if address.postal_code == UNDELIVERABLE_POSTAL_CODE {
            return Err(CollaboratorError::domain(
                codes::INVALID_ADDRESS,
                format!("no carrier delivers to postal code {}", address.postal_code),
            ));
        }

        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let shipment_id = format!("shp-{sequence}");
        state.arranged.push(shipment_id.clone());
        Ok(Shipment {
            shipment_id,
            tracking_number: format!("TRK-{sequence:08}"),
            estimated_delivery: Utc::now() + Duration::days(5),
        })
    }

    async fn cancel(&self, shipment_id: &str, _idempotency_key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancel_calls += 1;
        if !state.cancelled.iter().any(|id| id == shipment_id) {
            state.cancelled.push(shipment_id.to_string());
        }
        Ok(())
    }
}

/// Bundle of mock collaborators with handles retained for assertions.
#[derive(Clone)]
pub struct MockCollaborators {
    pub inventory: Arc<MockInventoryClient>,
    pub payment: Arc<MockPaymentClient>,
    pub shipping: Arc<MockShippingClient>,
}

impl MockCollaborators {
    pub fn new() -> Self {
        Self {
            inventory: Arc::new(MockInventoryClient::new()),
            payment: Arc::new(MockPaymentClient::new()),
            shipping: Arc::new(MockShippingClient::new()),
        }
    }

    /// The trait-object set the registry is wired with.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            inventory: self.inventory.clone(),
            payment: self.payment.clone(),
            shipping: self.shipping.clone(),
        }
    }
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: Uuid) -> OrderItem {
        OrderItem {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            product_id,
            product_name: "Widget".to_string(),
            quantity: 2,
            unit_price_cents: 2_999,
        }
    }

    #[tokio::test]
    async fn test_reserve_and_release_round_trip() {
        let inventory = MockInventoryClient::new();
        let reservation = inventory
            .reserve(Uuid::new_v4(), &[item(Uuid::new_v4())], "key")
            .await
            .unwrap();

        assert_eq!(inventory.open_reservations().len(), 1);
        inventory
            .release(&reservation.reservation_id, "key")
            .await
            .unwrap();
        assert!(inventory.open_reservations().is_empty());

        // Idempotent: releasing again records no duplicate.
        inventory
            .release(&reservation.reservation_id, "key")
            .await
            .unwrap();
        assert_eq!(inventory.released().len(), 1);
    }

    #[tokio::test]
    async fn test_nil_product_is_unavailable() {
        let inventory = MockInventoryClient::new();
        let err = inventory
            .reserve(Uuid::new_v4(), &[item(Uuid::nil())], "key")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVENTORY_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_declined_and_fraud_cards() {
        let payment = MockPaymentClient::new();
        let declined = payment
            .authorize(Uuid::new_v4(), DECLINED_CARD, 5_998, "key")
            .await
            .unwrap_err();
        assert_eq!(declined.code(), codes::PAYMENT_DECLINED);

        let fraud = payment
            .authorize(Uuid::new_v4(), FRAUD_CARD, 5_998, "key")
            .await
            .unwrap_err();
        assert_eq!(fraud.code(), codes::FRAUD_DETECTED);
        assert!(payment.open_authorizations().is_empty());
    }

    #[tokio::test]
    async fn test_undeliverable_postal_code() {
        let shipping = MockShippingClient::new();
        let address = Address {
            street: "123 Main St".to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            postal_code: UNDELIVERABLE_POSTAL_CODE.to_string(),
            country: "US".to_string(),
        };
        let err = shipping
            .arrange(Uuid::new_v4(), &address, &[], "key")
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_ADDRESS);
    }
}
