//! HTTP collaborator clients.
//!
//! Each call carries an `Idempotency-Key` header and a per-call deadline.
//! Transport faults are retried with exponential backoff inside the
//! client; domain errors are returned on the first definitive answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Authorization, CollaboratorError, Collaborators, InventoryClient, PaymentClient, Reservation,
    Result, Shipment, ShippingClient,
};
use crate::config::{CollaboratorEndpoints, StepTimeouts};
use crate::model::{Address, OrderItem};

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Build the HTTP collaborator set from configured endpoints.
pub fn http_collaborators(
    endpoints: &CollaboratorEndpoints,
    timeouts: &StepTimeouts,
) -> Collaborators {
    let http = reqwest::Client::new();
    let call_timeout = timeouts.call_timeout();
    Collaborators {
        inventory: Arc::new(HttpInventoryClient::new(
            http.clone(),
            endpoints.inventory_url.clone(),
            call_timeout,
        )),
        payment: Arc::new(HttpPaymentClient::new(
            http.clone(),
            endpoints.payment_url.clone(),
            call_timeout,
        )),
        shipping: Arc::new(HttpShippingClient::new(
            http,
            endpoints.shipping_url.clone(),
            call_timeout,
        )),
    }
}

/// Shared POST-with-retry plumbing for the three clients.
#[derive(Clone)]
struct HttpCollaborator {
    http: reqwest::Client,
    base_url: String,
    call_timeout: Duration,
}

/// Error body returned by collaborators on domain failures.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

impl HttpCollaborator {
    fn new(http: reqwest::Client, base_url: String, call_timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            call_timeout,
        }
    }

    /// POST once, mapping the response to a domain or transport error.
    async fn post_once<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .post(&url)
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .timeout(self.call_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| CollaboratorError::Transport(format!("malformed response: {e}")));
        }

        // A parseable error body is a definitive domain answer; anything
        // else is treated as transport-level.
        match response.json::<ErrorBody>().await {
            Ok(error) => Err(CollaboratorError::Domain {
                code: error.code,
                message: error.message,
            }),
            Err(_) => Err(CollaboratorError::Transport(format!(
                "unexpected status {status} from {url}"
            ))),
        }
    }

    /// POST with exponential backoff on transient faults.
    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: &str,
    ) -> Result<T> {
        (|| self.post_once(path, body, idempotency_key))
            .retry(ExponentialBuilder::default().with_max_times(3))
            .when(CollaboratorError::is_transient)
            .notify(|error: &CollaboratorError, delay: Duration| {
                warn!(error = %error, delay_ms = delay.as_millis() as u64, path, "retrying collaborator call");
            })
            .await
    }

    fn map_transport(&self, error: reqwest::Error) -> CollaboratorError {
        if error.is_timeout() {
            CollaboratorError::Timeout(self.call_timeout.as_secs())
        } else {
            CollaboratorError::Transport(error.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody<'a> {
    product_id: Uuid,
    product_name: &'a str,
    quantity: u32,
    unit_price_in_cents: i64,
}

fn item_bodies(items: &[OrderItem]) -> Vec<ItemBody<'_>> {
    items
        .iter()
        .map(|item| ItemBody {
            product_id: item.product_id,
            product_name: &item.product_name,
            quantity: item.quantity,
            unit_price_in_cents: item.unit_price_cents,
        })
        .collect()
}

/// Inventory service over HTTP.
pub struct HttpInventoryClient {
    inner: HttpCollaborator,
}

impl HttpInventoryClient {
    pub fn new(http: reqwest::Client, base_url: String, call_timeout: Duration) -> Self {
        Self {
            inner: HttpCollaborator::new(http, base_url, call_timeout),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveBody<'a> {
    order_id: Uuid,
    items: Vec<ItemBody<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveResponse {
    reservation_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseBody<'a> {
    reservation_id: &'a str,
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn reserve(
        &self,
        order_id: Uuid,
        items: &[OrderItem],
        idempotency_key: &str,
    ) -> Result<Reservation> {
        let body = ReserveBody {
            order_id,
            items: item_bodies(items),
        };
        let response: ReserveResponse =
            self.inner.post("/reservations", &body, idempotency_key).await?;

        debug!(order_id = %order_id, reservation_id = %response.reservation_id, "inventory reserved");
        Ok(Reservation {
            reservation_id: response.reservation_id,
            expires_at: response.expires_at,
        })
    }

    async fn release(&self, reservation_id: &str, idempotency_key: &str) -> Result<()> {
        let body = ReleaseBody { reservation_id };
        let _: serde_json::Value = self
            .inner
            .post("/reservations/release", &body, idempotency_key)
            .await?;
        Ok(())
    }
}

/// Payment service over HTTP.
pub struct HttpPaymentClient {
    inner: HttpCollaborator,
}

impl HttpPaymentClient {
    pub fn new(http: reqwest::Client, base_url: String, call_timeout: Duration) -> Self {
        Self {
            inner: HttpCollaborator::new(http, base_url, call_timeout),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeBody<'a> {
    order_id: Uuid,
    payment_method_id: &'a str,
    amount_in_cents: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    authorization_id: String,
    captured_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoidBody<'a> {
    authorization_id: &'a str,
}

#[async_trait]
impl PaymentClient for HttpPaymentClient {
    async fn authorize(
        &self,
        order_id: Uuid,
        payment_method_id: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<Authorization> {
        let body = AuthorizeBody {
            order_id,
            payment_method_id,
            amount_in_cents: amount_cents,
        };
        let response: AuthorizeResponse = self
            .inner
            .post("/authorizations", &body, idempotency_key)
            .await?;

        debug!(order_id = %order_id, authorization_id = %response.authorization_id, "payment authorized");
        Ok(Authorization {
            authorization_id: response.authorization_id,
            captured_at: response.captured_at,
            expires_at: response.expires_at,
        })
    }

    async fn void(&self, authorization_id: &str, idempotency_key: &str) -> Result<()> {
        let body = VoidBody { authorization_id };
        let _: serde_json::Value = self
            .inner
            .post("/authorizations/void", &body, idempotency_key)
            .await?;
        Ok(())
    }
}

/// Shipping service over HTTP.
pub struct HttpShippingClient {
    inner: HttpCollaborator,
}

impl HttpShippingClient {
    pub fn new(http: reqwest::Client, base_url: String, call_timeout: Duration) -> Self {
        Self {
            inner: HttpCollaborator::new(http, base_url, call_timeout),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArrangeBody<'a> {
    order_id: Uuid,
    address: &'a Address,
    items: Vec<ItemBody<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArrangeResponse {
    shipment_id: String,
    tracking_number: String,
    estimated_delivery: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody<'a> {
    shipment_id: &'a str,
}

#[async_trait]
impl ShippingClient for HttpShippingClient {
    async fn arrange(
        &self,
        order_id: Uuid,
        address: &Address,
        items: &[OrderItem],
        idempotency_key: &str,
    ) -> Result<Shipment> {
        let body = ArrangeBody {
            order_id,
            address,
            items: item_bodies(items),
        };
        let response: ArrangeResponse =
            self.inner.post("/shipments", &body, idempotency_key).await?;

        debug!(order_id = %order_id, shipment_id = %response.shipment_id, "shipment arranged");
        Ok(Shipment {
            shipment_id: response.shipment_id,
            tracking_number: response.tracking_number,
            estimated_delivery: response.estimated_delivery,
        })
    }

    async fn cancel(&self, shipment_id: &str, idempotency_key: &str) -> Result<()> {
        let body = CancelBody { shipment_id };
        let _: serde_json::Value = self
            .inner
            .post("/shipments/cancel", &body, idempotency_key)
            .await?;
        Ok(())
    }
}
