//! Saga domain entities and status machines.
//!
//! These are the rows the durable store persists: orders and their items,
//! saga executions, per-step results, retry attempts, and the append-only
//! order event log. Statuses round-trip through their string form so the
//! store can persist them as TEXT columns.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque per-step output map, persisted as a JSON document.
///
/// A `BTreeMap` keeps the serialized form deterministic, which makes the
/// timeline projection a pure function of the stored rows.
pub type StepData = BTreeMap<String, String>;

/// Shipping destination for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
}

impl Address {
    /// First empty field, if any. Used by retry context validation,
    /// which refuses to substitute defaults for missing address parts.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.street.trim().is_empty() {
            return Some("street");
        }
        if self.city.trim().is_empty() {
            return Some("city");
        }
        if self.state.trim().is_empty() {
            return Some("state");
        }
        if self.postal_code.trim().is_empty() {
            return Some("postal_code");
        }
        if self.country.trim().is_empty() {
            return Some("country");
        }
        None
    }

    /// Normalized fingerprint used to detect address changes between
    /// saga attempts.
    pub fn fingerprint(&self) -> String {
        [
            &self.street,
            &self.city,
            &self.state,
            &self.postal_code,
            &self.country,
        ]
        .iter()
        .map(|part| part.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("|")
    }
}

/// Order lifecycle status.
///
/// Transitions are monotone except for `Retrying` -> `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Retrying,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Compensating => "COMPENSATING",
            OrderStatus::Compensated => "COMPENSATED",
            OrderStatus::Retrying => "RETRYING",
        }
    }

    /// Whether a retry may be attempted from this status.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrderStatus::Failed | OrderStatus::Compensated)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "COMPLETED" => Ok(OrderStatus::Completed),
            "FAILED" => Ok(OrderStatus::Failed),
            "COMPENSATING" => Ok(OrderStatus::Compensating),
            "COMPENSATED" => Ok(OrderStatus::Compensated),
            "RETRYING" => Ok(OrderStatus::Retrying),
            other => Err(ParseStatusError::new("OrderStatus", other)),
        }
    }
}

/// Saga execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::InProgress => "IN_PROGRESS",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Compensating => "COMPENSATING",
            ExecutionStatus::Compensated => "COMPENSATED",
        }
    }

    /// Terminal states admit no further transition.
    ///
    /// `Compensating` is deliberately non-terminal: a partial
    /// compensation failure parks the execution there for operator
    /// resolution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Compensated
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(ExecutionStatus::InProgress),
            "COMPLETED" => Ok(ExecutionStatus::Completed),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "COMPENSATING" => Ok(ExecutionStatus::Compensating),
            "COMPENSATED" => Ok(ExecutionStatus::Compensated),
            other => Err(ParseStatusError::new("ExecutionStatus", other)),
        }
    }
}

/// Per-step lifecycle status within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Compensated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::InProgress => "IN_PROGRESS",
            StepStatus::Completed => "COMPLETED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::Compensated => "COMPENSATED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "IN_PROGRESS" => Ok(StepStatus::InProgress),
            "COMPLETED" => Ok(StepStatus::Completed),
            "FAILED" => Ok(StepStatus::Failed),
            "SKIPPED" => Ok(StepStatus::Skipped),
            "COMPENSATED" => Ok(StepStatus::Compensated),
            other => Err(ParseStatusError::new("StepStatus", other)),
        }
    }
}

/// Outcome of a retry attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryOutcome {
    Pending,
    Success,
    Failed,
}

impl RetryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Pending => "PENDING",
            RetryOutcome::Success => "SUCCESS",
            RetryOutcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryOutcome {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RetryOutcome::Pending),
            "SUCCESS" => Ok(RetryOutcome::Success),
            "FAILED" => Ok(RetryOutcome::Failed),
            other => Err(ParseStatusError::new("RetryOutcome", other)),
        }
    }
}

/// Timeline event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEventType {
    SagaStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    CompensationStarted,
    StepCompensated,
    StepCompensationFailed,
    CompensationCompleted,
    SagaCompleted,
    SagaFailed,
}

impl OrderEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventType::SagaStarted => "SAGA_STARTED",
            OrderEventType::StepStarted => "STEP_STARTED",
            OrderEventType::StepCompleted => "STEP_COMPLETED",
            OrderEventType::StepFailed => "STEP_FAILED",
            OrderEventType::StepSkipped => "STEP_SKIPPED",
            OrderEventType::CompensationStarted => "COMPENSATION_STARTED",
            OrderEventType::StepCompensated => "STEP_COMPENSATED",
            OrderEventType::StepCompensationFailed => "STEP_COMPENSATION_FAILED",
            OrderEventType::CompensationCompleted => "COMPENSATION_COMPLETED",
            OrderEventType::SagaCompleted => "SAGA_COMPLETED",
            OrderEventType::SagaFailed => "SAGA_FAILED",
        }
    }
}

impl fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderEventType {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SAGA_STARTED" => Ok(OrderEventType::SagaStarted),
            "STEP_STARTED" => Ok(OrderEventType::StepStarted),
            "STEP_COMPLETED" => Ok(OrderEventType::StepCompleted),
            "STEP_FAILED" => Ok(OrderEventType::StepFailed),
            "STEP_SKIPPED" => Ok(OrderEventType::StepSkipped),
            "COMPENSATION_STARTED" => Ok(OrderEventType::CompensationStarted),
            "STEP_COMPENSATED" => Ok(OrderEventType::StepCompensated),
            "STEP_COMPENSATION_FAILED" => Ok(OrderEventType::StepCompensationFailed),
            "COMPENSATION_COMPLETED" => Ok(OrderEventType::CompensationCompleted),
            "SAGA_COMPLETED" => Ok(OrderEventType::SagaCompleted),
            "SAGA_FAILED" => Ok(OrderEventType::SagaFailed),
            other => Err(ParseStatusError::new("OrderEventType", other)),
        }
    }
}

/// Failed to parse a persisted status string.
#[derive(Debug, thiserror::Error)]
#[error("invalid {kind} value: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseStatusError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A customer order, the saga's subject.
///
/// The shipping address and payment method captured at submission are
/// persisted with the order so retry-context reconstruction can validate
/// against real data instead of silent defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub items: Vec<OrderItem>,
    pub total_amount_cents: i64,
    pub status: OrderStatus,
    pub payment_method_id: String,
    pub shipping_address: Address,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of an order; lifetime bound to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// One run of the saga for an order. Retries create new executions;
/// at most one per order is non-terminal at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaExecution {
    pub id: Uuid,
    pub order_id: Uuid,
    /// 0-based index of the step currently (or last) driven.
    pub current_step_index: u32,
    pub status: ExecutionStatus,
    pub failed_step_index: Option<u32>,
    pub failure_reason: Option<String>,
    pub correlation_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensation_started_at: Option<DateTime<Utc>>,
    pub compensation_completed_at: Option<DateTime<Utc>>,
}

impl SagaExecution {
    pub fn begin(order_id: Uuid, started_at: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            order_id,
            current_step_index: 0,
            status: ExecutionStatus::InProgress,
            failed_step_index: None,
            failure_reason: None,
            correlation_id: id.simple().to_string(),
            started_at,
            completed_at: None,
            compensation_started_at: None,
            compensation_completed_at: None,
        }
    }
}

/// Durable lifecycle record for one step within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStepResult {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_name: String,
    /// 1-based, dense within the execution.
    pub step_order: u32,
    pub status: StepStatus,
    pub step_data: StepData,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Record of one retry of a failed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub order_id: Uuid,
    pub original_execution_id: Uuid,
    pub retry_execution_id: Option<Uuid>,
    /// Monotonic per order, starting at 1.
    pub attempt_number: u32,
    pub resumed_from_step: Option<String>,
    pub skipped_steps: Vec<String>,
    pub outcome: RetryOutcome,
    pub failure_reason: Option<String>,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only timeline event. Rows are never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub id: Uuid,
    pub order_id: Uuid,
    pub event_type: OrderEventType,
    pub step_name: Option<String>,
    pub outcome: Option<String>,
    pub details: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderEvent {
    /// Minimal event with nothing but the discriminator.
    pub fn new(order_id: Uuid, event_type: OrderEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            event_type,
            step_name: None,
            outcome: None,
            details: None,
            error_code: None,
            error_message: None,
            timestamp,
        }
    }

    pub fn with_step(mut self, step_name: impl Into<String>) -> Self {
        self.step_name = Some(step_name.into());
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Completed,
            OrderStatus::Failed,
            OrderStatus::Compensating,
            OrderStatus::Compensated,
            OrderStatus::Retrying,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_step_status_round_trip() {
        for status in [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Compensated,
        ] {
            assert_eq!(status.as_str().parse::<StepStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        let err = "BOGUS".parse::<ExecutionStatus>().unwrap_err();
        assert_eq!(err.kind, "ExecutionStatus");
        assert_eq!(err.value, "BOGUS");
    }

    #[test]
    fn test_execution_terminality() {
        assert!(!ExecutionStatus::InProgress.is_terminal());
        assert!(!ExecutionStatus::Compensating.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Compensated.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_address_missing_field() {
        let mut address = Address {
            street: "123 Main St".to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            postal_code: "62701".to_string(),
            country: "US".to_string(),
        };
        assert_eq!(address.missing_field(), None);

        address.postal_code = "  ".to_string();
        assert_eq!(address.missing_field(), Some("postal_code"));
    }

    #[test]
    fn test_address_fingerprint_normalizes() {
        let a = Address {
            street: " 123 Main St".to_string(),
            city: "Springfield".to_string(),
            state: "il".to_string(),
            postal_code: "62701".to_string(),
            country: "US".to_string(),
        };
        let b = Address {
            street: "123 MAIN ST".to_string(),
            city: "springfield".to_string(),
            state: "IL".to_string(),
            postal_code: "62701".to_string(),
            country: "us".to_string(),
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
