//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building, plus the DDL the SQLite store runs at startup. Timestamps
//! are stored as fixed-width RFC 3339 TEXT so lexical order matches
//! chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::Iden;

/// Orders table schema.
#[derive(Iden)]
pub enum Orders {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "total_amount_cents"]
    TotalAmountCents,
    #[iden = "status"]
    Status,
    #[iden = "payment_method_id"]
    PaymentMethodId,
    #[iden = "shipping_address"]
    ShippingAddress,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Order items table schema.
#[derive(Iden)]
pub enum OrderItems {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "order_id"]
    OrderId,
    #[iden = "product_id"]
    ProductId,
    #[iden = "product_name"]
    ProductName,
    #[iden = "quantity"]
    Quantity,
    #[iden = "unit_price_cents"]
    UnitPriceCents,
}

/// Saga executions table schema.
#[derive(Iden)]
pub enum SagaExecutions {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "order_id"]
    OrderId,
    #[iden = "current_step_index"]
    CurrentStepIndex,
    #[iden = "status"]
    Status,
    #[iden = "failed_step_index"]
    FailedStepIndex,
    #[iden = "failure_reason"]
    FailureReason,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "started_at"]
    StartedAt,
    #[iden = "completed_at"]
    CompletedAt,
    #[iden = "compensation_started_at"]
    CompensationStartedAt,
    #[iden = "compensation_completed_at"]
    CompensationCompletedAt,
}

/// Saga step results table schema.
#[derive(Iden)]
pub enum SagaStepResults {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "execution_id"]
    ExecutionId,
    #[iden = "step_name"]
    StepName,
    #[iden = "step_order"]
    StepOrder,
    #[iden = "status"]
    Status,
    #[iden = "step_data"]
    StepData,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "started_at"]
    StartedAt,
    #[iden = "completed_at"]
    CompletedAt,
}

/// Order events table schema.
#[derive(Iden)]
pub enum OrderEvents {
    Table,
    #[iden = "seq"]
    Seq,
    #[iden = "id"]
    Id,
    #[iden = "order_id"]
    OrderId,
    #[iden = "event_type"]
    EventType,
    #[iden = "step_name"]
    StepName,
    #[iden = "outcome"]
    Outcome,
    #[iden = "details"]
    Details,
    #[iden = "error_code"]
    ErrorCode,
    #[iden = "error_message"]
    ErrorMessage,
    #[iden = "timestamp"]
    Timestamp,
}

/// Retry attempts table schema.
#[derive(Iden)]
pub enum RetryAttempts {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "order_id"]
    OrderId,
    #[iden = "original_execution_id"]
    OriginalExecutionId,
    #[iden = "retry_execution_id"]
    RetryExecutionId,
    #[iden = "attempt_number"]
    AttemptNumber,
    #[iden = "resumed_from_step"]
    ResumedFromStep,
    #[iden = "skipped_steps"]
    SkippedSteps,
    #[iden = "outcome"]
    Outcome,
    #[iden = "failure_reason"]
    FailureReason,
    #[iden = "initiated_at"]
    InitiatedAt,
    #[iden = "completed_at"]
    CompletedAt,
}

/// SQL for creating the orders table.
pub const CREATE_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    total_amount_cents INTEGER NOT NULL,
    status TEXT NOT NULL,
    payment_method_id TEXT NOT NULL,
    shipping_address TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// SQL for creating the order items table.
pub const CREATE_ORDER_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS order_items (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    product_id TEXT NOT NULL,
    product_name TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    unit_price_cents INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
"#;

/// SQL for creating the saga executions table.
pub const CREATE_SAGA_EXECUTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS saga_executions (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    current_step_index INTEGER NOT NULL,
    status TEXT NOT NULL,
    failed_step_index INTEGER,
    failure_reason TEXT,
    correlation_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    compensation_started_at TEXT,
    compensation_completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_saga_executions_order ON saga_executions(order_id, started_at);
"#;

/// SQL for creating the saga step results table.
pub const CREATE_SAGA_STEP_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS saga_step_results (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL REFERENCES saga_executions(id) ON DELETE CASCADE,
    step_name TEXT NOT NULL,
    step_order INTEGER NOT NULL,
    status TEXT NOT NULL,
    step_data TEXT NOT NULL DEFAULT '{}',
    error_message TEXT,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE (execution_id, step_name)
);

CREATE INDEX IF NOT EXISTS idx_saga_step_results_execution ON saga_step_results(execution_id, step_order);
"#;

/// SQL for creating the order events table.
///
/// `seq` gives the append-only log a total order that survives equal
/// timestamps.
pub const CREATE_ORDER_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS order_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    event_type TEXT NOT NULL,
    step_name TEXT,
    outcome TEXT,
    details TEXT,
    error_code TEXT,
    error_message TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_order_events_order ON order_events(order_id, seq);
"#;

/// SQL for creating the retry attempts table.
pub const CREATE_RETRY_ATTEMPTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS retry_attempts (
    id TEXT PRIMARY KEY,
    order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
    original_execution_id TEXT NOT NULL,
    retry_execution_id TEXT,
    attempt_number INTEGER NOT NULL,
    resumed_from_step TEXT,
    skipped_steps TEXT NOT NULL DEFAULT '[]',
    outcome TEXT NOT NULL,
    failure_reason TEXT,
    initiated_at TEXT NOT NULL,
    completed_at TEXT,
    UNIQUE (order_id, attempt_number)
);

CREATE INDEX IF NOT EXISTS idx_retry_attempts_order ON retry_attempts(order_id, attempt_number);
"#;

/// All DDL statements in dependency order.
pub const CREATE_ALL: &[&str] = &[
    CREATE_ORDERS_TABLE,
    CREATE_ORDER_ITEMS_TABLE,
    CREATE_SAGA_EXECUTIONS_TABLE,
    CREATE_SAGA_STEP_RESULTS_TABLE,
    CREATE_ORDER_EVENTS_TABLE,
    CREATE_RETRY_ATTEMPTS_TABLE,
];

/// Format a timestamp for storage. Fixed-width microseconds keep the
/// TEXT column lexically ordered.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp column.
pub fn parse_timestamp(column: &'static str, raw: &str) -> Result<DateTime<Utc>, super::StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| super::StoreError::InvalidColumn {
            column,
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let stored = format_timestamp(now);
        let parsed = parse_timestamp("created_at", &stored).unwrap();
        // Microsecond precision is retained through the round trip.
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_timestamp_lexical_order_matches_chronological() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(1);
        assert!(format_timestamp(earlier) < format_timestamp(later));
    }
}
