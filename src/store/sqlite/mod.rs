//! SQLite SagaStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Order as SortOrder, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::schema::{
    format_timestamp, parse_timestamp, OrderEvents, OrderItems, Orders, RetryAttempts,
    SagaExecutions, SagaStepResults, CREATE_ALL,
};
use super::{Result, SagaStore, StoreError};
use crate::model::{
    Address, ExecutionStatus, Order, OrderEvent, OrderEventType, OrderItem, OrderStatus,
    RetryAttempt, RetryOutcome, SagaExecution, SagaStepResult, StepData, StepStatus,
};

/// SQLite implementation of [`SagaStore`].
pub struct SqliteSagaStore {
    pool: SqlitePool,
}

impl SqliteSagaStore {
    /// Wrap an existing pool. Call [`SqliteSagaStore::init`] before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database path (`:memory:` for in-memory) and create
    /// the schema.
    pub async fn connect(database_path: &str) -> Result<Self> {
        let store = if database_path == ":memory:" {
            // An in-memory database exists per connection; a single
            // connection keeps every transaction on the same database.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?;
            Self::new(pool)
        } else {
            let pool = SqlitePool::connect(&format!("sqlite:{database_path}?mode=rwc")).await?;
            Self::new(pool)
        };
        store.init().await?;
        Ok(store)
    }

    /// Create tables and indexes.
    pub async fn init(&self) -> Result<()> {
        for ddl in CREATE_ALL {
            sqlx::raw_sql(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Open a connection with the write lock taken upfront.
    ///
    /// BEGIN IMMEDIATE prevents deadlocks when concurrent DEFERRED
    /// transactions race to upgrade from shared to exclusive.
    async fn begin_immediate(&self) -> Result<sqlx::pool::PoolConnection<sqlx::Sqlite>> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }
}

/// Commit on success, roll back on error, passing the result through.
async fn finish_tx<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}

fn opt_timestamp(
    column: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_timestamp(column, &value)).transpose()
}

fn parse_uuid(column: &'static str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| StoreError::InvalidColumn {
        column,
        value: raw.to_string(),
    })
}

fn order_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Order> {
    let id: String = row.get("id");
    let customer_id: String = row.get("customer_id");
    let status: String = row.get("status");
    let address_json: String = row.get("shipping_address");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let shipping_address: Address = serde_json::from_str(&address_json)?;

    Ok(Order {
        id: parse_uuid("id", &id)?,
        customer_id: parse_uuid("customer_id", &customer_id)?,
        items: Vec::new(),
        total_amount_cents: row.get("total_amount_cents"),
        status: status
            .parse::<OrderStatus>()
            .map_err(|e| StoreError::InvalidColumn {
                column: "status",
                value: e.value,
            })?,
        payment_method_id: row.get("payment_method_id"),
        shipping_address,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OrderItem> {
    let id: String = row.get("id");
    let order_id: String = row.get("order_id");
    let product_id: String = row.get("product_id");
    let quantity: i64 = row.get("quantity");

    Ok(OrderItem {
        id: parse_uuid("id", &id)?,
        order_id: parse_uuid("order_id", &order_id)?,
        product_id: parse_uuid("product_id", &product_id)?,
        product_name: row.get("product_name"),
        quantity: quantity as u32,
        unit_price_cents: row.get("unit_price_cents"),
    })
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SagaExecution> {
    let id: String = row.get("id");
    let order_id: String = row.get("order_id");
    let current_step_index: i64 = row.get("current_step_index");
    let status: String = row.get("status");
    let failed_step_index: Option<i64> = row.get("failed_step_index");
    let started_at: String = row.get("started_at");

    Ok(SagaExecution {
        id: parse_uuid("id", &id)?,
        order_id: parse_uuid("order_id", &order_id)?,
        current_step_index: current_step_index as u32,
        status: status
            .parse::<ExecutionStatus>()
            .map_err(|e| StoreError::InvalidColumn {
                column: "status",
                value: e.value,
            })?,
        failed_step_index: failed_step_index.map(|i| i as u32),
        failure_reason: row.get("failure_reason"),
        correlation_id: row.get("correlation_id"),
        started_at: parse_timestamp("started_at", &started_at)?,
        completed_at: opt_timestamp("completed_at", row.get("completed_at"))?,
        compensation_started_at: opt_timestamp(
            "compensation_started_at",
            row.get("compensation_started_at"),
        )?,
        compensation_completed_at: opt_timestamp(
            "compensation_completed_at",
            row.get("compensation_completed_at"),
        )?,
    })
}

fn step_result_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SagaStepResult> {
    let id: String = row.get("id");
    let execution_id: String = row.get("execution_id");
    let step_order: i64 = row.get("step_order");
    let status: String = row.get("status");
    let step_data: String = row.get("step_data");

    Ok(SagaStepResult {
        id: parse_uuid("id", &id)?,
        execution_id: parse_uuid("execution_id", &execution_id)?,
        step_name: row.get("step_name"),
        step_order: step_order as u32,
        status: status
            .parse::<StepStatus>()
            .map_err(|e| StoreError::InvalidColumn {
                column: "status",
                value: e.value,
            })?,
        step_data: serde_json::from_str::<StepData>(&step_data)?,
        error_message: row.get("error_message"),
        started_at: opt_timestamp("started_at", row.get("started_at"))?,
        completed_at: opt_timestamp("completed_at", row.get("completed_at"))?,
    })
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OrderEvent> {
    let id: String = row.get("id");
    let order_id: String = row.get("order_id");
    let event_type: String = row.get("event_type");
    let details: Option<String> = row.get("details");
    let timestamp: String = row.get("timestamp");

    Ok(OrderEvent {
        id: parse_uuid("id", &id)?,
        order_id: parse_uuid("order_id", &order_id)?,
        event_type: event_type
            .parse::<OrderEventType>()
            .map_err(|e| StoreError::InvalidColumn {
                column: "event_type",
                value: e.value,
            })?,
        step_name: row.get("step_name"),
        outcome: row.get("outcome"),
        details: details
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        error_code: row.get("error_code"),
        error_message: row.get("error_message"),
        timestamp: parse_timestamp("timestamp", &timestamp)?,
    })
}

fn attempt_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RetryAttempt> {
    let id: String = row.get("id");
    let order_id: String = row.get("order_id");
    let original_execution_id: String = row.get("original_execution_id");
    let retry_execution_id: Option<String> = row.get("retry_execution_id");
    let attempt_number: i64 = row.get("attempt_number");
    let skipped_steps: String = row.get("skipped_steps");
    let outcome: String = row.get("outcome");
    let initiated_at: String = row.get("initiated_at");

    Ok(RetryAttempt {
        id: parse_uuid("id", &id)?,
        order_id: parse_uuid("order_id", &order_id)?,
        original_execution_id: parse_uuid("original_execution_id", &original_execution_id)?,
        retry_execution_id: retry_execution_id
            .map(|raw| parse_uuid("retry_execution_id", &raw))
            .transpose()?,
        attempt_number: attempt_number as u32,
        resumed_from_step: row.get("resumed_from_step"),
        skipped_steps: serde_json::from_str(&skipped_steps)?,
        outcome: outcome
            .parse::<RetryOutcome>()
            .map_err(|e| StoreError::InvalidColumn {
                column: "outcome",
                value: e.value,
            })?,
        failure_reason: row.get("failure_reason"),
        initiated_at: parse_timestamp("initiated_at", &initiated_at)?,
        completed_at: opt_timestamp("completed_at", row.get("completed_at"))?,
    })
}

/// Non-terminal execution statuses, for the single-active check.
const ACTIVE_STATUSES: [&str; 2] = ["IN_PROGRESS", "COMPENSATING"];

#[async_trait]
impl SagaStore for SqliteSagaStore {
    async fn create_order_with_items(&self, order: &Order) -> Result<()> {
        let order_row = Query::insert()
            .into_table(Orders::Table)
            .columns([
                Orders::Id,
                Orders::CustomerId,
                Orders::TotalAmountCents,
                Orders::Status,
                Orders::PaymentMethodId,
                Orders::ShippingAddress,
                Orders::CreatedAt,
                Orders::UpdatedAt,
            ])
            .values_panic([
                order.id.to_string().into(),
                order.customer_id.to_string().into(),
                order.total_amount_cents.into(),
                order.status.as_str().into(),
                order.payment_method_id.clone().into(),
                serde_json::to_string(&order.shipping_address)?.into(),
                format_timestamp(order.created_at).into(),
                format_timestamp(order.updated_at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        let mut item_rows = Vec::with_capacity(order.items.len());
        for item in &order.items {
            item_rows.push(
                Query::insert()
                    .into_table(OrderItems::Table)
                    .columns([
                        OrderItems::Id,
                        OrderItems::OrderId,
                        OrderItems::ProductId,
                        OrderItems::ProductName,
                        OrderItems::Quantity,
                        OrderItems::UnitPriceCents,
                    ])
                    .values_panic([
                        item.id.to_string().into(),
                        item.order_id.to_string().into(),
                        item.product_id.to_string().into(),
                        item.product_name.clone().into(),
                        item.quantity.into(),
                        item.unit_price_cents.into(),
                    ])
                    .to_string(SqliteQueryBuilder),
            );
        }

        let mut conn = self.begin_immediate().await?;
        let result: Result<()> = async {
            sqlx::query(&order_row).execute(&mut *conn).await?;
            for item_row in &item_rows {
                sqlx::query(item_row).execute(&mut *conn).await?;
            }
            Ok(())
        }
        .await;
        finish_tx(&mut conn, result).await
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>> {
        let query = Query::select()
            .columns([
                Orders::Id,
                Orders::CustomerId,
                Orders::TotalAmountCents,
                Orders::Status,
                Orders::PaymentMethodId,
                Orders::ShippingAddress,
                Orders::CreatedAt,
                Orders::UpdatedAt,
            ])
            .from(Orders::Table)
            .and_where(Expr::col(Orders::Id).eq(order_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let mut order = order_from_row(&row)?;

        let items_query = Query::select()
            .columns([
                OrderItems::Id,
                OrderItems::OrderId,
                OrderItems::ProductId,
                OrderItems::ProductName,
                OrderItems::Quantity,
                OrderItems::UnitPriceCents,
            ])
            .from(OrderItems::Table)
            .and_where(Expr::col(OrderItems::OrderId).eq(order_id.to_string()))
            .order_by(OrderItems::Id, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&items_query).fetch_all(&self.pool).await?;
        order.items = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(order))
    }

    async fn update_order_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = Query::update()
            .table(Orders::Table)
            .value(Orders::Status, status.as_str())
            .value(Orders::UpdatedAt, format_timestamp(at))
            .and_where(Expr::col(Orders::Id).eq(order_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::OrderNotFound(order_id));
        }
        Ok(())
    }

    async fn create_execution(&self, execution: &SagaExecution) -> Result<()> {
        let active_query = Query::select()
            .expr(Expr::col(SagaExecutions::Id).count())
            .from(SagaExecutions::Table)
            .and_where(Expr::col(SagaExecutions::OrderId).eq(execution.order_id.to_string()))
            .and_where(Expr::col(SagaExecutions::Status).is_in(ACTIVE_STATUSES))
            .to_string(SqliteQueryBuilder);

        let insert = Query::insert()
            .into_table(SagaExecutions::Table)
            .columns([
                SagaExecutions::Id,
                SagaExecutions::OrderId,
                SagaExecutions::CurrentStepIndex,
                SagaExecutions::Status,
                SagaExecutions::FailedStepIndex,
                SagaExecutions::FailureReason,
                SagaExecutions::CorrelationId,
                SagaExecutions::StartedAt,
                SagaExecutions::CompletedAt,
                SagaExecutions::CompensationStartedAt,
                SagaExecutions::CompensationCompletedAt,
            ])
            .values_panic([
                execution.id.to_string().into(),
                execution.order_id.to_string().into(),
                execution.current_step_index.into(),
                execution.status.as_str().into(),
                execution.failed_step_index.into(),
                execution.failure_reason.clone().into(),
                execution.correlation_id.clone().into(),
                format_timestamp(execution.started_at).into(),
                execution.completed_at.map(format_timestamp).into(),
                execution
                    .compensation_started_at
                    .map(format_timestamp)
                    .into(),
                execution
                    .compensation_completed_at
                    .map(format_timestamp)
                    .into(),
            ])
            .to_string(SqliteQueryBuilder);

        let order_id = execution.order_id;
        let mut conn = self.begin_immediate().await?;
        let result: Result<()> = async {
            let row = sqlx::query(&active_query).fetch_one(&mut *conn).await?;
            let active: i64 = row.get(0);
            if active > 0 {
                return Err(StoreError::ExecutionAlreadyActive(order_id));
            }
            sqlx::query(&insert).execute(&mut *conn).await?;
            Ok(())
        }
        .await;
        finish_tx(&mut conn, result).await
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<SagaExecution>> {
        let query = Query::select()
            .column(sea_query::Asterisk)
            .from(SagaExecutions::Table)
            .and_where(Expr::col(SagaExecutions::Id).eq(execution_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn latest_execution(&self, order_id: Uuid) -> Result<Option<SagaExecution>> {
        let query = Query::select()
            .column(sea_query::Asterisk)
            .from(SagaExecutions::Table)
            .and_where(Expr::col(SagaExecutions::OrderId).eq(order_id.to_string()))
            .order_by(SagaExecutions::StartedAt, SortOrder::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn executions(&self, order_id: Uuid) -> Result<Vec<SagaExecution>> {
        let query = Query::select()
            .column(sea_query::Asterisk)
            .from(SagaExecutions::Table)
            .and_where(Expr::col(SagaExecutions::OrderId).eq(order_id.to_string()))
            .order_by(SagaExecutions::StartedAt, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn start_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<SagaStepResult> {
        let result = SagaStepResult {
            id: Uuid::new_v4(),
            execution_id,
            step_name: step_name.to_string(),
            step_order,
            status: StepStatus::InProgress,
            step_data: StepData::new(),
            error_message: None,
            started_at: Some(at),
            completed_at: None,
        };

        let insert = Query::insert()
            .into_table(SagaStepResults::Table)
            .columns([
                SagaStepResults::Id,
                SagaStepResults::ExecutionId,
                SagaStepResults::StepName,
                SagaStepResults::StepOrder,
                SagaStepResults::Status,
                SagaStepResults::StepData,
                SagaStepResults::StartedAt,
            ])
            .values_panic([
                result.id.to_string().into(),
                execution_id.to_string().into(),
                step_name.into(),
                step_order.into(),
                result.status.as_str().into(),
                "{}".into(),
                format_timestamp(at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        let advance = Query::update()
            .table(SagaExecutions::Table)
            .value(SagaExecutions::CurrentStepIndex, step_order - 1)
            .and_where(Expr::col(SagaExecutions::Id).eq(execution_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let mut conn = self.begin_immediate().await?;
        let tx_result: Result<()> = async {
            sqlx::query(&insert).execute(&mut *conn).await?;
            let updated = sqlx::query(&advance).execute(&mut *conn).await?;
            if updated.rows_affected() == 0 {
                return Err(StoreError::ExecutionNotFound(execution_id));
            }
            Ok(())
        }
        .await;
        finish_tx(&mut conn, tx_result).await?;

        Ok(result)
    }

    async fn complete_step(
        &self,
        step_result_id: Uuid,
        step_data: &StepData,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = Query::update()
            .table(SagaStepResults::Table)
            .value(SagaStepResults::Status, StepStatus::Completed.as_str())
            .value(SagaStepResults::StepData, serde_json::to_string(step_data)?)
            .value(SagaStepResults::CompletedAt, format_timestamp(at))
            .and_where(Expr::col(SagaStepResults::Id).eq(step_result_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StepResultNotFound(step_result_id));
        }
        Ok(())
    }

    async fn fail_step_and_execution(
        &self,
        step_result_id: Uuid,
        execution_id: Uuid,
        failed_step_index: u32,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let fail_step = Query::update()
            .table(SagaStepResults::Table)
            .value(SagaStepResults::Status, StepStatus::Failed.as_str())
            .value(SagaStepResults::ErrorMessage, error_message)
            .value(SagaStepResults::CompletedAt, format_timestamp(at))
            .and_where(Expr::col(SagaStepResults::Id).eq(step_result_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let fail_execution = Query::update()
            .table(SagaExecutions::Table)
            .value(SagaExecutions::Status, ExecutionStatus::Failed.as_str())
            .value(SagaExecutions::FailedStepIndex, failed_step_index)
            .value(SagaExecutions::FailureReason, error_message)
            .value(SagaExecutions::CompletedAt, format_timestamp(at))
            .and_where(Expr::col(SagaExecutions::Id).eq(execution_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let mut conn = self.begin_immediate().await?;
        let result: Result<()> = async {
            let step_rows = sqlx::query(&fail_step).execute(&mut *conn).await?;
            if step_rows.rows_affected() == 0 {
                return Err(StoreError::StepResultNotFound(step_result_id));
            }
            let execution_rows = sqlx::query(&fail_execution).execute(&mut *conn).await?;
            if execution_rows.rows_affected() == 0 {
                return Err(StoreError::ExecutionNotFound(execution_id));
            }
            Ok(())
        }
        .await;
        finish_tx(&mut conn, result).await
    }

    async fn insert_skipped_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
        step_order: u32,
        at: DateTime<Utc>,
    ) -> Result<SagaStepResult> {
        let result = SagaStepResult {
            id: Uuid::new_v4(),
            execution_id,
            step_name: step_name.to_string(),
            step_order,
            status: StepStatus::Skipped,
            step_data: StepData::new(),
            error_message: None,
            started_at: None,
            completed_at: Some(at),
        };

        let insert = Query::insert()
            .into_table(SagaStepResults::Table)
            .columns([
                SagaStepResults::Id,
                SagaStepResults::ExecutionId,
                SagaStepResults::StepName,
                SagaStepResults::StepOrder,
                SagaStepResults::Status,
                SagaStepResults::StepData,
                SagaStepResults::CompletedAt,
            ])
            .values_panic([
                result.id.to_string().into(),
                execution_id.to_string().into(),
                step_name.into(),
                step_order.into(),
                result.status.as_str().into(),
                "{}".into(),
                format_timestamp(at).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&insert).execute(&self.pool).await?;
        Ok(result)
    }

    async fn step_results(&self, execution_id: Uuid) -> Result<Vec<SagaStepResult>> {
        let query = Query::select()
            .column(sea_query::Asterisk)
            .from(SagaStepResults::Table)
            .and_where(Expr::col(SagaStepResults::ExecutionId).eq(execution_id.to_string()))
            .order_by(SagaStepResults::StepOrder, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(step_result_from_row).collect()
    }

    async fn complete_execution(&self, execution_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = Query::update()
            .table(SagaExecutions::Table)
            .value(SagaExecutions::Status, ExecutionStatus::Completed.as_str())
            .value(SagaExecutions::CompletedAt, format_timestamp(at))
            .and_where(Expr::col(SagaExecutions::Id).eq(execution_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    async fn mark_compensation_started(
        &self,
        execution_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = Query::update()
            .table(SagaExecutions::Table)
            .value(
                SagaExecutions::Status,
                ExecutionStatus::Compensating.as_str(),
            )
            .value(
                SagaExecutions::CompensationStartedAt,
                format_timestamp(at),
            )
            .and_where(Expr::col(SagaExecutions::Id).eq(execution_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    async fn mark_step_compensated(&self, step_result_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = Query::update()
            .table(SagaStepResults::Table)
            .value(SagaStepResults::Status, StepStatus::Compensated.as_str())
            .value(SagaStepResults::CompletedAt, format_timestamp(at))
            .and_where(Expr::col(SagaStepResults::Id).eq(step_result_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StepResultNotFound(step_result_id));
        }
        Ok(())
    }

    async fn record_compensation_failure(
        &self,
        step_result_id: Uuid,
        message: &str,
    ) -> Result<()> {
        let query = Query::update()
            .table(SagaStepResults::Table)
            .value(SagaStepResults::ErrorMessage, message)
            .and_where(Expr::col(SagaStepResults::Id).eq(step_result_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StepResultNotFound(step_result_id));
        }
        Ok(())
    }

    async fn mark_execution_compensated(
        &self,
        execution_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = Query::update()
            .table(SagaExecutions::Table)
            .value(
                SagaExecutions::Status,
                ExecutionStatus::Compensated.as_str(),
            )
            .value(
                SagaExecutions::CompensationCompletedAt,
                format_timestamp(at),
            )
            .and_where(Expr::col(SagaExecutions::Id).eq(execution_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    async fn append_event(&self, event: &OrderEvent) -> Result<()> {
        let max_query = Query::select()
            .expr(Expr::col(OrderEvents::Timestamp).max())
            .from(OrderEvents::Table)
            .and_where(Expr::col(OrderEvents::OrderId).eq(event.order_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let mut conn = self.begin_immediate().await?;
        let result: Result<()> = async {
            // Clamp to the order's latest event so timestamps stay
            // monotone even under clock skew.
            let row = sqlx::query(&max_query).fetch_one(&mut *conn).await?;
            let latest: Option<String> = row.get(0);
            let mut stored = format_timestamp(event.timestamp);
            if let Some(latest) = latest {
                if stored < latest {
                    stored = latest;
                }
            }

            let insert = Query::insert()
                .into_table(OrderEvents::Table)
                .columns([
                    OrderEvents::Id,
                    OrderEvents::OrderId,
                    OrderEvents::EventType,
                    OrderEvents::StepName,
                    OrderEvents::Outcome,
                    OrderEvents::Details,
                    OrderEvents::ErrorCode,
                    OrderEvents::ErrorMessage,
                    OrderEvents::Timestamp,
                ])
                .values_panic([
                    event.id.to_string().into(),
                    event.order_id.to_string().into(),
                    event.event_type.as_str().into(),
                    event.step_name.clone().into(),
                    event.outcome.clone().into(),
                    event
                        .details
                        .as_ref()
                        .map(serde_json::Value::to_string)
                        .into(),
                    event.error_code.clone().into(),
                    event.error_message.clone().into(),
                    stored.into(),
                ])
                .to_string(SqliteQueryBuilder);

            sqlx::query(&insert).execute(&mut *conn).await?;
            Ok(())
        }
        .await;
        finish_tx(&mut conn, result).await
    }

    async fn events(&self, order_id: Uuid) -> Result<Vec<OrderEvent>> {
        let query = Query::select()
            .column(sea_query::Asterisk)
            .from(OrderEvents::Table)
            .and_where(Expr::col(OrderEvents::OrderId).eq(order_id.to_string()))
            .order_by(OrderEvents::Seq, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn find_resume_state(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(SagaExecution, Vec<SagaStepResult>)>> {
        let Some(execution) = self.latest_execution(order_id).await? else {
            return Ok(None);
        };
        let results = self.step_results(execution.id).await?;
        Ok(Some((execution, results)))
    }

    async fn create_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()> {
        let pending_query = Query::select()
            .expr(Expr::col(RetryAttempts::Id).count())
            .from(RetryAttempts::Table)
            .and_where(Expr::col(RetryAttempts::OrderId).eq(attempt.order_id.to_string()))
            .and_where(Expr::col(RetryAttempts::Outcome).eq(RetryOutcome::Pending.as_str()))
            .to_string(SqliteQueryBuilder);

        let insert = Query::insert()
            .into_table(RetryAttempts::Table)
            .columns([
                RetryAttempts::Id,
                RetryAttempts::OrderId,
                RetryAttempts::OriginalExecutionId,
                RetryAttempts::RetryExecutionId,
                RetryAttempts::AttemptNumber,
                RetryAttempts::ResumedFromStep,
                RetryAttempts::SkippedSteps,
                RetryAttempts::Outcome,
                RetryAttempts::FailureReason,
                RetryAttempts::InitiatedAt,
                RetryAttempts::CompletedAt,
            ])
            .values_panic([
                attempt.id.to_string().into(),
                attempt.order_id.to_string().into(),
                attempt.original_execution_id.to_string().into(),
                attempt
                    .retry_execution_id
                    .map(|id| id.to_string())
                    .into(),
                attempt.attempt_number.into(),
                attempt.resumed_from_step.clone().into(),
                serde_json::to_string(&attempt.skipped_steps)?.into(),
                attempt.outcome.as_str().into(),
                attempt.failure_reason.clone().into(),
                format_timestamp(attempt.initiated_at).into(),
                attempt.completed_at.map(format_timestamp).into(),
            ])
            .to_string(SqliteQueryBuilder);

        let order_id = attempt.order_id;
        let mut conn = self.begin_immediate().await?;
        let result: Result<()> = async {
            let row = sqlx::query(&pending_query).fetch_one(&mut *conn).await?;
            let pending: i64 = row.get(0);
            if pending > 0 {
                return Err(StoreError::RetryAlreadyPending(order_id));
            }
            sqlx::query(&insert).execute(&mut *conn).await?;
            Ok(())
        }
        .await;
        finish_tx(&mut conn, result).await
    }

    async fn update_retry_attempt(&self, attempt: &RetryAttempt) -> Result<()> {
        let query = Query::update()
            .table(RetryAttempts::Table)
            .value(
                RetryAttempts::RetryExecutionId,
                attempt.retry_execution_id.map(|id| id.to_string()),
            )
            .value(
                RetryAttempts::ResumedFromStep,
                attempt.resumed_from_step.clone(),
            )
            .value(
                RetryAttempts::SkippedSteps,
                serde_json::to_string(&attempt.skipped_steps)?,
            )
            .value(RetryAttempts::Outcome, attempt.outcome.as_str())
            .value(RetryAttempts::FailureReason, attempt.failure_reason.clone())
            .value(
                RetryAttempts::CompletedAt,
                attempt.completed_at.map(format_timestamp),
            )
            .and_where(Expr::col(RetryAttempts::Id).eq(attempt.id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn retry_attempts(&self, order_id: Uuid) -> Result<Vec<RetryAttempt>> {
        let query = Query::select()
            .column(sea_query::Asterisk)
            .from(RetryAttempts::Table)
            .and_where(Expr::col(RetryAttempts::OrderId).eq(order_id.to_string()))
            .order_by(RetryAttempts::AttemptNumber, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(attempt_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderEventType;
    use tokio_test::assert_ok;

    fn make_order() -> Order {
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        Order {
            id: order_id,
            customer_id: Uuid::new_v4(),
            items: vec![OrderItem {
                id: Uuid::new_v4(),
                order_id,
                product_id: Uuid::new_v4(),
                product_name: "Widget".to_string(),
                quantity: 2,
                unit_price_cents: 2_999,
            }],
            total_amount_cents: 5_998,
            status: OrderStatus::Processing,
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

    async fn make_store() -> SqliteSagaStore {
        SqliteSagaStore::connect(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_order_round_trip() {
        let store = make_store().await;
        let order = make_order();
        assert_ok!(store.create_order_with_items(&order).await);

        let loaded = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, order.id);
        assert_eq!(loaded.items.len(), 1);
        assert_eq!(loaded.items[0].product_name, "Widget");
        assert_eq!(loaded.total_amount_cents, 5_998);
        assert_eq!(loaded.shipping_address, order.shipping_address);
    }

    #[tokio::test]
    async fn test_single_active_execution_enforced() {
        let store = make_store().await;
        let order = make_order();
        store.create_order_with_items(&order).await.unwrap();

        let first = SagaExecution::begin(order.id, Utc::now());
        store.create_execution(&first).await.unwrap();

        let second = SagaExecution::begin(order.id, Utc::now());
        let err = store.create_execution(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::ExecutionAlreadyActive(id) if id == order.id));

        // Once the first reaches a terminal state, a new one is allowed.
        store
            .complete_execution(first.id, Utc::now())
            .await
            .unwrap();
        store.create_execution(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_step_lifecycle_and_ordering() {
        let store = make_store().await;
        let order = make_order();
        store.create_order_with_items(&order).await.unwrap();
        let execution = SagaExecution::begin(order.id, Utc::now());
        store.create_execution(&execution).await.unwrap();

        let first = store
            .start_step(execution.id, "Inventory Reservation", 1, Utc::now())
            .await
            .unwrap();
        let mut data = StepData::new();
        data.insert("RESERVATION_ID".to_string(), "rsv-1".to_string());
        store
            .complete_step(first.id, &data, Utc::now())
            .await
            .unwrap();

        let second = store
            .start_step(execution.id, "Payment Authorization", 2, Utc::now())
            .await
            .unwrap();
        store
            .fail_step_and_execution(second.id, execution.id, 1, "PAYMENT_DECLINED: no", Utc::now())
            .await
            .unwrap();

        let results = store.step_results(execution.id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].step_order, 1);
        assert_eq!(results[0].status, StepStatus::Completed);
        assert_eq!(
            results[0].step_data.get("RESERVATION_ID").map(String::as_str),
            Some("rsv-1")
        );
        assert_eq!(results[1].status, StepStatus::Failed);

        let loaded = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.failed_step_index, Some(1));
        assert_eq!(loaded.current_step_index, 1);
    }

    #[tokio::test]
    async fn test_event_timestamps_clamped_monotone() {
        let store = make_store().await;
        let order = make_order();
        store.create_order_with_items(&order).await.unwrap();

        let now = Utc::now();
        store
            .append_event(&OrderEvent::new(order.id, OrderEventType::SagaStarted, now))
            .await
            .unwrap();
        // An event stamped in the past must not go backwards.
        store
            .append_event(&OrderEvent::new(
                order.id,
                OrderEventType::StepCompleted,
                now - chrono::Duration::seconds(30),
            ))
            .await
            .unwrap();

        let events = store.events(order.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[tokio::test]
    async fn test_pending_retry_attempt_is_exclusive() {
        let store = make_store().await;
        let order = make_order();
        store.create_order_with_items(&order).await.unwrap();
        let execution = SagaExecution::begin(order.id, Utc::now());

        let mut attempt = RetryAttempt {
            id: Uuid::new_v4(),
            order_id: order.id,
            original_execution_id: execution.id,
            retry_execution_id: None,
            attempt_number: 1,
            resumed_from_step: None,
            skipped_steps: vec![],
            outcome: RetryOutcome::Pending,
            failure_reason: None,
            initiated_at: Utc::now(),
            completed_at: None,
        };
        store.create_retry_attempt(&attempt).await.unwrap();

        let duplicate = RetryAttempt {
            id: Uuid::new_v4(),
            attempt_number: 2,
            ..attempt.clone()
        };
        let err = store.create_retry_attempt(&duplicate).await.unwrap_err();
        assert!(matches!(err, StoreError::RetryAlreadyPending(_)));

        attempt.outcome = RetryOutcome::Success;
        attempt.completed_at = Some(Utc::now());
        store.update_retry_attempt(&attempt).await.unwrap();
        store.create_retry_attempt(&duplicate).await.unwrap();

        let attempts = store.retry_attempts(order.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, RetryOutcome::Success);
    }
}
