//! Tandem - durable saga orchestration for order fulfillment.
//!
//! A single-coordinator engine that drives a fixed sequence of remote
//! business steps (reserve inventory, authorize payment, arrange
//! shipping) for an order, records every transition durably, and on any
//! failure compensates the completed prefix in reverse order. Failed
//! orders can be retried from the failed step, reusing still-valid
//! prior results, and every order exposes a live progress stream and a
//! reconstructed timeline.

pub mod clients;
pub mod compensation;
pub mod config;
pub mod context;
pub mod executor;
pub mod facade;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod steps;
pub mod store;
pub mod timeline;

pub use config::{SagaConfig, CONFIG_ENV_PREFIX, CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};
pub use context::SagaContext;
pub use facade::{
    OrderStatusView, StepStatusView, Tandem, TandemBuilder, TandemConfig, TandemError,
};
pub use orchestrator::{NewOrderItem, OrderRequest, SagaResult};
pub use progress::{ProgressItem, ProgressStream};
pub use retry::{Eligibility, RetryRequest, SagaRetryResult};
pub use timeline::Timeline;
