//! Step definitions and the ordered registry.
//!
//! Steps are stateless singletons: all per-execution state lives in the
//! [`SagaContext`]. The registry order defines saga order and is
//! immutable after startup.

pub mod inventory;
pub mod payment;
pub mod shipping;

pub use inventory::InventoryReservation;
pub use payment::PaymentAuthorization;
pub use shipping::ShippingArrangement;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clients::{CollaboratorError, Collaborators};
use crate::config::ValidityPolicy;
use crate::context::SagaContext;
use crate::model::StepData;

/// Classification of a stored step result at retry time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultValidity {
    /// External side effect still holds; the step may be skipped.
    Valid,
    /// The side effect could be refreshed, but re-planning treats this
    /// as the resume point.
    Refreshable,
    /// Inputs changed or the effect lapsed; the step must run again.
    MustReexecute,
}

/// A step refused to complete (or compensate).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StepFailure {
    pub code: String,
    pub message: String,
}

impl StepFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<CollaboratorError> for StepFailure {
    fn from(error: CollaboratorError) -> Self {
        let message = match &error {
            CollaboratorError::Domain { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            code: error.code().to_string(),
            message,
        }
    }
}

/// One remote business step with its paired compensation.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Stable name, recorded on step rows and events.
    fn name(&self) -> &'static str;

    /// 1-based position in the saga.
    fn step_order(&self) -> u32;

    /// Run the step's side effect. Outputs are merged into the context
    /// by the executor and persisted as the step's opaque data.
    async fn execute(&self, ctx: &SagaContext) -> Result<StepData, StepFailure>;

    /// Reverse the step's side effect, reading identifiers from the
    /// context.
    async fn compensate(&self, ctx: &SagaContext) -> Result<(), StepFailure>;

    /// Classify a stored result from a prior execution.
    fn result_validity(
        &self,
        stored: &StepData,
        completed_at: DateTime<Utc>,
        ctx: &SagaContext,
        now: DateTime<Utc>,
    ) -> ResultValidity;

    /// Context keys that must be present before this step can be the
    /// resume point of a retry.
    fn required_context_keys(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Errors raised while assembling a registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry has no steps")]
    Empty,

    #[error("step order must be dense from 1: expected {expected}, found {found} ({name})")]
    SparseOrder {
        expected: u32,
        found: u32,
        name: String,
    },

    #[error("duplicate step name: {0}")]
    DuplicateName(String),
}

/// Ordered, immutable list of step definitions.
pub struct StepRegistry {
    steps: Vec<Arc<dyn SagaStep>>,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl StepRegistry {
    /// Assemble a registry, validating that step orders are dense from 1
    /// and names are unique.
    pub fn new(mut steps: Vec<Arc<dyn SagaStep>>) -> Result<Self, RegistryError> {
        if steps.is_empty() {
            return Err(RegistryError::Empty);
        }
        steps.sort_by_key(|step| step.step_order());

        for (index, step) in steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.step_order() != expected {
                return Err(RegistryError::SparseOrder {
                    expected,
                    found: step.step_order(),
                    name: step.name().to_string(),
                });
            }
            if steps[..index].iter().any(|prior| prior.name() == step.name()) {
                return Err(RegistryError::DuplicateName(step.name().to_string()));
            }
        }

        Ok(Self { steps })
    }

    /// The default three-step order saga wired against the given
    /// collaborators.
    pub fn standard(collaborators: &Collaborators, validity: &ValidityPolicy) -> Self {
        let steps: Vec<Arc<dyn SagaStep>> = vec![
            Arc::new(InventoryReservation::new(
                collaborators.inventory.clone(),
                validity.inventory_ttl(),
                validity.inventory_refresh_window(),
            )),
            Arc::new(PaymentAuthorization::new(
                collaborators.payment.clone(),
                validity.payment_ttl(),
            )),
            Arc::new(ShippingArrangement::new(
                collaborators.shipping.clone(),
                validity.shipping_ttl(),
            )),
        ];
        // The fixed set above is dense and unique by construction.
        Self { steps }
    }

    /// Steps in saga order.
    pub fn ordered_steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look a step up by its stable name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn SagaStep>> {
        self.steps.iter().find(|step| step.name() == name)
    }

    /// Step at a 0-based index.
    pub fn at_index(&self, index: usize) -> Option<&Arc<dyn SagaStep>> {
        self.steps.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::mock::MockCollaborators;
    use crate::config::ValidityPolicy;
    use crate::model::StepData;

    struct FakeStep {
        name: &'static str,
        order: u32,
    }

    #[async_trait]
    impl SagaStep for FakeStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn step_order(&self) -> u32 {
            self.order
        }

        async fn execute(&self, _ctx: &SagaContext) -> Result<StepData, StepFailure> {
            Ok(StepData::new())
        }

        async fn compensate(&self, _ctx: &SagaContext) -> Result<(), StepFailure> {
            Ok(())
        }

        fn result_validity(
            &self,
            _stored: &StepData,
            _completed_at: DateTime<Utc>,
            _ctx: &SagaContext,
            _now: DateTime<Utc>,
        ) -> ResultValidity {
            ResultValidity::Valid
        }
    }

    #[test]
    fn test_standard_registry_order() {
        let mocks = MockCollaborators::new();
        let registry =
            StepRegistry::standard(&mocks.collaborators(), &ValidityPolicy::default());

        let names: Vec<&str> = registry.ordered_steps().iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "Inventory Reservation",
                "Payment Authorization",
                "Shipping Arrangement"
            ]
        );
        for (index, step) in registry.ordered_steps().iter().enumerate() {
            assert_eq!(step.step_order() as usize, index + 1);
        }
    }

    #[test]
    fn test_sparse_order_rejected() {
        let err = StepRegistry::new(vec![
            Arc::new(FakeStep {
                name: "first",
                order: 1,
            }),
            Arc::new(FakeStep {
                name: "third",
                order: 3,
            }),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::SparseOrder { found: 3, .. }));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = StepRegistry::new(vec![
            Arc::new(FakeStep {
                name: "dup",
                order: 1,
            }),
            Arc::new(FakeStep {
                name: "dup",
                order: 2,
            }),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));
    }

    #[test]
    fn test_collaborator_error_to_step_failure() {
        let failure: StepFailure =
            CollaboratorError::domain("PAYMENT_DECLINED", "card declined").into();
        assert_eq!(failure.code, "PAYMENT_DECLINED");
        assert_eq!(failure.message, "card declined");

        let transient: StepFailure =
            CollaboratorError::Transport("connection reset".to_string()).into();
        assert_eq!(transient.code, "TRANSIENT");
    }
}
