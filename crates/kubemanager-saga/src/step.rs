//! Step contract and saga definitions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StepError, StepResult};
use crate::policy::StepOptions;

/// Bound for the data threaded through a saga's steps.
///
/// The context is persisted after every completed step, so it must
/// round-trip through JSON.
pub trait SagaContext: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> SagaContext for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A named, idempotent unit of work with an optional compensation.
///
/// `run` may be executed more than once (retries, resume after a crash),
/// so implementations must converge: "create if absent", "delete if
/// present". `compensate` undoes the effect of a completed `run`; the
/// default does nothing.
#[async_trait]
pub trait Step<C: SagaContext>: Send + Sync {
    /// Stable name, recorded in the step log.
    fn name(&self) -> &'static str;

    /// Phase label exposed to pollers while this step runs.
    fn phase(&self) -> Option<&'static str> {
        None
    }

    async fn run(&self, ctx: &mut C) -> StepResult;

    async fn compensate(&self, _ctx: &C) -> StepResult {
        Ok(())
    }
}

/// Invoked once when a saga stops making forward progress, before any
/// compensation runs. Errors are logged and otherwise ignored.
#[async_trait]
pub trait FailureHook<C: SagaContext>: Send + Sync {
    async fn on_failure(&self, ctx: &C, failed_step: &str, error: &StepError) -> StepResult;
}

pub(crate) struct DefinedStep<C: SagaContext> {
    pub(crate) step: Arc<dyn Step<C>>,
    pub(crate) options: StepOptions,
}

/// Ordered list of steps for one kind of saga.
pub struct SagaDefinition<C: SagaContext> {
    kind: String,
    pub(crate) steps: Vec<DefinedStep<C>>,
    pub(crate) on_failure: Option<Arc<dyn FailureHook<C>>>,
}

impl<C: SagaContext> SagaDefinition<C> {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            steps: Vec::new(),
            on_failure: None,
        }
    }

    /// Append a step.
    pub fn step(mut self, step: impl Step<C> + 'static, options: StepOptions) -> Self {
        self.steps.push(DefinedStep {
            step: Arc::new(step),
            options,
        });
        self
    }

    pub fn on_failure(mut self, hook: impl FailureHook<C> + 'static) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.step.name()).collect()
    }

    pub(crate) fn find(&self, name: &str) -> Option<&DefinedStep<C>> {
        self.steps.iter().find(|s| s.step.name() == name)
    }
}
