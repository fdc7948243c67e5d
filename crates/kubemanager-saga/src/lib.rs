//! KubeManager saga engine.
//!
//! Sequences multi-system operations as an ordered list of idempotent
//! steps. Each step carries a timeout and a bounded retry policy; when a
//! step fails for good, the compensations of every already-completed step
//! run in reverse order. Progress and the saga context are persisted to the
//! state store after every attempt, so an interrupted saga resumes from its
//! last completed step.
//!
//! # Components
//!
//! - **`policy`** — Retry policy, per-step options, remote/local profiles
//! - **`step`** — `Step` and `FailureHook` traits, `SagaDefinition`
//! - **`engine`** — `SagaEngine` (start, resume, cancel, progress)

pub mod engine;
pub mod error;
pub mod policy;
pub mod step;

pub use engine::{SagaEngine, SagaOutcome, SagaReport};
pub use error::{SagaError, SagaResult, StepError, StepResult};
pub use policy::{RetryPolicy, StepOptions, StepProfiles};
pub use step::{FailureHook, SagaContext, SagaDefinition, Step};
