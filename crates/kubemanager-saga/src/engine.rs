//! Saga executor.
//!
//! Drives a [`SagaDefinition`] against a persisted [`SagaRecord`]:
//!
//! ```text
//!   Running ──(all steps ok)──────────────────────────► Succeeded
//!      │
//!      └─(step fails for good / cancel)─► Compensating ─┬─► FailedCompensated
//!                                                       └─► FailedUnrecoverable
//! ```
//!
//! The record is rewritten after every attempt so pollers see live
//! progress and a restarted process can call [`SagaEngine::resume`].

use kubemanager_state::{SagaRecord, SagaStatus, StateStore, epoch_secs};
use tracing::{debug, error, info, warn};

use crate::error::{SagaError, SagaResult, StepError};
use crate::step::{DefinedStep, SagaContext, SagaDefinition};

/// Terminal result of a saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaOutcome {
    Succeeded,
    FailedCompensated,
    FailedUnrecoverable,
}

impl SagaOutcome {
    pub fn status(&self) -> SagaStatus {
        match self {
            SagaOutcome::Succeeded => SagaStatus::Succeeded,
            SagaOutcome::FailedCompensated => SagaStatus::FailedCompensated,
            SagaOutcome::FailedUnrecoverable => SagaStatus::FailedUnrecoverable,
        }
    }
}

/// What a finished saga hands back to its launcher.
#[derive(Debug, Clone)]
pub struct SagaReport<C> {
    pub saga_id: String,
    pub outcome: SagaOutcome,
    /// Context as of the last completed step.
    pub context: C,
    /// The error that stopped forward progress, if any.
    pub error: Option<StepError>,
}

/// Executes saga definitions and persists their progress.
#[derive(Clone)]
pub struct SagaEngine {
    store: StateStore,
}

impl SagaEngine {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Start a new saga, or pick up an incomplete one with the same id.
    pub async fn start<C: SagaContext>(
        &self,
        saga_id: &str,
        correlation_id: &str,
        def: &SagaDefinition<C>,
        ctx: C,
    ) -> SagaResult<SagaReport<C>> {
        if let Some(existing) = self.store.get_saga(saga_id)? {
            debug!(saga_id, "saga id already recorded, resuming");
            return self.continue_record(existing, def).await;
        }

        let record = SagaRecord::new(
            saga_id,
            def.kind(),
            correlation_id,
            &def.step_names(),
            serde_json::to_value(&ctx)?,
        );
        self.store.put_saga(&record)?;
        info!(saga_id, kind = def.kind(), correlation_id, "saga started");
        self.drive(record, def, ctx).await
    }

    /// Resume a persisted saga from its last completed step.
    pub async fn resume<C: SagaContext>(
        &self,
        saga_id: &str,
        def: &SagaDefinition<C>,
    ) -> SagaResult<SagaReport<C>> {
        let record = self
            .store
            .get_saga(saga_id)?
            .ok_or_else(|| SagaError::NotFound(saga_id.to_string()))?;
        info!(saga_id, kind = %record.kind, status = %record.status, "resuming saga");
        self.continue_record(record, def).await
    }

    /// Current progress of a saga.
    pub fn status(&self, saga_id: &str) -> SagaResult<SagaRecord> {
        self.store
            .get_saga(saga_id)?
            .ok_or_else(|| SagaError::NotFound(saga_id.to_string()))
    }

    /// Persist a cancel signal. The engine observes it before the next step.
    pub fn request_cancel(&self, saga_id: &str) -> SagaResult<()> {
        let record = self.status(saga_id)?;
        if record.status.is_terminal() || !self.store.request_saga_cancel(saga_id)? {
            return Err(SagaError::AlreadyFinished(saga_id.to_string()));
        }
        info!(saga_id, "saga cancel requested");
        Ok(())
    }

    async fn continue_record<C: SagaContext>(
        &self,
        record: SagaRecord,
        def: &SagaDefinition<C>,
    ) -> SagaResult<SagaReport<C>> {
        if record.status.is_terminal() {
            return Err(SagaError::AlreadyFinished(record.id));
        }
        if record.kind != def.kind() {
            return Err(SagaError::KindMismatch {
                saga_id: record.id,
                expected: def.kind().to_string(),
                actual: record.kind,
            });
        }
        let ctx: C = serde_json::from_value(record.context.clone())?;
        if record.status == SagaStatus::Compensating {
            let err = StepError::Transient(
                record
                    .error
                    .clone()
                    .unwrap_or_else(|| "interrupted during compensation".to_string()),
            );
            return self.compensate(record, def, ctx, err).await;
        }
        self.drive(record, def, ctx).await
    }

    async fn drive<C: SagaContext>(
        &self,
        mut record: SagaRecord,
        def: &SagaDefinition<C>,
        mut ctx: C,
    ) -> SagaResult<SagaReport<C>> {
        for defined in &def.steps {
            let name = defined.step.name();
            if record.step(name).is_some_and(|s| s.is_completed()) {
                debug!(saga_id = %record.id, step = name, "step already completed, skipping");
                continue;
            }

            if self.store.saga_cancel_requested(&record.id)? {
                warn!(saga_id = %record.id, step = name, "cancel signal observed");
                return self.fail(record, def, ctx, name, StepError::Cancelled).await;
            }

            record.current_step = Some(name.to_string());
            if let Some(phase) = defined.step.phase() {
                record.phase = Some(phase.to_string());
            }
            record.touch();
            self.store.put_saga(&record)?;

            if let Err(err) = self.run_step(&mut record, defined, &mut ctx).await? {
                return self.fail(record, def, ctx, name, err).await;
            }

            if let Some(entry) = record.step_mut(name) {
                entry.completed_at = Some(epoch_secs());
                entry.last_error = None;
            }
            record.context = serde_json::to_value(&ctx)?;
            record.touch();
            self.store.put_saga(&record)?;
            debug!(saga_id = %record.id, step = name, "step completed");
        }

        record.status = SagaStatus::Succeeded;
        record.current_step = None;
        record.touch();
        self.store.put_saga(&record)?;
        self.store.clear_saga_cancel(&record.id)?;
        info!(saga_id = %record.id, kind = %record.kind, "saga succeeded");

        Ok(SagaReport {
            saga_id: record.id,
            outcome: SagaOutcome::Succeeded,
            context: ctx,
            error: None,
        })
    }

    /// Run one step with timeout and retries. The outer `Result` carries
    /// engine failures; the inner one the step's final verdict.
    async fn run_step<C: SagaContext>(
        &self,
        record: &mut SagaRecord,
        defined: &DefinedStep<C>,
        ctx: &mut C,
    ) -> SagaResult<Result<(), StepError>> {
        let name = defined.step.name();
        let options = &defined.options;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut scratch = ctx.clone();
            let result =
                match tokio::time::timeout(options.timeout, defined.step.run(&mut scratch)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::Timeout(options.timeout)),
                };

            if let Some(entry) = record.step_mut(name) {
                entry.attempts += 1;
                entry.last_error = result.as_ref().err().map(ToString::to_string);
            }
            record.touch();
            self.store.put_saga(record)?;

            let err = match result {
                Ok(()) => {
                    *ctx = scratch;
                    return Ok(Ok(()));
                }
                Err(err) => err,
            };

            if !err.is_retryable() || !options.retry.allows_retry_after(attempt) {
                warn!(
                    saga_id = %record.id,
                    step = name,
                    attempt,
                    error = %err,
                    "step failed"
                );
                return Ok(Err(err));
            }

            let delay = options.retry.backoff_for(attempt);
            warn!(
                saga_id = %record.id,
                step = name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "step attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;

            if self.store.saga_cancel_requested(&record.id)? {
                warn!(saga_id = %record.id, step = name, "cancel signal observed between retries");
                return Ok(Err(StepError::Cancelled));
            }
        }
    }

    async fn fail<C: SagaContext>(
        &self,
        mut record: SagaRecord,
        def: &SagaDefinition<C>,
        ctx: C,
        failed_step: &str,
        err: StepError,
    ) -> SagaResult<SagaReport<C>> {
        record.status = SagaStatus::Compensating;
        record.failed_step = Some(failed_step.to_string());
        record.error = Some(err.to_string());
        record.touch();
        self.store.put_saga(&record)?;
        warn!(
            saga_id = %record.id,
            step = failed_step,
            error = %err,
            "saga failed, compensating"
        );

        if let Some(hook) = &def.on_failure
            && let Err(hook_err) = hook.on_failure(&ctx, failed_step, &err).await
        {
            warn!(
                saga_id = %record.id,
                step = failed_step,
                error = %hook_err,
                "failure hook did not complete"
            );
        }

        self.compensate(record, def, ctx, err).await
    }

    /// Run compensations of completed, not yet compensated steps in reverse
    /// order. Each compensation is attempted once.
    async fn compensate<C: SagaContext>(
        &self,
        mut record: SagaRecord,
        def: &SagaDefinition<C>,
        ctx: C,
        cause: StepError,
    ) -> SagaResult<SagaReport<C>> {
        let pending: Vec<String> = record
            .steps
            .iter()
            .filter(|s| s.is_completed() && s.compensated_at.is_none())
            .map(|s| s.name.clone())
            .collect();
        let failed_step = record.failed_step.clone().unwrap_or_default();
        let mut unrecoverable = false;

        for name in pending.iter().rev() {
            let Some(defined) = def.find(name) else {
                warn!(saga_id = %record.id, step = %name, "no definition for completed step, skipping compensation");
                continue;
            };
            let result =
                match tokio::time::timeout(defined.options.timeout, defined.step.compensate(&ctx)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(StepError::Timeout(defined.options.timeout)),
                };

            if let Some(entry) = record.step_mut(name) {
                match &result {
                    Ok(()) => entry.compensated_at = Some(epoch_secs()),
                    Err(e) => entry.compensation_error = Some(e.to_string()),
                }
            }
            record.touch();
            self.store.put_saga(&record)?;

            match result {
                Ok(()) => debug!(saga_id = %record.id, compensation = %name, "compensation completed"),
                Err(e) => {
                    error!(
                        saga_id = %record.id,
                        failed_step = %failed_step,
                        compensation = %name,
                        error = %e,
                        "compensation failed, manual remediation required"
                    );
                    unrecoverable = true;
                }
            }
        }

        let outcome = if unrecoverable {
            SagaOutcome::FailedUnrecoverable
        } else {
            SagaOutcome::FailedCompensated
        };
        record.status = outcome.status();
        record.current_step = None;
        record.touch();
        self.store.put_saga(&record)?;
        self.store.clear_saga_cancel(&record.id)?;
        info!(saga_id = %record.id, kind = %record.kind, status = %record.status, "saga finished after failure");

        Ok(SagaReport {
            saga_id: record.id,
            outcome,
            context: ctx,
            error: Some(cause),
        })
    }
}
