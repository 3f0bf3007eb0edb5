use crate::orchestration::cache::ResponseCache;
use crate::orchestration::policy::{CancelHandle, ExecutionPolicy};
use crate::orchestration::run_controller::RunController;
use crate::orchestration::verifier::{verify, FinalOutput};
use crate::plan::{
    resolve_execution_order, validate_plan, ExecutionOrder, PlanDocument, PlanError, ValidatedPlan,
};
use crate::registry::CapabilityRegistry;
use std::sync::Arc;

/// Entry point wiring validation, ordering, execution and verification.
///
/// The registry is shared read-only; one engine can serve concurrent runs.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<CapabilityRegistry>,
    policy: ExecutionPolicy,
    cache: Option<Arc<ResponseCache>>,
}

impl Engine {
    pub fn new(registry: Arc<CapabilityRegistry>, policy: ExecutionPolicy) -> Self {
        Self {
            registry,
            policy,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_deref()
    }

    /// Accepts a plan without running it.
    pub fn prepare(
        &self,
        plan: &PlanDocument,
    ) -> Result<(ValidatedPlan, ExecutionOrder), PlanError> {
        let validated = validate_plan(plan, &self.registry)?;
        let order = resolve_execution_order(&validated)?;
        for step_id in &self.policy.critical_steps {
            if validated.step(step_id).is_none() {
                tracing::warn!(step_id = %step_id, "critical step is not part of the plan");
            }
        }
        Ok((validated, order))
    }

    pub fn run(&self, plan: &PlanDocument) -> Result<FinalOutput, PlanError> {
        self.run_with_cancel(plan, CancelHandle::new())
    }

    /// Like `run`, but `cancel` can stop the run from another thread.
    pub fn run_with_cancel(
        &self,
        plan: &PlanDocument,
        cancel: CancelHandle,
    ) -> Result<FinalOutput, PlanError> {
        let (validated, order) = self.prepare(plan).inspect_err(|err| {
            tracing::warn!(error = %err, "plan rejected");
        })?;
        let state = RunController::new(&self.registry, &self.policy)
            .with_cache(self.cache())
            .with_cancel_handle(cancel)
            .run(&validated, &order);
        Ok(verify(&state))
    }
}
