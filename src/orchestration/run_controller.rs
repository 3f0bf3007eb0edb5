use crate::orchestration::cache::ResponseCache;
use crate::orchestration::policy::{CancelHandle, ExecutionMode, ExecutionPolicy, RunCancellation};
use crate::orchestration::result::{SkipReason, StepError, StepErrorKind, StepResult};
use crate::orchestration::step_execution::{StepExecutor, UpstreamLookup};
use crate::plan::{ExecutionOrder, ValidatedPlan, ValidatedStep};
use crate::registry::CapabilityRegistry;
use crate::shared::run_id::generate_run_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Running,
    Completed,
    Aborted,
}

impl RunPhase {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunPhase::Pending, RunPhase::Running)
                | (RunPhase::Running, RunPhase::Completed)
                | (RunPhase::Running, RunPhase::Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Aborted)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Pending => write!(f, "pending"),
            RunPhase::Running => write!(f, "running"),
            RunPhase::Completed => write!(f, "completed"),
            RunPhase::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    CriticalStepFailed { step_id: String },
    RunCancelled,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::CriticalStepFailed { step_id } => {
                write!(f, "critical step `{step_id}` failed")
            }
            AbortReason::RunCancelled => write!(f, "run cancelled or past its deadline"),
        }
    }
}

/// Per-run state. Results are kept in resolved execution order.
#[derive(Debug, Clone)]
pub struct RunState<'a> {
    run_id: String,
    plan: &'a ValidatedPlan,
    results: Vec<StepResult>,
    phase: RunPhase,
    abort_reason: Option<AbortReason>,
    started_at: DateTime<Utc>,
    elapsed: Duration,
}

impl<'a> RunState<'a> {
    fn new(run_id: String, plan: &'a ValidatedPlan) -> Self {
        Self {
            run_id,
            plan,
            results: Vec::with_capacity(plan.len()),
            phase: RunPhase::Pending,
            abort_reason: None,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn plan(&self) -> &'a ValidatedPlan {
        self.plan
    }

    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.upstream_result(step_id)
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort_reason.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn advance(&mut self, next: RunPhase) {
        if self.phase.can_transition_to(next) {
            self.phase = next;
        } else {
            tracing::error!(
                run_id = %self.run_id,
                from = %self.phase,
                to = %next,
                "ignored invalid run phase transition"
            );
        }
    }

    fn abort(&mut self, reason: AbortReason) {
        tracing::warn!(run_id = %self.run_id, reason = %reason, "run aborted");
        self.abort_reason = Some(reason);
        self.advance(RunPhase::Aborted);
    }
}

impl UpstreamLookup for RunState<'_> {
    fn upstream_result(&self, step_id: &str) -> Option<&StepResult> {
        self.result(step_id)
    }
}

/// Drives a validated plan through the step executor in resolved order.
#[derive(Debug, Clone)]
pub struct RunController<'a> {
    registry: &'a CapabilityRegistry,
    policy: &'a ExecutionPolicy,
    cache: Option<&'a ResponseCache>,
    cancel: CancelHandle,
    run_id: Option<String>,
}

impl<'a> RunController<'a> {
    pub fn new(registry: &'a CapabilityRegistry, policy: &'a ExecutionPolicy) -> Self {
        Self {
            registry,
            policy,
            cache: None,
            cancel: CancelHandle::new(),
            run_id: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn run<'p>(&self, plan: &'p ValidatedPlan, order: &ExecutionOrder) -> RunState<'p> {
        let started = Instant::now();
        let run_id = self.run_id.clone().unwrap_or_else(generate_run_id);
        let cancellation =
            RunCancellation::starting_now(self.policy.run_deadline, self.cancel.clone());
        let mut state = RunState::new(run_id, plan);
        let ordered: Vec<&ValidatedStep> = order
            .step_ids()
            .iter()
            .filter_map(|step_id| plan.step(step_id.as_str()))
            .collect();

        tracing::info!(
            run_id = %state.run_id,
            steps = ordered.len(),
            mode = ?self.policy.mode,
            "run started"
        );
        state.advance(RunPhase::Running);

        let run_id = state.run_id.clone();
        let executor =
            StepExecutor::new(self.registry, self.policy, &cancellation, &run_id)
                .with_cache(self.cache);
        match self.policy.mode {
            ExecutionMode::Sequential => {
                self.run_sequential(&mut state, &ordered, &executor, &cancellation)
            }
            ExecutionMode::Bounded {
                max_workers,
                per_capability,
            } => self.run_bounded(
                &mut state,
                &ordered,
                order,
                &executor,
                &cancellation,
                max_workers.max(1),
                per_capability.max(1),
            ),
        }

        if state.phase == RunPhase::Running {
            state.advance(RunPhase::Completed);
        }
        state.elapsed = started.elapsed();
        tracing::info!(
            run_id = %state.run_id,
            phase = %state.phase,
            elapsed_ms = u64::try_from(state.elapsed.as_millis()).unwrap_or(u64::MAX),
            "run finished"
        );
        state
    }

    fn is_critical(&self, step: &ValidatedStep) -> bool {
        step.critical || self.policy.critical_steps.contains(step.id.as_str())
    }

    fn run_sequential(
        &self,
        state: &mut RunState<'_>,
        ordered: &[&ValidatedStep],
        executor: &StepExecutor<'_>,
        cancellation: &RunCancellation,
    ) {
        for (index, step) in ordered.iter().enumerate() {
            if cancellation.is_cancelled() {
                state.abort(AbortReason::RunCancelled);
                skip_all(state, &ordered[index..], SkipReason::RunCancelled);
                return;
            }

            let unmet = unmet_upstream(step, state.results.as_slice());
            if !unmet.is_empty() {
                record_skip(state, step, SkipReason::UpstreamNotSucceeded { step_ids: unmet });
                continue;
            }

            let result = executor.execute(step, state.results.as_slice());
            let critical_failure = !result.is_success() && self.is_critical(step);
            state.results.push(result);
            if critical_failure {
                let step_id = step.id.to_string();
                state.abort(AbortReason::CriticalStepFailed {
                    step_id: step_id.clone(),
                });
                skip_all(
                    state,
                    &ordered[index + 1..],
                    SkipReason::CriticalStepFailed { step_id },
                );
                return;
            }
        }
    }

    /// Greedy batches of ready, mutually independent steps on scoped threads;
    /// each batch is joined before the next one is formed.
    fn run_bounded(
        &self,
        state: &mut RunState<'_>,
        ordered: &[&ValidatedStep],
        order: &ExecutionOrder,
        executor: &StepExecutor<'_>,
        cancellation: &RunCancellation,
        max_workers: usize,
        per_capability: usize,
    ) {
        let mut finished: BTreeMap<String, StepResult> = BTreeMap::new();
        let mut pending: Vec<&ValidatedStep> = ordered.to_vec();

        while !pending.is_empty() {
            if cancellation.is_cancelled() {
                state.abort(AbortReason::RunCancelled);
                for step in pending.drain(..) {
                    finished.insert(
                        step.id.to_string(),
                        StepResult::skipped(
                            step.id.as_str(),
                            step.capability.as_str(),
                            SkipReason::RunCancelled,
                        ),
                    );
                }
                break;
            }

            let settled = finished.len();
            let mut batch: Vec<&ValidatedStep> = Vec::new();
            let mut per_capability_load: BTreeMap<&str, usize> = BTreeMap::new();
            let mut deferred = Vec::with_capacity(pending.len());
            for step in pending.drain(..) {
                let ready = step
                    .upstream
                    .iter()
                    .all(|dependency| finished.contains_key(dependency.as_str()));
                if !ready {
                    deferred.push(step);
                    continue;
                }
                let unmet = unmet_upstream(step, &finished);
                if !unmet.is_empty() {
                    tracing::info!(run_id = %state.run_id, step_id = %step.id, "step skipped");
                    finished.insert(
                        step.id.to_string(),
                        StepResult::skipped(
                            step.id.as_str(),
                            step.capability.as_str(),
                            SkipReason::UpstreamNotSucceeded { step_ids: unmet },
                        ),
                    );
                    continue;
                }
                let independent = order.independent_of(step.id.as_str()).is_some_and(|peers| {
                    batch.iter().all(|member| peers.contains(member.id.as_str()))
                });
                let load = per_capability_load.entry(step.capability.as_str()).or_insert(0);
                if independent && batch.len() < max_workers && *load < per_capability {
                    *load += 1;
                    batch.push(step);
                } else {
                    deferred.push(step);
                }
            }
            pending = deferred;
            if batch.is_empty() {
                if finished.len() == settled {
                    break;
                }
                continue;
            }

            let upstream = &finished;
            let results: Vec<StepResult> = thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|step| {
                        let step: &ValidatedStep = step;
                        scope.spawn(move || executor.execute(step, upstream))
                    })
                    .collect();
                handles
                    .into_iter()
                    .zip(&batch)
                    .map(|(handle, step)| {
                        handle.join().unwrap_or_else(|_| {
                            StepResult::failed(
                                step.id.as_str(),
                                step.capability.as_str(),
                                StepError::new(
                                    StepErrorKind::PermanentCapability,
                                    "step worker panicked",
                                ),
                                1,
                                Duration::ZERO,
                            )
                        })
                    })
                    .collect()
            });

            let mut critical_failure = None;
            for (step, result) in batch.iter().zip(results) {
                if critical_failure.is_none() && !result.is_success() && self.is_critical(step) {
                    critical_failure = Some(step.id.to_string());
                }
                finished.insert(step.id.to_string(), result);
            }

            if let Some(step_id) = critical_failure {
                state.abort(AbortReason::CriticalStepFailed {
                    step_id: step_id.clone(),
                });
                for step in pending.drain(..) {
                    finished.insert(
                        step.id.to_string(),
                        StepResult::skipped(
                            step.id.as_str(),
                            step.capability.as_str(),
                            SkipReason::CriticalStepFailed {
                                step_id: step_id.clone(),
                            },
                        ),
                    );
                }
            }
        }

        state.results = ordered
            .iter()
            .filter_map(|step| finished.remove(step.id.as_str()))
            .collect();
    }
}

fn unmet_upstream<U>(step: &ValidatedStep, results: &U) -> Vec<String>
where
    U: UpstreamLookup + ?Sized,
{
    step.upstream
        .iter()
        .filter(|dependency| {
            !results
                .upstream_result(dependency.as_str())
                .is_some_and(StepResult::is_success)
        })
        .map(ToString::to_string)
        .collect()
}

fn record_skip(state: &mut RunState<'_>, step: &ValidatedStep, reason: SkipReason) {
    tracing::info!(
        run_id = %state.run_id,
        step_id = %step.id,
        status = "skipped",
        reason = %reason,
        "step skipped"
    );
    state.results.push(StepResult::skipped(
        step.id.as_str(),
        step.capability.as_str(),
        reason,
    ));
}

fn skip_all(state: &mut RunState<'_>, steps: &[&ValidatedStep], reason: SkipReason) {
    for step in steps {
        record_skip(state, step, reason.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_phases_only_move_forward() {
        assert!(RunPhase::Pending.can_transition_to(RunPhase::Running));
        assert!(RunPhase::Running.can_transition_to(RunPhase::Aborted));
        assert!(!RunPhase::Completed.can_transition_to(RunPhase::Running));
        assert!(!RunPhase::Pending.can_transition_to(RunPhase::Completed));
        assert!(RunPhase::Aborted.is_terminal());
        assert_eq!(RunPhase::Aborted.to_string(), "aborted");
    }

    #[test]
    fn abort_reasons_render_for_humans() {
        let reason = AbortReason::CriticalStepFailed {
            step_id: "s1".to_string(),
        };
        assert_eq!(reason.to_string(), "critical step `s1` failed");
    }
}
