use crate::orchestration::cache::ResponseCache;
use crate::orchestration::policy::{ExecutionPolicy, RunCancellation};
use crate::orchestration::result::{StepError, StepErrorKind, StepResult};
use crate::plan::{StepReference, ValidatedStep};
use crate::registry::{
    CapabilityDescriptor, CapabilityError, CapabilityHandler, CapabilityRegistry,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Read access to results recorded earlier in the same run.
pub trait UpstreamLookup {
    fn upstream_result(&self, step_id: &str) -> Option<&StepResult>;
}

impl UpstreamLookup for [StepResult] {
    fn upstream_result(&self, step_id: &str) -> Option<&StepResult> {
        self.iter().find(|result| result.step_id == step_id)
    }
}

impl UpstreamLookup for Vec<StepResult> {
    fn upstream_result(&self, step_id: &str) -> Option<&StepResult> {
        self.as_slice().upstream_result(step_id)
    }
}

impl UpstreamLookup for BTreeMap<String, StepResult> {
    fn upstream_result(&self, step_id: &str) -> Option<&StepResult> {
        self.get(step_id)
    }
}

/// Executes single steps for one run: argument resolution, cache lookup,
/// timed invocation, retry with backoff and output contract checks.
#[derive(Debug, Clone, Copy)]
pub struct StepExecutor<'a> {
    registry: &'a CapabilityRegistry,
    policy: &'a ExecutionPolicy,
    cancellation: &'a RunCancellation,
    cache: Option<&'a ResponseCache>,
    run_id: &'a str,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        registry: &'a CapabilityRegistry,
        policy: &'a ExecutionPolicy,
        cancellation: &'a RunCancellation,
        run_id: &'a str,
    ) -> Self {
        Self {
            registry,
            policy,
            cancellation,
            cache: None,
            run_id,
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn execute<U>(&self, step: &ValidatedStep, upstream: &U) -> StepResult
    where
        U: UpstreamLookup + ?Sized,
    {
        let started = Instant::now();
        let step_id = step.id.as_str();
        let capability = step.capability.as_str();

        let descriptor = match self.registry.lookup(capability) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                return StepResult::failed(
                    step_id,
                    capability,
                    StepError::new(StepErrorKind::PermanentCapability, err.to_string()),
                    0,
                    started.elapsed(),
                );
            }
        };

        let arguments = match resolve_arguments(step, upstream) {
            Ok(arguments) => arguments,
            Err(error) => {
                tracing::warn!(
                    run_id = %self.run_id,
                    step_id,
                    capability,
                    error = %error,
                    "step arguments could not be resolved"
                );
                return StepResult::failed(step_id, capability, error, 0, started.elapsed());
            }
        };

        let cache = self.cache.zip(descriptor.cache_ttl);
        if let Some((cache, _)) = cache {
            if let Some(output) = cache.get(capability, &arguments) {
                tracing::debug!(
                    run_id = %self.run_id,
                    step_id,
                    capability,
                    "served from response cache"
                );
                return StepResult::success(step_id, capability, output, 0, started.elapsed())
                    .from_cache();
            }
        }

        let timeout = descriptor.timeout.or(self.policy.step_timeout);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        let mut abandoned: Option<AbandonedCall> = None;
        loop {
            attempt += 1;
            tracing::debug!(
                run_id = %self.run_id,
                step_id,
                capability,
                attempt,
                "invoking capability"
            );

            let outcome = invoke_with_timeout(descriptor, &arguments, timeout, &mut abandoned)
                .and_then(|output| check_output_contract(descriptor, output));
            let error = match outcome {
                Ok(output) => {
                    if let Some((cache, ttl)) = cache {
                        cache.put(capability, &arguments, output.clone(), ttl);
                    }
                    tracing::info!(
                        run_id = %self.run_id,
                        step_id,
                        capability,
                        attempt,
                        status = "success",
                        "step finished"
                    );
                    return StepResult::success(
                        step_id,
                        capability,
                        output,
                        attempt,
                        started.elapsed(),
                    );
                }
                Err(error) => error,
            };

            if !error.kind.is_retryable() || attempt >= max_attempts {
                tracing::warn!(
                    run_id = %self.run_id,
                    step_id,
                    capability,
                    attempt,
                    status = "failed",
                    error = %error,
                    "step finished"
                );
                return StepResult::failed(step_id, capability, error, attempt, started.elapsed());
            }

            if let Some(call) = abandoned.take() {
                tracing::debug!(
                    run_id = %self.run_id,
                    step_id,
                    capability,
                    attempt,
                    "waiting for timed-out call to finish before retrying"
                );
                if !self.cancellation.wait_for(&call.receiver) {
                    let cancelled = StepError::new(
                        StepErrorKind::RunCancelled,
                        format!(
                            "run cancelled while a timed-out call was still running: {}",
                            error.message
                        ),
                    );
                    return StepResult::failed(
                        step_id,
                        capability,
                        cancelled,
                        attempt,
                        started.elapsed(),
                    );
                }
            }

            let delay = self.policy.backoff.delay_for(attempt);
            tracing::warn!(
                run_id = %self.run_id,
                step_id,
                capability,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "transient step failure; retrying"
            );
            if !self.cancellation.sleep(delay) {
                let cancelled = StepError::new(
                    StepErrorKind::RunCancelled,
                    format!("run cancelled while waiting to retry: {}", error.message),
                );
                return StepResult::failed(
                    step_id,
                    capability,
                    cancelled,
                    attempt,
                    started.elapsed(),
                );
            }
        }
    }
}

/// One-off execution outside a run: no cache, no cancellation.
pub fn execute_step<U>(
    step: &ValidatedStep,
    upstream: &U,
    registry: &CapabilityRegistry,
    policy: &ExecutionPolicy,
) -> StepResult
where
    U: UpstreamLookup + ?Sized,
{
    let cancellation = RunCancellation::never();
    StepExecutor::new(registry, policy, &cancellation, "adhoc").execute(step, upstream)
}

fn unresolved(message: String) -> StepError {
    StepError::new(StepErrorKind::UnresolvedReference, message)
}

fn resolve_arguments<U>(
    step: &ValidatedStep,
    upstream: &U,
) -> Result<Map<String, Value>, StepError>
where
    U: UpstreamLookup + ?Sized,
{
    for dependency in &step.upstream {
        let result = upstream
            .upstream_result(dependency.as_str())
            .ok_or_else(|| unresolved(format!("upstream step `{dependency}` has no result")))?;
        if !result.is_success() {
            return Err(unresolved(format!(
                "upstream step `{dependency}` did not succeed ({})",
                result.status
            )));
        }
    }

    let lookup = |reference: &StepReference| -> Result<Value, StepError> {
        let output = upstream
            .upstream_result(&reference.step_id)
            .and_then(|result| result.output.as_ref())
            .ok_or_else(|| {
                unresolved(format!("upstream step `{}` has no output", reference.step_id))
            })?;
        reference.select(output).cloned().ok_or_else(|| {
            unresolved(format!(
                "`{reference}` is absent from the output of `{}`",
                reference.step_id
            ))
        })
    };

    let mut resolved = Map::new();
    for (name, value) in &step.arguments {
        resolved.insert(name.clone(), value.resolve(&lookup)?);
    }
    Ok(resolved)
}

fn classify(error: CapabilityError) -> StepError {
    let kind = if error.is_transient() {
        StepErrorKind::TransientCapability
    } else {
        StepErrorKind::PermanentCapability
    };
    StepError::new(kind, error.message)
}

type CallOutcome = Result<Map<String, Value>, CapabilityError>;

/// Worker thread whose call outlived its timeout. The sender is dropped when
/// the call returns, so the receiver doubles as a completion signal.
struct AbandonedCall {
    receiver: Receiver<CallOutcome>,
}

/// Runs the handler on a worker thread when a timeout applies. A call that
/// outlives the timeout is handed back through `abandoned` so the next attempt
/// does not overlap it.
fn invoke_with_timeout(
    descriptor: &CapabilityDescriptor,
    arguments: &Map<String, Value>,
    timeout: Option<Duration>,
    abandoned: &mut Option<AbandonedCall>,
) -> Result<Map<String, Value>, StepError> {
    let handler: Arc<dyn CapabilityHandler> = descriptor.handler();
    let Some(timeout) = timeout else {
        return handler.invoke(arguments).map_err(classify);
    };

    let (sender, receiver) = mpsc::channel();
    let owned_arguments = arguments.clone();
    thread::Builder::new()
        .name(format!("capability-{}", descriptor.name))
        .spawn(move || {
            let _ = sender.send(handler.invoke(&owned_arguments));
        })
        .map_err(|err| {
            StepError::new(
                StepErrorKind::TransientCapability,
                format!("failed to start capability worker: {err}"),
            )
        })?;

    match receiver.recv_timeout(timeout) {
        Ok(outcome) => outcome.map_err(classify),
        Err(RecvTimeoutError::Timeout) => {
            *abandoned = Some(AbandonedCall { receiver });
            Err(StepError::new(
                StepErrorKind::Timeout,
                format!(
                    "capability `{}` did not answer within {}ms",
                    descriptor.name,
                    timeout.as_millis()
                ),
            ))
        }
        Err(RecvTimeoutError::Disconnected) => Err(StepError::new(
            StepErrorKind::PermanentCapability,
            format!("capability `{}` handler panicked", descriptor.name),
        )),
    }
}

fn check_output_contract(
    descriptor: &CapabilityDescriptor,
    output: Map<String, Value>,
) -> Result<Map<String, Value>, StepError> {
    let mut problems = Vec::new();
    for field in &descriptor.outputs {
        match output.get(&field.name) {
            None | Some(Value::Null) if field.required => {
                problems.push(format!("missing required field `{}`", field.name));
            }
            Some(value) if !value.is_null() && !field.kind.matches(value) => {
                problems.push(format!(
                    "field `{}` is {}; expected {}",
                    field.name,
                    crate::registry::ValueKind::describe(value),
                    field.kind
                ));
            }
            _ => {}
        }
    }
    if problems.is_empty() {
        return Ok(output);
    }
    Err(StepError::new(
        StepErrorKind::InvalidOutput,
        format!(
            "capability `{}` output contract violated: {}",
            descriptor.name,
            problems.join("; ")
        ),
    ))
}
