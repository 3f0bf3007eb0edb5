use opsflow::orchestration::{
    BackoffPolicy, CancelHandle, Engine, ExecutionPolicy, ResponseCache, RunCancellation,
    StepErrorKind, StepExecutor, StepResult, StepStatus,
};
use opsflow::plan::{validate_plan, PlanDocument, PlanStepDocument, ValidatedPlan};
use opsflow::registry::{
    CapabilityDescriptor, CapabilityError, CapabilityRegistry, InputParam, OutputField, ValueKind,
};
use opsflow::shared::ids::CapabilityName;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn fast_policy(max_attempts: u32) -> ExecutionPolicy {
    ExecutionPolicy::default()
        .with_max_attempts(max_attempts)
        .with_step_timeout(Some(Duration::from_secs(5)))
        .with_backoff(BackoffPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            multiplier: 2,
        })
}

/// Registers `flaky.call`, which fails transiently `failures` times before answering.
fn flaky_registry(failures: u32, calls: Arc<AtomicU32>) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDescriptor::from_fn(
                CapabilityName::parse("flaky.call").expect("name"),
                move |_| {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if call <= failures {
                        return Err(CapabilityError::transient(format!(
                            "429 rate limited (call {call})"
                        )));
                    }
                    Ok(Map::from_iter([("value".to_string(), json!(call))]))
                },
            )
            .with_output(OutputField::required("value", ValueKind::Integer)),
        )
        .expect("register flaky.call");
    registry
}

fn single_step_plan(registry: &CapabilityRegistry, capability: &str) -> ValidatedPlan {
    let plan = PlanDocument {
        task: None,
        steps: vec![PlanStepDocument::new("s1", capability)],
    };
    validate_plan(&plan, registry).expect("valid plan")
}

fn execute(
    registry: &CapabilityRegistry,
    plan: &ValidatedPlan,
    policy: &ExecutionPolicy,
) -> StepResult {
    let cancellation = RunCancellation::never();
    let step = plan.step("s1").expect("s1");
    StepExecutor::new(registry, policy, &cancellation, "run-test")
        .execute(step, &Vec::<StepResult>::new())
}

#[test]
fn transient_failures_are_retried_until_success() {
    for failures in 0..3 {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = flaky_registry(failures, Arc::clone(&calls));
        let plan = single_step_plan(&registry, "flaky.call");

        let result = execute(&registry, &plan, &fast_policy(failures + 1));
        assert_eq!(result.status, StepStatus::Success, "failures={failures}");
        assert_eq!(result.attempts, failures + 1);
        assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
        assert_eq!(
            result.output.expect("output")["value"],
            json!(failures + 1)
        );
    }
}

#[test]
fn retry_exhaustion_keeps_the_last_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = flaky_registry(10, Arc::clone(&calls));
    let plan = single_step_plan(&registry, "flaky.call");

    let result = execute(&registry, &plan, &fast_policy(3));
    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.attempts, 3);
    let error = result.error.expect("error");
    assert_eq!(error.kind, StepErrorKind::TransientCapability);
    assert_eq!(error.message, "429 rate limited (call 3)");
}

#[test]
fn permanent_failures_are_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = CapabilityRegistry::new();
    registry
        .register(CapabilityDescriptor::from_fn(
            CapabilityName::parse("auth.call").expect("name"),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CapabilityError::permanent("401 unauthorized"))
            },
        ))
        .expect("register");
    let plan = single_step_plan(&registry, "auth.call");

    let result = execute(&registry, &plan, &fast_policy(5));
    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        result.error.expect("error").kind,
        StepErrorKind::PermanentCapability
    );
}

#[test]
fn timeouts_are_transient_and_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDescriptor::from_fn(
                CapabilityName::parse("slow.call").expect("name"),
                move |_| {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if call == 1 {
                        thread::sleep(Duration::from_millis(300));
                    }
                    Ok(Map::new())
                },
            )
            .with_timeout(Duration::from_millis(30)),
        )
        .expect("register");
    let plan = single_step_plan(&registry, "slow.call");

    let result = execute(&registry, &plan, &fast_policy(2));
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.attempts, 2);
}

#[test]
fn missing_required_output_fields_fail_without_retry() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDescriptor::from_fn(
                CapabilityName::parse("weather.current").expect("name"),
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Map::from_iter([("desc".to_string(), json!("Cloudy"))]))
                },
            )
            .with_output(OutputField::required("temp", ValueKind::Number))
            .with_output(OutputField::required("desc", ValueKind::String)),
        )
        .expect("register");
    let plan = single_step_plan(&registry, "weather.current");

    let result = execute(&registry, &plan, &fast_policy(3));
    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let error = result.error.expect("error");
    assert_eq!(error.kind, StepErrorKind::InvalidOutput);
    assert!(error.message.contains("missing required field `temp`"));
}

#[test]
fn cached_responses_skip_the_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDescriptor::from_fn(
                CapabilityName::parse("weather.current").expect("name"),
                move |arguments: &Map<String, Value>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Map::from_iter([
                        ("temp".to_string(), json!(15)),
                        ("city".to_string(), arguments["city"].clone()),
                    ]))
                },
            )
            .with_input(InputParam::required("city", ValueKind::String))
            .with_cache_ttl(Duration::from_secs(60)),
        )
        .expect("register");
    let plan = validate_plan(
        &PlanDocument {
            task: None,
            steps: vec![PlanStepDocument::new("s1", "weather.current")
                .with_argument("city", json!("London"))],
        },
        &registry,
    )
    .expect("valid plan");

    let cache = ResponseCache::new(10);
    let policy = fast_policy(1);
    let cancellation = RunCancellation::never();
    let executor =
        StepExecutor::new(&registry, &policy, &cancellation, "run-cache").with_cache(Some(&cache));
    let step = plan.step("s1").expect("s1");
    let upstream: Vec<StepResult> = Vec::new();

    let first = executor.execute(step, &upstream);
    let second = executor.execute(step, &upstream);
    assert!(!first.cached);
    assert_eq!(first.attempts, 1);
    assert!(second.cached);
    assert_eq!(second.attempts, 0);
    assert_eq!(second.output, first.output);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let metrics = cache.metrics();
    assert_eq!((metrics.hits, metrics.misses, metrics.entries), (1, 1, 1));
}

#[test]
fn cancellation_interrupts_backoff_waits() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = flaky_registry(10, Arc::clone(&calls));
    let plan = single_step_plan(&registry, "flaky.call");
    let policy = ExecutionPolicy::default()
        .with_max_attempts(5)
        .with_backoff(BackoffPolicy {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(10),
            multiplier: 1,
        });

    let handle = CancelHandle::new();
    let cancellation = RunCancellation::new(None, handle.clone());
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.cancel();
    });

    let started = Instant::now();
    let result = StepExecutor::new(&registry, &policy, &cancellation, "run-cancel")
        .execute(plan.step("s1").expect("s1"), &Vec::<StepResult>::new());
    canceller.join().expect("canceller thread");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.attempts, 1);
    let error = result.error.expect("error");
    assert_eq!(error.kind, StepErrorKind::RunCancelled);
    assert!(error.message.contains("429 rate limited (call 1)"));
}

/// Registers `slow.call`, which sleeps `delay` per call and records the
/// highest number of calls in flight at once.
fn slow_registry(delay: Duration, peak: Arc<AtomicUsize>) -> CapabilityRegistry {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDescriptor::from_fn(
                CapabilityName::parse("slow.call").expect("name"),
                move |_| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(delay);
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(Map::new())
                },
            )
            .with_timeout(Duration::from_millis(20)),
        )
        .expect("register slow.call");
    registry
}

#[test]
fn retries_after_timeouts_never_overlap_the_abandoned_call() {
    let peak = Arc::new(AtomicUsize::new(0));
    let registry = Arc::new(slow_registry(Duration::from_millis(200), Arc::clone(&peak)));
    let engine = Engine::new(
        registry,
        ExecutionPolicy::default()
            .with_max_attempts(3)
            .with_backoff(BackoffPolicy::none()),
    );
    let plan = PlanDocument {
        task: None,
        steps: vec![PlanStepDocument::new("s1", "slow.call")],
    };

    let output = engine.run(&plan).expect("run");

    assert_eq!(output.steps[0].status, StepStatus::Failed);
    assert_eq!(output.steps[0].attempts, 3);
    assert_eq!(
        output
            .issue("s1")
            .and_then(|issue| issue.error.as_ref())
            .map(|error| error.kind),
        Some(StepErrorKind::Timeout)
    );
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[test]
fn cancellation_interrupts_waits_on_timed_out_calls() {
    let peak = Arc::new(AtomicUsize::new(0));
    let registry = slow_registry(Duration::from_secs(2), Arc::clone(&peak));
    let plan = single_step_plan(&registry, "slow.call");
    let policy = ExecutionPolicy::default()
        .with_max_attempts(3)
        .with_backoff(BackoffPolicy::none());

    let handle = CancelHandle::new();
    let cancellation = RunCancellation::new(None, handle.clone());
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.cancel();
    });

    let started = Instant::now();
    let result = StepExecutor::new(&registry, &policy, &cancellation, "run-cancel")
        .execute(plan.step("s1").expect("s1"), &Vec::<StepResult>::new());
    canceller.join().expect("canceller thread");

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.attempts, 1);
    let error = result.error.expect("error");
    assert_eq!(error.kind, StepErrorKind::RunCancelled);
    assert!(error.message.contains("did not answer within 20ms"));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}
