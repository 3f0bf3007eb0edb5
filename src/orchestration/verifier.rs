use crate::orchestration::result::{StepError, StepResult, StepStatus};
use crate::orchestration::run_controller::{AbortReason, RunPhase, RunState};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

const MAX_QUALITY_ISSUES: usize = 5;
const MAX_RETRY_STEPS: usize = 3;
const MAX_SUGGESTIONS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Completed,
    PartiallyCompleted,
    Failed,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Completed => write!(f, "completed"),
            OverallStatus::PartiallyCompleted => write!(f, "partially_completed"),
            OverallStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Output of one succeeded step, as it appears in the answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSection {
    pub step_id: String,
    pub capability: String,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepIssue {
    pub step_id: String,
    pub capability: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub step_id: String,
    pub capability: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDetails {
    pub steps_total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_time_ms: u64,
    pub cached_results: usize,
    /// Share of planned steps that succeeded, in `0.0..=1.0`.
    pub completeness_score: f64,
}

/// Verified, structured result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalOutput {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    pub status: OverallStatus,
    pub phase: RunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<AbortReason>,
    pub summary: String,
    pub answer: Vec<AnswerSection>,
    pub issues: Vec<StepIssue>,
    /// Succeeded steps whose output looks unusable.
    pub quality_issues: Vec<String>,
    /// Failed steps whose error kind makes another run worth trying.
    pub retry_steps: Vec<String>,
    pub suggestions: Vec<String>,
    pub steps: Vec<StepSummary>,
    pub execution: ExecutionDetails,
}

impl FinalOutput {
    pub fn is_completed(&self) -> bool {
        self.status == OverallStatus::Completed
    }

    pub fn section(&self, step_id: &str) -> Option<&AnswerSection> {
        self.answer.iter().find(|section| section.step_id == step_id)
    }

    pub fn issue(&self, step_id: &str) -> Option<&StepIssue> {
        self.issues.iter().find(|issue| issue.step_id == step_id)
    }
}

pub fn classify_status(results: &[StepResult]) -> OverallStatus {
    let succeeded = results.iter().filter(|result| result.is_success()).count();
    if succeeded == 0 {
        OverallStatus::Failed
    } else if succeeded == results.len() {
        OverallStatus::Completed
    } else {
        OverallStatus::PartiallyCompleted
    }
}

pub fn verify(state: &RunState<'_>) -> FinalOutput {
    let plan = state.plan();
    let results = state.results();
    let position_of = |step_id: &str| plan.step(step_id).map_or(usize::MAX, |step| step.position);

    let mut in_plan_order: Vec<&StepResult> = results.iter().collect();
    in_plan_order.sort_by_key(|result| position_of(&result.step_id));

    let answer = in_plan_order
        .iter()
        .filter(|result| result.is_success())
        .map(|result| AnswerSection {
            step_id: result.step_id.clone(),
            capability: result.capability.clone(),
            fields: result.output.clone().unwrap_or_default(),
        })
        .collect();

    let issues = in_plan_order
        .iter()
        .filter(|result| !result.is_success())
        .map(|result| StepIssue {
            step_id: result.step_id.clone(),
            capability: result.capability.clone(),
            status: result.status,
            error: result.error.clone(),
            message: issue_message(result),
        })
        .collect();

    let quality_issues: Vec<String> = in_plan_order
        .iter()
        .filter(|result| result.is_success())
        .filter(|result| result.output.as_ref().map_or(true, Map::is_empty))
        .take(MAX_QUALITY_ISSUES)
        .map(|result| {
            format!(
                "step `{}` ({}) returned empty data",
                result.step_id, result.capability
            )
        })
        .collect();

    let retry_steps: Vec<String> = in_plan_order
        .iter()
        .filter(|result| result.status == StepStatus::Failed)
        .filter(|result| result.error.as_ref().is_some_and(|error| error.kind.is_retryable()))
        .take(MAX_RETRY_STEPS)
        .map(|result| result.step_id.clone())
        .collect();

    let steps = results
        .iter()
        .map(|result| StepSummary {
            step_id: result.step_id.clone(),
            capability: result.capability.clone(),
            status: result.status,
            attempts: result.attempts,
            elapsed_ms: millis(result.elapsed),
            cached: result.cached,
        })
        .collect();

    let execution = execution_details(state);
    let status = classify_status(results);
    let summary = summarize(status, &execution, state.abort_reason());
    let suggestions = suggest(status, &retry_steps);
    if !quality_issues.is_empty() || !retry_steps.is_empty() {
        tracing::info!(
            run_id = %state.run_id(),
            quality_issues = quality_issues.len(),
            retry_steps = retry_steps.len(),
            "verification flagged steps for review"
        );
    }

    FinalOutput {
        run_id: state.run_id().to_string(),
        task: plan.task().map(str::to_string),
        status,
        phase: state.phase(),
        abort_reason: state.abort_reason().cloned(),
        summary,
        answer,
        issues,
        quality_issues,
        retry_steps,
        suggestions,
        steps,
        execution,
    }
}

fn execution_details(state: &RunState<'_>) -> ExecutionDetails {
    let results = state.results();
    let count = |status: StepStatus| {
        results
            .iter()
            .filter(|result| result.status == status)
            .count()
    };
    let steps_total = state.plan().len();
    let succeeded = count(StepStatus::Success);
    ExecutionDetails {
        steps_total,
        succeeded,
        failed: count(StepStatus::Failed),
        skipped: count(StepStatus::Skipped),
        total_time_ms: millis(state.elapsed()),
        cached_results: results.iter().filter(|result| result.cached).count(),
        completeness_score: if steps_total == 0 {
            0.0
        } else {
            succeeded as f64 / steps_total as f64
        },
    }
}

fn issue_message(result: &StepResult) -> String {
    if let Some(error) = &result.error {
        return error.to_string();
    }
    if let Some(reason) = &result.skip_reason {
        return reason.to_string();
    }
    result.status.to_string()
}

fn summarize(
    status: OverallStatus,
    execution: &ExecutionDetails,
    abort_reason: Option<&AbortReason>,
) -> String {
    let mut summary = match status {
        OverallStatus::Completed => format!(
            "All {} step(s) completed successfully.",
            execution.steps_total
        ),
        OverallStatus::PartiallyCompleted => format!(
            "{} of {} step(s) succeeded; {} failed, {} skipped.",
            execution.succeeded, execution.steps_total, execution.failed, execution.skipped
        ),
        OverallStatus::Failed => format!(
            "No step succeeded; {} failed, {} skipped.",
            execution.failed, execution.skipped
        ),
    };
    if let Some(reason) = abort_reason {
        summary.push_str(&format!(" Run aborted: {reason}."));
    }
    summary
}

fn suggest(status: OverallStatus, retry_steps: &[String]) -> Vec<String> {
    let mut suggestions = Vec::new();
    if !retry_steps.is_empty() {
        suggestions.push(format!(
            "Consider retrying failed steps: {}",
            retry_steps.join(", ")
        ));
    }
    if status != OverallStatus::Completed {
        suggestions.push("Some data may be incomplete; results are partial".to_string());
    }
    suggestions.truncate(MAX_SUGGESTIONS);
    suggestions
}

fn millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
