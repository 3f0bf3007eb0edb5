use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    UnresolvedReference,
    TransientCapability,
    PermanentCapability,
    Timeout,
    InvalidOutput,
    RunCancelled,
}

impl StepErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientCapability | Self::Timeout)
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedReference => write!(f, "unresolved_reference"),
            Self::TransientCapability => write!(f, "transient_capability"),
            Self::PermanentCapability => write!(f, "permanent_capability"),
            Self::Timeout => write!(f, "timeout"),
            Self::InvalidOutput => write!(f, "invalid_output"),
            Self::RunCancelled => write!(f, "run_cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    UpstreamNotSucceeded { step_ids: Vec<String> },
    CriticalStepFailed { step_id: String },
    RunCancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamNotSucceeded { step_ids } => {
                write!(f, "upstream step(s) did not succeed: {}", step_ids.join(", "))
            }
            SkipReason::CriticalStepFailed { step_id } => {
                write!(f, "run aborted after critical step `{step_id}` failed")
            }
            SkipReason::RunCancelled => write!(f, "run cancelled before the step was dispatched"),
        }
    }
}

/// Recorded outcome of one step. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub capability: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    #[serde(default)]
    pub cached: bool,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(
        step_id: impl Into<String>,
        capability: impl Into<String>,
        output: Map<String, Value>,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            capability: capability.into(),
            status: StepStatus::Success,
            output: Some(output),
            error: None,
            skip_reason: None,
            attempts,
            elapsed,
            cached: false,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        capability: impl Into<String>,
        error: StepError,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            capability: capability.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            skip_reason: None,
            attempts,
            elapsed,
            cached: false,
            completed_at: Utc::now(),
        }
    }

    pub fn skipped(
        step_id: impl Into<String>,
        capability: impl Into<String>,
        reason: SkipReason,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            capability: capability.into(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            skip_reason: Some(reason),
            attempts: 0,
            elapsed: Duration::ZERO,
            cached: false,
            completed_at: Utc::now(),
        }
    }

    pub(crate) fn from_cache(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
