use crate::registry::ValueKind;

/// A single problem found while accepting a plan.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("plan has no steps")]
    EmptyPlan,
    #[error("step #{position} has invalid id `{step_id}`: {reason}")]
    InvalidStepId {
        position: usize,
        step_id: String,
        reason: String,
    },
    #[error("duplicate step id `{step_id}`")]
    DuplicateStepId { step_id: String },
    #[error("step `{step_id}` uses unknown capability `{capability}`")]
    UnknownCapability { step_id: String, capability: String },
    #[error("step `{step_id}` is missing required argument `{argument}` for `{capability}`")]
    MissingArgument {
        step_id: String,
        capability: String,
        argument: String,
    },
    #[error("step `{step_id}` passes unknown argument `{argument}` to `{capability}`")]
    UnknownArgument {
        step_id: String,
        capability: String,
        argument: String,
    },
    #[error("step `{step_id}` argument `{argument}` has type {found}; expected {expected}")]
    InvalidArgumentType {
        step_id: String,
        argument: String,
        expected: ValueKind,
        found: String,
    },
    #[error("step `{step_id}` argument `{argument}` has bad reference `{reference}`: {reason}")]
    BadReference {
        step_id: String,
        argument: String,
        reference: String,
        reason: String,
    },
}

/// Reasons a plan is refused before any step runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("plan validation failed: {}", summarize(.errors))]
    Invalid { errors: Vec<ValidationError> },
    #[error("cyclic dependency between steps: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
}

impl PlanError {
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::Invalid { errors } => errors,
            Self::CyclicDependency { .. } => &[],
        }
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
