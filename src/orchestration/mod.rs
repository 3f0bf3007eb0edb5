//! Run-time half of the engine: step execution, run control and verification.

pub mod cache;
pub mod engine;
pub mod policy;
pub mod result;
pub mod run_controller;
pub mod step_execution;
pub mod verifier;

pub use cache::{CacheMetrics, ResponseCache};
pub use engine::Engine;
pub use policy::{BackoffPolicy, CancelHandle, ExecutionMode, ExecutionPolicy, RunCancellation};
pub use result::{SkipReason, StepError, StepErrorKind, StepResult, StepStatus};
pub use run_controller::{AbortReason, RunController, RunPhase, RunState};
pub use step_execution::{execute_step, StepExecutor, UpstreamLookup};
pub use verifier::{
    classify_status, verify, AnswerSection, ExecutionDetails, FinalOutput, OverallStatus,
    StepIssue, StepSummary,
};
