//! Execution-plan orchestration: validates declarative plans against a
//! capability registry, runs them with retry, timeout and failure policy, and
//! verifies the collected results into one structured answer.

pub mod app;
pub mod capabilities;
pub mod config;
pub mod logging;
pub mod orchestration;
pub mod plan;
pub mod registry;
pub mod shared;

pub use orchestration::{
    CancelHandle, Engine, ExecutionMode, ExecutionPolicy, FinalOutput, OverallStatus, StepResult,
    StepStatus,
};
pub use plan::{PlanDocument, PlanError, PlanStepDocument, ValidationError};
pub use registry::{CapabilityDescriptor, CapabilityError, CapabilityRegistry};
