//! Plan intake: the untrusted document, its static validation and the
//! dependency-ordered view the run controller walks.

pub mod document;
pub mod error;
pub mod resolver;
pub mod validate;
pub mod value;

pub use document::{PlanDocument, PlanDocumentError, PlanStepDocument};
pub use error::{PlanError, ValidationError};
pub use resolver::{resolve_execution_order, ExecutionOrder};
pub use validate::{validate_plan, ValidatedPlan, ValidatedStep};
pub use value::{ArgValue, PathSegment, StepReference};
