//! # tenon-api
//!
//! The Tenon object model.
//!
//! This crate defines the persisted schemas for the four run resources and
//! the machinery around them:
//!
//! - **Task / Pipeline**: reusable definitions (steps, sidecars, params,
//!   results, workspaces; a DAG of pipeline tasks plus a `finally` group)
//! - **TaskRun / PipelineRun**: execution instances with status
//! - **Conversion**: the legacy revision `vA` round-trips losslessly
//!   through the authoritative revision `vB` defined here, with lossy
//!   fields preserved in the `tenon.io/` annotation namespace
//! - **Validation**: structural and semantic checks producing structured,
//!   aggregated field errors
//! - **Substitution**: the typed `$(...)` variable resolution engine
//!
//! The serialized field names, enum literals, and duration strings in this
//! crate are part of the compatibility surface.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod convert;
pub mod duration;
pub mod param;
pub mod pipeline;
pub mod pipelinerun;
pub mod subst;
pub mod task;
pub mod taskrun;
pub mod validate;
pub mod workspace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::duration::ApiDuration;
    pub use crate::param::{Param, ParamSpec, ParamType, ParamValue};
    pub use crate::pipeline::{
        Pipeline, PipelineResult, PipelineSpec, PipelineTask, TaskRef, WhenExpression,
    };
    pub use crate::pipelinerun::{PipelineRun, PipelineRunSpec, PipelineRunStatus, TimeoutFields};
    pub use crate::subst::Substitutions;
    pub use crate::task::{Sidecar, Step, Task, TaskResult, TaskSpec};
    pub use crate::taskrun::{StepState, TaskRun, TaskRunSpec, TaskRunStatus};
    pub use crate::validate::{FieldError, FieldErrorList, Validate};
    pub use crate::workspace::{WorkspaceBinding, WorkspaceDeclaration};
}
