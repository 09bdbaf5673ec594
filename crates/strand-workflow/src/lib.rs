//! Strand Workflow
//!
//! Workflow definitions for the strand execution engine:
//!
//! - the definition model ([`Workflow`], [`Step`], [`Input`])
//! - graph validation (unique steps, known edges, no cycles)
//! - loading definitions from disk through the [`WorkflowLoader`] port
//! - content hashing used to detect definition drift between a recorded
//!   execution and the definition on disk
//!
//! A path runs steps one after another. A step with a single successor
//! continues the path; a step with several successors completes it and
//! starts one child path per successor:
//!
//! ```text
//!   path-1:   fetch -> split
//!                        |-- path-1-1: left  -> merge
//!                        `-- path-1-2: right -> merge
//! ```

mod error;
mod graph;
pub mod hash;
mod loader;
mod workflow;

pub use error::WorkflowError;
pub use graph::Graph;
pub use hash::{
  InputChange, InputChangeKind, WorkflowCompatibility, compare_workflows, hash_inputs,
  hash_workflow,
};
pub use loader::{DEFAULT_WORKFLOW_FILE, FsWorkflowLoader, WorkflowLoader};
pub use workflow::{Input, PathFailureMode, Step, Values, Workflow};
