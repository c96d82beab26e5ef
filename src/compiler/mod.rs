//! Action compilation pipeline.
//!
//! Leaf to root: the expression compiler turns guarded condition/value
//! text into safe SQL fragments, the reference resolver emits pk lookup
//! statements, the step compiler dispatches over the closed step set,
//! and the orchestrator assembles whole mutation functions with impact
//! metadata.

pub mod context;
pub mod expression;
pub mod impact;
pub mod orchestrator;
pub mod steps;
pub mod trinity;

pub use context::{CompileContext, RowKey, VariableBinding};
pub use expression::{ExpressionCompiler, VarPrefix};
pub use impact::{ImpactCompiler, METADATA_TYPES_DDL};
pub use orchestrator::{ActionOrchestrator, MUTATION_RESULT_DDL};
pub use steps::StepCompiler;
pub use trinity::{ReferenceResolver, ResolvedReference};
