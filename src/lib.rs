//! actiongen - Declarative action compilation for PostgreSQL backends
//!
//! This crate compiles a declarative entity/action description into
//! PL/pgSQL mutation functions plus structured impact metadata. Teams
//! describe entities and named state transitions ("actions"); the
//! compiler produces stored procedures implementing validation,
//! reference resolution, persistence, and change-impact reporting.
//!
//! ## Pipeline
//! Entity + Action AST -> Expression Compiler -> Step Compiler ->
//! Orchestrator -> PL/pgSQL function + metadata types
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use actiongen::ast::{ActionDefinition, ActionStep, EntityDefinition, FieldDefinition};
//! use actiongen::compiler::ActionOrchestrator;
//! use actiongen::registry::{GenerationSession, SchemaRegistry};
//!
//! let mut entities = BTreeMap::new();
//! entities.insert(
//!     "Contact".to_string(),
//!     EntityDefinition::new(
//!         "Contact",
//!         "crm",
//!         vec![FieldDefinition::basic("status", "text")],
//!     ),
//! );
//! let registry = SchemaRegistry::with_defaults();
//! let action = ActionDefinition {
//!     name: "archive_contact".to_string(),
//!     requires: None,
//!     steps: vec![ActionStep::Delete {
//!         entity: "Contact".to_string(),
//!         hard: false,
//!         dependents: Vec::new(),
//!     }],
//!     impact: None,
//! };
//!
//! let orchestrator = ActionOrchestrator::new(&registry, &entities);
//! let mut session = GenerationSession::new();
//! let sql = orchestrator
//!     .compile_action(&mut session, &action, entities.get("Contact").unwrap())
//!     .unwrap();
//! assert!(sql.contains("CREATE OR REPLACE FUNCTION crm.archive_contact("));
//! ```

// Core error handling
pub mod error;

// Entity, action, and impact AST types
pub mod ast;

// Schema-scoping registry and generation sessions
pub mod registry;

// SQL formatting helpers
pub mod sql;

// The compilation pipeline
pub mod compiler;

pub use compiler::{ActionOrchestrator, ExpressionCompiler, ReferenceResolver, StepCompiler};
pub use error::{CompileError, Result, SecurityError};
pub use registry::{GenerationSession, SchemaRegistry};
