//! Shared compilation state threaded through step compilation.
//!
//! A context lives for one action. It accumulates the DECLARE section,
//! remembers which row variables are bound to which entities, which
//! fields have already been loaded into locals, and which iterator
//! variables are in scope for expression validation.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::EntityDefinition;

/// Which identity a bound row variable holds.
///
/// Resolved lookups yield the internal sequential key; freshly inserted
/// rows are tracked by the external UUID generated for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKey {
    InternalPk,
    ExternalId,
}

/// A local row variable bound to an entity, e.g. `v_contact_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableBinding {
    pub entity: String,
    pub schema: String,
    pub key: RowKey,
}

/// Per-action compilation state.
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
    declarations: Vec<(String, String)>,
    declared: BTreeSet<String>,
    bindings: BTreeMap<String, VariableBinding>,
    loaded_fields: BTreeSet<String>,
    scope: Vec<String>,
    /// The action resolves an existing primary row (update/delete style)
    /// rather than creating one.
    pub targets_existing_row: bool,
    /// Mutation steps append cascade rows for impact metadata.
    pub track_cascades: bool,
}

impl CompileContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary-key variable name for an entity: `v_<entity>_id`.
    pub fn pk_variable(entity: &EntityDefinition) -> String {
        format!("v_{}_id", entity.lower_name())
    }

    /// Add a declaration once; later duplicates are ignored.
    pub fn declare(&mut self, name: &str, declaration: &str) {
        if self.declared.insert(name.to_string()) {
            self.declarations
                .push((name.to_string(), declaration.to_string()));
        }
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    /// Render the DECLARE section body, one variable per line.
    pub fn declarations_block(&self) -> String {
        self.declarations
            .iter()
            .map(|(name, decl)| format!("    {name} {decl};"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn bind_row_variable(&mut self, name: &str, entity: &EntityDefinition, key: RowKey) {
        self.bindings.insert(
            name.to_string(),
            VariableBinding {
                entity: entity.name.clone(),
                schema: entity.schema.clone(),
                key,
            },
        );
    }

    pub fn binding(&self, name: &str) -> Option<&VariableBinding> {
        self.bindings.get(name)
    }

    /// Record a field as loaded into its `v_` local.
    pub fn mark_loaded(&mut self, field: &str) {
        self.loaded_fields.insert(field.to_string());
    }

    pub fn is_loaded(&self, field: &str) -> bool {
        self.loaded_fields.contains(field)
    }

    pub fn push_scope(&mut self, variable: &str) {
        self.scope.push(variable.to_string());
    }

    pub fn pop_scope(&mut self) {
        self.scope.pop();
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }
}
