//! Reference resolution: `ref(Entity).field` → pk lookup statements.
//!
//! Every entity table carries a dual-key identity: an internal sequential
//! `pk_<entity>` for joins and an external UUID `id` for public
//! references. A generated `<schema>.<entity>_pk(...)` helper converts
//! external identifiers to internal keys. This module emits calls to
//! those helpers plus the not-found short-circuit that follows each one.
//!
//! Tenant isolation happens here: when the target schema is
//! tenant-scoped, the lookup always receives `auth_tenant_id`, so a
//! caller can never resolve another tenant's rows.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::ast::EntityDefinition;
use crate::compiler::context::{CompileContext, RowKey};
use crate::error::{CompileError, Result};
use crate::registry::SchemaRegistry;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^ref\((\w+)\)\.(\w+)$").unwrap());

/// A resolved reference: the bound variable plus the statements that
/// populate and guard it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    /// Variable holding the internal key, e.g. `v_contact_id`.
    pub variable: String,
    /// Lookup assignment followed by the not-found guard.
    pub sql: String,
    pub entity: String,
    pub schema: String,
}

/// Resolves `ref(Entity).field` references against the known entities.
#[derive(Debug, Clone)]
pub struct ReferenceResolver<'a> {
    registry: &'a SchemaRegistry,
    entities: &'a BTreeMap<String, EntityDefinition>,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        entities: &'a BTreeMap<String, EntityDefinition>,
    ) -> Self {
        Self { registry, entities }
    }

    /// Resolve a `ref(Entity).field` reference, with `value_sql` supplying
    /// the external identifier (a parameter, a local, or a literal already
    /// formatted by the caller).
    pub fn resolve(
        &self,
        ctx: &mut CompileContext,
        reference: &str,
        value_sql: &str,
    ) -> Result<ResolvedReference> {
        let caps = REFERENCE
            .captures(reference)
            .ok_or_else(|| CompileError::InvalidReference {
                reference: reference.to_string(),
            })?;
        let entity_name = &caps[1];
        let entity = self
            .entities
            .get(entity_name)
            .ok_or_else(|| CompileError::UnknownEntity {
                name: entity_name.to_string(),
                step: "reference",
            })?;

        let variable = CompileContext::pk_variable(entity);
        ctx.declare(&variable, "INTEGER");
        ctx.bind_row_variable(&variable, entity, RowKey::InternalPk);

        Ok(ResolvedReference {
            sql: self.lookup_block(entity, &variable, value_sql),
            variable,
            entity: entity.name.clone(),
            schema: entity.schema.clone(),
        })
    }

    /// The primary-row resolution for update/delete style actions: the
    /// external identifier arrives as `p_<entity>_id`.
    pub fn resolve_primary(
        &self,
        ctx: &mut CompileContext,
        entity: &EntityDefinition,
    ) -> ResolvedReference {
        let variable = CompileContext::pk_variable(entity);
        ctx.declare(&variable, "INTEGER");
        ctx.bind_row_variable(&variable, entity, RowKey::InternalPk);

        let value = format!("p_{}_id", entity.lower_name());
        ResolvedReference {
            sql: self.lookup_block(entity, &variable, &value),
            variable,
            entity: entity.name.clone(),
            schema: entity.schema.clone(),
        }
    }

    /// Foreign-key resolution for a reference field on `entity`: resolves
    /// the target entity's key into `v_fk_<field>`.
    pub fn resolve_field(
        &self,
        ctx: &mut CompileContext,
        entity: &EntityDefinition,
        field: &str,
        value_sql: &str,
    ) -> Result<ResolvedReference> {
        let field_def = entity.fields.get(field).ok_or_else(|| {
            CompileError::Security(crate::error::SecurityError::UnknownIdentifier {
                name: field.to_string(),
            })
        })?;
        let target_name =
            field_def
                .reference_entity
                .as_deref()
                .ok_or_else(|| CompileError::InvalidReference {
                    reference: format!("ref({}).{field}", entity.name),
                })?;
        let target = self
            .entities
            .get(target_name)
            .ok_or_else(|| CompileError::UnknownEntity {
                name: target_name.to_string(),
                step: "reference",
            })?;

        let variable = format!("v_fk_{field}");
        ctx.declare(&variable, "INTEGER");

        let lookup = self.lookup_call(target, value_sql);
        let mut sql = format!("{variable} := {lookup};\n");
        if !field_def.nullable {
            sql.push_str(&format!(
                "IF {variable} IS NULL THEN\n    v_result.status := 'failed:not_found';\n    v_result.message := '{} not found';\n    RETURN v_result;\nEND IF;\n",
                target.name
            ));
        }

        Ok(ResolvedReference {
            variable,
            sql,
            entity: target.name.clone(),
            schema: target.schema.clone(),
        })
    }

    fn lookup_call(&self, entity: &EntityDefinition, value_sql: &str) -> String {
        let helper = format!("{}.{}_pk", entity.schema, entity.lower_name());
        if self.registry.is_tenant_scoped(&entity.schema) {
            format!("{helper}({value_sql}, auth_tenant_id)")
        } else {
            format!("{helper}({value_sql})")
        }
    }

    fn lookup_block(&self, entity: &EntityDefinition, variable: &str, value_sql: &str) -> String {
        format!(
            "{variable} := {call};\nIF {variable} IS NULL THEN\n    v_result.status := 'failed:not_found';\n    v_result.message := '{name} not found';\n    RETURN v_result;\nEND IF;\n",
            call = self.lookup_call(entity, value_sql),
            name = entity.name,
        )
    }
}
