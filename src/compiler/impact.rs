//! Impact metadata assembly.
//!
//! Each action declares its impact up front: the primary entity it
//! mutates, static side effects, and cache-invalidation hints. At run
//! time the generated function also accumulates cascade rows for the
//! entities its steps actually touched. This module emits the composite
//! types shared by every generated function and the per-action block
//! that assembles the metadata into `v_result.extra_metadata`.
//!
//! Assembly is a pure function of its inputs. Compiling the same impact
//! twice yields byte-identical output.

use std::collections::BTreeMap;

use crate::ast::{ActionImpact, CacheInvalidation, EntityDefinition, EntityImpact};
use crate::compiler::context::{CompileContext, RowKey};
use crate::registry::GenerationSession;
use crate::sql;

/// DDL for the shared metadata composite types, emitted once per
/// [`GenerationSession`].
pub const METADATA_TYPES_DDL: &str = "\
CREATE SCHEMA IF NOT EXISTS mutation_metadata;

CREATE TYPE mutation_metadata.entity_impact AS (
    entity TEXT,
    operation TEXT,
    schema_name TEXT,
    fields TEXT[],
    entity_id TEXT
);

CREATE TYPE mutation_metadata.cache_invalidation AS (
    query_name TEXT,
    filter JSONB,
    strategy TEXT,
    reason TEXT
);

CREATE TYPE mutation_metadata.mutation_impact_metadata AS (
    primary_entity mutation_metadata.entity_impact,
    actual_side_effects mutation_metadata.entity_impact[],
    cache_invalidations mutation_metadata.cache_invalidation[],
    cascade_updated mutation_metadata.entity_impact[],
    cascade_deleted mutation_metadata.entity_impact[]
);
";

/// Emit the shared metadata types if this session has not yet done so.
pub fn emit_metadata_types(session: &mut GenerationSession) -> Option<&'static str> {
    session
        .mark_emitted("mutation_metadata_types")
        .then_some(METADATA_TYPES_DDL)
}

/// Compiles an action's declared impact into metadata assembly SQL.
pub struct ImpactCompiler<'a> {
    entities: &'a BTreeMap<String, EntityDefinition>,
}

impl<'a> ImpactCompiler<'a> {
    pub fn new(entities: &'a BTreeMap<String, EntityDefinition>) -> Self {
        Self { entities }
    }

    /// Add the metadata declarations for an action that carries an impact
    /// and turn on cascade tracking for its mutation steps.
    pub fn declare(&self, ctx: &mut CompileContext, impact: Option<&ActionImpact>) {
        if impact.is_none() {
            return;
        }
        ctx.declare("v_meta", "mutation_metadata.mutation_impact_metadata");
        ctx.declare(
            "v_cascade_updated",
            "mutation_metadata.entity_impact[] := '{}'",
        );
        ctx.declare(
            "v_cascade_deleted",
            "mutation_metadata.entity_impact[] := '{}'",
        );
        ctx.track_cascades = true;
    }

    /// The metadata-assembly block that runs after all steps succeeded.
    pub fn compile(
        &self,
        ctx: &CompileContext,
        impact: Option<&ActionImpact>,
        primary: &EntityDefinition,
    ) -> String {
        let Some(impact) = impact else {
            return "v_result.extra_metadata := '{}'::jsonb;\n".to_string();
        };

        let mut block = String::new();
        block.push_str(&format!(
            "v_meta.primary_entity := {};\n",
            self.entity_row(ctx, &impact.primary, primary),
        ));

        if !impact.side_effects.is_empty() {
            let rows = impact
                .side_effects
                .iter()
                .map(|effect| format!("    {}", self.entity_row(ctx, effect, primary)))
                .collect::<Vec<_>>()
                .join(",\n");
            block.push_str(&format!(
                "v_meta.actual_side_effects := ARRAY[\n{rows}\n];\n"
            ));
        }

        if !impact.cache_invalidations.is_empty() {
            let rows = impact
                .cache_invalidations
                .iter()
                .map(|inv| format!("    {}", invalidation_row(inv)))
                .collect::<Vec<_>>()
                .join(",\n");
            block.push_str(&format!(
                "v_meta.cache_invalidations := ARRAY[\n{rows}\n];\n"
            ));
        }

        if ctx.is_declared("v_cascade_updated") {
            block.push_str("v_meta.cascade_updated := v_cascade_updated;\n");
            block.push_str("v_meta.cascade_deleted := v_cascade_deleted;\n");
        }

        let mut json_args = vec!["'_meta', to_jsonb(v_meta)".to_string()];
        for effect in &impact.side_effects {
            if let Some(collection) = &effect.collection {
                if let Some(subquery) = self.collection_query(ctx, effect, primary) {
                    json_args.push(format!("{}, {subquery}", sql::quote_literal(collection)));
                }
            }
        }
        block.push_str(&format!(
            "v_result.extra_metadata := jsonb_build_object({});\n",
            json_args.join(", "),
        ));
        block
    }

    /// `ROW(entity, operation, schema, fields, id)::mutation_metadata.entity_impact`
    fn entity_row(
        &self,
        ctx: &CompileContext,
        impact: &EntityImpact,
        primary: &EntityDefinition,
    ) -> String {
        let schema = self
            .entities
            .get(&impact.entity)
            .map(|e| e.schema.clone())
            .unwrap_or_else(|| primary.schema.clone());
        let id_var = format!("v_{}_id", impact.entity.to_lowercase());
        let id_expr = if ctx.is_declared(&id_var) {
            format!("{id_var}::TEXT")
        } else {
            "NULL".to_string()
        };
        format!(
            "ROW({entity}, '{operation}', {schema}, {fields}, {id_expr})::mutation_metadata.entity_impact",
            entity = sql::quote_literal(&impact.entity),
            operation = impact.operation,
            schema = sql::quote_literal(&schema),
            fields = sql::text_array(&impact.fields),
        )
    }

    /// Aggregate the side-effect rows linked to the primary row into a
    /// JSONB array, for impacts that name an output collection.
    fn collection_query(
        &self,
        ctx: &CompileContext,
        effect: &EntityImpact,
        primary: &EntityDefinition,
    ) -> Option<String> {
        let side = self.entities.get(&effect.entity)?;
        let pk_var = CompileContext::pk_variable(primary);
        let binding = ctx.binding(&pk_var)?;
        let key_expr = match binding.key {
            RowKey::InternalPk => pk_var,
            // Fresh inserts hold the external UUID; join through it.
            RowKey::ExternalId => format!(
                "(SELECT {pk} FROM {table} WHERE id = {pk_var})",
                pk = primary.pk_column(),
                table = primary.qualified_table(),
            ),
        };
        Some(format!(
            "(SELECT COALESCE(jsonb_agg(to_jsonb(t)), '[]'::jsonb) FROM {table} t WHERE t.fk_{primary_lower} = {key_expr})",
            table = side.qualified_table(),
            primary_lower = primary.lower_name(),
        ))
    }
}

fn invalidation_row(invalidation: &CacheInvalidation) -> String {
    let filter = match &invalidation.filter {
        Some(value) => format!("{}::jsonb", sql::quote_literal(&value.to_string())),
        None => "NULL".to_string(),
    };
    format!(
        "ROW({query}, {filter}, '{strategy}', {reason})::mutation_metadata.cache_invalidation",
        query = sql::quote_literal(&invalidation.query),
        strategy = invalidation.strategy,
        reason = sql::quote_literal(&invalidation.reason),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FieldDefinition, ImpactOperation, InvalidationStrategy};

    fn entities() -> BTreeMap<String, EntityDefinition> {
        let mut map = BTreeMap::new();
        map.insert(
            "Contact".to_string(),
            EntityDefinition::new("Contact", "crm", vec![FieldDefinition::basic("status", "text")]),
        );
        map.insert(
            "Notification".to_string(),
            EntityDefinition::new(
                "Notification",
                "crm",
                vec![FieldDefinition::basic("body", "text")],
            ),
        );
        map
    }

    fn resolved_ctx(entities: &BTreeMap<String, EntityDefinition>) -> CompileContext {
        let mut ctx = CompileContext::new();
        let contact = entities.get("Contact").unwrap();
        let var = CompileContext::pk_variable(contact);
        ctx.declare(&var, "INTEGER");
        ctx.bind_row_variable(&var, contact, RowKey::InternalPk);
        ctx
    }

    fn sample_impact() -> ActionImpact {
        let mut impact = ActionImpact::new(
            EntityImpact::new("Contact", ImpactOperation::Update)
                .with_fields(&["status", "updated_at"]),
        );
        impact.side_effects.push(
            EntityImpact::new("Notification", ImpactOperation::Create)
                .with_collection("createdNotifications"),
        );
        impact.cache_invalidations.push(CacheInvalidation {
            query: "contacts_list".to_string(),
            filter: None,
            strategy: InvalidationStrategy::Refetch,
            reason: "Contact status changed".to_string(),
        });
        impact
    }

    #[test]
    fn no_impact_yields_empty_metadata() {
        let entities = entities();
        let compiler = ImpactCompiler::new(&entities);
        let ctx = CompileContext::new();
        let contact = entities.get("Contact").unwrap();
        assert_eq!(
            compiler.compile(&ctx, None, contact),
            "v_result.extra_metadata := '{}'::jsonb;\n"
        );
    }

    #[test]
    fn primary_row_carries_operation_and_fields() {
        let entities = entities();
        let compiler = ImpactCompiler::new(&entities);
        let mut ctx = resolved_ctx(&entities);
        let contact = entities.get("Contact").unwrap();
        let impact = sample_impact();
        compiler.declare(&mut ctx, Some(&impact));

        let block = compiler.compile(&ctx, Some(&impact), contact);
        assert!(block.contains(
            "v_meta.primary_entity := ROW('Contact', 'UPDATE', 'crm', ARRAY['status', 'updated_at'], v_contact_id::TEXT)::mutation_metadata.entity_impact;"
        ));
        assert!(block.contains("ROW('contacts_list', NULL, 'REFETCH', 'Contact status changed')::mutation_metadata.cache_invalidation"));
        assert!(block.contains("v_meta.cascade_updated := v_cascade_updated;"));
    }

    #[test]
    fn named_collections_are_projected() {
        let entities = entities();
        let compiler = ImpactCompiler::new(&entities);
        let mut ctx = resolved_ctx(&entities);
        let contact = entities.get("Contact").unwrap();
        let impact = sample_impact();
        compiler.declare(&mut ctx, Some(&impact));

        let block = compiler.compile(&ctx, Some(&impact), contact);
        assert!(block.contains("'createdNotifications', (SELECT COALESCE(jsonb_agg(to_jsonb(t)), '[]'::jsonb) FROM crm.tb_notification t WHERE t.fk_contact = v_contact_id)"));
    }

    #[test]
    fn assembly_is_deterministic() {
        let entities = entities();
        let compiler = ImpactCompiler::new(&entities);
        let mut ctx = resolved_ctx(&entities);
        let contact = entities.get("Contact").unwrap();
        let impact = sample_impact();
        compiler.declare(&mut ctx, Some(&impact));

        let first = compiler.compile(&ctx, Some(&impact), contact);
        let second = compiler.compile(&ctx, Some(&impact), contact);
        assert_eq!(first, second);
    }

    #[test]
    fn metadata_types_emit_once_per_session() {
        let mut session = GenerationSession::new();
        assert!(emit_metadata_types(&mut session).is_some());
        assert!(emit_metadata_types(&mut session).is_none());
    }
}
