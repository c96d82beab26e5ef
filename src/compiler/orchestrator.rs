//! Action orchestration: one ActionDefinition → one PL/pgSQL function.
//!
//! The orchestrator owns function-level concerns: the parameter list,
//! the DECLARE section, the permission guard, primary-row resolution,
//! step sequencing, impact assembly, the success return, and the
//! catch-all exception handler. The per-step SQL itself comes from the
//! step compiler.

use std::collections::BTreeMap;

use tracing::info;

use crate::ast::{ActionDefinition, ActionStep, EntityDefinition};
use crate::compiler::context::{CompileContext, RowKey};
use crate::compiler::expression::{ExpressionCompiler, VarPrefix};
use crate::compiler::impact::{self, ImpactCompiler};
use crate::compiler::steps::StepCompiler;
use crate::compiler::trinity::ReferenceResolver;
use crate::error::Result;
use crate::registry::{GenerationSession, SchemaRegistry};
use crate::sql;

/// DDL for the shared result type, emitted once per [`GenerationSession`].
pub const MUTATION_RESULT_DDL: &str = "\
CREATE SCHEMA IF NOT EXISTS app;

CREATE TYPE app.mutation_result AS (
    id UUID,
    updated_fields TEXT[],
    status TEXT,
    message TEXT,
    object_data JSONB,
    extra_metadata JSONB
);
";

/// Compiles actions into complete mutation functions.
pub struct ActionOrchestrator<'a> {
    registry: &'a SchemaRegistry,
    entities: &'a BTreeMap<String, EntityDefinition>,
    expressions: ExpressionCompiler,
}

impl<'a> ActionOrchestrator<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        entities: &'a BTreeMap<String, EntityDefinition>,
    ) -> Self {
        Self {
            registry,
            entities,
            expressions: ExpressionCompiler::new(),
        }
    }

    /// Compile one action against its primary entity. Shared type DDL is
    /// prepended the first time a session needs it.
    pub fn compile_action(
        &self,
        session: &mut GenerationSession,
        action: &ActionDefinition,
        entity: &'a EntityDefinition,
    ) -> Result<String> {
        info!(action = %action.name, entity = %entity.name, "compiling action");

        let mut ctx = CompileContext::new();
        ctx.targets_existing_row = targets_existing_row(action, entity);

        let steps = StepCompiler::new(self.registry, self.entities);
        let resolver = ReferenceResolver::new(self.registry, self.entities);
        let impacts = ImpactCompiler::new(self.entities);

        let mut body = String::new();

        if let Some(guard) = &action.requires {
            let compiled =
                self.expressions
                    .compile_with_prefix(guard, entity, VarPrefix::Param)?;
            body.push_str(&format!(
                "IF NOT ({compiled}) THEN\n    v_result.status := 'failed:forbidden';\n    v_result.message := 'Not authorized';\n    RETURN v_result;\nEND IF;\n"
            ));
        }

        if ctx.targets_existing_row {
            body.push_str(&resolver.resolve_primary(&mut ctx, entity).sql);
        }

        impacts.declare(&mut ctx, action.impact.as_ref());

        body.push_str(&steps.compile_steps(&mut ctx, &action.steps, entity)?);
        if !body.ends_with('\n') {
            body.push('\n');
        }

        body.push_str(&impacts.compile(&ctx, action.impact.as_ref(), entity));
        body.push_str(&self.success_return(&ctx, action, entity));

        let mut output = String::new();
        if session.mark_emitted("app.mutation_result") {
            output.push_str(MUTATION_RESULT_DDL);
            output.push('\n');
        }
        if action.impact.is_some() {
            if let Some(ddl) = impact::emit_metadata_types(session) {
                output.push_str(ddl);
                output.push('\n');
            }
        }
        output.push_str(&self.render_function(action, entity, &ctx, &body));
        Ok(output)
    }

    fn success_return(
        &self,
        ctx: &CompileContext,
        action: &ActionDefinition,
        entity: &EntityDefinition,
    ) -> String {
        let mut block = String::new();

        let pk_var = CompileContext::pk_variable(entity);
        if let Some(binding) = ctx.binding(&pk_var) {
            let id_expr = match binding.key {
                RowKey::InternalPk => format!("p_{}_id", entity.lower_name()),
                RowKey::ExternalId => pk_var.clone(),
            };
            block.push_str(&format!("v_result.id := {id_expr};\n"));
            let predicate = match binding.key {
                RowKey::InternalPk => format!("{} = {pk_var}", entity.pk_column()),
                RowKey::ExternalId => format!("id = {pk_var}"),
            };
            block.push_str(&format!(
                "v_result.object_data := (SELECT to_jsonb(t) FROM {} t WHERE t.{predicate});\n",
                entity.qualified_table(),
            ));
        }

        if let Some(impact) = &action.impact {
            if !impact.primary.fields.is_empty() {
                block.push_str(&format!(
                    "v_result.updated_fields := {};\n",
                    sql::text_array(&impact.primary.fields),
                ));
            }
        }

        block.push_str(&format!(
            "v_result.status := 'success';\nv_result.message := {};\nRETURN v_result;\n",
            sql::quote_literal(&format!("{} completed", action.name)),
        ));
        block
    }

    fn render_function(
        &self,
        action: &ActionDefinition,
        entity: &EntityDefinition,
        ctx: &CompileContext,
        body: &str,
    ) -> String {
        let params = self.parameters(action, entity);
        let declarations = ctx.declarations_block();
        let declare_tail = if declarations.is_empty() {
            String::new()
        } else {
            format!("\n{declarations}")
        };

        format!(
            "CREATE OR REPLACE FUNCTION {schema}.{name}(\n    {params}\n)\nRETURNS app.mutation_result AS $$\nDECLARE\n    v_result app.mutation_result;{declare_tail}\nBEGIN\n{body}\nEXCEPTION\n    WHEN OTHERS THEN\n        v_result.status := 'failed:exception';\n        v_result.message := SQLERRM;\n        RETURN v_result;\nEND;\n$$ LANGUAGE plpgsql;\n",
            schema = entity.schema,
            name = action.name,
            params = params.join(",\n    "),
            body = sql::indent(body, 1),
        )
    }

    fn parameters(&self, action: &ActionDefinition, entity: &EntityDefinition) -> Vec<String> {
        let mut params = Vec::new();
        if targets_existing_row(action, entity) {
            params.push(format!("p_{}_id UUID", entity.lower_name()));
        }
        for (name, field) in &entity.fields {
            if field.is_reference() {
                params.push(format!("p_{name}_id UUID DEFAULT NULL"));
            } else {
                params.push(format!("p_{name} {} DEFAULT NULL", field.pg_type()));
            }
        }
        params.push("auth_tenant_id UUID DEFAULT NULL".to_string());
        params.push("auth_user_id UUID DEFAULT NULL".to_string());
        params
    }
}

/// Whether an action operates on an existing primary row. Creating the
/// primary entity rules it out; otherwise any row-scoped step rules it in.
fn targets_existing_row(action: &ActionDefinition, entity: &EntityDefinition) -> bool {
    if inserts_entity(&action.steps, &entity.name) {
        return false;
    }
    needs_row(&action.steps)
}

fn inserts_entity(steps: &[ActionStep], entity: &str) -> bool {
    steps.iter().any(|step| match step {
        ActionStep::Insert { entity: name, .. } => name == entity,
        ActionStep::If {
            then_steps,
            else_steps,
            ..
        } => inserts_entity(then_steps, entity) || inserts_entity(else_steps, entity),
        ActionStep::Switch {
            cases,
            default_steps,
            ..
        } => {
            cases.iter().any(|c| inserts_entity(&c.steps, entity))
                || inserts_entity(default_steps, entity)
        }
        ActionStep::Foreach { body, .. } => inserts_entity(body, entity),
        _ => false,
    })
}

fn needs_row(steps: &[ActionStep]) -> bool {
    steps.iter().any(|step| match step {
        ActionStep::Validate { .. }
        | ActionStep::Update { .. }
        | ActionStep::Delete { .. }
        | ActionStep::Foreach { .. } => true,
        ActionStep::If {
            then_steps,
            else_steps,
            ..
        } => needs_row(then_steps) || needs_row(else_steps),
        ActionStep::Switch {
            cases,
            default_steps,
            ..
        } => cases.iter().any(|c| needs_row(&c.steps)) || needs_row(default_steps),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        ActionImpact, EntityImpact, FieldDefinition, ImpactOperation,
    };
    use serde_json::Value as JsonValue;

    fn entities() -> BTreeMap<String, EntityDefinition> {
        let mut map = BTreeMap::new();
        map.insert(
            "Contact".to_string(),
            EntityDefinition::new(
                "Contact",
                "crm",
                vec![
                    FieldDefinition::basic("email", "text"),
                    FieldDefinition::basic("status", "text"),
                    FieldDefinition::basic("lead_score", "integer"),
                ],
            ),
        );
        map
    }

    fn qualify_lead() -> ActionDefinition {
        let mut fields = BTreeMap::new();
        fields.insert(
            "status".to_string(),
            JsonValue::String("qualified".to_string()),
        );
        ActionDefinition {
            name: "qualify_lead".to_string(),
            requires: Some("auth_user_id IS NOT NULL".to_string()),
            steps: vec![
                ActionStep::Validate {
                    expression: "status = 'lead' AND lead_score >= 50".to_string(),
                    error: Some("Contact is not a qualified lead".to_string()),
                },
                ActionStep::Update {
                    entity: "Contact".to_string(),
                    fields,
                    where_clause: None,
                },
            ],
            impact: Some(ActionImpact::new(
                EntityImpact::new("Contact", ImpactOperation::Update)
                    .with_fields(&["status", "updated_at"]),
            )),
        }
    }

    #[test]
    fn update_action_has_full_function_shape() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let orchestrator = ActionOrchestrator::new(&registry, &entities);
        let mut session = GenerationSession::new();
        let contact = entities.get("Contact").unwrap();

        let sql = orchestrator
            .compile_action(&mut session, &qualify_lead(), contact)
            .unwrap();

        assert!(sql.contains("CREATE OR REPLACE FUNCTION crm.qualify_lead("));
        assert!(sql.contains("p_contact_id UUID"));
        assert!(sql.contains("p_lead_score INTEGER DEFAULT NULL"));
        assert!(sql.contains("auth_tenant_id UUID DEFAULT NULL"));
        assert!(sql.contains("RETURNS app.mutation_result AS $$"));
        assert!(sql.contains("v_contact_id := crm.contact_pk(p_contact_id, auth_tenant_id);"));
        assert!(sql.contains("'failed:forbidden'"));
        assert!(sql.contains("WHEN OTHERS THEN"));
        assert!(sql.contains("v_result.message := SQLERRM;"));
        assert!(sql.contains("v_result.updated_fields := ARRAY['status', 'updated_at'];"));
        assert!(sql.contains("$$ LANGUAGE plpgsql;"));
    }

    #[test]
    fn guard_runs_before_row_resolution_and_steps() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let orchestrator = ActionOrchestrator::new(&registry, &entities);
        let mut session = GenerationSession::new();
        let contact = entities.get("Contact").unwrap();

        let sql = orchestrator
            .compile_action(&mut session, &qualify_lead(), contact)
            .unwrap();

        let guard = sql.find("'failed:forbidden'").unwrap();
        let lookup = sql.find("crm.contact_pk(").unwrap();
        let update = sql.find("UPDATE crm.tb_contact").unwrap();
        assert!(guard < lookup && lookup < update);
    }

    #[test]
    fn shared_types_emit_once_per_session() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let orchestrator = ActionOrchestrator::new(&registry, &entities);
        let mut session = GenerationSession::new();
        let contact = entities.get("Contact").unwrap();

        let first = orchestrator
            .compile_action(&mut session, &qualify_lead(), contact)
            .unwrap();
        let second = orchestrator
            .compile_action(&mut session, &qualify_lead(), contact)
            .unwrap();

        assert!(first.contains("CREATE TYPE app.mutation_result"));
        assert!(first.contains("CREATE TYPE mutation_metadata.entity_impact"));
        assert!(!second.contains("CREATE TYPE app.mutation_result"));
        assert!(!second.contains("CREATE TYPE mutation_metadata.entity_impact"));
    }

    #[test]
    fn compilation_is_deterministic() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let orchestrator = ActionOrchestrator::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();

        let mut first_session = GenerationSession::new();
        let mut second_session = GenerationSession::new();
        let first = orchestrator
            .compile_action(&mut first_session, &qualify_lead(), contact)
            .unwrap();
        let second = orchestrator
            .compile_action(&mut second_session, &qualify_lead(), contact)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn create_action_skips_row_resolution() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let orchestrator = ActionOrchestrator::new(&registry, &entities);
        let mut session = GenerationSession::new();
        let contact = entities.get("Contact").unwrap();

        let action = ActionDefinition {
            name: "create_contact".to_string(),
            requires: None,
            steps: vec![
                ActionStep::Validate {
                    expression: "email IS NOT NULL".to_string(),
                    error: Some("Email is required".to_string()),
                },
                ActionStep::Insert {
                    entity: "Contact".to_string(),
                    fields: BTreeMap::new(),
                },
            ],
            impact: None,
        };
        let sql = orchestrator
            .compile_action(&mut session, &action, contact)
            .unwrap();

        assert!(!sql.contains("p_contact_id UUID,"));
        assert!(sql.contains("IF NOT (p_email IS NOT NULL) THEN"));
        assert!(sql.contains("v_contact_id UUID := gen_random_uuid();"));
        assert!(sql.contains("v_result.id := v_contact_id;"));
        assert!(sql.contains("v_result.extra_metadata := '{}'::jsonb;"));
    }

    #[test]
    fn unknown_step_kind_aborts_the_action() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let orchestrator = ActionOrchestrator::new(&registry, &entities);
        let mut session = GenerationSession::new();
        let contact = entities.get("Contact").unwrap();

        let action = ActionDefinition {
            name: "broken".to_string(),
            requires: None,
            steps: vec![ActionStep::Other {
                kind: "bogus".to_string(),
            }],
            impact: None,
        };
        let err = orchestrator
            .compile_action(&mut session, &action, contact)
            .unwrap_err();
        assert_eq!(err.to_string(), "no compiler for step type bogus");
    }
}
