//! Step compiler: one typed step → a block of procedural statements.
//!
//! A pure tree-recursive dispatcher over the closed step set. Branching
//! steps (`if`, `switch`, `foreach`) recurse into their child sequences;
//! everything else emits a flat block. Unknown kinds abort the whole
//! compilation.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::ast::{ActionStep, ConflictPolicy, EntityDefinition, SwitchCase};
use crate::compiler::context::{CompileContext, RowKey};
use crate::compiler::expression::{ExpressionCompiler, VarPrefix};
use crate::compiler::trinity::ReferenceResolver;
use crate::error::{CompileError, Result};
use crate::registry::SchemaRegistry;
use crate::sql;

static FOREACH_EXPR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\s+in\s+(.+)$").unwrap());

/// Compiles action steps against a primary entity.
pub struct StepCompiler<'a> {
    expressions: ExpressionCompiler,
    resolver: ReferenceResolver<'a>,
    registry: &'a SchemaRegistry,
    entities: &'a BTreeMap<String, EntityDefinition>,
}

impl<'a> StepCompiler<'a> {
    pub fn new(
        registry: &'a SchemaRegistry,
        entities: &'a BTreeMap<String, EntityDefinition>,
    ) -> Self {
        Self {
            expressions: ExpressionCompiler::new(),
            resolver: ReferenceResolver::new(registry, entities),
            registry,
            entities,
        }
    }

    /// Compile an ordered step sequence into one block.
    pub fn compile_steps(
        &self,
        ctx: &mut CompileContext,
        steps: &[ActionStep],
        primary: &'a EntityDefinition,
    ) -> Result<String> {
        let mut blocks = Vec::with_capacity(steps.len());
        for step in steps {
            blocks.push(self.compile_step(ctx, step, primary)?);
        }
        Ok(blocks.join("\n"))
    }

    pub fn compile_step(
        &self,
        ctx: &mut CompileContext,
        step: &ActionStep,
        primary: &'a EntityDefinition,
    ) -> Result<String> {
        debug!(kind = step.kind(), "compiling step");
        match step {
            ActionStep::Validate { expression, error } => {
                self.compile_validate(ctx, primary, expression, error.as_deref())
            }
            ActionStep::Insert { entity, fields } => {
                self.compile_insert(ctx, primary, entity, fields)
            }
            ActionStep::Update {
                entity,
                fields,
                where_clause,
            } => self.compile_update(ctx, primary, entity, fields, where_clause.as_deref()),
            ActionStep::Delete {
                entity,
                hard,
                dependents,
            } => self.compile_delete(ctx, primary, entity, *hard, dependents),
            ActionStep::If {
                condition,
                then_steps,
                else_steps,
            } => self.compile_if(ctx, primary, condition, then_steps, else_steps),
            ActionStep::Switch {
                expression,
                cases,
                default_steps,
            } => self.compile_switch(ctx, primary, expression, cases, default_steps),
            ActionStep::Foreach { expression, body } => {
                self.compile_foreach(ctx, primary, expression, body)
            }
            ActionStep::Call {
                function,
                arguments,
                store_result,
            } => Ok(self.compile_call(ctx, function, arguments, store_result.as_deref())),
            ActionStep::Notify { channel, payload } => Ok(compile_notify(channel, payload)),
            ActionStep::DuplicateCheck {
                fields,
                policy,
                return_conflict_object,
            } => self.compile_duplicate_check(ctx, primary, fields, *policy, *return_conflict_object),
            ActionStep::Other { kind } => Err(CompileError::UnknownStepKind { kind: kind.clone() }),
        }
    }

    // --- validate ---

    fn compile_validate(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        expression: &str,
        error: Option<&str>,
    ) -> Result<String> {
        let (prelude, condition) = self.compile_condition(ctx, primary, expression)?;
        let message = sql::quote_literal(error.unwrap_or("Validation failed"));
        Ok(format!(
            "{prelude}IF NOT ({condition}) THEN\n    v_result.status := 'failed:validation';\n    v_result.message := {message};\n    RETURN v_result;\nEND IF;\n"
        ))
    }

    /// Compile a guard condition, loading referenced fields into locals
    /// first when the action operates on a resolved row. Create-style
    /// actions check the raw `p_` parameters instead.
    fn compile_condition(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        expression: &str,
    ) -> Result<(String, String)> {
        if !ctx.targets_existing_row {
            let condition = self.expressions.compile_scoped(
                expression,
                primary,
                VarPrefix::Param,
                ctx.scope(),
            )?;
            return Ok((String::new(), condition));
        }

        let scope: Vec<String> = ctx.scope().to_vec();
        let referenced = self
            .expressions
            .referenced_fields(expression, primary, &scope)?;
        let to_load: Vec<String> = referenced
            .into_iter()
            .filter(|f| !ctx.is_loaded(f))
            .collect();

        let mut prelude = String::new();
        if !to_load.is_empty() {
            for field in &to_load {
                if let Some(def) = primary.fields.get(field) {
                    ctx.declare(&format!("v_{field}"), def.pg_type());
                }
                ctx.mark_loaded(field);
            }
            let columns = to_load.join(", ");
            let targets = to_load
                .iter()
                .map(|f| format!("v_{f}"))
                .collect::<Vec<_>>()
                .join(", ");
            prelude = format!(
                "SELECT {columns} INTO {targets}\nFROM {table}\nWHERE {predicate};\n",
                table = primary.qualified_table(),
                predicate = self.row_predicate(ctx, primary)?,
            );
        }

        let condition =
            self.expressions
                .compile_scoped(expression, primary, VarPrefix::Local, &scope)?;
        Ok((prelude, condition))
    }

    /// Predicate scoping a statement to the current row of `entity`.
    fn row_predicate(&self, ctx: &CompileContext, entity: &EntityDefinition) -> Result<String> {
        let variable = CompileContext::pk_variable(entity);
        let binding = ctx
            .binding(&variable)
            .ok_or_else(|| CompileError::UnresolvedRow {
                entity: entity.name.clone(),
            })?;
        Ok(match binding.key {
            RowKey::InternalPk => format!("{} = {variable}", entity.pk_column()),
            RowKey::ExternalId => format!("id = {variable}"),
        })
    }

    fn target_entity(
        &self,
        primary: &'a EntityDefinition,
        name: &str,
        step: &'static str,
    ) -> Result<&'a EntityDefinition> {
        if name == primary.name {
            return Ok(primary);
        }
        self.entities
            .get(name)
            .ok_or_else(|| CompileError::UnknownEntity {
                name: name.to_string(),
                step,
            })
    }

    // --- insert ---

    fn compile_insert(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        entity_name: &str,
        values: &BTreeMap<String, JsonValue>,
    ) -> Result<String> {
        let entity = self.target_entity(primary, entity_name, "insert")?;
        let id_var = CompileContext::pk_variable(entity);
        ctx.declare(&id_var, "UUID := gen_random_uuid()");
        ctx.bind_row_variable(&id_var, entity, RowKey::ExternalId);

        let is_primary = entity.name == primary.name;
        let mut block = String::new();
        let mut columns: Vec<String> = vec!["id".to_string()];
        let mut row_values: Vec<String> = vec![id_var.clone()];

        if self.registry.is_tenant_scoped(&entity.schema) {
            columns.push("tenant_id".to_string());
            row_values.push("auth_tenant_id".to_string());
        }

        for (name, field) in &entity.fields {
            if field.is_reference() {
                if let Some(value) = values.get(name) {
                    // Caller supplied an already-resolved key expression.
                    columns.push(format!("fk_{name}"));
                    row_values.push(sql::format_value(value));
                } else if is_primary {
                    let resolved =
                        self.resolver
                            .resolve_field(ctx, entity, name, &format!("p_{name}_id"))?;
                    block.push_str(&resolved.sql);
                    columns.push(format!("fk_{name}"));
                    row_values.push(resolved.variable);
                } else if field.reference_entity.as_deref() == Some(primary.name.as_str()) {
                    // Side-entity rows link back to the resolved primary row.
                    // A freshly inserted primary is only known by its external
                    // UUID, so the internal key comes from a subselect.
                    let pk_var = CompileContext::pk_variable(primary);
                    if let Some(binding) = ctx.binding(&pk_var) {
                        let key_expr = match binding.key {
                            RowKey::InternalPk => pk_var,
                            RowKey::ExternalId => format!(
                                "(SELECT {pk} FROM {table} WHERE id = {pk_var})",
                                pk = primary.pk_column(),
                                table = primary.qualified_table(),
                            ),
                        };
                        columns.push(format!("fk_{name}"));
                        row_values.push(key_expr);
                    }
                }
                continue;
            }
            if let Some(value) = values.get(name) {
                columns.push(name.clone());
                row_values.push(sql::format_value(value));
            } else if is_primary {
                columns.push(name.clone());
                row_values.push(format!("p_{name}"));
            }
        }

        columns.extend(["created_at".to_string(), "created_by".to_string()]);
        row_values.extend(["now()".to_string(), "auth_user_id".to_string()]);

        block.push_str(&format!(
            "INSERT INTO {table} (\n    {cols}\n) VALUES (\n    {vals}\n);\n",
            table = entity.qualified_table(),
            cols = columns.join(",\n    "),
            vals = row_values.join(",\n    "),
        ));

        if ctx.track_cascades && !is_primary {
            block.push_str(&cascade_append(
                "v_cascade_updated",
                entity,
                "CREATE",
                &values.keys().cloned().collect::<Vec<_>>(),
                &format!("{id_var}::TEXT"),
            ));
        }
        Ok(block)
    }

    // --- update ---

    fn compile_update(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        entity_name: &str,
        values: &BTreeMap<String, JsonValue>,
        where_clause: Option<&str>,
    ) -> Result<String> {
        let entity = self.target_entity(primary, entity_name, "update")?;

        let mut assignments: Vec<String> = values
            .iter()
            .map(|(name, value)| {
                let column = match entity.fields.get(name) {
                    Some(f) if f.is_reference() => format!("fk_{name}"),
                    _ => name.clone(),
                };
                format!("{column} = {}", sql::format_value(value))
            })
            .collect();
        assignments.push("updated_at = now()".to_string());
        assignments.push("updated_by = auth_user_id".to_string());

        let predicate = match where_clause {
            Some(raw) => self.column_predicate(ctx, entity, raw)?,
            None => self.row_predicate(ctx, entity)?,
        };

        let mut block = format!(
            "UPDATE {table}\nSET {set}\nWHERE {predicate};\n",
            table = entity.qualified_table(),
            set = assignments.join(",\n    "),
        );

        if ctx.track_cascades {
            let mut fields: Vec<String> = values.keys().cloned().collect();
            fields.push("updated_at".to_string());
            let pk_var = CompileContext::pk_variable(entity);
            let id_expr = if ctx.binding(&pk_var).is_some() {
                format!("{pk_var}::TEXT")
            } else {
                "NULL".to_string()
            };
            block.push_str(&cascade_append(
                "v_cascade_updated",
                entity,
                "UPDATE",
                &fields,
                &id_expr,
            ));
        }
        Ok(block)
    }

    /// Compile a raw WHERE clause: entity fields stay bare column names,
    /// `id` and in-scope iterator variables pass through.
    fn column_predicate(
        &self,
        ctx: &CompileContext,
        entity: &EntityDefinition,
        raw: &str,
    ) -> Result<String> {
        let mut scope: Vec<String> = ctx.scope().to_vec();
        scope.push("id".to_string());
        self.expressions
            .compile_scoped(raw, entity, VarPrefix::Column, &scope)
    }

    // --- delete ---

    fn compile_delete(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        entity_name: &str,
        hard: bool,
        dependents: &[String],
    ) -> Result<String> {
        let entity = self.target_entity(primary, entity_name, "delete")?;
        let predicate = self.row_predicate(ctx, entity)?;
        let pk_var = CompileContext::pk_variable(entity);

        let mut block = String::new();
        if hard {
            for dependent in dependents {
                let dep = self.target_entity(primary, dependent, "delete")?;
                block.push_str(&format!(
                    "IF EXISTS (SELECT 1 FROM {dep_table} WHERE fk_{target} = {pk_var}) THEN\n    v_result.status := 'failed:has_dependents';\n    v_result.message := {message};\n    RETURN v_result;\nEND IF;\n",
                    dep_table = dep.qualified_table(),
                    target = entity.lower_name(),
                    message = sql::quote_literal(&format!(
                        "Cannot delete {}: has dependent {} rows",
                        entity.name, dep.name
                    )),
                ));
            }
            block.push_str(&format!(
                "DELETE FROM {table}\nWHERE {predicate};\n",
                table = entity.qualified_table(),
            ));
        } else {
            block.push_str(&format!(
                "UPDATE {table}\nSET deleted_at = now(),\n    deleted_by = auth_user_id,\n    updated_at = now(),\n    updated_by = auth_user_id\nWHERE {predicate}\n  AND deleted_at IS NULL;\n",
                table = entity.qualified_table(),
            ));
        }

        if ctx.track_cascades {
            block.push_str(&cascade_append(
                "v_cascade_deleted",
                entity,
                "DELETE",
                &[],
                &format!("{pk_var}::TEXT"),
            ));
        }
        Ok(block)
    }

    // --- branching ---

    fn compile_if(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        condition: &str,
        then_steps: &[ActionStep],
        else_steps: &[ActionStep],
    ) -> Result<String> {
        let (prelude, compiled) = self.compile_condition(ctx, primary, condition)?;
        let then_block = sql::indent(&self.compile_steps(ctx, then_steps, primary)?, 1);

        let mut block = format!("{prelude}IF ({compiled}) THEN\n{then_block}\n");
        if !else_steps.is_empty() {
            let else_block = sql::indent(&self.compile_steps(ctx, else_steps, primary)?, 1);
            block.push_str(&format!("ELSE\n{else_block}\n"));
        }
        block.push_str("END IF;\n");
        Ok(block)
    }

    fn compile_switch(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        expression: &str,
        cases: &[SwitchCase],
        default_steps: &[ActionStep],
    ) -> Result<String> {
        let (prelude, compiled) = self.compile_condition(ctx, primary, expression)?;

        let mut block = format!("{prelude}CASE {compiled}\n");
        for case in cases {
            let body = if case.steps.is_empty() {
                "    NULL;".to_string()
            } else {
                sql::indent(&self.compile_steps(ctx, &case.steps, primary)?, 1)
            };
            block.push_str(&format!("WHEN {} THEN\n{body}\n", case_value(&case.value)));
        }
        let default = if default_steps.is_empty() {
            "    NULL;".to_string()
        } else {
            sql::indent(&self.compile_steps(ctx, default_steps, primary)?, 1)
        };
        block.push_str(&format!("ELSE\n{default}\nEND CASE;\n"));
        Ok(block)
    }

    fn compile_foreach(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        expression: &str,
        body: &[ActionStep],
    ) -> Result<String> {
        let caps =
            FOREACH_EXPR
                .captures(expression)
                .ok_or_else(|| CompileError::InvalidForeach {
                    expression: expression.to_string(),
                })?;
        let iterator = caps[1].to_string();
        let collection = caps[2].trim();

        let query = self.iteration_query(ctx, primary, collection)?;
        ctx.declare(&iterator, "RECORD");

        ctx.push_scope(&iterator);
        let compiled_body = self.compile_steps(ctx, body, primary);
        ctx.pop_scope();

        Ok(format!(
            "FOR {iterator} IN\n{query}\nLOOP\n{body}\nEND LOOP;\n",
            query = sql::indent(&query, 1),
            body = sql::indent(&compiled_body?, 1),
        ))
    }

    /// Derive the row source for a foreach collection.
    ///
    /// `related_<plural>` iterates the child table joined by the reverse
    /// foreign key; subqueries and SELECT statements pass through; a
    /// qualified or bare table name becomes a full SELECT.
    fn iteration_query(
        &self,
        ctx: &CompileContext,
        primary: &'a EntityDefinition,
        collection: &str,
    ) -> Result<String> {
        if let Some(plural) = collection.strip_prefix("related_") {
            let pk_var = CompileContext::pk_variable(primary);
            if ctx.binding(&pk_var).is_none() {
                return Err(CompileError::UnresolvedRow {
                    entity: primary.name.clone(),
                });
            }
            let table = self
                .child_table(plural)
                .unwrap_or_else(|| {
                    let singular = plural.strip_suffix('s').unwrap_or(plural);
                    format!("{}.tb_{singular}", primary.schema)
                });
            return Ok(format!(
                "SELECT * FROM {table}\nWHERE fk_{} = {pk_var}",
                primary.lower_name(),
            ));
        }
        if collection.starts_with('(') && collection.ends_with(')') {
            return Ok(collection.to_string());
        }
        if collection.len() >= 6 && collection[..6].eq_ignore_ascii_case("SELECT") {
            return Ok(collection.to_string());
        }
        if collection.starts_with("p_") || collection.starts_with("input.") {
            return Err(CompileError::InvalidForeach {
                expression: collection.to_string(),
            });
        }
        if collection.contains('.') {
            return Ok(format!("SELECT * FROM {collection}"));
        }
        Ok(format!("SELECT * FROM {}.{collection}", primary.schema))
    }

    /// Table of a known entity whose lower name matches a plural label.
    fn child_table(&self, plural: &str) -> Option<String> {
        let mut candidates = Vec::new();
        if let Some(stem) = plural.strip_suffix("ies") {
            candidates.push(format!("{stem}y"));
        }
        if let Some(stem) = plural.strip_suffix('s') {
            candidates.push(stem.to_string());
        }
        candidates.push(plural.to_string());
        candidates.into_iter().find_map(|candidate| {
            self.entities
                .values()
                .find(|e| e.lower_name() == candidate)
                .map(EntityDefinition::qualified_table)
        })
    }

    // --- call ---

    fn compile_call(
        &self,
        ctx: &mut CompileContext,
        function: &str,
        arguments: &BTreeMap<String, JsonValue>,
        store_result: Option<&str>,
    ) -> String {
        let args = arguments
            .iter()
            .map(|(name, value)| format!("{name} => {}", sql::format_value(value)))
            .collect::<Vec<_>>()
            .join(", ");

        match store_result {
            Some(target) => {
                let variable = format!("v_{target}");
                ctx.declare(&variable, "JSONB");
                format!("{variable} := {function}({args});\n")
            }
            None => format!("PERFORM {function}({args});\n"),
        }
    }

    // --- duplicate_check ---

    fn compile_duplicate_check(
        &self,
        ctx: &mut CompileContext,
        primary: &'a EntityDefinition,
        fields: &[String],
        policy: ConflictPolicy,
        return_conflict_object: bool,
    ) -> Result<String> {
        if fields.is_empty() {
            // An empty predicate would flag every row as a duplicate.
            return Err(CompileError::MissingStepField {
                step: "duplicate_check",
                field: "fields",
            });
        }
        ctx.declare("v_duplicate_pk", "INTEGER");
        ctx.declare("v_duplicate_id", "UUID");

        let mut predicates: Vec<String> = fields
            .iter()
            .map(|f| format!("{f} = p_{f}"))
            .collect();
        if self.registry.is_tenant_scoped(&primary.schema) {
            predicates.push("tenant_id = auth_tenant_id".to_string());
        }
        predicates.push("deleted_at IS NULL".to_string());

        let status = match policy {
            ConflictPolicy::Noop => "noop:duplicate",
            ConflictPolicy::Fail => "failed:duplicate",
        };
        let message = sql::quote_literal(&format!("Duplicate {} found", primary.name));

        let mut branch = format!(
            "    v_result.id := v_duplicate_id;\n    v_result.status := '{status}';\n    v_result.message := {message};\n"
        );
        if return_conflict_object {
            branch.push_str(&format!(
                "    v_result.object_data := (SELECT to_jsonb(t) FROM {table} t WHERE {pk} = v_duplicate_pk);\n",
                table = primary.qualified_table(),
                pk = primary.pk_column(),
            ));
        }

        Ok(format!(
            "SELECT {pk}, id INTO v_duplicate_pk, v_duplicate_id\nFROM {table}\nWHERE {preds}\nLIMIT 1;\nIF v_duplicate_pk IS NOT NULL THEN\n{branch}    RETURN v_result;\nEND IF;\n",
            pk = primary.pk_column(),
            table = primary.qualified_table(),
            preds = predicates.join("\n  AND "),
        ))
    }
}

fn compile_notify(channel: &str, payload: &BTreeMap<String, JsonValue>) -> String {
    let pairs = payload
        .iter()
        .map(|(key, value)| format!("{}, {}", sql::quote_literal(key), sql::format_value(value)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "PERFORM pg_notify({}, jsonb_build_object({pairs})::text);\n",
        sql::quote_literal(channel),
    )
}

fn case_value(value: &str) -> String {
    if value.parse::<f64>().is_ok()
        || value.eq_ignore_ascii_case("TRUE")
        || value.eq_ignore_ascii_case("FALSE")
        || value.eq_ignore_ascii_case("NULL")
    {
        value.to_string()
    } else {
        sql::quote_literal(value)
    }
}

fn cascade_append(
    array: &str,
    entity: &EntityDefinition,
    operation: &str,
    fields: &[String],
    id_expr: &str,
) -> String {
    format!(
        "{array} := array_append({array}, ROW({name}, '{operation}', {schema}, {fields}, {id_expr})::mutation_metadata.entity_impact);\n",
        name = sql::quote_literal(&entity.name),
        schema = sql::quote_literal(&entity.schema),
        fields = sql::text_array(fields),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FieldDefinition;

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
        map.insert(
            "Activity".to_string(),
            EntityDefinition::new(
                "Activity",
                "crm",
                vec![
                    FieldDefinition::basic("kind", "text"),
                    FieldDefinition::reference("contact", "Contact", "crm"),
                ],
            ),
        );
        map
    }

    fn resolved_ctx(entity: &EntityDefinition) -> CompileContext {
        let mut ctx = CompileContext::new();
        ctx.targets_existing_row = true;
        let var = CompileContext::pk_variable(entity);
        ctx.declare(&var, "INTEGER");
        ctx.bind_row_variable(&var, entity, RowKey::InternalPk);
        ctx
    }

    #[test]
    fn validate_loads_fields_and_guards() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let step = ActionStep::Validate {
            expression: "status = 'lead' AND lead_score >= 50".to_string(),
            error: Some("Contact is not a qualified lead".to_string()),
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();

        assert!(sql.contains("SELECT status, lead_score INTO v_status, v_lead_score"));
        assert!(sql.contains("WHERE pk_contact = v_contact_id"));
        assert!(sql.contains("IF NOT (v_status = 'lead' AND v_lead_score >= 50) THEN"));
        assert!(sql.contains("'failed:validation'"));
        assert!(sql.contains("'Contact is not a qualified lead'"));
    }

    #[test]
    fn validate_in_create_action_checks_parameters() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = CompileContext::new();

        let step = ActionStep::Validate {
            expression: "email IS NOT NULL".to_string(),
            error: None,
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();
        assert!(sql.contains("IF NOT (p_email IS NOT NULL) THEN"));
        assert!(!sql.contains("SELECT"));
    }

    #[test]
    fn fields_load_once_across_steps() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let steps = vec![
            ActionStep::Validate {
                expression: "status = 'lead'".to_string(),
                error: None,
            },
            ActionStep::Validate {
                expression: "status != 'archived'".to_string(),
                error: None,
            },
        ];
        let sql = compiler.compile_steps(&mut ctx, &steps, contact).unwrap();
        assert_eq!(sql.matches("SELECT status INTO v_status").count(), 1);
    }

    #[test]
    fn insert_lists_identity_tenant_and_audit_columns() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = CompileContext::new();

        let mut fields = BTreeMap::new();
        fields.insert("status".to_string(), JsonValue::String("lead".to_string()));
        let step = ActionStep::Insert {
            entity: "Contact".to_string(),
            fields,
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();

        assert!(sql.contains("INSERT INTO crm.tb_contact"));
        assert!(sql.contains("tenant_id"));
        assert!(sql.contains("auth_tenant_id"));
        assert!(sql.contains("'lead'"));
        assert!(sql.contains("p_email"));
        assert!(sql.contains("created_by"));
        assert!(ctx.is_declared("v_contact_id"));
    }

    #[test]
    fn insert_resolves_reference_fields() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let activity = entities.get("Activity").unwrap();
        let mut ctx = CompileContext::new();

        let step = ActionStep::Insert {
            entity: "Activity".to_string(),
            fields: BTreeMap::new(),
        };
        let sql = compiler.compile_step(&mut ctx, &step, activity).unwrap();
        assert!(sql.contains("v_fk_contact := crm.contact_pk(p_contact_id, auth_tenant_id);"));
        assert!(sql.contains("fk_contact"));
    }

    #[test]
    fn side_insert_links_to_freshly_inserted_primary() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = CompileContext::new();

        let steps = vec![
            ActionStep::Insert {
                entity: "Contact".to_string(),
                fields: BTreeMap::new(),
            },
            ActionStep::Insert {
                entity: "Activity".to_string(),
                fields: BTreeMap::new(),
            },
        ];
        let sql = compiler.compile_steps(&mut ctx, &steps, contact).unwrap();

        // The primary row is only known by its generated UUID, so the
        // side row joins through it to get the internal key.
        let activity = sql.find("INSERT INTO crm.tb_activity").unwrap();
        assert!(sql[activity..].contains("fk_contact"));
        assert!(sql[activity..]
            .contains("(SELECT pk_contact FROM crm.tb_contact WHERE id = v_contact_id)"));
    }

    #[test]
    fn update_adds_audit_assignments_and_row_scope() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let mut fields = BTreeMap::new();
        fields.insert(
            "status".to_string(),
            JsonValue::String("qualified".to_string()),
        );
        let step = ActionStep::Update {
            entity: "Contact".to_string(),
            fields,
            where_clause: None,
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();

        assert!(sql.contains("UPDATE crm.tb_contact"));
        assert!(sql.contains("status = 'qualified'"));
        assert!(sql.contains("updated_at = now()"));
        assert!(sql.contains("updated_by = auth_user_id"));
        assert!(sql.contains("WHERE pk_contact = v_contact_id;"));
    }

    #[test]
    fn update_without_resolved_row_fails() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = CompileContext::new();

        let step = ActionStep::Update {
            entity: "Contact".to_string(),
            fields: BTreeMap::new(),
            where_clause: None,
        };
        let err = compiler.compile_step(&mut ctx, &step, contact).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedRow { .. }));
    }

    #[test]
    fn soft_delete_is_the_default() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let step = ActionStep::Delete {
            entity: "Contact".to_string(),
            hard: false,
            dependents: Vec::new(),
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();
        assert!(sql.contains("SET deleted_at = now()"));
        assert!(sql.contains("AND deleted_at IS NULL;"));
        assert!(!sql.contains("DELETE FROM"));
    }

    #[test]
    fn hard_delete_guards_on_dependents() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let step = ActionStep::Delete {
            entity: "Contact".to_string(),
            hard: true,
            dependents: vec!["Activity".to_string()],
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();

        let guard = sql.find("'failed:has_dependents'").unwrap();
        let delete = sql.find("DELETE FROM crm.tb_contact").unwrap();
        assert!(guard < delete);
        assert!(sql.contains("SELECT 1 FROM crm.tb_activity WHERE fk_contact = v_contact_id"));
    }

    #[test]
    fn if_blocks_are_balanced_at_any_depth() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();

        for depth in [1usize, 5, 20, 50] {
            let mut step = ActionStep::Validate {
                expression: "lead_score >= 50".to_string(),
                error: None,
            };
            for _ in 0..depth {
                step = ActionStep::If {
                    condition: "status = 'lead'".to_string(),
                    then_steps: vec![step],
                    else_steps: Vec::new(),
                };
            }
            let mut ctx = resolved_ctx(contact);
            let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();
            let opens = sql.matches("IF (").count();
            let closes = sql.matches("END IF;").count();
            // Each validate contributes one IF NOT guard and one END IF.
            assert_eq!(opens + 1, closes, "depth {depth}");
            assert_eq!(opens, depth, "depth {depth}");
        }
    }

    #[test]
    fn switch_cases_keep_declaration_order() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let step = ActionStep::Switch {
            expression: "status".to_string(),
            cases: vec![
                SwitchCase {
                    value: "lead".to_string(),
                    steps: Vec::new(),
                },
                SwitchCase {
                    value: "qualified".to_string(),
                    steps: Vec::new(),
                },
                SwitchCase {
                    value: "customer".to_string(),
                    steps: Vec::new(),
                },
            ],
            default_steps: Vec::new(),
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();

        let a = sql.find("WHEN 'lead'").unwrap();
        let b = sql.find("WHEN 'qualified'").unwrap();
        let c = sql.find("WHEN 'customer'").unwrap();
        assert!(a < b && b < c);
        assert!(sql.contains("END CASE;"));
        assert!(sql.contains("ELSE\n    NULL;"));
    }

    #[test]
    fn foreach_iterates_related_rows() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let step = ActionStep::Foreach {
            expression: "item in related_activities".to_string(),
            body: vec![ActionStep::Update {
                entity: "Activity".to_string(),
                fields: BTreeMap::new(),
                where_clause: Some("id = item.id".to_string()),
            }],
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();

        assert!(sql.contains("FOR item IN"));
        assert!(sql.contains("SELECT * FROM crm.tb_activity"));
        assert!(sql.contains("WHERE fk_contact = v_contact_id"));
        assert!(sql.contains("WHERE id = item.id;"));
        assert!(sql.contains("END LOOP;"));
        assert!(ctx.is_declared("item"));
        assert!(ctx.scope().is_empty());
    }

    #[test]
    fn foreach_rejects_malformed_expressions() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let step = ActionStep::Foreach {
            expression: "just_a_collection".to_string(),
            body: Vec::new(),
        };
        let err = compiler.compile_step(&mut ctx, &step, contact).unwrap_err();
        assert!(matches!(err, CompileError::InvalidForeach { .. }));
    }

    #[test]
    fn call_uses_named_notation() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = resolved_ctx(contact);

        let mut arguments = BTreeMap::new();
        arguments.insert(
            "contact_pk".to_string(),
            JsonValue::String("$v_contact_id".to_string()),
        );
        let step = ActionStep::Call {
            function: "crm.recalculate_score".to_string(),
            arguments,
            store_result: Some("score_report".to_string()),
        };
        let sql = compiler.compile_step(&mut ctx, &step, contact).unwrap();
        assert_eq!(
            sql,
            "v_score_report := crm.recalculate_score(contact_pk => v_contact_id);\n"
        );
        assert!(ctx.is_declared("v_score_report"));
    }

    #[test]
    fn notify_builds_a_json_payload() {
        let mut payload = BTreeMap::new();
        payload.insert(
            "contact_id".to_string(),
            JsonValue::String("$v_contact_id".to_string()),
        );
        payload.insert(
            "event".to_string(),
            JsonValue::String("qualified".to_string()),
        );
        let sql = compile_notify("crm_events", &payload);
        assert_eq!(
            sql,
            "PERFORM pg_notify('crm_events', jsonb_build_object('contact_id', v_contact_id, 'event', 'qualified')::text);\n"
        );
    }

    #[test]
    fn duplicate_check_short_circuits_before_insert() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = CompileContext::new();

        let steps = vec![
            ActionStep::DuplicateCheck {
                fields: vec!["email".to_string()],
                policy: ConflictPolicy::Noop,
                return_conflict_object: true,
            },
            ActionStep::Insert {
                entity: "Contact".to_string(),
                fields: BTreeMap::new(),
            },
        ];
        let sql = compiler.compile_steps(&mut ctx, &steps, contact).unwrap();

        let ret = sql.find("RETURN v_result;").unwrap();
        let insert = sql.find("INSERT INTO crm.tb_contact").unwrap();
        assert!(ret < insert);
        assert!(sql.contains("email = p_email"));
        assert!(sql.contains("tenant_id = auth_tenant_id"));
        assert!(sql.contains("'noop:duplicate'"));
        assert!(sql.contains("v_result.object_data := (SELECT to_jsonb(t)"));
    }

    #[test]
    fn unknown_step_kind_is_fatal() {
        let registry = SchemaRegistry::with_defaults();
        let entities = entities();
        let compiler = StepCompiler::new(&registry, &entities);
        let contact = entities.get("Contact").unwrap();
        let mut ctx = CompileContext::new();

        let step = ActionStep::Other {
            kind: "bogus".to_string(),
        };
        let err = compiler.compile_step(&mut ctx, &step, contact).unwrap_err();
        assert_eq!(err.to_string(), "no compiler for step type bogus");
    }
}
