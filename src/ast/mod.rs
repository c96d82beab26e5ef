//! AST consumed by the action compiler.
//!
//! These structures arrive pre-validated from the declarative-language
//! parser (or a reverse-engineering adapter) — the compiler trusts entity
//! and field existence and only re-checks what expression/reference safety
//! requires. Everything here is immutable once constructed; one
//! [`ActionDefinition`] plus its [`EntityDefinition`] context is the
//! complete input of a compilation run.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Which tier a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldTier {
    /// text, integer, boolean, ...
    #[default]
    Basic,
    /// Rich scalar types (email, money, ...) that map onto basic columns.
    Scalar,
    /// Composite types stored as JSONB.
    Composite,
    /// `ref(Entity)` foreign keys resolved through Trinity helpers.
    Reference,
}

/// A single field of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub type_name: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub tier: FieldTier,
    /// Target entity name; reference tier only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_entity: Option<String>,
    /// Target entity schema; reference tier only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_schema: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FieldDefinition {
    /// Basic-tier field.
    pub fn basic(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            nullable: true,
            tier: FieldTier::Basic,
            reference_entity: None,
            reference_schema: None,
        }
    }

    /// Reference-tier field pointing at another entity.
    pub fn reference(name: &str, entity: &str, schema: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: "ref".to_string(),
            nullable: true,
            tier: FieldTier::Reference,
            reference_entity: Some(entity.to_string()),
            reference_schema: Some(schema.to_string()),
        }
    }

    pub fn is_reference(&self) -> bool {
        self.tier == FieldTier::Reference
    }

    /// PostgreSQL column/variable type for this field.
    pub fn pg_type(&self) -> &'static str {
        match self.type_name.as_str() {
            "text" => "TEXT",
            "integer" => "INTEGER",
            "boolean" => "BOOLEAN",
            "date" => "DATE",
            "timestamp" => "TIMESTAMPTZ",
            "uuid" => "UUID",
            "json" => "JSONB",
            "decimal" => "DECIMAL",
            // FK to a pk_* column
            "ref" => "INTEGER",
            _ => "TEXT",
        }
    }
}

/// An entity and its ordered field map.
///
/// Invariant: field names are unique (the map enforces it) and iteration
/// follows declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub name: String,
    pub schema: String,
    #[serde(default)]
    pub fields: IndexMap<String, FieldDefinition>,
}

impl EntityDefinition {
    pub fn new(name: &str, schema: &str, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.to_string(),
            schema: schema.to_string(),
            fields: fields.into_iter().map(|f| (f.name.clone(), f)).collect(),
        }
    }

    pub fn lower_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn table_name(&self) -> String {
        format!("tb_{}", self.lower_name())
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table_name())
    }

    pub fn pk_column(&self) -> String {
        format!("pk_{}", self.lower_name())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }
}

/// One case of a `switch` step. Declaration order is significant: the
/// target dialect gives first-match-wins semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: String,
    #[serde(default)]
    pub steps: Vec<ActionStep>,
}

/// Conflict policy for a `duplicate_check` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Report the duplicate as a no-op (`noop:duplicate`).
    #[default]
    Noop,
    /// Treat the duplicate as a failure (`failed:duplicate`).
    Fail,
}

/// One step of an action.
///
/// Branch-carrying variants hold ordered child-step sequences, so the type
/// is tree-recursive; no back-pointers, no shared nodes. The set is closed:
/// [`ActionStep::Other`] exists only so adapters can hand through kinds
/// this compiler deliberately rejects with a fatal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionStep {
    Validate {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Insert {
        entity: String,
        #[serde(default)]
        fields: BTreeMap<String, JsonValue>,
    },
    Update {
        entity: String,
        #[serde(default)]
        fields: BTreeMap<String, JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        where_clause: Option<String>,
    },
    Delete {
        entity: String,
        #[serde(default)]
        hard: bool,
        /// Entities whose rows block a hard delete while present.
        #[serde(default)]
        dependents: Vec<String>,
    },
    If {
        condition: String,
        #[serde(default)]
        then_steps: Vec<ActionStep>,
        #[serde(default)]
        else_steps: Vec<ActionStep>,
    },
    Switch {
        expression: String,
        #[serde(default)]
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default_steps: Vec<ActionStep>,
    },
    Foreach {
        /// `<iterator> in <collection>`
        expression: String,
        #[serde(default)]
        body: Vec<ActionStep>,
    },
    Call {
        function: String,
        #[serde(default)]
        arguments: BTreeMap<String, JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_result: Option<String>,
    },
    Notify {
        channel: String,
        #[serde(default)]
        payload: BTreeMap<String, JsonValue>,
    },
    DuplicateCheck {
        /// Uniqueness field set probed before the following insert.
        fields: Vec<String>,
        #[serde(default)]
        policy: ConflictPolicy,
        #[serde(default)]
        return_conflict_object: bool,
    },
    /// Forward-compatibility escape hatch; always fatal at compile time.
    Other { kind: String },
}

impl ActionStep {
    /// Wire name of this step kind, as used in diagnostics.
    pub fn kind(&self) -> &str {
        match self {
            ActionStep::Validate { .. } => "validate",
            ActionStep::Insert { .. } => "insert",
            ActionStep::Update { .. } => "update",
            ActionStep::Delete { .. } => "delete",
            ActionStep::If { .. } => "if",
            ActionStep::Switch { .. } => "switch",
            ActionStep::Foreach { .. } => "foreach",
            ActionStep::Call { .. } => "call",
            ActionStep::Notify { .. } => "notify",
            ActionStep::DuplicateCheck { .. } => "duplicate_check",
            ActionStep::Other { kind } => kind,
        }
    }
}

/// A named state-transition operation over one primary entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    /// Optional permission-guard expression checked before any step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
    #[serde(default)]
    pub steps: Vec<ActionStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<ActionImpact>,
}

/// Operation kind recorded in impact metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpactOperation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ImpactOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImpactOperation::Create => write!(f, "CREATE"),
            ImpactOperation::Update => write!(f, "UPDATE"),
            ImpactOperation::Delete => write!(f, "DELETE"),
        }
    }
}

/// Impact of an action on one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityImpact {
    pub entity: String,
    pub operation: ImpactOperation,
    #[serde(default)]
    pub fields: Vec<String>,
    /// Named output collection for side effects (e.g. "createdNotifications").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl EntityImpact {
    pub fn new(entity: &str, operation: ImpactOperation) -> Self {
        Self {
            entity: entity.to_string(),
            operation,
            fields: Vec::new(),
            collection: None,
        }
    }

    pub fn with_fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_collection(mut self, collection: &str) -> Self {
        self.collection = Some(collection.to_string());
        self
    }
}

/// How downstream consumers should react to an invalidated query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvalidationStrategy {
    #[default]
    Refetch,
    Remove,
    Update,
}

impl std::fmt::Display for InvalidationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationStrategy::Refetch => write!(f, "REFETCH"),
            InvalidationStrategy::Remove => write!(f, "REMOVE"),
            InvalidationStrategy::Update => write!(f, "UPDATE"),
        }
    }
}

/// Cache-invalidation hint attached to an action's impact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInvalidation {
    /// Collection-query name to invalidate.
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<JsonValue>,
    #[serde(default)]
    pub strategy: InvalidationStrategy,
    #[serde(default)]
    pub reason: String,
}

impl CacheInvalidation {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            filter: None,
            strategy: InvalidationStrategy::default(),
            reason: String::new(),
        }
    }
}

/// Declared impact of one action: the primary entity plus side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionImpact {
    pub primary: EntityImpact,
    #[serde(default)]
    pub side_effects: Vec<EntityImpact>,
    #[serde(default)]
    pub cache_invalidations: Vec<CacheInvalidation>,
}

impl ActionImpact {
    pub fn new(primary: EntityImpact) -> Self {
        Self {
            primary,
            side_effects: Vec::new(),
            cache_invalidations: Vec::new(),
        }
    }
}
