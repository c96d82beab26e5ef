//! Schema-scoping registry and per-run generation session.
//!
//! The registry is the read-only oracle the reference resolver consults:
//! which schemas are tenant-scoped (lookups there always receive the
//! caller's tenant id) and what the canonical name of a schema alias is.
//! It can be loaded from a project YAML config or fall back to the built-in
//! defaults.
//!
//! [`GenerationSession`] tracks which shared type definitions were already
//! emitted during one generation run. It is an explicit value threaded
//! through every compilation call — never process-wide state — so parallel
//! or repeated runs cannot interfere.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Configuration of one PostgreSQL schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub multi_tenant: bool,
}

impl SchemaConfig {
    pub fn new(name: &str, multi_tenant: bool) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            multi_tenant,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    schemas: Vec<SchemaConfig>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
}

/// Read-only oracle for schema scoping decisions.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, SchemaConfig>,
    aliases: BTreeMap<String, String>,
}

impl SchemaRegistry {
    /// Registry with the built-in tenant-scoped schema set.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            schemas: BTreeMap::new(),
            aliases: BTreeMap::new(),
        };
        for name in ["tenant", "crm", "management", "operations"] {
            registry.register(SchemaConfig::new(name, true));
        }
        for name in ["public", "catalog", "common", "app"] {
            registry.register(SchemaConfig::new(name, false));
        }
        registry
    }

    /// Load a registry from project-config YAML.
    ///
    /// ```yaml
    /// schemas:
    ///   - name: crm
    ///     multi_tenant: true
    /// aliases:
    ///   client: tenant
    /// ```
    pub fn from_yaml(source: &str) -> Result<Self, serde_yaml::Error> {
        let file: RegistryFile = serde_yaml::from_str(source)?;
        let mut registry = Self {
            schemas: BTreeMap::new(),
            aliases: file.aliases,
        };
        for schema in file.schemas {
            registry.register(schema);
        }
        Ok(registry)
    }

    pub fn register(&mut self, schema: SchemaConfig) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Whether lookups in this schema must carry the caller's tenant id.
    /// Unknown schemas are not tenant-scoped.
    pub fn is_tenant_scoped(&self, schema: &str) -> bool {
        let canonical = self.canonical_schema(schema);
        self.schemas
            .get(&canonical)
            .map(|s| s.multi_tenant)
            .unwrap_or(false)
    }

    /// Canonical name for a schema, resolving one level of aliasing.
    pub fn canonical_schema(&self, schema: &str) -> String {
        self.aliases
            .get(schema)
            .cloned()
            .unwrap_or_else(|| schema.to_string())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Tracks shared artifacts emitted during one generation run.
#[derive(Debug, Clone, Default)]
pub struct GenerationSession {
    emitted_types: BTreeSet<String>,
}

impl GenerationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a shared type as emitted. Returns `true` on first emission.
    pub fn mark_emitted(&mut self, name: &str) -> bool {
        self.emitted_types.insert(name.to_string())
    }

    pub fn is_emitted(&self, name: &str) -> bool {
        self.emitted_types.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tenant_schemas() {
        let registry = SchemaRegistry::with_defaults();
        assert!(registry.is_tenant_scoped("crm"));
        assert!(registry.is_tenant_scoped("tenant"));
        assert!(!registry.is_tenant_scoped("catalog"));
        assert!(!registry.is_tenant_scoped("unheard_of"));
    }

    #[test]
    fn yaml_registry_with_aliases() {
        let registry = SchemaRegistry::from_yaml(
            r#"
schemas:
  - name: bookings
    description: reservations and allocations
    multi_tenant: true
  - name: inventory
    multi_tenant: false
aliases:
  reservations: bookings
"#,
        )
        .unwrap();

        assert!(registry.is_tenant_scoped("bookings"));
        assert!(!registry.is_tenant_scoped("inventory"));
        assert_eq!(registry.canonical_schema("reservations"), "bookings");
        // Aliases resolve before the tenant decision.
        assert!(registry.is_tenant_scoped("reservations"));
    }

    #[test]
    fn session_marks_each_type_once() {
        let mut session = GenerationSession::new();
        assert!(session.mark_emitted("app.mutation_result"));
        assert!(!session.mark_emitted("app.mutation_result"));
        assert!(session.is_emitted("app.mutation_result"));
        assert!(!session.is_emitted("mutation_metadata"));
    }

    #[test]
    fn sessions_are_independent() {
        let mut a = GenerationSession::new();
        let b = GenerationSession::new();
        a.mark_emitted("app.mutation_result");
        assert!(!b.is_emitted("app.mutation_result"));
    }
}
