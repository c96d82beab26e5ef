//! SQL formatting helpers shared by the step compilers.
//!
//! The literal-formatting rule here is the second injection-defence layer:
//! it governs *values* flowing into INSERT/UPDATE statements, while the
//! expression compiler governs condition/value *expressions*.

use serde_json::Value as JsonValue;

/// Quote a string literal, doubling every embedded single quote.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Rewrite a `$var` reference to its procedural variable name.
///
/// References already carrying a procedural prefix (`v_`, `p_`) or naming an
/// auth context variable pass through; everything else gets the `v_` prefix.
fn variable_name(reference: &str) -> String {
    if reference.starts_with("v_") || reference.starts_with("p_") || reference.starts_with("auth_")
    {
        reference.to_string()
    } else {
        format!("v_{reference}")
    }
}

/// Format one field value for an INSERT/UPDATE statement.
///
/// Strings are quoted (with doubling), `$var` references become procedural
/// variables and are never quoted, scalars are stringified bare, and
/// array/object values are serialized and cast to `jsonb`.
pub fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => match s.strip_prefix('$') {
            Some(reference) => variable_name(reference),
            None => quote_literal(s),
        },
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => format!("{}::jsonb", quote_literal(&other.to_string())),
    }
}

/// Render a `TEXT[]` array constructor from a field list.
pub fn text_array(items: &[String]) -> String {
    if items.is_empty() {
        "ARRAY[]::TEXT[]".to_string()
    } else {
        let quoted: Vec<String> = items.iter().map(|i| quote_literal(i)).collect();
        format!("ARRAY[{}]", quoted.join(", "))
    }
}

/// Indent every non-empty line of a block by `levels` four-space steps.
pub fn indent(block: &str, levels: usize) -> String {
    let pad = "    ".repeat(levels);
    block
        .lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
