//! Expression compiler: restricted condition/value grammar → safe SQL.
//!
//! Example inputs and outputs:
//!
//! ```text
//! status = 'qualified'            →  v_status = 'qualified'
//! email LIKE '%@company.com'      →  v_email LIKE '%@company.com'
//! UPPER(TRIM(email))              →  UPPER(TRIM(v_email))
//! ```
//!
//! Defence layers, in order: a fixed denylist of dangerous substrings and
//! control characters checked against the raw text, then a parse into a
//! small AST, then allow-list validation of every operator, function, and
//! identifier *on the parsed AST* (textual variants cannot bypass it), and
//! finally re-serialization with field → variable substitution.
//!
//! The parser deliberately has no operator precedence: binaries split at
//! the first top-level occurrence of each operator, scanning operators in
//! a fixed priority list. Mixed `AND`/`OR` without parentheses therefore
//! groups as `AND(a, OR(b, c))`. This matches the surrounding toolchain
//! and is pinned by a regression test; do not "fix" it here.

use std::sync::LazyLock;

use regex::Regex;

use crate::ast::EntityDefinition;
use crate::error::{Result, SecurityError};

/// Operators accepted by allow-list validation.
const SAFE_OPERATORS: &[&str] = &[
    "=", "!=", "<", ">", "<=", ">=", "AND", "OR", "NOT", "IN", "LIKE", "ILIKE", "IS", "IS NOT",
    "+", "-", "*", "/",
];

/// Functions accepted by allow-list validation.
const SAFE_FUNCTIONS: &[&str] = &[
    "UPPER",
    "LOWER",
    "TRIM",
    "LENGTH",
    "COALESCE",
    "NOW",
    "CURRENT_DATE",
    "CURRENT_TIME",
    "EXTRACT",
    "SUBSTRING",
    "POSITION",
    "CONCAT",
];

/// Context variables that are always in scope.
const CONTEXT_VARIABLES: &[&str] = &["auth_user_id", "auth_tenant_id", "now()"];

/// Binary-split priority order. Position in this list, not position in the
/// expression, decides which operator splits first. `IS NOT` must precede
/// `NOT`, or `x IS NOT NULL` would split at `NOT` with an unparseable left
/// side.
const BINARY_SCAN_ORDER: &[&str] = &[
    "AND", "OR", "IS NOT", "NOT", "=", "!=", "<", ">", "<=", ">=", "LIKE", "ILIKE", "IN", "IS",
];

/// Denylist of injection patterns, checked before any parsing.
static DANGEROUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        r";\s*--",
        r";\s*/\*",
        r"union\s+select",
        r"exec\s*\(",
        r"xp_\w+",
        r";\s*drop\s+",
        r";\s*delete\s+from",
        r";\s*update\s+",
        r";\s*insert\s+",
    ]
    .iter()
    .map(|p| (Regex::new(&format!("(?i){p}")).unwrap(), *p))
    .collect()
});

static FUNCTION_CALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\w+)\s*\((.*)\)$").unwrap());

/// Variable-substitution form for recognized entity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarPrefix {
    /// Row-scoped locals (`v_<field>`).
    #[default]
    Local,
    /// Input parameters (`p_<field>`), used when validating inputs.
    Param,
    /// Bare column names, for fragments embedded in a WHERE clause.
    Column,
}

impl VarPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            VarPrefix::Local => "v_",
            VarPrefix::Param => "p_",
            VarPrefix::Column => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ExprNode {
    Group(Box<ExprNode>),
    Function { name: String, args: Vec<ExprNode> },
    Binary {
        operator: String,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Unary {
        operator: String,
        operand: Box<ExprNode>,
    },
    Literal(String),
    Identifier(String),
}

/// Compiles restricted expressions to safe SQL fragments.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionCompiler;

impl ExpressionCompiler {
    pub fn new() -> Self {
        Self
    }

    /// Compile with the default row-local (`v_`) substitution.
    pub fn compile(&self, expression: &str, entity: &EntityDefinition) -> Result<String> {
        self.compile_scoped(expression, entity, VarPrefix::Local, &[])
    }

    /// Compile with an explicit substitution prefix.
    pub fn compile_with_prefix(
        &self,
        expression: &str,
        entity: &EntityDefinition,
        prefix: VarPrefix,
    ) -> Result<String> {
        self.compile_scoped(expression, entity, prefix, &[])
    }

    /// Compile with additional in-scope iterator variables (`item`,
    /// `item.column`) admitted by identifier validation.
    pub fn compile_scoped(
        &self,
        expression: &str,
        entity: &EntityDefinition,
        prefix: VarPrefix,
        scope: &[String],
    ) -> Result<String> {
        self.check_security(expression)?;
        let ast = parse(expression)?;
        self.validate(&ast, entity, scope)?;
        Ok(self.serialize(&ast, entity, prefix))
    }

    /// Entity fields referenced by an expression, in order of appearance.
    pub(crate) fn referenced_fields(
        &self,
        expression: &str,
        entity: &EntityDefinition,
        scope: &[String],
    ) -> Result<Vec<String>> {
        self.check_security(expression)?;
        let ast = parse(expression)?;
        self.validate(&ast, entity, scope)?;
        let mut fields = Vec::new();
        collect_fields(&ast, entity, &mut fields);
        Ok(fields)
    }

    fn check_security(&self, expression: &str) -> Result<()> {
        for (regex, pattern) in DANGEROUS_PATTERNS.iter() {
            if regex.is_match(expression) {
                return Err(SecurityError::DangerousPattern {
                    pattern: (*pattern).to_string(),
                }
                .into());
            }
        }
        if expression
            .chars()
            .any(|c| matches!(c, '\\' | '\0' | '\n' | '\r'))
        {
            return Err(SecurityError::SuspiciousCharacters.into());
        }
        Ok(())
    }

    fn validate(&self, node: &ExprNode, entity: &EntityDefinition, scope: &[String]) -> Result<()> {
        match node {
            ExprNode::Binary {
                operator,
                left,
                right,
            } => {
                if !SAFE_OPERATORS.contains(&operator.as_str()) {
                    return Err(SecurityError::OperatorNotAllowed {
                        operator: operator.clone(),
                    }
                    .into());
                }
                self.validate(left, entity, scope)?;
                self.validate(right, entity, scope)
            }
            ExprNode::Unary { operator, operand } => {
                if !SAFE_OPERATORS.contains(&operator.as_str()) {
                    return Err(SecurityError::OperatorNotAllowed {
                        operator: operator.clone(),
                    }
                    .into());
                }
                self.validate(operand, entity, scope)
            }
            ExprNode::Function { name, args } => {
                if !SAFE_FUNCTIONS.contains(&name.as_str()) {
                    return Err(SecurityError::FunctionNotAllowed { name: name.clone() }.into());
                }
                for arg in args {
                    self.validate(arg, entity, scope)?;
                }
                Ok(())
            }
            ExprNode::Identifier(name) => {
                if entity.has_field(name) || is_allowed_variable(name, scope) {
                    Ok(())
                } else {
                    Err(SecurityError::UnknownIdentifier { name: name.clone() }.into())
                }
            }
            ExprNode::Group(inner) => self.validate(inner, entity, scope),
            // Literals are recognized structurally and always safe.
            ExprNode::Literal(_) => Ok(()),
        }
    }

    fn serialize(&self, node: &ExprNode, entity: &EntityDefinition, prefix: VarPrefix) -> String {
        match node {
            ExprNode::Binary {
                operator,
                left,
                right,
            } => format!(
                "{} {} {}",
                self.serialize(left, entity, prefix),
                operator,
                self.serialize(right, entity, prefix)
            ),
            ExprNode::Unary { operator, operand } => {
                format!("{} {}", operator, self.serialize(operand, entity, prefix))
            }
            ExprNode::Function { name, args } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|a| self.serialize(a, entity, prefix))
                    .collect();
                format!("{}({})", name, rendered.join(", "))
            }
            ExprNode::Identifier(name) => {
                if entity.has_field(name) {
                    format!("{}{}", prefix.as_str(), name)
                } else {
                    name.clone()
                }
            }
            ExprNode::Literal(value) => value.clone(),
            ExprNode::Group(inner) => format!("({})", self.serialize(inner, entity, prefix)),
        }
    }
}

fn is_allowed_variable(name: &str, scope: &[String]) -> bool {
    if name.starts_with("v_") || CONTEXT_VARIABLES.contains(&name) {
        return true;
    }
    scope
        .iter()
        .any(|var| name == var || name.starts_with(&format!("{var}.")))
}

fn collect_fields(node: &ExprNode, entity: &EntityDefinition, out: &mut Vec<String>) {
    match node {
        ExprNode::Binary { left, right, .. } => {
            collect_fields(left, entity, out);
            collect_fields(right, entity, out);
        }
        ExprNode::Unary { operand, .. } => collect_fields(operand, entity, out),
        ExprNode::Function { args, .. } => {
            for arg in args {
                collect_fields(arg, entity, out);
            }
        }
        ExprNode::Identifier(name) => {
            if entity.has_field(name) && !out.contains(name) {
                out.push(name.clone());
            }
        }
        ExprNode::Group(inner) => collect_fields(inner, entity, out),
        ExprNode::Literal(_) => {}
    }
}

fn parse(expression: &str) -> Result<ExprNode> {
    let expr = expression.trim();

    if is_outer_group(expr) {
        let inner = parse(&expr[1..expr.len() - 1])?;
        return Ok(ExprNode::Group(Box::new(inner)));
    }

    // Binary split: operator-list priority, first top-level occurrence.
    for operator in BINARY_SCAN_ORDER {
        if let Some(at) = find_top_level(expr, operator) {
            let left = &expr[..at - 1];
            let right = &expr[at + operator.len() + 1..];
            return Ok(ExprNode::Binary {
                operator: (*operator).to_string(),
                left: Box::new(parse(left)?),
                right: Box::new(parse(right)?),
            });
        }
    }

    if expr.len() > 4 && expr[..4].eq_ignore_ascii_case("NOT ") {
        return Ok(ExprNode::Unary {
            operator: "NOT".to_string(),
            operand: Box::new(parse(&expr[4..])?),
        });
    }

    if let Some(caps) = FUNCTION_CALL.captures(expr) {
        // Only a whole-expression call counts; `f(a) = g(b)` is not one.
        let open = expr.find('(').unwrap_or(0);
        if is_outer_group(&expr[open..]) {
            let name = caps[1].to_uppercase();
            if !SAFE_FUNCTIONS.contains(&name.as_str()) {
                return Err(SecurityError::FunctionNotAllowed { name }.into());
            }
            let args = split_args(caps[2].trim())
                .into_iter()
                .map(parse)
                .collect::<Result<Vec<_>>>()?;
            return Ok(ExprNode::Function { name, args });
        }
    }

    if is_string_literal(expr) || is_number_literal(expr) || is_keyword_literal(expr) {
        return Ok(ExprNode::Literal(expr.to_string()));
    }

    Ok(ExprNode::Identifier(expr.to_string()))
}

/// Whether the leading `(` closes only at the very last character.
fn is_outer_group(expr: &str) -> bool {
    let bytes = expr.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'(' || bytes[bytes.len() - 1] != b')' {
        return false;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if b == b'\'' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'\'' => in_string = true,
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 && i != bytes.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Byte offset of the first top-level ` <operator> ` occurrence, pointing
/// at the operator itself. Case-insensitive; skips parenthesized regions
/// and single-quoted strings.
fn find_top_level(expr: &str, operator: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    let pattern: Vec<u8> = format!(" {operator} ")
        .bytes()
        .map(|b| b.to_ascii_uppercase())
        .collect();
    let mut depth = 0i32;
    let mut in_string = false;
    for i in 0..bytes.len() {
        let b = bytes[i];
        if in_string {
            if b == b'\'' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'\'' => {
                in_string = true;
                continue;
            }
            b'(' => {
                depth += 1;
                continue;
            }
            b')' => {
                depth -= 1;
                continue;
            }
            _ => {}
        }
        if depth == 0 && i + pattern.len() <= bytes.len() {
            let window = &bytes[i..i + pattern.len()];
            if window
                .iter()
                .zip(pattern.iter())
                .all(|(a, p)| a.to_ascii_uppercase() == *p)
            {
                return Some(i + 1);
            }
        }
    }
    None
}

/// Split function arguments at top-level commas.
fn split_args(args: &str) -> Vec<&str> {
    if args.is_empty() {
        return Vec::new();
    }
    let bytes = args.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0usize;
    let mut depth = 0i32;
    let mut in_string = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if b == b'\'' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'\'' => in_string = true,
            b'(' => depth += 1,
            b')' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(args[start..].trim());
    parts
}

fn is_string_literal(expr: &str) -> bool {
    (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
        || (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2)
}

fn is_number_literal(expr: &str) -> bool {
    expr.parse::<f64>().is_ok()
}

fn is_keyword_literal(expr: &str) -> bool {
    expr.eq_ignore_ascii_case("TRUE")
        || expr.eq_ignore_ascii_case("FALSE")
        || expr.eq_ignore_ascii_case("NULL")
}
