//! Schema translation: server-declared input schemas into parameter descriptors.
//!
//! Tools describe their arguments with a JSON-Schema-like object
//! (`properties` + `required`). Rather than synthesizing a type per tool, the
//! schema is flattened into an ordered list of [`ParameterDescriptor`]s that
//! callers validate argument maps against.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── ParameterKind ───────────────────────────────────────────────────────────

/// The value kind a tool parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Integer,
    Number,
    Boolean,
    List,
    Object,
}

impl ParameterKind {
    /// Map a declared JSON-Schema type name. Unknown names fall back to string.
    pub fn from_schema_type(name: &str) -> Self {
        match name {
            "integer" => ParameterKind::Integer,
            "number" => ParameterKind::Number,
            "boolean" => ParameterKind::Boolean,
            "array" => ParameterKind::List,
            "object" => ParameterKind::Object,
            _ => ParameterKind::String,
        }
    }

    /// Whether `value` (non-null) is acceptable for this kind.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            ParameterKind::String => value.is_string(),
            ParameterKind::Integer => value.is_i64() || value.is_u64(),
            ParameterKind::Number => value.is_number(),
            ParameterKind::Boolean => value.is_boolean(),
            ParameterKind::List => value.is_array(),
            ParameterKind::Object => value.is_object(),
        }
    }

    /// The JSON-Schema type name this kind is emitted as.
    pub fn schema_type(self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Number => "number",
            ParameterKind::Boolean => "boolean",
            ParameterKind::List => "array",
            ParameterKind::Object => "object",
        }
    }
}

impl std::fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParameterKind::List => "list",
            other => other.schema_type(),
        };
        f.write_str(name)
    }
}

// ─── ParameterDescriptor ─────────────────────────────────────────────────────

/// One tool argument.
///
/// A required parameter never has a default. An optional one is always
/// nullable and defaults to JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ParameterKind,
    pub nullable: bool,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Translate a tool input schema into parameter descriptors, in the order the
/// schema declares its properties. Pure and deterministic.
pub fn translate_schema(schema: &Value) -> Vec<ParameterDescriptor> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Vec::new();
    };

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    properties
        .iter()
        .map(|(name, property)| {
            let is_required = required.contains(&name.as_str());
            let (kind, declares_null) = declared_kind(property);
            ParameterDescriptor {
                name: name.clone(),
                kind,
                nullable: !is_required || declares_null,
                required: is_required,
                default: (!is_required).then_some(Value::Null),
                description: property
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }
        })
        .collect()
}

/// Kind of a property plus whether its type list admits `null`.
fn declared_kind(property: &Value) -> (ParameterKind, bool) {
    match property.get("type") {
        Some(Value::String(name)) => (ParameterKind::from_schema_type(name), name == "null"),
        Some(Value::Array(names)) => {
            let names: Vec<&str> = names.iter().filter_map(Value::as_str).collect();
            let kind = names
                .iter()
                .find(|name| **name != "null")
                .map(|name| ParameterKind::from_schema_type(name))
                .unwrap_or(ParameterKind::String);
            (kind, names.contains(&"null"))
        }
        _ => (ParameterKind::String, false),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
