//! Tool registry: the server-qualified view of every discovered tool.
//!
//! Provides:
//! - Qualified naming (`server__tool`) and splitting on the first separator
//! - Tool descriptors carrying translated parameter sets
//! - Argument validation against those parameters
//! - Serialization into function-calling format for the agent collaborator

use serde::Serialize;
use serde_json::{Map, Value};

use super::config::NAME_SEPARATOR;
use super::errors::McpError;
use super::schema::{translate_schema, ParameterDescriptor};
use super::types::McpToolDefinition;

// ─── Qualified Names ─────────────────────────────────────────────────────────

/// Compose `server__tool`.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{NAME_SEPARATOR}{tool}")
}

/// Split a qualified name on the first `__` into `(server, tool)`.
///
/// E.g., `"files__read__raw"` → `("files", "read__raw")`.
pub fn split_qualified_name(name: &str) -> Result<(&str, &str), McpError> {
    name.split_once(NAME_SEPARATOR)
        .ok_or_else(|| McpError::InvalidName {
            name: name.to_string(),
        })
}

// ─── ToolDescriptor ──────────────────────────────────────────────────────────

/// One routable tool, as handed to the agent collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub qualified_name: String,
    pub description: String,
    pub parameter_set: Vec<ParameterDescriptor>,
    /// Owning session.
    pub server_name: String,
    /// Name the owning server knows the tool by.
    pub tool_name: String,
    #[serde(skip)]
    input_schema: Value,
}

impl ToolDescriptor {
    pub fn from_definition(server_name: &str, def: &McpToolDefinition) -> Self {
        let description = match def.description.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => format!("Tool {} from {server_name}", def.name),
        };
        Self {
            qualified_name: qualify(server_name, &def.name),
            description,
            parameter_set: translate_schema(&def.input_schema),
            server_name: server_name.to_string(),
            tool_name: def.name.clone(),
            input_schema: def.input_schema.clone(),
        }
    }

    /// The schema the server declared, untranslated.
    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }

    /// Check an argument map against the parameter set.
    ///
    /// Required parameters must be present and non-null, present values must
    /// match their kind, and `null` is only accepted where nullable. Keys the
    /// schema does not declare pass through to the server.
    pub fn validate_arguments(&self, arguments: &Map<String, Value>) -> Result<(), McpError> {
        for param in &self.parameter_set {
            match arguments.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(self.invalid(format!("missing required field: '{}'", param.name)));
                }
                None => {}
                Some(Value::Null) if param.nullable => {}
                Some(Value::Null) => {
                    return Err(self.invalid(format!("'{}' must not be null", param.name)));
                }
                Some(value) if !param.kind.accepts(value) => {
                    return Err(self.invalid(format!(
                        "'{}' must be {}, got {}",
                        param.name,
                        param.kind,
                        json_type_name(value)
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Function-calling form: `{"type": "function", "function": {...}}`.
    pub fn function_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameter_set {
            let mut property = Map::new();
            let kind = Value::from(param.kind.schema_type());
            let type_value = if param.nullable {
                Value::Array(vec![kind, Value::from("null")])
            } else {
                kind
            };
            property.insert("type".into(), type_value);
            if !param.description.is_empty() {
                property.insert("description".into(), Value::from(param.description.as_str()));
            }
            properties.insert(param.name.clone(), Value::Object(property));
            if param.required {
                required.push(Value::from(param.name.as_str()));
            }
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.qualified_name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }

    fn invalid(&self, reason: String) -> McpError {
        McpError::InvalidArguments {
            tool: self.qualified_name.clone(),
            reason,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Ordered, flattened registry across all connected servers.
///
/// Order is server registration order, then each server's catalog order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a server's catalog.
    pub fn register_server_tools(&mut self, server_name: &str, tools: &[McpToolDefinition]) {
        self.tools.extend(
            tools
                .iter()
                .map(|def| ToolDescriptor::from_definition(server_name, def)),
        );
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Descriptors owned by one server.
    pub fn tools_for_server(&self, server_name: &str) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .filter(|t| t.server_name == server_name)
            .cloned()
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
