//! Tool descriptors returned by discovery and results of tool calls

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Type reported for parameters whose schema carries no usable `type`
pub const UNKNOWN_PARAMETER_TYPE: &str = "any";

/// Schema summary for a single tool parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
}

/// A callable tool exposed by a running MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParameterSchema>,
}

impl ToolDescriptor {
    /// Build a descriptor from a tool's JSON input schema
    ///
    /// Only top-level `properties` are summarised; nested schemas are reported
    /// by their outer type.
    pub fn from_schema(name: String, description: Option<String>, input_schema: &Value) -> Self {
        let parameters = input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| {
                properties
                    .iter()
                    .map(|(param, schema)| {
                        let summary = ParameterSchema {
                            param_type: schema_type(schema),
                            description: schema
                                .get("description")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        };
                        (param.clone(), summary)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name,
            description: description.unwrap_or_default(),
            parameters,
        }
    }
}

/// Outcome of invoking a tool on a running server
///
/// `is_error` reports a failure inside the tool itself; protocol failures
/// surface as errors instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<Value>,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireToolResult {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    is_error: Option<bool>,
    #[serde(default)]
    structured_content: Option<Value>,
}

impl ToolCallResult {
    /// Parse the `result` of a `tools/call` response
    pub fn from_wire(result: Value) -> Result<Self, String> {
        let wire: WireToolResult = serde_json::from_value(result)
            .map_err(|e| format!("malformed tools/call result: {}", e))?;
        Ok(Self {
            content: wire.content,
            is_error: wire.is_error.unwrap_or(false),
            structured_content: wire.structured_content,
        })
    }
}

/// Resolve the `type` of a property schema
///
/// Handles `"type": "string"`, `"type": ["string", "null"]` and
/// `anyOf`/`oneOf` unions (first non-null variant wins).
fn schema_type(schema: &Value) -> String {
    match schema.get("type") {
        Some(Value::String(t)) => return t.clone(),
        Some(Value::Array(types)) => {
            if let Some(t) = types
                .iter()
                .filter_map(Value::as_str)
                .find(|t| *t != "null")
            {
                return t.to_string();
            }
        }
        _ => {}
    }

    for key in ["anyOf", "oneOf"] {
        if let Some(variants) = schema.get(key).and_then(Value::as_array) {
            let resolved = variants
                .iter()
                .map(schema_type)
                .find(|t| t != "null" && t != UNKNOWN_PARAMETER_TYPE);
            if let Some(t) = resolved {
                return t;
            }
        }
    }

    UNKNOWN_PARAMETER_TYPE.to_string()
}
