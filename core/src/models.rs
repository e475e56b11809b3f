//! Wire-level data model shared by the turn loop, the provider client, and
//! the persistence layer.
//!
//! The shapes follow the Chat Completions API: assistant messages may carry
//! `tool_calls`, every `tool` message must carry the `tool_call_id` of the
//! assistant call it resolves, and `function.arguments` is always a JSON
//! *string*, even when it encodes an object. Role-inappropriate fields are
//! omitted on serialization so the provider does not reject the payload.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    /// Model reasoning attached to an assistant message. Kept in the session
    /// transcript; never sent back to the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_calls(
        content: impl Into<String>,
        reasoning: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            reasoning,
            name: None,
            tool_call_id: None,
            tool_calls,
        }
    }

    /// A `tool` message resolving the call with `call_id`. `content` is the
    /// tool's JSON result string.
    pub fn tool(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            reasoning: None,
            name: Some(name.into()),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_call_type")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

fn function_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments object, kept as a raw string and parsed by the
    /// tool at execution time. This exactly matches the wire format.
    pub arguments: String,
}

/// A tool advertised to the model. The name is the sole routing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type", default = "function_call_type")]
    pub kind: String,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: JsonSchema) -> Self {
        Self {
            kind: function_call_type(),
            function: FunctionDef {
                name: name.into(),
                description: Some(description.into()),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: JsonSchema,
}

/// Generic JSON-Schema subset needed for our tool definitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonSchema {
    Boolean {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    String {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(alias = "integer")]
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Array {
        items: Box<JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Object {
        properties: BTreeMap<String, JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        required: Option<Vec<String>>,
        #[serde(
            rename = "additionalProperties",
            skip_serializing_if = "Option::is_none"
        )]
        additional_properties: Option<bool>,
    },
}

impl JsonSchema {
    pub fn string(description: &str) -> Self {
        JsonSchema::String {
            description: Some(description.to_string()),
        }
    }

    pub fn number(description: &str) -> Self {
        JsonSchema::Number {
            description: Some(description.to_string()),
        }
    }

    pub fn boolean(description: &str) -> Self {
        JsonSchema::Boolean {
            description: Some(description.to_string()),
        }
    }

    pub fn object(properties: BTreeMap<String, JsonSchema>, required: &[&str]) -> Self {
        JsonSchema::Object {
            properties,
            required: if required.is_empty() {
                None
            } else {
                Some(required.iter().map(|s| s.to_string()).collect())
            },
            additional_properties: Some(false),
        }
    }
}
