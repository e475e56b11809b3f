//! Recovery of tool calls the model emitted as tagged text instead of
//! structured `tool_calls`.
//!
//! Accepted forms inside assistant content:
//!
//! ```text
//! <tool_call>{"name": "bash", "arguments": {"command": "ls"}}</tool_call>
//! <tool_call><function=bash><parameter=command>ls</parameter></function></tool_call>
//! <function=bash><parameter=command>ls</parameter></function>
//! ```
//!
//! Only names present in the allowed set are recovered; anything else is
//! left in the content untouched. Recovered calls get synthetic ids
//! (`recovered-1`, `recovered-2`, …) and the matched spans are stripped
//! from the content.

use std::collections::BTreeSet;

use serde_json::Value;
use serde_json::json;

use crate::models::ToolCall;

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";
const FUNCTION_CLOSE: &str = "</function>";

#[derive(Debug, Default, PartialEq)]
pub struct Recovered {
    pub cleaned_content: String,
    pub calls: Vec<ToolCall>,
}

/// Scan `content` for tagged calls. Returns `None` when nothing allowed was
/// recovered (content untouched).
pub fn recover_tool_calls(content: &str, allowed: &BTreeSet<String>) -> Option<Recovered> {
    let mut cleaned = String::with_capacity(content.len());
    let mut calls: Vec<ToolCall> = Vec::new();
    let mut rest = content;

    while !rest.is_empty() {
        let tool_tag = rest.find(TOOL_CALL_OPEN);
        let bare_fn = rest.find("<function=");

        let (start, wrapped) = match (tool_tag, bare_fn) {
            (Some(t), Some(f)) if t <= f => (t, true),
            (Some(t), None) => (t, true),
            (_, Some(f)) => (f, false),
            (None, None) => break,
        };

        let (body, span_end) = if wrapped {
            let body_start = start + TOOL_CALL_OPEN.len();
            let Some(close) = rest[body_start..].find(TOOL_CALL_CLOSE) else {
                break;
            };
            (
                &rest[body_start..body_start + close],
                body_start + close + TOOL_CALL_CLOSE.len(),
            )
        } else {
            let Some(close) = rest[start..].find(FUNCTION_CLOSE) else {
                break;
            };
            (
                &rest[start..start + close + FUNCTION_CLOSE.len()],
                start + close + FUNCTION_CLOSE.len(),
            )
        };

        match parse_call_body(body.trim()) {
            Some((name, arguments)) if allowed.contains(&name) => {
                cleaned.push_str(&rest[..start]);
                let id = format!("recovered-{}", calls.len() + 1);
                calls.push(ToolCall::function(id, name, arguments));
            }
            _ => {
                // Unknown tool or malformed body: keep the span verbatim.
                cleaned.push_str(&rest[..span_end]);
            }
        }
        rest = &rest[span_end..];
    }

    if calls.is_empty() {
        return None;
    }
    cleaned.push_str(rest);
    Some(Recovered {
        cleaned_content: cleaned.trim().to_string(),
        calls,
    })
}

/// `body` is either a JSON object (`{"name":…,"arguments":…}`) or a
/// `<function=NAME>…</function>` block.
fn parse_call_body(body: &str) -> Option<(String, String)> {
    if body.starts_with('{') {
        let value: Value = serde_json::from_str(body).ok()?;
        let name = value.get("name")?.as_str()?.to_string();
        let arguments = match value.get("arguments") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "{}".to_string(),
        };
        return Some((name, arguments));
    }
    parse_function_form(body)
}

fn parse_function_form(body: &str) -> Option<(String, String)> {
    let after_open = body.strip_prefix("<function=")?;
    let name_end = after_open.find('>')?;
    let name = after_open[..name_end].trim().to_string();
    if name.is_empty() {
        return None;
    }
    let mut rest = &after_open[name_end + 1..];

    let mut arguments = serde_json::Map::new();
    while let Some(param_start) = rest.find("<parameter=") {
        let after_param = &rest[param_start + "<parameter=".len()..];
        let key_end = after_param.find('>')?;
        let key = after_param[..key_end].trim().to_string();
        let value_body = &after_param[key_end + 1..];
        let value_end = value_body.find("</parameter>")?;
        let raw = value_body[..value_end].trim_matches('\n');
        arguments.insert(key, parse_scalar(raw));
        rest = &value_body[value_end + "</parameter>".len()..];
    }

    Some((name, json!(arguments).to_string()))
}

/// Parameter values arrive as text; numbers and booleans are promoted so
/// tools with typed schemas still deserialize.
fn parse_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_number() || value.is_boolean() {
            return value;
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn allowed(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recovers_bare_function_form() {
        let content = "OK.\n<function=bash>\n<parameter=command>uname</parameter>\n</function>";
        let recovered = recover_tool_calls(content, &allowed(&["bash"])).unwrap();
        assert_eq!(recovered.cleaned_content, "OK.");
        assert_eq!(recovered.calls.len(), 1);
        assert_eq!(recovered.calls[0].function.name, "bash");
        let args: Value = serde_json::from_str(&recovered.calls[0].function.arguments).unwrap();
        assert_eq!(args, serde_json::json!({"command": "uname"}));
        assert_eq!(recovered.calls[0].id, "recovered-1");
    }

    #[test]
    fn recovers_json_tool_call_form() {
        let content =
            r#"Sure.<tool_call>{"name":"read","arguments":{"path":"main.go"}}</tool_call>"#;
        let recovered = recover_tool_calls(content, &allowed(&["read"])).unwrap();
        assert_eq!(recovered.cleaned_content, "Sure.");
        assert_eq!(recovered.calls[0].function.name, "read");
        let args: Value = serde_json::from_str(&recovered.calls[0].function.arguments).unwrap();
        assert_eq!(args.get("path").unwrap(), "main.go");
    }

    #[test]
    fn recovers_wrapped_function_form_with_numeric_parameter() {
        let content = "<tool_call><function=read><parameter=path>a.txt</parameter><parameter=limit>5</parameter></function></tool_call>";
        let recovered = recover_tool_calls(content, &allowed(&["read"])).unwrap();
        let args: Value = serde_json::from_str(&recovered.calls[0].function.arguments).unwrap();
        assert_eq!(args.get("limit").unwrap(), 5);
    }

    #[test]
    fn disallowed_names_are_left_in_content() {
        let content = "<function=evil><parameter=x>1</parameter></function>";
        assert!(recover_tool_calls(content, &allowed(&["bash"])).is_none());
    }

    #[test]
    fn multiple_calls_get_sequential_ids() {
        let content = "<tool_call>{\"name\":\"read\",\"arguments\":{\"path\":\"a\"}}</tool_call>\n\
                       <tool_call>{\"name\":\"read\",\"arguments\":{\"path\":\"b\"}}</tool_call>";
        let recovered = recover_tool_calls(content, &allowed(&["read"])).unwrap();
        assert_eq!(recovered.calls.len(), 2);
        assert_eq!(recovered.calls[1].id, "recovered-2");
        assert_eq!(recovered.cleaned_content, "");
    }

    #[test]
    fn plain_content_is_not_recovered() {
        assert!(recover_tool_calls("just text", &allowed(&["bash"])).is_none());
        assert!(recover_tool_calls("a < b > c", &allowed(&["bash"])).is_none());
    }

    #[test]
    fn malformed_blocks_are_preserved() {
        let content = "<tool_call>{broken json</tool_call> tail";
        assert!(recover_tool_calls(content, &allowed(&["bash"])).is_none());
    }
}
