//! OpenAI-compatible streaming chat client.
//!
//! POSTs to `<base_url>/chat/completions` with `stream: true` and decodes
//! the SSE stream into [`StreamEvent`]s. Tool-call fragments arrive
//! interleaved and index-keyed; they are accumulated here and released as
//! complete calls inside the final [`CompletedResponse`], so the turn loop
//! never sees a half-built call.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use crate::client_common::CompletedResponse;
use crate::client_common::Prompt;
use crate::client_common::Provider;
use crate::client_common::ResponseStream;
use crate::client_common::StreamEvent;
use crate::client_common::backoff;
use crate::config::Config;
use crate::error::CoderErr;
use crate::error::Result;
use crate::models::ToolCall;

const REQUEST_MAX_RETRIES: u64 = 4;
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key_env: String,
}

impl OpenAiClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
        }
    }

    /// The API key is mandatory unless the provider looks local.
    fn api_key(&self) -> Result<Option<String>> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.is_empty() => Ok(Some(key)),
            _ => {
                if self.base_url.contains("localhost") || self.base_url.contains("127.0.0.1") {
                    Ok(None)
                } else {
                    Err(CoderErr::EnvVar {
                        var: self.api_key_env.clone(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiClient {
    async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream> {
        let mut payload = json!({
            "model": prompt.model,
            "messages": prompt.messages,
            "stream": true,
        });
        if !prompt.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&prompt.tools)?;
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!("POST {url} ({} messages)", prompt.messages.len());
        let api_key = self.api_key()?;

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut req = self
                .http
                .post(&url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&payload);
            if let Some(key) = &api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let (tx, rx) = mpsc::channel::<Result<StreamEvent>>(16);
                    let stream = resp.bytes_stream().map_err(CoderErr::Reqwest);
                    tokio::spawn(process_sse(stream, tx));
                    return Ok(ResponseStream::new(rx));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(CoderErr::UnexpectedStatus(status, body));
                    }
                    if attempt > REQUEST_MAX_RETRIES {
                        return Err(CoderErr::RetryLimit(status));
                    }
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    tokio::time::sleep(retry_after.unwrap_or_else(|| backoff(attempt))).await;
                }
                Err(e) => {
                    if attempt > REQUEST_MAX_RETRIES {
                        return Err(e.into());
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Decode one SSE stream, forwarding deltas and emitting a single
/// `Completed` event at the end.
async fn process_sse<S>(stream: S, tx: mpsc::Sender<Result<StreamEvent>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    let mut content = String::new();
    let mut reasoning = String::new();
    // Fragments keyed by the tool-call index so parallel calls interleave
    // safely.
    let mut calls: BTreeMap<u64, PartialToolCall> = BTreeMap::new();
    let mut completed = false;

    loop {
        let sse = match timeout(STREAM_IDLE_TIMEOUT, stream.next()).await {
            Ok(Some(Ok(event))) => event,
            Ok(Some(Err(e))) => {
                let _ = tx
                    .send(Err(CoderErr::Stream(e.to_string(), None)))
                    .await;
                return;
            }
            Ok(None) => break,
            Err(_) => {
                let _ = tx
                    .send(Err(CoderErr::Stream(
                        "idle timeout waiting for SSE".to_string(),
                        None,
                    )))
                    .await;
                return;
            }
        };

        if sse.data.trim() == "[DONE]" {
            break;
        }
        let chunk: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        trace!("SSE chunk: {chunk:?}");

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            continue;
        };
        let delta = choice.get("delta");

        if let Some(text) = delta
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
        {
            content.push_str(text);
            let _ = tx.send(Ok(StreamEvent::TextDelta(text.to_string()))).await;
        }

        // Providers disagree on the field name for reasoning deltas.
        for key in ["reasoning", "reasoning_content"] {
            if let Some(text) = delta.and_then(|d| d.get(key)).and_then(|c| c.as_str()) {
                reasoning.push_str(text);
                let _ = tx
                    .send(Ok(StreamEvent::ReasoningDelta(text.to_string())))
                    .await;
            }
        }

        if let Some(fragments) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        {
            for fragment in fragments {
                let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let partial = calls.entry(index).or_default();
                if let Some(id) = fragment.get("id").and_then(|v| v.as_str()) {
                    partial.id.get_or_insert_with(|| id.to_string());
                }
                if let Some(function) = fragment.get("function") {
                    if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                        partial.name.get_or_insert_with(|| name.to_string());
                    }
                    if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                        partial.arguments.push_str(args);
                    }
                }
            }
        }

        if choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .is_some()
        {
            completed = true;
            break;
        }
    }

    if !completed {
        trace!("SSE stream closed without finish_reason");
    }
    let response = CompletedResponse {
        content,
        reasoning: if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        },
        tool_calls: assemble_tool_calls(calls),
    };
    let _ = tx.send(Ok(StreamEvent::Completed(response))).await;
}

fn assemble_tool_calls(calls: BTreeMap<u64, PartialToolCall>) -> Vec<ToolCall> {
    calls
        .into_values()
        .filter_map(|partial| {
            let name = partial.name?;
            let id = partial
                .id
                .unwrap_or_else(|| format!("call-{}", uuid::Uuid::new_v4()));
            Some(ToolCall::function(id, name, partial.arguments))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use futures::StreamExt;

    use super::*;

    fn sse_body(events: &[&str]) -> Vec<Result<Bytes>> {
        events
            .iter()
            .map(|e| Ok(Bytes::from(format!("data: {e}\n\n"))))
            .collect()
    }

    async fn run_sse(events: &[&str]) -> Vec<StreamEvent> {
        let (tx, rx) = mpsc::channel(16);
        let stream = futures::stream::iter(sse_body(events));
        process_sse(stream, tx).await;
        let mut out = Vec::new();
        let mut rx = ResponseStream::new(rx);
        while let Some(event) = rx.next().await {
            out.push(event.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn text_deltas_accumulate_into_completed() {
        let events = run_sse(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
        ])
        .await;
        let StreamEvent::Completed(response) = events.last().unwrap() else {
            panic!("expected Completed last");
        };
        assert_eq!(response.content, "Hello");
        assert!(response.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn tool_call_fragments_assemble_by_index() {
        let events = run_sse(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"bash","arguments":"{\"comm"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"read","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"and\":\"ls\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ])
        .await;
        let StreamEvent::Completed(response) = events.last().unwrap() else {
            panic!("expected Completed last");
        };
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].function.name, "bash");
        assert_eq!(
            response.tool_calls[0].function.arguments,
            r#"{"command":"ls"}"#
        );
        assert_eq!(response.tool_calls[1].function.name, "read");
    }

    #[tokio::test]
    async fn reasoning_deltas_are_captured() {
        let events = run_sse(&[
            r#"{"choices":[{"delta":{"reasoning_content":"thinking "}}]}"#,
            r#"{"choices":[{"delta":{"content":"done"},"finish_reason":"stop"}]}"#,
        ])
        .await;
        let StreamEvent::Completed(response) = events.last().unwrap() else {
            panic!("expected Completed last");
        };
        assert_eq!(response.reasoning.as_deref(), Some("thinking "));
        assert_eq!(response.content, "done");
    }

    #[tokio::test]
    async fn done_sentinel_completes_gracefully() {
        let events = run_sse(&[r#"{"choices":[{"delta":{"content":"hi"}}]}"#, "[DONE]"]).await;
        assert!(matches!(events.last(), Some(StreamEvent::Completed(_))));
    }
}
