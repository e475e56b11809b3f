//! Provider-agnostic streaming chat contract consumed by the turn loop.

use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::models::Message;
use crate::models::ToolCall;
use crate::models::ToolDef;

/// One provider call: full conversation context plus the tools advertised
/// for this step.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
}

/// Final assembled response of one streaming call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletedResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug)]
pub enum StreamEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// Incremental reasoning text.
    ReasoningDelta(String),
    /// Terminal event; the stream ends after this.
    Completed(CompletedResponse),
}

pub struct ResponseStream {
    pub(crate) rx: mpsc::Receiver<Result<StreamEvent>>,
}

impl ResponseStream {
    pub fn new(rx: mpsc::Receiver<Result<StreamEvent>>) -> Self {
        Self { rx }
    }
}

impl Stream for ResponseStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// An async producer of streaming chat events. Implemented by the HTTP
/// client and by scripted fakes in tests.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream>;
}

/// Jittered exponential backoff for HTTP-level retries:
/// 200ms → 400ms → 800ms → …
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt.saturating_sub(1)).min(6));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((base_delay_ms as f64 * jitter) as u64)
}

/// Turn-level retry delay for provider errors: 150ms × (attempt + 1).
pub(crate) fn provider_retry_delay(attempt: u64) -> Duration {
    Duration::from_millis(150 * (attempt + 1))
}
