use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoderErr>;

#[derive(Error, Debug)]
pub enum CoderErr {
    /// The SSE stream disconnected or errored after the HTTP handshake
    /// succeeded but before the final chunk. The turn loop treats this as
    /// transient and retries. Optionally carries a requested retry delay.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    /// Unexpected HTTP status from the provider.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry budget for a provider call was exhausted.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// The turn was cancelled. No tool message is appended for the call in
    /// flight; the whole turn unwinds.
    #[error("turn cancelled")]
    Interrupted,

    /// The ReAct loop hit its step bound. Carries the last assistant text so
    /// the caller can still surface it.
    #[error("step limit reached after {steps} steps")]
    StepLimitReached { steps: usize, last_content: String },

    /// A path escaped the workspace root.
    #[error("path outside workspace: {0}")]
    PathOutsideWorkspace(String),

    #[error("workspace root is invalid: {0}")]
    InvalidWorkspace(String),

    /// Missing environment variable (typically the provider API key).
    #[error("missing environment variable: `{var}`")]
    EnvVar { var: String },

    /// Bang-mode input while the active agent has bash disabled.
    #[error("command mode denied: bash is not available to the `{agent}` agent")]
    CommandModeDenied { agent: String },

    #[error("unknown session: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoderErr {
    /// True for the two structured terminal errors a turn can return
    /// alongside partial output.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoderErr::Interrupted | CoderErr::StepLimitReached { .. }
        )
    }
}
