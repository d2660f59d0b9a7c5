#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("malformed embedding from {provider}: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("{0}")]
    Other(String),
}
