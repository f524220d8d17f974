use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single labeling request
#[derive(Debug, Error)]
pub enum LabelError {
    #[error("API key pool is empty")]
    EmptyKeyPool,

    #[error("Rate limit still exceeded after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Failed to read image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LabelError {
    /// The request gave up while still rate limited
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LabelError::RateLimited { .. })
    }
}
