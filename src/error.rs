use thiserror::Error;

/// failures talking to the inference server.
#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("request failed: {0}")]
    Http(#[from] ureq::Error),

    #[error("server returned http {0}")]
    Status(u16),

    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server error: {0}")]
    Server(String),

    #[error("no response received from the model")]
    Empty,
}

impl OllamaError {
    /// ureq reports non-2xx as `StatusCode`; surface it as our own variant.
    pub(crate) fn from_ureq(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::Status(code),
            other => Self::Http(other),
        }
    }
}

/// failures reading or writing the local config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}
