/// Shared error type used across all voxgate crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("pool: {0}")]
    Pool(String),

    #[error("tool: {0}")]
    Tool(String),

    #[error("audio: {0}")]
    Audio(String),

    #[error("config: {0}")]
    Config(String),

    #[error("session closed")]
    SessionClosed,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
