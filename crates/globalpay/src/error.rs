use thiserror::Error;

/// Errors raised while loading or validating the static catalog.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog: {0}")]
    Invalid(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invalid pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

/// Errors returned by client store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("client not found: {0}")]
    NotFound(String),

    #[error("duplicate client or key")]
    Duplicate,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors returned by the client registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid API key")]
    InvalidKey,

    #[error("client {0} is suspended")]
    Suspended(String),

    #[error("client not found: {0}")]
    UnknownClient(String),

    #[error("request origin not permitted for this client")]
    OriginNotAllowed,

    #[error("source address not permitted for this client")]
    IpNotAllowed,

    #[error("invalid client profile: {0}")]
    InvalidProfile(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures raised by endpoint handlers. Only the message in `InvalidParams`
/// is meant for the caller.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("internal endpoint failure: {0}")]
    Internal(String),
}

/// A single provider attempt failure. Always transient from the point of view
/// of the failover manager: the next candidate is tried.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("provider timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("charge rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(0)
        } else if e.is_decode() {
            ProviderError::InvalidResponse(e.to_string())
        } else {
            // reqwest errors include the URL but never the request body
            ProviderError::Transport(e.without_url().to_string())
        }
    }
}
