use thiserror::Error;

/// Process exit codes per the external-interface contract.
pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;
pub const EXIT_RUNTIME_ERROR: i32 = 2;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("bind error on {addr}: {source}")]
    Bind { addr: String, #[source] source: std::io::Error },

    #[error("patch rejected: {0}")]
    PatchRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("external fetch failed: {0}")]
    ExternalFetch(String),

    #[error("hub authentication error: {0}")]
    Auth(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl RelayError {
    /// Whether this error class is fatal at startup (exit code 1).
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, RelayError::Config(_) | RelayError::Bind { .. })
    }
}
