#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The config repo attempt was discarded; the message carries every
    /// problem found during the parse, not just the first one.
    #[error("config repo rejected: {0}")]
    ConfigRepo(String),

    #[error("git operation failed: {0}")]
    Git(String),

    #[error("host definition '{file}' is invalid: {reason}")]
    HostDefinition { file: String, reason: String },

    #[error("communication with {url} failed: {reason}")]
    Communication { url: String, reason: String },

    #[error("protocol mismatch from {url}: {reason}")]
    Protocol { url: String, reason: String },

    #[error("{url} denied the request: {reason}")]
    PermissionDenied { url: String, reason: String },

    #[error("executor '{0}' is not a member of this pool")]
    NotAMember(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Transient failures are retried on the caller's next scheduled pass.
    /// Authorization and validation failures are surfaced instead.
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::Communication { .. })
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
