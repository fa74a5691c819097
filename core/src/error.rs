use thiserror::Error;

/// A3S OCI error types
#[derive(Error, Debug)]
pub enum OciError {
    /// Digest is absent from a provider
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write target already holds the content
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Content referenced by a composition input could not be read
    #[error("Missing content: {what} {digest}: {source}")]
    MissingContent {
        what: String,
        digest: String,
        #[source]
        source: Box<OciError>,
    },

    /// Another writer is committing the same content
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Old base is not a layer prefix of the image being rebased
    #[error("Base mismatch: {0}")]
    BaseMismatch(String),

    /// Resolved platform differs from the requested one
    #[error("Platform mismatch: expected {expected}, found {actual}")]
    PlatformMismatch { expected: String, actual: String },

    /// Container registry error (network failure or unexpected status)
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Undecodable document, unexpected media type or unknown compression
    #[error("Malformed content: {0}")]
    MalformedContent(String),

    /// Written bytes do not hash to the descriptor digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Operation not implemented by this backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Every retry attempt failed
    #[error("{operation} failed after {attempts} attempts: {source}{}", format_previous(.previous))]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<OciError>,
        previous: Vec<String>,
    },

    /// Wrapping layer naming the operation that failed
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<OciError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

fn format_previous(previous: &[String]) -> String {
    if previous.is_empty() {
        String::new()
    } else {
        format!(" (previous attempts: {})", previous.join("; "))
    }
}

impl From<serde_json::Error> for OciError {
    fn from(err: serde_json::Error) -> Self {
        OciError::SerializationError(err.to_string())
    }
}

impl OciError {
    /// Wrap this error with the operation or descriptor that produced it.
    pub fn context(self, context: impl Into<String>) -> Self {
        OciError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping wrapping layers.
    pub fn root(&self) -> &OciError {
        match self {
            OciError::Context { source, .. }
            | OciError::MissingContent { source, .. }
            | OciError::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), OciError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), OciError::AlreadyExists(_))
    }

    /// Whether retrying the same call could succeed.
    ///
    /// Deterministic failures (bad input, missing content, mismatched
    /// preconditions) are never worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.root(),
            OciError::NotFound(_)
                | OciError::AlreadyExists(_)
                | OciError::BaseMismatch(_)
                | OciError::PlatformMismatch { .. }
                | OciError::MalformedContent(_)
                | OciError::DigestMismatch { .. }
                | OciError::Unsupported(_)
                | OciError::Cancelled
                | OciError::ConfigError(_)
        )
    }
}

/// Attach context to the error side of a `Result`.
pub trait ResultExt<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Result type alias for A3S OCI operations
pub type Result<T> = std::result::Result<T, OciError>;
