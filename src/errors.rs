use std::fmt;

/// Classification tag attached to every [`VaultError`].
///
/// Kinds are coarse on purpose: the retry helper and the server's propagation
/// policy only ever branch on the kind, never on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Connection,
    Timeout,
    Storage,
    FileNotFound,
    Corruption,
    QuotaExceeded,
    Authentication,
    Authorization,
    Encryption,
    Config,
    Validation,
    Internal,
    InvalidInput,
}

impl ErrorKind {
    /// Transient kinds that are worth retrying with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Storage
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::Storage => "STORAGE_ERROR",
            ErrorKind::FileNotFound => "FILE_NOT_FOUND",
            ErrorKind::Corruption => "CORRUPTION_ERROR",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::Authorization => "AUTHORIZATION_ERROR",
            ErrorKind::Encryption => "ENCRYPTION_ERROR",
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::InvalidInput => "INVALID_INPUT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carrying a kind tag, a human message, an optional cause
/// and free-form context key/values.
#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct VaultError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    context: Vec<(String, String)>,
}

pub type Result<T> = std::result::Result<T, VaultError>;

impl VaultError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            context: Vec::new(),
        }
    }

    /// Wrap an underlying error with a kind and a higher-level message.
    pub fn wrap(
        cause: impl std::error::Error + Send + Sync + 'static,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
            context: Vec::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.context.push((key.into(), value.to_string()));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message)
    }

    pub fn file_not_found(key: impl fmt::Display) -> Self {
        Self::new(ErrorKind::FileNotFound, format!("file not found: {key}"))
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corruption, message)
    }

    pub fn encryption(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Encryption, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }
}
