/// The main error type for the rebill engine.
///
/// Domain-specific failures live in [`crate::billing::BillingError`] and are
/// mapped onto these transport-agnostic categories via `From`. Consumers
/// mounting the engine behind HTTP typically map `is_client_error()` to 4xx
/// and everything else to 5xx.
#[derive(Debug, thiserror::Error)]
pub enum RebillError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl RebillError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// True for errors caused by the caller's input or the entity's state.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::BadRequest(_) | Self::Conflict(_))
    }

    /// True for errors originating in the engine or its collaborators.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns an error message suitable for caller-facing responses.
    ///
    /// Client errors expose their message since the caller needs to know what
    /// went wrong. Server errors return a generic message to prevent
    /// information disclosure; full details stay in server-side logs.
    #[must_use]
    pub fn safe_message(&self) -> String {
        match self {
            Self::NotFound(msg) => format!("Not found: {}", msg),
            Self::BadRequest(msg) => format!("Bad request: {}", msg),
            Self::Conflict(msg) => format!("Conflict: {}", msg),

            Self::Internal(_) | Self::Anyhow(_) => "Internal error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable".to_string(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, RebillError>;

// Common error type conversions

impl From<serde_json::Error> for RebillError {
    fn from(err: serde_json::Error) -> Self {
        // Classify based on error category
        if err.is_data() || err.is_syntax() || err.is_eof() {
            RebillError::BadRequest(format!("JSON error: {}", err))
        } else {
            // IO errors are internal
            RebillError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}
