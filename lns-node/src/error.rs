use thiserror::Error;

/// Errors that can occur in the network server node library
#[derive(Error, Debug)]
pub enum LnsError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared cache store error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cross-instance channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Provisioning backend error
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// Device could not be resolved
    #[error("Device not found: {0}")]
    NotFound(String),

    /// A distributed lock is held by another instance
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// Remote coordination failed
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using LnsError
pub type Result<T> = std::result::Result<T, LnsError>;

/// Classified failure of a bundled coordination call.
///
/// Transport errors never cross this boundary: every reqwest error, HTTP
/// status or timeout is mapped to one of these two variants first.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// Network error, 5xx or attempt timeout. Retried up to the ceiling.
    #[error("transient coordination failure after {attempts} attempt(s): {reason}")]
    Transient { attempts: u32, reason: String },

    /// 4xx or malformed response. Never retried.
    #[error("coordination rejected (status {status:?}): {reason}")]
    NonTransient { status: Option<u16>, reason: String },
}

impl CoordinationError {
    pub fn transient(reason: impl Into<String>) -> Self {
        CoordinationError::Transient {
            attempts: 1,
            reason: reason.into(),
        }
    }

    pub fn non_transient(status: Option<u16>, reason: impl Into<String>) -> Self {
        CoordinationError::NonTransient {
            status,
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinationError::Transient { .. })
    }

    /// Stamp the number of attempts made before the error became terminal
    pub(crate) fn with_attempts(self, attempts: u32) -> Self {
        match self {
            CoordinationError::Transient { reason, .. } => {
                CoordinationError::Transient { attempts, reason }
            }
            other => other,
        }
    }
}

impl From<String> for LnsError {
    fn from(s: String) -> Self {
        LnsError::Other(s)
    }
}

impl From<&str> for LnsError {
    fn from(s: &str) -> Self {
        LnsError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for LnsError {
    fn from(err: serde_json::Error) -> Self {
        LnsError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for LnsError {
    fn from(err: config::ConfigError) -> Self {
        LnsError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LnsError::Config("invalid retry ceiling".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid retry ceiling");
    }

    #[test]
    fn test_error_from_string() {
        let err: LnsError = "test error".into();
        assert!(matches!(err, LnsError::Other(_)));
    }

    #[test]
    fn test_coordination_classification() {
        let transient = CoordinationError::transient("503 Service Unavailable");
        assert!(transient.is_transient());
        assert_eq!(
            transient.with_attempts(9),
            CoordinationError::Transient {
                attempts: 9,
                reason: "503 Service Unavailable".to_string()
            }
        );

        let rejected = CoordinationError::non_transient(Some(404), "unknown device");
        assert!(!rejected.is_transient());
        let wrapped: LnsError = rejected.into();
        assert!(matches!(wrapped, LnsError::Coordination(_)));
    }
}
