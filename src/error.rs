//! Error handling for the provisioning, invocation, and inline-agent recipes
//!
//! Every fallible operation in the crate returns [`KitError`]. AWS SDK failures
//! are folded into a small set of categories based on the service error code so
//! that callers can branch on "not found" or "already exists" without matching
//! per-operation error enums.
//!
//! ```rust
//! use bedrock_agent_kit::error::KitError;
//!
//! # fn handle(error: KitError) {
//! if error.is_not_found() {
//!     // The resource is already gone; treat deletion as done
//! } else if error.is_conflict() {
//!     // The resource or statement already exists; reuse it
//! } else if error.is_retryable() {
//!     // Throttling or a transient network failure
//! }
//! # }
//! ```

use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use aws_smithy_types::error::operation::BuildError;
use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug, Clone)]
pub enum KitError {
    /// Input validation errors (arguments, malformed events, bad builders)
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Configuration errors (missing settings, unreadable files)
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// AWS resource not found
    #[error("AWS resource not found: {message}")]
    ResourceNotFound { message: String },

    /// AWS resource or statement already exists
    #[error("AWS resource conflict: {message}")]
    Conflict { message: String },

    /// AWS authentication or permission errors
    #[error("AWS access denied: {message}")]
    AccessDenied { message: String },

    /// AWS request validation failed
    #[error("AWS validation error: {message}")]
    ValidationError { message: String },

    /// AWS throttling/rate limiting
    #[error("AWS throttling: {message}")]
    ThrottlingError { message: String },

    /// Any other service error, kept with its code
    #[error("AWS error ({}): {message}", code.as_deref().unwrap_or("unknown"))]
    AwsError {
        code: Option<String>,
        message: String,
    },

    /// A remote resource did not reach the expected state in time
    #[error("Timed out after {waited_ms}ms waiting for {what}")]
    TimeoutError { what: String, waited_ms: u64 },

    /// Network-related errors (SDK dispatch failures, HTTP downloads)
    #[error("Network error: {message}")]
    NetworkError { message: String },

    /// JSON/YAML serialization errors
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    /// Local filesystem errors
    #[error("IO error: {message}")]
    IoError { message: String },

    /// Zip packaging errors
    #[error("Packaging error: {message}")]
    PackagingError { message: String },

    /// MCP client and server process errors
    #[error("MCP error: {message}")]
    McpError { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl KitError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    pub fn resource_not_found(message: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, waited_ms: u64) -> Self {
        Self::TimeoutError {
            what: what.into(),
            waited_ms,
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    pub fn packaging_error(message: impl Into<String>) -> Self {
        Self::PackagingError {
            message: message.into(),
        }
    }

    pub fn mcp_error(message: impl Into<String>) -> Self {
        Self::McpError {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Map an AWS service error code onto a category
    ///
    /// Codes differ between services for the same condition: IAM reports
    /// `NoSuchEntity`, Bedrock and Lambda report `ResourceNotFoundException`,
    /// S3 `HeadBucket` reports a bare `NotFound`.
    pub fn from_service_code(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Some(
                "ResourceNotFoundException" | "NoSuchEntity" | "NoSuchBucket" | "NotFound"
                | "NoSuchKey",
            ) => Self::ResourceNotFound { message },
            Some(
                "ResourceConflictException"
                | "ConflictException"
                | "EntityAlreadyExists"
                | "BucketAlreadyOwnedByYou",
            ) => Self::Conflict { message },
            Some("AccessDeniedException" | "AccessDenied" | "UnauthorizedOperation") => {
                Self::AccessDenied { message }
            }
            Some("ValidationException" | "InvalidParameterValueException") => {
                Self::ValidationError { message }
            }
            Some("ThrottlingException" | "Throttling" | "TooManyRequestsException") => {
                Self::ThrottlingError { message }
            }
            other => Self::AwsError {
                code: other.map(str::to_string),
                message,
            },
        }
    }

    /// The resource does not exist (or no longer exists)
    pub fn is_not_found(&self) -> bool {
        matches!(self, KitError::ResourceNotFound { .. })
    }

    /// The resource or statement already exists
    pub fn is_conflict(&self) -> bool {
        matches!(self, KitError::Conflict { .. })
    }

    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KitError::ThrottlingError { .. }
                | KitError::NetworkError { .. }
                | KitError::TimeoutError { .. }
        )
    }
}

impl<E, R> From<SdkError<E, R>> for KitError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    fn from(err: SdkError<E, R>) -> Self {
        match err.as_service_error() {
            Some(service_error) => {
                let message = service_error
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| DisplayErrorContext(service_error).to_string());
                KitError::from_service_code(service_error.code(), message)
            }
            None => KitError::network_error(DisplayErrorContext(&err).to_string()),
        }
    }
}

impl From<BuildError> for KitError {
    fn from(err: BuildError) -> Self {
        KitError::invalid_input(format!("Failed to build AWS request: {}", err))
    }
}

impl From<std::io::Error> for KitError {
    fn from(err: std::io::Error) -> Self {
        KitError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for KitError {
    fn from(err: serde_json::Error) -> Self {
        KitError::serialization_error(err.to_string())
    }
}

impl From<serde_yaml::Error> for KitError {
    fn from(err: serde_yaml::Error) -> Self {
        KitError::serialization_error(err.to_string())
    }
}

impl From<zip::result::ZipError> for KitError {
    fn from(err: zip::result::ZipError) -> Self {
        KitError::packaging_error(err.to_string())
    }
}

impl From<reqwest::Error> for KitError {
    fn from(err: reqwest::Error) -> Self {
        KitError::network_error(err.to_string())
    }
}

impl From<crate::config::ConfigError> for KitError {
    fn from(err: crate::config::ConfigError) -> Self {
        KitError::configuration_error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_codes_across_services() {
        for code in ["ResourceNotFoundException", "NoSuchEntity", "NotFound"] {
            let error = KitError::from_service_code(Some(code), "gone");
            assert!(error.is_not_found(), "{} should be not-found", code);
            assert!(!error.is_conflict());
        }
    }

    #[test]
    fn test_conflict_codes() {
        let error = KitError::from_service_code(Some("ResourceConflictException"), "exists");
        assert!(error.is_conflict());
        let error = KitError::from_service_code(Some("EntityAlreadyExists"), "exists");
        assert!(error.is_conflict());
    }

    #[test]
    fn test_unknown_code_is_kept() {
        let error = KitError::from_service_code(Some("ServiceQuotaExceededException"), "quota");
        match &error {
            KitError::AwsError { code, message } => {
                assert_eq!(code.as_deref(), Some("ServiceQuotaExceededException"));
                assert_eq!(message, "quota");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        assert!(error.to_string().contains("ServiceQuotaExceededException"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(KitError::from_service_code(Some("ThrottlingException"), "slow down").is_retryable());
        assert!(KitError::timeout("agent", 1000).is_retryable());
        assert!(!KitError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let error = KitError::timeout("agent ABC to be deleted", 300_000);
        assert_eq!(
            error.to_string(),
            "Timed out after 300000ms waiting for agent ABC to be deleted"
        );
    }
}
