//! Error types shared by the simulation core.

use async_openai::error::{ApiError, OpenAIError};

/// Errors raised by the core library.
///
/// The configuration variants are fatal and are expected to surface before
/// any batch work starts. Parse failures of model output are never reported
/// through this type; they degrade to "no information" at the call site.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unsupported proficiency profile: '{0}'")]
    UnsupportedProfile(String),
    #[error("Unsupported length control mode: '{0}'")]
    UnsupportedLengthMode(String),
    #[error("Missing value for prompt placeholder '{0}'")]
    MissingPlaceholder(String),
    #[error("Malformed prompt template: {0}")]
    MalformedTemplate(String),
    #[error("Missing prompt template: '{0}'")]
    MissingTemplate(String),
    #[error("IU graph extraction failed for problem '{0}': empty or unparsable response")]
    IuExtraction(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A failed attempt against the language-model backend.
///
/// The dispatcher retries an attempt only while [`BackendError::is_transient`]
/// holds and the attempt budget lasts.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("OpenAI-compatible API error: {0}")]
    Api(#[from] OpenAIError),
    #[error("Backend returned no choices")]
    EmptyResponse,
    #[error("Backend failure: {0}")]
    Other(String),
}

/// API error types that fail identically on every attempt.
const PERMANENT_ERROR_TYPES: [&str; 5] = [
    "invalid_request_error",
    "authentication_error",
    "permission_error",
    "not_found_error",
    "insufficient_quota",
];
const PERMANENT_ERROR_CODES: [&str; 3] = ["invalid_api_key", "model_not_found", "insufficient_quota"];

fn is_permanent_api_error(error: &ApiError) -> bool {
    error
        .r#type
        .as_deref()
        .is_some_and(|t| PERMANENT_ERROR_TYPES.contains(&t))
        || error
            .code
            .as_deref()
            .is_some_and(|c| PERMANENT_ERROR_CODES.contains(&c))
}

impl BackendError {
    /// Whether another attempt could succeed.
    ///
    /// Rejected requests (bad arguments, credentials, permissions, unknown
    /// models, exhausted quota) are permanent. Network failures, server errors
    /// and unreadable responses are transient.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Api(OpenAIError::InvalidArgument(_)) => false,
            BackendError::Api(OpenAIError::ApiError(error)) => !is_permanent_api_error(error),
            _ => true,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
