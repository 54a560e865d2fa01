use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classes shared by the call layer, the resolver and the repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    TransientNetwork,
    TransientServer,
    Timeout,
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    MalformedRequest,
    ContentTooLarge,
    ParseFailure,
    ValidationFailure,
    Exhausted,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient-network",
            ErrorClass::TransientServer => "transient-server",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Permission => "permission",
            ErrorClass::NotFound => "not-found",
            ErrorClass::RateLimit => "rate-limit",
            ErrorClass::MalformedRequest => "malformed-request",
            ErrorClass::ContentTooLarge => "content-too-large",
            ErrorClass::ParseFailure => "parse-failure",
            ErrorClass::ValidationFailure => "validation-failure",
            ErrorClass::Exhausted => "exhausted",
        }
    }

    /// Classes that can clear up on their own if the same request is sent again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClass::TransientNetwork
                | ErrorClass::TransientServer
                | ErrorClass::Timeout
                | ErrorClass::RateLimit
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure reported by a generation backend for a single attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Unreadable response: {0}")]
    InvalidResponse(String),
}

/// Maps a backend failure onto the error taxonomy.
///
/// This is the only place status codes and transport failures are inspected;
/// everything downstream works with the returned class.
pub fn classify(error: &BackendError) -> ErrorClass {
    match error {
        BackendError::Http { status, .. } => match *status {
            401 => ErrorClass::Authentication,
            403 => ErrorClass::Permission,
            404 => ErrorClass::NotFound,
            408 => ErrorClass::Timeout,
            413 => ErrorClass::ContentTooLarge,
            429 => ErrorClass::RateLimit,
            500..=599 => ErrorClass::TransientServer,
            _ => ErrorClass::MalformedRequest,
        },
        BackendError::Network(_) => ErrorClass::TransientNetwork,
        BackendError::Timeout(_) => ErrorClass::Timeout,
        BackendError::InvalidResponse(_) => ErrorClass::ParseFailure,
    }
}

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("{class} failure after {attempts} attempt(s): {message}")]
    Call {
        class: ErrorClass,
        attempts: u32,
        message: String,
    },

    #[error("Retries exhausted after {attempts} attempts (last failure {last_class}): {message}")]
    RetriesExhausted {
        last_class: ErrorClass,
        attempts: u32,
        message: String,
    },

    #[error("No valid access token available")]
    MissingCredentials,

    #[error("Could not parse generated instruction: {0}")]
    Parse(String),

    #[error("Generated instruction rejected: {0}")]
    Validation(String),

    #[error("Field '{field}' exhausted {iterations} iteration(s) without a valid instruction")]
    Exhausted { field: String, iterations: u32 },

    #[error("Precheck failed: {0}")]
    Precheck(String),

    #[error("Run cancelled by operator")]
    Cancelled,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "http")]
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl OptimizerError {
    /// Taxonomy tag for this error, when it has one.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            OptimizerError::Call { class, .. } => Some(*class),
            OptimizerError::RetriesExhausted { .. } => Some(ErrorClass::Exhausted),
            OptimizerError::MissingCredentials => Some(ErrorClass::Authentication),
            OptimizerError::Parse(_) => Some(ErrorClass::ParseFailure),
            OptimizerError::Validation(_) => Some(ErrorClass::ValidationFailure),
            OptimizerError::Exhausted { .. } => Some(ErrorClass::Exhausted),
            OptimizerError::SerializationError(_) => Some(ErrorClass::ParseFailure),
            _ => None,
        }
    }

    /// Errors that make every further call in the run pointless.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self.class(),
            Some(ErrorClass::Authentication) | Some(ErrorClass::Permission)
        )
    }
}

pub type Result<T> = std::result::Result<T, OptimizerError>;
