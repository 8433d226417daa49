//! Structured error handling for Bastion.
//!
//! This module provides:
//! - One error type for every layer of the access core
//! - Stable machine-readable error codes with HTTP status mapping
//! - A strict split between caller-safe messages and internal detail
//! - Severity-based logging and an error counter
//!
//! Every access denial, whatever its cause (wrong organization, wrong role,
//! spoofed parameter), surfaces through [`BastionError::forbidden`] with the
//! same caller-facing message. The cause is kept in the internal message,
//! which is only ever logged.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bastion_core::error::{BastionError, Result, ErrorContext};
//!
//! fn load_policy(path: &str) -> Result<String> {
//!     std::fs::read_to_string(path).context("Failed to read policy file")
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::telemetry::ERRORS_TOTAL;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Bastion operations.
pub type Result<T> = std::result::Result<T, BastionError>;

/// Caller-facing message shared by every access denial.
pub const FORBIDDEN_MESSAGE: &str = "You do not have access to this resource";

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Context Errors (1000-1099)
    MissingContext,
    InvalidContext,

    // Access Errors (1100-1199)
    Unauthenticated,
    Forbidden,
    NotFound,
    NotConfirmed,
    LastOwner,
    UnknownAction,

    // Infrastructure Errors (2000-2099)
    ServiceUnavailable,
    SerializationError,

    // Validation Errors (4100-4199)
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::MissingContext => 1000,
            Self::InvalidContext => 1001,

            Self::Unauthenticated => 1100,
            Self::Forbidden => 1101,
            Self::NotFound => 1102,
            Self::NotConfirmed => 1103,
            Self::LastOwner => 1104,
            Self::UnknownAction => 1105,

            Self::ServiceUnavailable => 2000,
            Self::SerializationError => 2001,

            Self::InvalidInput => 4100,

            Self::ConfigurationError => 5000,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidContext => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound | Self::UnknownAction => StatusCode::NOT_FOUND,
            Self::NotConfirmed => StatusCode::PRECONDITION_REQUIRED,
            Self::LastOwner => StatusCode::CONFLICT,
            Self::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            Self::MissingContext
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable by the caller.
    ///
    /// Only infrastructure failures qualify. Retrying a denial never changes
    /// its outcome.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "context",
            1100..=1199 => "access",
            2000..=2099 => "infrastructure",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, absent entities)
    Low,
    /// Denials and refused operations
    Medium,
    /// Infrastructure and configuration failures
    High,
    /// Programmer errors that bypassed the access layer
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidContext
            | ErrorCode::NotFound
            | ErrorCode::UnknownAction
            | ErrorCode::InvalidInput
            | ErrorCode::NotConfirmed => Self::Low,

            ErrorCode::Unauthenticated | ErrorCode::Forbidden | ErrorCode::LastOwner => {
                Self::Medium
            }

            ErrorCode::ServiceUnavailable
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::MissingContext | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(
        mut self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.entity_type.is_none()
            && self.retry_after_secs.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Bastion.
#[derive(Error, Debug)]
pub struct BastionError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Caller-safe error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for BastionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl BastionError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// A data operation ran without an established tenant context.
    pub fn missing_context(what: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::MissingContext,
            "An internal error occurred",
            format!("tenant context missing: {}", what.into()),
        )
    }

    /// A tenant context could not be established from the supplied identity.
    pub fn invalid_context(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidContext, message)
    }

    /// No verified identity reached the access layer.
    pub fn unauthenticated() -> Self {
        Self::new(
            ErrorCode::Unauthenticated,
            "Authentication credentials are required",
        )
    }

    /// Access denied. The reason is internal only; every denial reads the same.
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::Forbidden, FORBIDDEN_MESSAGE, reason)
    }

    /// The entity does not exist in any tenant.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// An execute call arrived without explicit confirmation.
    pub fn not_confirmed(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCode::NotConfirmed,
            format!("Action '{}' requires explicit confirmation", action),
        )
        .with_context("action", action)
    }

    /// The mutation would leave a workspace without an owner.
    pub fn last_owner(workspace_id: impl Into<String>) -> Self {
        let workspace_id = workspace_id.into();
        Self::new(
            ErrorCode::LastOwner,
            "A workspace must retain at least one owner",
        )
        .with_details(ErrorDetails::new().with_entity("workspace", workspace_id))
    }

    /// No handler is registered for the requested action.
    pub fn unknown_action(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(ErrorCode::UnknownAction, format!("Unknown action: {}", action))
    }

    /// A backing store is unreachable. Access decisions fail closed.
    pub fn service_unavailable(component: impl Into<String>, message: impl Into<String>) -> Self {
        let component = component.into();
        Self::with_internal(
            ErrorCode::ServiceUnavailable,
            "A required service is temporarily unavailable",
            format!("{}: {}", component, message.into()),
        )
        .with_details(
            ErrorDetails::new()
                .with_context("component", component)
                .with_retry_after(1),
        )
    }

    /// Create a validation error.
    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Configuration error",
            message,
        )
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    internal_message = ?self.internal_message,
                    "Request refused"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            ERRORS_TOTAL,
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Error information rendered to callers. Never includes internal messages.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&BastionError> for ErrorResponse {
    fn from(error: &BastionError) -> Self {
        // Denials and context failures render without details so the body
        // is identical whatever the cause.
        let details = match error.code {
            ErrorCode::Forbidden | ErrorCode::MissingContext | ErrorCode::InternalError => None,
            _ if error.details.is_empty() => None,
            _ => Some(error.details.clone()),
        };

        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details,
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for BastionError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| BastionError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| BastionError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| BastionError::new(ErrorCode::NotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| BastionError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for BastionError {
    fn from(error: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to process JSON data",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<toml::de::Error> for BastionError {
    fn from(error: toml::de::Error) -> Self {
        Self::configuration(format!("invalid TOML: {}", error)).with_source(error)
    }
}

impl From<config::ConfigError> for BastionError {
    fn from(error: config::ConfigError) -> Self {
        Self::configuration(error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for BastionError {
    fn from(error: std::io::Error) -> Self {
        Self::internal(format!("I/O error: {}", error)).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for BastionError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::service_unavailable("membership_store", "lookup timed out").with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::Forbidden.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::NotConfirmed.http_status(),
            StatusCode::PRECONDITION_REQUIRED
        );
        assert_eq!(ErrorCode::LastOwner.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::ServiceUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::MissingContext.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_only_infrastructure_errors_are_retryable() {
        assert!(ErrorCode::ServiceUnavailable.is_retryable());
        assert!(!ErrorCode::Forbidden.is_retryable());
        assert!(!ErrorCode::NotFound.is_retryable());
        assert!(!ErrorCode::MissingContext.is_retryable());
    }

    #[test]
    fn test_forbidden_message_is_uniform() {
        let wrong_org = BastionError::forbidden("workspace belongs to org-b");
        let wrong_role = BastionError::forbidden("viewer cannot delete");

        assert_eq!(wrong_org.user_message(), wrong_role.user_message());
        assert_eq!(wrong_org.user_message(), FORBIDDEN_MESSAGE);
        assert_ne!(wrong_org.internal_message(), wrong_role.internal_message());
    }

    #[test]
    fn test_forbidden_response_hides_details() {
        let err = BastionError::forbidden("tenant mismatch").with_context("workspace", "w-2");
        let response = ErrorResponse::from(&err);
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["error"]["code"], "FORBIDDEN");
        assert!(json["error"].get("details").is_none());
        assert!(!json.to_string().contains("tenant mismatch"));
    }

    #[test]
    fn test_not_found_details() {
        let err = BastionError::not_found("document", "doc-1");
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.details().entity_type.as_deref(), Some("document"));
        assert_eq!(err.details().entity_id.as_deref(), Some("doc-1"));
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            BastionError::missing_context("guard").severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            BastionError::forbidden("x").severity(),
            ErrorSeverity::Medium
        );
        assert_eq!(
            BastionError::service_unavailable("store", "down").severity(),
            ErrorSeverity::High
        );
    }

    #[test]
    fn test_error_context_on_option() {
        let value: Option<u32> = None;
        let err = value.context("workspace missing").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_error_display() {
        let err = BastionError::with_internal(
            ErrorCode::InternalError,
            "User message",
            "Internal details",
        );
        let display = format!("{}", err);
        assert!(display.contains("InternalError"));
        assert!(display.contains("User message"));
        assert!(display.contains("Internal details"));
    }
}
