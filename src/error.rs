// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the gateway:
// - one enum per subsystem, converted into `FacetteError`
// - a user-facing `ErrorKind` shared by the API layer
// - recoverability hints for background tasks
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// User-facing error kinds
// ----------------------------------------------------------------------------

/// Error kinds distinguished at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidAlias,
    InvalidId,
    InvalidName,
    InvalidPattern,
    InvalidParameter,
    InvalidJson,
    InvalidFilter,
    InvalidTimerange,
    InvalidTemplate,
    MissingField,
    UnknownReference,
    ReadOnly,
    Forbidden,
    RequestLoop,
    UnknownEndpoint,
    MethodNotAllowed,
    UnsupportedMediaType,
    Unhandled,
}

impl ErrorKind {
    /// Description returned in `{"message": ...}` bodies.
    pub fn message(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "item not found",
            ErrorKind::Conflict => "item conflicts with an existing one",
            ErrorKind::InvalidAlias => "invalid alias",
            ErrorKind::InvalidId => "invalid identifier",
            ErrorKind::InvalidName => "invalid name",
            ErrorKind::InvalidPattern => "invalid pattern",
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::InvalidJson => "invalid JSON document",
            ErrorKind::InvalidFilter => "invalid filter",
            ErrorKind::InvalidTimerange => "invalid time range",
            ErrorKind::InvalidTemplate => "invalid template",
            ErrorKind::MissingField => "missing mandatory field",
            ErrorKind::UnknownReference => "unknown item reference",
            ErrorKind::ReadOnly => "instance is read-only",
            ErrorKind::Forbidden => "action forbidden",
            ErrorKind::RequestLoop => "request loop detected",
            ErrorKind::UnknownEndpoint => "unknown endpoint",
            ErrorKind::MethodNotAllowed => "method not allowed",
            ErrorKind::UnsupportedMediaType => "unsupported content type",
            ErrorKind::Unhandled => "an unhandled error has occurred",
        }
    }

    /// HTTP status code associated with the kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound | ErrorKind::UnknownEndpoint => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidAlias
            | ErrorKind::InvalidId
            | ErrorKind::InvalidName
            | ErrorKind::InvalidPattern
            | ErrorKind::InvalidParameter
            | ErrorKind::InvalidJson
            | ErrorKind::InvalidFilter
            | ErrorKind::InvalidTimerange
            | ErrorKind::InvalidTemplate
            | ErrorKind::MissingField
            | ErrorKind::UnknownReference => 400,
            ErrorKind::ReadOnly | ErrorKind::Forbidden | ErrorKind::RequestLoop => 403,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::UnsupportedMediaType => 415,
            ErrorKind::Unhandled => 500,
        }
    }
}

// ----------------------------------------------------------------------------
// Core gateway error
// ----------------------------------------------------------------------------

/// The main error type of the gateway.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum FacetteError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Time range error: {0}")]
    TimeRange(#[from] TimeRangeError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Series error: {0}")]
    Series(#[from] SeriesError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl FacetteError {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        FacetteError::InvalidParameter {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            FacetteError::Config(_) => false,
            FacetteError::Storage(e) => e.is_recoverable(),
            FacetteError::Connector(e) => e.is_recoverable(),
            FacetteError::Template(_) => true,
            FacetteError::TimeRange(_) => true,
            FacetteError::Pattern(_) => true,
            FacetteError::Series(_) => true,
            FacetteError::Io(_) => true,
            FacetteError::InvalidParameter { .. } => true,
            FacetteError::Internal(_) => false,
            FacetteError::ShuttingDown => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            FacetteError::Config(_) => "config",
            FacetteError::Storage(_) => "storage",
            FacetteError::Connector(_) => "connector",
            FacetteError::Template(_) => "template",
            FacetteError::TimeRange(_) => "timerange",
            FacetteError::Pattern(_) => "pattern",
            FacetteError::Series(_) => "series",
            FacetteError::Io(_) => "io",
            FacetteError::InvalidParameter { .. } => "request",
            FacetteError::Internal(_) => "internal",
            FacetteError::ShuttingDown => "shutdown",
        }
    }

    /// User-facing kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FacetteError::Storage(e) => e.kind(),
            FacetteError::Connector(e) => e.kind(),
            FacetteError::Template(_) => ErrorKind::InvalidTemplate,
            FacetteError::TimeRange(_) => ErrorKind::InvalidTimerange,
            FacetteError::Pattern(_) => ErrorKind::InvalidPattern,
            FacetteError::Series(_) | FacetteError::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            FacetteError::Config(_)
            | FacetteError::Io(_)
            | FacetteError::Internal(_)
            | FacetteError::ShuttingDown => ErrorKind::Unhandled,
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Storage Errors
// ----------------------------------------------------------------------------

/// Errors raised by the library store
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("item not found")]
    NotFound,

    #[error("item conflicts with an existing one on '{field}'")]
    Conflict { field: String },

    #[error("invalid alias '{alias}'")]
    InvalidAlias { alias: String },

    #[error("invalid identifier '{id}'")]
    InvalidId { id: String },

    #[error("invalid name '{name}'")]
    InvalidName { name: String },

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("missing mandatory field '{field}'")]
    MissingField { field: String },

    #[error("unknown reference '{reference}'")]
    UnknownReference { reference: String },

    #[error("circular parent chain through '{id}'")]
    CircularReference { id: String },

    #[error("item is still referenced by '{by}'")]
    Referenced { by: String },

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("unknown column '{column}'")]
    UnknownColumn { column: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("unable to persist library to '{path}': {message}")]
    Persistence { path: PathBuf, message: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::Persistence { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound => ErrorKind::NotFound,
            StorageError::Conflict { .. } | StorageError::Referenced { .. } => ErrorKind::Conflict,
            StorageError::InvalidAlias { .. } => ErrorKind::InvalidAlias,
            StorageError::InvalidId { .. } => ErrorKind::InvalidId,
            StorageError::InvalidName { .. } => ErrorKind::InvalidName,
            StorageError::InvalidPattern { .. } => ErrorKind::InvalidPattern,
            StorageError::MissingField { .. } => ErrorKind::MissingField,
            StorageError::UnknownReference { .. } => ErrorKind::UnknownReference,
            StorageError::CircularReference { .. }
            | StorageError::InvalidValue { .. }
            | StorageError::UnknownColumn { .. } => ErrorKind::InvalidParameter,
            StorageError::Template(_) => ErrorKind::InvalidTemplate,
            StorageError::Persistence { .. } | StorageError::Serialization(_) => ErrorKind::Unhandled,
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        StorageError::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn unknown_reference(reference: impl Into<String>) -> Self {
        StorageError::UnknownReference {
            reference: reference.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Connector Errors
// ----------------------------------------------------------------------------

/// Errors from provider connectors
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("unsupported connector '{kind}'")]
    Unsupported { kind: String },

    #[error("missing connector setting '{setting}'")]
    MissingSetting { setting: String },

    #[error("invalid connector setting '{setting}': {message}")]
    InvalidSetting { setting: String, message: String },

    #[error("{connector}: request failed: {message}")]
    Request { connector: String, message: String },

    #[error("{connector}: invalid response: {message}")]
    InvalidResponse { connector: String, message: String },

    #[error("invalid series attribute '{attribute}'")]
    InvalidAttribute { attribute: String },

    #[error("requested series list is empty")]
    EmptyQuery,

    #[error("refresh output closed")]
    OutputClosed,
}

impl ConnectorError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Request { .. } | ConnectorError::InvalidResponse { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::Unsupported { .. }
            | ConnectorError::MissingSetting { .. }
            | ConnectorError::InvalidSetting { .. } => ErrorKind::InvalidParameter,
            _ => ErrorKind::Unhandled,
        }
    }

    pub fn missing_setting(setting: impl Into<String>) -> Self {
        ConnectorError::MissingSetting {
            setting: setting.into(),
        }
    }

    pub fn invalid_setting(setting: impl Into<String>, message: impl Into<String>) -> Self {
        ConnectorError::InvalidSetting {
            setting: setting.into(),
            message: message.into(),
        }
    }

    pub fn request(connector: impl Into<String>, message: impl ToString) -> Self {
        ConnectorError::Request {
            connector: connector.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_response(connector: impl Into<String>, message: impl ToString) -> Self {
        ConnectorError::InvalidResponse {
            connector: connector.into(),
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Template, Time Range, Pattern and Series Errors
// ----------------------------------------------------------------------------

/// Placeholder syntax errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("invalid template: unterminated action at offset {offset}")]
    Unterminated { offset: usize },

    #[error("invalid template: unsupported action '{action}'")]
    InvalidAction { action: String },
}

/// Time range expression errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeRangeError {
    #[error("invalid time range '{input}'")]
    InvalidRange { input: String },
}

/// Match pattern errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("invalid regexp pattern '{pattern}': {message}")]
    InvalidRegexp { pattern: String, message: String },

    #[error("invalid glob pattern '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },
}

/// Series processing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeriesError {
    #[error("series are not normalized")]
    UnnormalizedSeries,

    #[error("invalid sample value {sample}")]
    InvalidSample { sample: usize },

    #[error("invalid time window: end is not after start")]
    InvalidWindow,

    #[error("unsupported operator '{operator}'")]
    UnsupportedOperator { operator: String },
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for gateway operations
pub type FacetteResult<T> = Result<T, FacetteError>;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

// ----------------------------------------------------------------------------
// Error Context Extension
// ----------------------------------------------------------------------------

/// Extension trait to add context to errors
pub trait ErrorContext<T, E> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T, FacetteError>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F, C>(self, f: F) -> Result<T, FacetteError>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    E: Into<FacetteError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, FacetteError> {
        self.map_err(|e| {
            let err: FacetteError = e.into();
            FacetteError::Internal(format!("{}: {}", context.into(), err))
        })
    }

    fn with_context<F, C>(self, f: F) -> Result<T, FacetteError>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| {
            let err: FacetteError = e.into();
            FacetteError::Internal(format!("{}: {}", f().into(), err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_kinds() {
        assert_eq!(StorageError::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            StorageError::Referenced { by: "x".into() }.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            StorageError::unknown_reference("abc").kind(),
            ErrorKind::UnknownReference
        );
        assert_eq!(ErrorKind::UnknownReference.status_code(), 400);
    }

    #[test]
    fn test_gateway_error_kind_propagation() {
        let err: FacetteError = TimeRangeError::InvalidRange { input: "42".into() }.into();
        assert_eq!(err.kind(), ErrorKind::InvalidTimerange);
        assert_eq!(err.category(), "timerange");

        let err: FacetteError = StorageError::InvalidAlias { alias: "a b".into() }.into();
        assert_eq!(err.kind().status_code(), 400);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_context() {
        let result: Result<(), StorageError> = Err(StorageError::NotFound);
        let err = result.context("loading graph").unwrap_err();
        assert_eq!(err.to_string(), "Internal error: loading graph: Storage error: item not found");
    }
}
