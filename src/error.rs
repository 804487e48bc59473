//! Error types for the GraphQL scaffold

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scaffold
///
/// Covers configuration, startup, lock and connector failures. Request-level
/// failures inside the HTTP pipeline use [`crate::middleware::RequestFailure`]
/// instead and never surface here.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed base configuration or environment variables
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A remote service name that is not present in `remotes`
    #[error("Trying to access an undefined remote service ({0})")]
    UnknownService(String),

    /// A per-environment remote without a matching key or a `default` entry
    #[error("Cannot resolve remote service {name} for the environment {key}")]
    UnresolvedEnvironment { name: String, key: String },

    /// No query field registered by any resolver
    #[error("GraphQL schema error: at least one query field is required")]
    EmptySchema,

    /// GraphQL schema errors
    #[error("GraphQL schema error: {0}")]
    Schema(String),

    /// The configured port is already bound
    #[error("{0} is already in use")]
    AddressInUse(String),

    /// Binding requires elevated privileges
    #[error("{0} requires elevated privileges")]
    PermissionDenied(String),

    /// Any other bind failure
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The PID lock file already exists
    #[error("Lock file {0} already exists, another instance may be running")]
    LockHeld(String),

    /// A download response without `content-disposition`
    #[error("Content-disposition header is missing")]
    MissingFilenameHeader,

    /// Non-success status returned by a remote service
    #[error("Remote service returned {status} for {url}")]
    UpstreamStatus { status: u16, url: String },

    /// Outbound HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Convert error to GraphQL error format
    pub fn to_graphql_error(&self) -> GraphQLError {
        GraphQLError {
            message: self.to_string(),
            extensions: self.extensions(),
        }
    }

    /// Whether the error is a bind failure the orchestrator reports and exits on
    pub fn is_recognized_bind_error(&self) -> bool {
        matches!(self, Error::AddressInUse(_) | Error::PermissionDenied(_))
    }

    /// Get error code for extensions
    fn extensions(&self) -> std::collections::HashMap<String, serde_json::Value> {
        let mut map = std::collections::HashMap::new();
        let code = match self {
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::UnknownService(_) => "UNKNOWN_SERVICE",
            Error::UnresolvedEnvironment { .. } => "UNRESOLVED_ENVIRONMENT",
            Error::EmptySchema => "EMPTY_SCHEMA",
            Error::Schema(_) => "SCHEMA_ERROR",
            Error::AddressInUse(_) => "ADDRESS_IN_USE",
            Error::PermissionDenied(_) => "PERMISSION_DENIED",
            Error::Bind { .. } => "BIND_ERROR",
            Error::LockHeld(_) => "LOCK_HELD",
            Error::MissingFilenameHeader => "MISSING_FILENAME_HEADER",
            Error::UpstreamStatus { .. } => "UPSTREAM_STATUS",
            Error::Http(_) => "HTTP_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        };
        map.insert("code".to_string(), serde_json::json!(code));
        map
    }
}

impl async_graphql::ErrorExtensions for Error {
    fn extend(&self) -> async_graphql::Error {
        let extensions = self.extensions();
        async_graphql::Error::new(self.to_string()).extend_with(|_, ext| {
            for (key, value) in extensions {
                if let Ok(value) = async_graphql::Value::from_json(value) {
                    ext.set(key, value);
                }
            }
        })
    }
}

/// GraphQL error response format
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub extensions: std::collections::HashMap<String, serde_json::Value>,
}

impl From<Error> for GraphQLError {
    fn from(err: Error) -> Self {
        err.to_graphql_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphql_error_carries_code() {
        let err = Error::UnknownService("billing".into());
        let gql = err.to_graphql_error();
        assert_eq!(
            gql.message,
            "Trying to access an undefined remote service (billing)"
        );
        assert_eq!(gql.extensions["code"], serde_json::json!("UNKNOWN_SERVICE"));
    }

    #[test]
    fn extended_error_carries_code() {
        use async_graphql::ErrorExtensions;

        let err = Error::EmptySchema.extend();
        assert_eq!(err.message, Error::EmptySchema.to_string());
        let code = err.extensions.as_ref().and_then(|ext| ext.get("code"));
        assert_eq!(code, Some(&async_graphql::Value::from("EMPTY_SCHEMA")));
    }

    #[test]
    fn resolver_errors_convert_with_question_mark() {
        fn resolve() -> async_graphql::Result<()> {
            Err(Error::UnknownService("billing".into()))?;
            Ok(())
        }
        let err = resolve().unwrap_err();
        assert!(err.message.contains("billing"));
    }

    #[test]
    fn bind_errors_are_recognized() {
        assert!(Error::AddressInUse("Port 4000".into()).is_recognized_bind_error());
        assert!(Error::PermissionDenied("Port 80".into()).is_recognized_bind_error());
        assert!(!Error::LockHeld(".pid.lock".into()).is_recognized_bind_error());
    }
}
