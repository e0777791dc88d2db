//! Domain-specific error types for tablerag

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Main error type for the tablerag service
#[derive(Error, Debug)]
pub enum TableRagError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Graph store error: {message}")]
    Graph { message: String },

    #[error("Source database error: {message}")]
    SourceDb { message: String },

    #[error("Embedding provider error: {message}")]
    Embedding { message: String },

    #[error("LLM provider error: {message}")]
    Llm { message: String },

    #[error("Data error: {message}")]
    Data { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Timeout error: {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String, challenge: String },

    #[error("Forbidden: {message}")]
    Forbidden { message: String, challenge: String },

    #[error("Integrity error: {message}")]
    Integrity { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TableRagError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        TableRagError::Unauthorized {
            message: message.into(),
            challenge: "Bearer".to_string(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        TableRagError::Forbidden {
            message: message.into(),
            challenge: "Bearer".to_string(),
        }
    }

    /// Process exit code for CLI wrappers:
    /// 1 validation, 2 I/O, 3 auth failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            TableRagError::Config { .. }
            | TableRagError::Validation { .. }
            | TableRagError::Data { .. }
            | TableRagError::Serialization { .. } => 1,
            TableRagError::Unauthorized { .. } | TableRagError::Forbidden { .. } => 3,
            _ => 2,
        }
    }
}

impl From<anyhow::Error> for TableRagError {
    fn from(err: anyhow::Error) -> Self {
        TableRagError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TableRagError {
    fn from(err: serde_json::Error) -> Self {
        TableRagError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<surrealdb::Error> for TableRagError {
    fn from(err: surrealdb::Error) -> Self {
        TableRagError::Graph {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for TableRagError {
    fn from(err: sqlx::Error) -> Self {
        TableRagError::SourceDb {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for TableRagError {
    fn from(err: reqwest::Error) -> Self {
        TableRagError::Internal {
            message: format!("HTTP request failed: {}", err),
        }
    }
}

impl From<serde_yaml::Error> for TableRagError {
    fn from(err: serde_yaml::Error) -> Self {
        TableRagError::Config {
            message: format!("YAML error: {}", err),
        }
    }
}

impl IntoResponse for TableRagError {
    fn into_response(self) -> Response {
        let (status, challenge) = match &self {
            TableRagError::Validation { .. } => (StatusCode::UNPROCESSABLE_ENTITY, None),
            TableRagError::Unauthorized { challenge, .. } => {
                (StatusCode::UNAUTHORIZED, Some(challenge.clone()))
            }
            TableRagError::Forbidden { challenge, .. } => {
                (StatusCode::FORBIDDEN, Some(challenge.clone()))
            }
            TableRagError::Graph { .. }
            | TableRagError::SourceDb { .. }
            | TableRagError::Embedding { .. }
            | TableRagError::Llm { .. }
            | TableRagError::Timeout { .. } => (StatusCode::BAD_GATEWAY, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let detail = match &self {
            TableRagError::Unauthorized { message, .. }
            | TableRagError::Forbidden { message, .. } => message.clone(),
            other => other.to_string(),
        };

        let body = axum::Json(json!({ "detail": detail }));
        match challenge {
            Some(value) => (status, [(header::WWW_AUTHENTICATE, value)], body).into_response(),
            None => (status, body).into_response(),
        }
    }
}

/// Result type alias for tablerag operations
pub type Result<T> = std::result::Result<T, TableRagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_cli_contract() {
        let validation = TableRagError::Validation {
            message: "missing prompt variables".into(),
        };
        assert_eq!(validation.exit_code(), 1);
        let io = TableRagError::Graph {
            message: "unreachable".into(),
        };
        assert_eq!(io.exit_code(), 2);
        assert_eq!(TableRagError::unauthorized("bad token").exit_code(), 3);
    }
}
