//! Errors surfaced to HTTP clients.

use crate::engine::EngineError;
use crate::indexer::IndexError;
use crate::registry::RegistryError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidSource(String),
    #[error("{0}")]
    NotFound(String),
    #[error("missing or invalid token")]
    Unauthorized,
    #[error("requested range not satisfiable for a resource of {size} bytes")]
    RangeUnsatisfiable { size: u64 },
    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    /// Stable error kind carried in the failure payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSource(_) => "InvalidSource",
            Self::NotFound(_) => "NotFound",
            Self::Unauthorized => "Unauthorized",
            Self::RangeUnsatisfiable { .. } => "RangeUnsatisfiable",
            Self::Internal(_) => "InternalFailure",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidSource(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RangeUnsatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Self::RangeUnsatisfiable { size } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }
        response
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidSource(msg) => Self::InvalidSource(msg),
            RegistryError::NotFound(msg) => Self::NotFound(msg),
            RegistryError::Engine(e) => e.into(),
            RegistryError::Io(e) => e.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidSource(msg) => Self::InvalidSource(msg),
            EngineError::NotReady | EngineError::FileNotFound(_) | EngineError::Destroyed => {
                Self::NotFound(err.to_string())
            }
            EngineError::Io(e) => e.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<IndexError> for ApiError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound(path) => Self::NotFound(format!("{path} not found")),
            IndexError::Io(e) => e.into(),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(err.to_string())
        } else {
            Self::Internal(err.to_string())
        }
    }
}
