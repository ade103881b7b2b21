use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// message safe to hand to a client; storage details stay in the log
    pub fn public_message(&self) -> String {
        match self {
            AppError::Storage(_) => INTERNAL_SERVER_ERROR.to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Storage(e) = &self {
            error!("Storage failure: {e}");
        }

        let body = json!({ "success": false, "error": self.public_message() });
        (self.status(), Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, AppError>;
