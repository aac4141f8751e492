use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::api::ApiError;
use crate::validation::ValidationError;

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
  pub error: String,
}

impl ErrorResponse {
  pub fn new(error: impl Into<String>) -> Self {
    Self {
      error: error.into(),
    }
  }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
  StoreError(altfinder_db::DbError),
  CacheError(crate::cache::CacheError),
  ValidationError(String),
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    match self {
      AppError::StoreError(db_err) => {
        // Details stay in the log
        tracing::error!(error = %db_err, "store error while handling request");
        let error_response = ErrorResponse::new("internal error");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(error_response)).into_response()
      }
      AppError::CacheError(cache_err) => {
        tracing::error!(error = %cache_err, "cache error while handling request");
        let error_response = ErrorResponse::new("internal error");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(error_response)).into_response()
      }
      AppError::ValidationError(msg) => {
        tracing::warn!(validation_error = %msg, "Validation failed");
        let error_response = ErrorResponse::new(msg);
        (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
      }
    }
  }
}

impl From<ApiError> for AppError {
  fn from(err: ApiError) -> Self {
    match err {
      ApiError::Validation(err) => err.into(),
      ApiError::Store(err) => AppError::StoreError(err),
      ApiError::Cache(err) => AppError::CacheError(err),
    }
  }
}

impl From<ValidationError> for AppError {
  fn from(err: ValidationError) -> Self {
    AppError::ValidationError(err.to_string())
  }
}
