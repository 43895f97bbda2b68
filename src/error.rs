use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::models::order::OrderStatus;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Transient store or network failure. The whole assignment attempt may be retried.
    #[error("temporarily unavailable: {0}")]
    Retryable(String),

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// Lost a resolution race. Nothing was mutated; re-read the order.
    #[error("stale state: {0}")]
    StaleState(String),

    #[error("courier {courier_id} is not assigned to order {order_id}")]
    NotAssigned {
        order_id: uuid::Uuid,
        courier_id: uuid::Uuid,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Retryable(_) => "retryable",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::StaleState(_) => "stale_state",
            AppError::NotAssigned { .. } => "not_assigned",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Retryable(_))
    }

    /// The order had already reached a terminal state, so there is nothing left to do.
    pub fn is_terminal_rejection(&self) -> bool {
        matches!(self, AppError::InvalidTransition { from, .. } if from.is_terminal())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidTransition { .. } | AppError::StaleState(_) => StatusCode::CONFLICT,
            AppError::NotAssigned { .. } => StatusCode::FORBIDDEN,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}
