use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::util::sanitize::sanitize_driver_message;

/// Error kinds from spec §7. Each variant maps to one HTTP status for the
/// thin control-API surface and carries a sanitized message only.
#[derive(Debug)]
pub enum AppError {
    /// Malformed input, out-of-range vnode count, empty shard key.
    Validation(String),
    /// Unknown shard/job id.
    NotFound(String),
    /// Catalog compare-and-swap failed; caller should re-read and retry.
    Conflict(String),
    /// Lookup on an empty or fully-inactive ring.
    NoShardsAvailable,
    /// Endpoint I/O error reaching a shard.
    ShardUnreachable(String),
    /// The shard executed the query and returned an error.
    QueryFailed(String),
    /// Connection pool wait timed out.
    PoolExhausted,
    /// Metadata store unreachable.
    CatalogUnavailable(String),
    /// Caller deadline elapsed or explicit cancel.
    Cancelled,
    /// Request or response exceeded the 10 MB bound.
    PayloadTooLarge,
    /// Invariant violation. Logged at error level; the operation fails but
    /// the process continues.
    Internal(String),
}

impl AppError {
    /// Builds an error from a raw `sqlx` driver error, stripping any
    /// embedded connection URL first. A pool-acquire timeout is reported
    /// as `PoolExhausted` rather than folded into `QueryFailed`, since
    /// spec §4.3/§7 and scenario 6 require the two to be distinguishable.
    pub fn query_failed(raw: sqlx::Error) -> Self {
        if matches!(raw, sqlx::Error::PoolTimedOut) {
            return AppError::PoolExhausted;
        }
        AppError::QueryFailed(sanitize_driver_message(&raw.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not-found",
            AppError::Conflict(_) => "conflict",
            AppError::NoShardsAvailable => "no-shards-available",
            AppError::ShardUnreachable(_) => "shard-unreachable",
            AppError::QueryFailed(_) => "query-failed",
            AppError::PoolExhausted => "pool-exhausted",
            AppError::CatalogUnavailable(_) => "catalog-unavailable",
            AppError::Cancelled => "cancelled",
            AppError::PayloadTooLarge => "payload-too-large",
            AppError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Validation(msg) => write!(f, "validation error: {msg}"),
            AppError::NotFound(msg) => write!(f, "not found: {msg}"),
            AppError::Conflict(msg) => write!(f, "conflict: {msg}"),
            AppError::NoShardsAvailable => write!(f, "no shards available"),
            AppError::ShardUnreachable(msg) => write!(f, "shard unreachable: {msg}"),
            AppError::QueryFailed(msg) => write!(f, "query failed: {msg}"),
            AppError::PoolExhausted => write!(f, "connection pool exhausted"),
            AppError::CatalogUnavailable(msg) => write!(f, "catalog unavailable: {msg}"),
            AppError::Cancelled => write!(f, "operation cancelled"),
            AppError::PayloadTooLarge => write!(f, "payload too large"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NoShardsAvailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ShardUnreachable(_) => StatusCode::BAD_GATEWAY,
            AppError::QueryFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal invariant violation");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::query_failed(err)
    }
}

impl From<etcd_client::Error> for AppError {
    fn from(err: etcd_client::Error) -> Self {
        AppError::CatalogUnavailable(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
