// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the analytics pipeline.

use thiserror::Error;
use trail_analytics_core::{ConfigError, CoreError};
use trail_common_http::RetryableError;

/// Analytics pipeline errors.
#[derive(Debug, Error)]
pub enum AnalyticsError {
	/// Endpoint URL is missing or invalid.
	#[error("invalid endpoint: {0}")]
	InvalidEndpoint(String),

	/// HTTP request failed.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Server returned an error response.
	#[error("server error ({status}): {message}")]
	ServerError { status: u16, message: String },

	/// Rate limited by the server.
	#[error("rate limited, retry after {retry_after_secs:?} seconds")]
	RateLimited { retry_after_secs: Option<u64> },

	/// Pipeline has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,

	/// Event validation failed.
	#[error("event validation failed: {0}")]
	ValidationFailed(String),

	/// Serialization error.
	#[error("serialization error: {0}")]
	SerializationError(String),

	/// Durable storage failed.
	#[error("storage error: {0}")]
	Storage(#[from] StorageError),

	/// A geolocation provider returned an unusable answer.
	#[error("geolocation lookup via {provider} failed: {message}")]
	GeoLookup { provider: String, message: String },

	/// An operation did not complete in time.
	#[error("{operation} timed out after {timeout_ms}ms")]
	Timeout { operation: String, timeout_ms: u64 },

	#[error(transparent)]
	Config(#[from] ConfigError),
}

impl From<CoreError> for AnalyticsError {
	fn from(err: CoreError) -> Self {
		match err {
			CoreError::Serialization(msg) => AnalyticsError::SerializationError(msg),
			other => AnalyticsError::ValidationFailed(other.to_string()),
		}
	}
}

impl From<serde_json::Error> for AnalyticsError {
	fn from(err: serde_json::Error) -> Self {
		AnalyticsError::SerializationError(err.to_string())
	}
}

impl RetryableError for AnalyticsError {
	fn is_retryable(&self) -> bool {
		match self {
			AnalyticsError::RequestFailed(e) => e.is_retryable(),
			AnalyticsError::ServerError { status, .. } => {
				matches!(*status, 429 | 408 | 500 | 502 | 503 | 504)
			}
			AnalyticsError::RateLimited { .. } => true,
			AnalyticsError::Timeout { .. } => true,
			_ => false,
		}
	}
}

/// Result type alias for analytics operations.
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Errors from the durable key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// The store refused a write that would exceed its quota.
	#[error("quota exceeded writing {key} ({size} bytes)")]
	QuotaExceeded { key: String, size: usize },

	#[error("could not determine XDG state directory")]
	StateDirNotFound,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_server_error_retryable_statuses() {
		for status in [429, 408, 500, 502, 503, 504] {
			let err = AnalyticsError::ServerError {
				status,
				message: "test".to_string(),
			};
			assert!(err.is_retryable(), "status {status} should be retryable");
		}
	}

	#[test]
	fn test_server_error_non_retryable_statuses() {
		for status in [400, 401, 403, 404, 422] {
			let err = AnalyticsError::ServerError {
				status,
				message: "test".to_string(),
			};
			assert!(!err.is_retryable(), "status {status} should not be retryable");
		}
	}

	#[test]
	fn test_timeout_and_rate_limit_are_retryable() {
		assert!(AnalyticsError::RateLimited {
			retry_after_secs: Some(30)
		}
		.is_retryable());
		assert!(AnalyticsError::Timeout {
			operation: "geolocation".into(),
			timeout_ms: 3000
		}
		.is_retryable());
	}

	#[test]
	fn test_storage_and_shutdown_not_retryable() {
		let err = AnalyticsError::Storage(StorageError::QuotaExceeded {
			key: "k".into(),
			size: 10,
		});
		assert!(!err.is_retryable());
		assert!(!AnalyticsError::ClientShutdown.is_retryable());
	}

	#[test]
	fn test_core_validation_maps_to_validation_failed() {
		let err: AnalyticsError = CoreError::InvalidEventName("Bad".into()).into();
		assert!(matches!(err, AnalyticsError::ValidationFailed(_)));
	}
}
