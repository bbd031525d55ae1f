//! Crate-wide error types and `Result` alias.

// std
use std::error::Error as StdError;
// self
use crate::_prelude::*;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the bearer cache crate.
///
/// Every variant is cheap to clone so a single refresh outcome can be handed to each caller that
/// joined it.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
	/// The token fetcher reported a failure.
	#[error("Token fetch failed: {0}")]
	Fetch(#[source] Arc<dyn StdError + Send + Sync>),
	/// The token fetcher returned a token whose value is empty or whitespace.
	#[error("Token fetch returned an empty token value.")]
	EmptyToken,
	/// A single fetch exceeded the configured `fetch_timeout`.
	#[error("Token fetch timed out after {0:?}.")]
	Timeout(Duration),
	/// The refresh task panicked or was torn down before producing an outcome.
	#[error("Token refresh aborted: {0}")]
	RefreshAborted(String),
	/// The caller's wait, or the refresh itself, was cancelled.
	#[error("Token request cancelled.")]
	Cancelled,
	/// The coordinator was shut down and a refresh was needed: the cached token is missing or
	/// expired, or a refresh was forced.
	#[error("Token coordinator has been shut down.")]
	Shutdown,

	/// Construction-time configuration was rejected.
	#[error("Validation failed for {field}: {reason}")]
	Validation {
		/// Configuration field that failed validation.
		field: &'static str,
		/// Human-readable explanation.
		reason: String,
	},
	#[cfg(feature = "prometheus")]
	/// Metrics exporter installation failed.
	#[error("Metrics error: {0}")]
	Metrics(String),
}
impl Error {
	/// Wrap a fetcher error for sharing across joined callers.
	pub fn fetch(err: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
		Self::Fetch(Arc::from(err.into()))
	}

	/// Whether the error originated from the caller's or coordinator's cancellation.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled | Self::Shutdown)
	}
}
