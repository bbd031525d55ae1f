//! Token acquisition seam supplied by the embedding application.

// std
use std::{error::Error as StdError, future::Future};
// crates.io
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
// self
use crate::token::Token;

/// Boxed error returned by fetchers.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Future produced by a [`TokenFetcher`].
pub type FetchFuture = BoxFuture<'static, std::result::Result<Token, BoxError>>;

/// Performs the actual token acquisition, e.g. an OAuth2 client-credentials exchange.
///
/// The cancellation token handed to [`fetch`](TokenFetcher::fetch) belongs to the refresh itself,
/// not to any caller; it fires only when the owning coordinator shuts down. Fetchers must never
/// yield a token with an empty value.
pub trait TokenFetcher: Send + Sync {
	/// Start one acquisition attempt.
	fn fetch(&self, cancel: CancellationToken) -> FetchFuture;
}
impl<F, Fut> TokenFetcher for F
where
	F: Fn(CancellationToken) -> Fut + Send + Sync,
	Fut: Future<Output = std::result::Result<Token, BoxError>> + Send + 'static,
{
	fn fetch(&self, cancel: CancellationToken) -> FetchFuture {
		Box::pin(self(cancel))
	}
}
