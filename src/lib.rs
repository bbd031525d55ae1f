//! Async single-flight bearer token cache with proactive, jittered refresh and cooldown guarding.
//!
//! A [`TokenCoordinator`] keeps exactly one credential warm on behalf of any number of concurrent
//! callers. Fresh tokens are served after a single atomic load; when a refresh becomes due, all
//! concurrent demand collapses into one outstanding fetch whose outcome is shared by every caller.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod clock;
pub mod fetch;
pub mod metrics;
pub mod policy;
pub mod token;

mod error;
mod _prelude {
	pub use std::{sync::Arc, time::Duration};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

pub use tokio_util::sync::CancellationToken;

#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
pub use crate::{
	cache::coordinator::{CoordinatorStatus, Phase, TokenCoordinator, TokenCoordinatorBuilder},
	clock::{Clock, ManualClock, SystemClock},
	error::{Error, Result},
	fetch::{BoxError, FetchFuture, TokenFetcher},
	metrics::{CoordinatorMetrics, CoordinatorMetricsSnapshot},
	policy::{FixedJitter, JitterSource, RandomJitter, RefreshPolicy},
	token::Token,
};
