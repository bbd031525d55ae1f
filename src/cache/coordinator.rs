//! Single-flight coordinator keeping one bearer token warm for concurrent callers.

// std
use std::{
	any::Any,
	fmt::{Debug, Formatter, Result as FmtResult},
	panic::AssertUnwindSafe,
};
// crates.io
use arc_swap::ArcSwapOption;
use futures::FutureExt;
use serde::Serialize;
use tokio::{sync::Mutex, time};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	cache::state::{CacheState, RefreshDecision, RefreshOutcome},
	clock::{Clock, SystemClock},
	fetch::TokenFetcher,
	metrics::{self, CoordinatorMetrics, CoordinatorMetricsSnapshot, RequestOutcome},
	policy::{self, JitterSource, RandomJitter, RefreshPolicy},
	token::Token,
};

/// Name used when none is configured.
pub const DEFAULT_NAME: &str = "default";

/// Coordinates refreshes of a single bearer token.
///
/// Cloning is cheap and every clone shares the same cache, so one coordinator can be handed to
/// any number of tasks. At most one fetch runs at a time; callers that need a refresh while one
/// is running wait for its outcome instead of starting another.
///
/// Each refresh runs as its own task whose lifetime is independent of the callers that wait on
/// it: a caller cancelling its wait never cancels the fetch for the others. Only
/// [`shutdown`](Self::shutdown) cancels a running fetch.
#[derive(Clone)]
pub struct TokenCoordinator {
	inner: Arc<Inner>,
}
impl TokenCoordinator {
	/// Build a coordinator with default settings around `fetcher`.
	pub fn new(fetcher: impl TokenFetcher + 'static) -> Self {
		Self::from_parts(
			Arc::from(DEFAULT_NAME),
			RefreshPolicy::default(),
			Arc::new(fetcher),
			Arc::new(SystemClock),
			Arc::new(RandomJitter),
		)
	}

	/// Create a [`TokenCoordinatorBuilder`] for advanced configuration.
	pub fn builder() -> TokenCoordinatorBuilder {
		TokenCoordinatorBuilder::new()
	}

	fn from_parts(
		name: Arc<str>,
		policy: RefreshPolicy,
		fetcher: Arc<dyn TokenFetcher>,
		clock: Arc<dyn Clock>,
		jitter: Arc<dyn JitterSource>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				name,
				policy,
				fetcher,
				clock,
				jitter,
				cached: ArcSwapOption::empty(),
				state: Mutex::new(CacheState::default()),
				shutdown: CancellationToken::new(),
				metrics: CoordinatorMetrics::new(),
			}),
		}
	}

	/// Name used in logs and metric labels.
	pub fn name(&self) -> &str {
		&self.inner.name
	}

	/// Effective refresh policy.
	pub fn policy(&self) -> &RefreshPolicy {
		&self.inner.policy
	}

	/// Access the coordinator's metrics accumulator.
	pub fn metrics(&self) -> Arc<CoordinatorMetrics> {
		self.inner.metrics.clone()
	}

	/// Return a valid token, refreshing it first when the policy says it is due.
	///
	/// A fresh cached token is returned after a single atomic load. Otherwise the call joins the
	/// running refresh, serves the cached token when a refresh completed within
	/// `min_refresh_interval` and the token has not expired, or starts a new refresh.
	///
	/// `cancel` only aborts this caller's wait. Errors from the shared refresh are returned to
	/// every caller that waited on it; a later call may start a new attempt immediately.
	pub async fn get_valid_token(&self, cancel: &CancellationToken) -> Result<Token> {
		if let Some(token) = self.inner.fresh_token() {
			self.inner.observe_request(RequestOutcome::Fresh);

			return Ok(token);
		}

		self.inner.acquire(cancel, false).await
	}

	/// Refresh regardless of freshness and cooldown, or join the refresh already running.
	pub async fn force_refresh(&self, cancel: &CancellationToken) -> Result<Token> {
		self.inner.acquire(cancel, true).await
	}

	/// Peek at the cached token without refreshing; it may be due or already expired.
	pub fn cached_token(&self) -> Option<Token> {
		self.inner.cached.load_full().map(|token| Token::clone(&token))
	}

	/// Capture the coordinator's state for status reporting.
	pub async fn status(&self) -> CoordinatorStatus {
		let (last_refresh_at, refresh_started_at) = {
			let state = self.inner.state.lock().await;

			(state.last_refresh_at(), state.inflight().map(|flight| flight.started_at))
		};
		let cached = self.inner.cached.load_full();
		let now = self.inner.clock.now();
		let phase = match cached.as_deref() {
			_ if refresh_started_at.is_some() => Phase::Refreshing,
			None => Phase::Empty,
			Some(token) if token.is_expired(now) => Phase::Expired,
			Some(token) if now >= self.inner.policy.refresh_point(token, 0.) => Phase::Due,
			Some(_) => Phase::Fresh,
		};

		CoordinatorStatus {
			name: self.inner.name.to_string(),
			phase,
			expires_at: cached.as_ref().map(|token| token.expires_at()),
			last_refresh_at,
			refresh_started_at,
			shut_down: self.is_shut_down(),
			metrics: self.inner.metrics.snapshot(),
		}
	}

	/// Cancel any running refresh and refuse to start new ones.
	///
	/// Unexpired cached tokens keep being served, even once due for refresh; calls that would
	/// need a refresh without one, and [`force_refresh`](Self::force_refresh), fail with
	/// [`Error::Shutdown`].
	pub fn shutdown(&self) {
		if !self.inner.shutdown.is_cancelled() {
			tracing::debug!(coordinator = %self.inner.name, "shutting down token coordinator");
		}

		self.inner.shutdown.cancel();
	}

	/// Whether [`shutdown`](Self::shutdown) has been called.
	pub fn is_shut_down(&self) -> bool {
		self.inner.shutdown.is_cancelled()
	}
}
impl Debug for TokenCoordinator {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("TokenCoordinator")
			.field("name", &self.inner.name)
			.field("policy", &self.inner.policy)
			.field("clock", &self.inner.clock)
			.field("jitter", &self.inner.jitter)
			.finish_non_exhaustive()
	}
}

/// Builder for [`TokenCoordinator`].
#[derive(Default)]
pub struct TokenCoordinatorBuilder {
	name: Option<String>,
	policy: RefreshPolicy,
	fetcher: Option<Arc<dyn TokenFetcher>>,
	clock: Option<Arc<dyn Clock>>,
	jitter: Option<Arc<dyn JitterSource>>,
}
impl TokenCoordinatorBuilder {
	/// Create a builder with default configuration.
	pub fn new() -> Self {
		Self::default()
	}

	/// Name used in logs and metric labels (defaults to `default`).
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());

		self
	}

	/// Replace the whole refresh policy.
	pub fn policy(mut self, policy: RefreshPolicy) -> Self {
		self.policy = policy;

		self
	}

	/// Override how far ahead of expiry a refresh becomes due.
	pub fn refresh_skew(mut self, value: Duration) -> Self {
		self.policy.refresh_skew = value;

		self
	}

	/// Override the minimum time between successful refreshes.
	pub fn min_refresh_interval(mut self, value: Duration) -> Self {
		self.policy.min_refresh_interval = value;

		self
	}

	/// Override the jitter ratio; out-of-range values are clamped into `[0, 0.5]`.
	pub fn jitter_ratio(mut self, value: f64) -> Self {
		self.policy.jitter_ratio = policy::clamp_jitter_ratio(value);

		self
	}

	/// Bound every fetch by `value`.
	pub fn fetch_timeout(mut self, value: Duration) -> Self {
		self.policy.fetch_timeout = Some(value);

		self
	}

	/// Operation performing the actual token acquisition.
	pub fn fetcher(mut self, fetcher: impl TokenFetcher + 'static) -> Self {
		self.fetcher = Some(Arc::new(fetcher));

		self
	}

	/// Time source for expiry and cooldown decisions (defaults to [`SystemClock`]).
	pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
		self.clock = Some(Arc::new(clock));

		self
	}

	/// Randomness for refresh jitter (defaults to [`RandomJitter`]).
	pub fn jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
		self.jitter = Some(Arc::new(jitter));

		self
	}

	/// Validate the configuration and construct a [`TokenCoordinator`].
	pub fn build(self) -> Result<TokenCoordinator> {
		let fetcher = self.fetcher.ok_or_else(|| Error::Validation {
			field: "fetcher",
			reason: "A token fetcher must be configured.".into(),
		})?;
		let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_owned());

		validate_name(&name)?;

		let policy = self.policy.normalized();

		policy.validate()?;

		Ok(TokenCoordinator::from_parts(
			Arc::from(name),
			policy,
			fetcher,
			self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
			self.jitter.unwrap_or_else(|| Arc::new(RandomJitter)),
		))
	}
}
impl Debug for TokenCoordinatorBuilder {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("TokenCoordinatorBuilder")
			.field("name", &self.name)
			.field("policy", &self.policy)
			.field("fetcher", &self.fetcher.is_some())
			.field("clock", &self.clock)
			.field("jitter", &self.jitter)
			.finish()
	}
}

/// Public view of the coordinator lifecycle.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
	/// No token has been fetched successfully yet.
	Empty,
	/// The cached token is outside its refresh window.
	Fresh,
	/// The cached token has entered its refresh window (ignoring jitter).
	Due,
	/// The cached token has expired.
	Expired,
	/// A refresh is running.
	Refreshing,
}

/// Status projection for a coordinator.
#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStatus {
	/// Coordinator name.
	pub name: String,
	/// Lifecycle phase at capture time.
	pub phase: Phase,
	/// Expiry of the cached token, if any.
	pub expires_at: Option<DateTime<Utc>>,
	/// Completion time of the last successful refresh.
	pub last_refresh_at: Option<DateTime<Utc>>,
	/// Start time of the running refresh.
	pub refresh_started_at: Option<DateTime<Utc>>,
	/// Whether the coordinator has been shut down.
	pub shut_down: bool,
	/// Counter snapshot.
	pub metrics: CoordinatorMetricsSnapshot,
}

struct Inner {
	name: Arc<str>,
	policy: RefreshPolicy,
	fetcher: Arc<dyn TokenFetcher>,
	clock: Arc<dyn Clock>,
	jitter: Arc<dyn JitterSource>,
	// Written only while `state` is locked.
	cached: ArcSwapOption<Token>,
	state: Mutex<CacheState>,
	shutdown: CancellationToken,
	metrics: Arc<CoordinatorMetrics>,
}
impl Inner {
	fn fresh_token(&self) -> Option<Token> {
		let cached = self.cached.load();
		let token = cached.as_deref()?;

		(!self.policy.needs_refresh(token, self.clock.now(), self.jitter.as_ref()))
			.then(|| Token::clone(token))
	}

	#[tracing::instrument(level = "debug", skip_all, fields(coordinator = %self.name, force = force))]
	async fn acquire(self: &Arc<Self>, cancel: &CancellationToken, force: bool) -> Result<Token> {
		let outcome = {
			let mut state = tokio::select! {
				biased;
				_ = cancel.cancelled() => return Err(Error::Cancelled),
				state = self.state.lock() => state,
			};
			let now = self.clock.now();
			let cached = self.cached.load_full();

			match state.decide(cached.as_deref(), now, &self.policy, force) {
				RefreshDecision::Join(outcome) => {
					self.observe_request(RequestOutcome::Joined);

					tracing::debug!("joining in-flight refresh");

					outcome
				},
				RefreshDecision::Cooldown(token) => {
					self.observe_request(RequestOutcome::Cooldown);

					tracing::debug!(
						last_refresh_at = ?state.last_refresh_at(),
						"refresh due within cooldown window; serving cached token"
					);

					return Ok(token);
				},
				RefreshDecision::Start => {
					if self.shutdown.is_cancelled() {
						if !force
							&& let Some(token) = cached.as_deref()
							&& !token.is_expired(now)
						{
							self.observe_request(RequestOutcome::Fresh);

							tracing::debug!("coordinator shut down; serving unexpired cached token");

							return Ok(Token::clone(token));
						}

						return Err(Error::Shutdown);
					}

					self.observe_request(RequestOutcome::Started);

					tracing::debug!(cached = cached.is_some(), "starting token refresh");

					state.begin_flight(now, |id| self.launch(id))
				},
			}
		};

		tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				tracing::debug!("caller cancelled while awaiting refresh");

				Err(Error::Cancelled)
			},
			outcome = outcome => outcome,
		}
	}

	fn launch(self: &Arc<Self>, id: u64) -> RefreshOutcome {
		let task = tokio::spawn(Arc::clone(self).run_refresh(id, self.shutdown.child_token()));

		async move { task.await.unwrap_or_else(|err| Err(Error::RefreshAborted(err.to_string()))) }
			.boxed()
			.shared()
	}

	async fn run_refresh(self: Arc<Self>, id: u64, cancel: CancellationToken) -> Result<Token> {
		let mut guard = FlightGuard { inner: &self, id, armed: true };
		let started = Instant::now();
		let outcome = self.fetch_token(&cancel).await;
		let mut state = self.state.lock().await;

		match &outcome {
			Ok(token) => {
				let completed_at = self.clock.now();
				let elapsed = started.elapsed();

				self.cached.store(Some(Arc::new(token.clone())));
				state.record_success(completed_at);
				self.metrics.record_refresh_success(elapsed);
				metrics::record_refresh_success(&self.name, elapsed);

				tracing::debug!(
					coordinator = %self.name,
					expires_at = %token.expires_at(),
					?elapsed,
					"token refreshed"
				);
			},
			Err(err) => {
				self.metrics.record_refresh_error();
				metrics::record_refresh_error(&self.name);

				tracing::warn!(coordinator = %self.name, error = %err, "token refresh failed");
			},
		}

		state.finish_flight(id);

		guard.armed = false;

		outcome
	}

	async fn fetch_token(&self, cancel: &CancellationToken) -> Result<Token> {
		let attempt =
			AssertUnwindSafe(async { self.fetcher.fetch(cancel.clone()).await }).catch_unwind();
		let attempt = async {
			match attempt.await {
				Ok(Ok(token)) => Ok(token),
				Ok(Err(err)) => Err(Error::Fetch(Arc::from(err))),
				Err(panic) => Err(Error::RefreshAborted(format!(
					"fetcher panicked: {}",
					panic_message(&*panic)
				))),
			}
		};
		let bounded = async {
			match self.policy.fetch_timeout {
				Some(limit) =>
					time::timeout(limit, attempt).await.unwrap_or(Err(Error::Timeout(limit))),
				None => attempt.await,
			}
		};
		let token = tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(Error::Cancelled),
			outcome = bounded => outcome,
		}?;

		if token.is_blank() {
			return Err(Error::EmptyToken);
		}

		Ok(token)
	}

	fn observe_request(&self, outcome: RequestOutcome) {
		self.metrics.record_request(outcome);
		metrics::record_request(&self.name, outcome);
	}
}

/// Clears the in-flight slot if the refresh task unwinds or is dropped before finishing.
struct FlightGuard<'a> {
	inner: &'a Arc<Inner>,
	id: u64,
	armed: bool,
}
impl Drop for FlightGuard<'_> {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}

		let id = self.id;

		tracing::warn!(coordinator = %self.inner.name, flight = id, "token refresh torn down");

		if let Ok(mut state) = self.inner.state.try_lock() {
			state.finish_flight(id);
		} else if let Ok(handle) = tokio::runtime::Handle::try_current() {
			let inner = Arc::clone(self.inner);

			handle.spawn(async move {
				inner.state.lock().await.finish_flight(id);
			});
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(message) = payload.downcast_ref::<&str>() {
		(*message).to_owned()
	} else if let Some(message) = payload.downcast_ref::<String>() {
		message.clone()
	} else {
		"non-string panic payload".into()
	}
}

fn validate_name(value: &str) -> Result<()> {
	if value.is_empty() {
		return Err(Error::Validation { field: "name", reason: "Must not be empty.".into() });
	}
	if value.len() > 64 {
		return Err(Error::Validation {
			field: "name",
			reason: "Must be 64 characters or fewer.".into(),
		});
	}
	if !value.as_bytes().iter().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_')) {
		return Err(Error::Validation {
			field: "name",
			reason: "May only contain ASCII letters, numbers, '-', or '_'.".into(),
		});
	}

	Ok(())
}
