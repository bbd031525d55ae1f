//! Coordination state guarded by the coordinator's lock.

// crates.io
use futures::future::{BoxFuture, Shared};
// self
use crate::{_prelude::*, policy::RefreshPolicy, token::Token};

/// Shareable handle resolving to the outcome of one refresh.
pub(crate) type RefreshOutcome = Shared<BoxFuture<'static, Result<Token>>>;

/// A refresh that is currently executing.
#[derive(Clone)]
pub(crate) struct RefreshFlight {
	pub id: u64,
	pub started_at: DateTime<Utc>,
	pub outcome: RefreshOutcome,
}

/// What a caller on the slow path should do after consulting the state.
pub(crate) enum RefreshDecision {
	/// Await the refresh that is already running.
	Join(RefreshOutcome),
	/// Serve the cached token; a refresh completed too recently to start another.
	Cooldown(Token),
	/// Start a new refresh.
	Start,
}

/// Refresh bookkeeping; the cached token itself lives beside it for lock-free reads but is only
/// written while this state is locked.
#[derive(Default)]
pub(crate) struct CacheState {
	last_refresh_at: Option<DateTime<Utc>>,
	inflight: Option<RefreshFlight>,
	flights_started: u64,
}
impl CacheState {
	/// Completion time of the last successful refresh; `None` means never.
	pub fn last_refresh_at(&self) -> Option<DateTime<Utc>> {
		self.last_refresh_at
	}

	pub fn inflight(&self) -> Option<&RefreshFlight> {
		self.inflight.as_ref()
	}

	/// Choose between joining, serving under cooldown, or starting a refresh.
	///
	/// `force` skips the cooldown guard but still joins a running refresh.
	pub fn decide(
		&self,
		cached: Option<&Token>,
		now: DateTime<Utc>,
		policy: &RefreshPolicy,
		force: bool,
	) -> RefreshDecision {
		if let Some(flight) = &self.inflight {
			return RefreshDecision::Join(flight.outcome.clone());
		}

		if !force
			&& let Some(token) = cached
			&& !token.is_expired(now)
			&& policy.in_cooldown(self.last_refresh_at, now)
		{
			return RefreshDecision::Cooldown(token.clone());
		}

		RefreshDecision::Start
	}

	/// Register a new flight; `launch` receives the flight id and returns its outcome handle.
	pub fn begin_flight<F>(&mut self, started_at: DateTime<Utc>, launch: F) -> RefreshOutcome
	where
		F: FnOnce(u64) -> RefreshOutcome,
	{
		debug_assert!(self.inflight.is_none(), "a refresh is already in flight");

		self.flights_started = self.flights_started.wrapping_add(1);

		let id = self.flights_started;
		let outcome = launch(id);

		self.inflight = Some(RefreshFlight { id, started_at, outcome: outcome.clone() });

		outcome
	}

	/// Clear the in-flight slot if it still belongs to flight `id`.
	pub fn finish_flight(&mut self, id: u64) -> bool {
		if self.inflight.as_ref().is_some_and(|flight| flight.id == id) {
			self.inflight = None;

			true
		} else {
			false
		}
	}

	/// Record the completion time of a successful refresh.
	pub fn record_success(&mut self, completed_at: DateTime<Utc>) {
		self.last_refresh_at = Some(completed_at);
	}
}
