//! Metrics helpers and per-coordinator telemetry bookkeeping.
//!
//! [`CoordinatorMetrics`] is always maintained. With the `metrics` feature the same events are also
//! emitted through the `metrics` facade, labelled with the coordinator name.

// std
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
// crates.io
#[cfg(feature = "metrics")] use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
#[cfg(feature = "metrics")] use smallvec::SmallVec;
// self
use crate::_prelude::*;

#[cfg(feature = "metrics")]
type LabelSet = SmallVec<[Label; 2]>;

#[cfg(feature = "metrics")]
const METRIC_REQUESTS_TOTAL: &str = "bearer_cache_requests_total";
#[cfg(feature = "metrics")]
const METRIC_REFRESH_TOTAL: &str = "bearer_cache_refresh_total";
#[cfg(feature = "metrics")]
const METRIC_REFRESH_DURATION: &str = "bearer_cache_refresh_duration_seconds";
#[cfg(feature = "metrics")]
const METRIC_REFRESH_ERRORS: &str = "bearer_cache_refresh_errors_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// How a `get_valid_token` call was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
	/// Served from cache on the lock-free path.
	Fresh,
	/// Served from cache because a refresh completed within the cooldown window.
	Cooldown,
	/// Joined a refresh started by another caller.
	Joined,
	/// Started a new refresh.
	Started,
}
impl RequestOutcome {
	/// Stable label value for the outcome.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Fresh => "fresh",
			Self::Cooldown => "cooldown",
			Self::Joined => "joined",
			Self::Started => "started",
		}
	}
}

/// Thread-safe counters for a single coordinator.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
	total_requests: AtomicU64,
	fresh_hits: AtomicU64,
	cooldown_serves: AtomicU64,
	joined_flights: AtomicU64,
	refreshes_started: AtomicU64,
	refresh_successes: AtomicU64,
	refresh_errors: AtomicU64,
	last_refresh_micros: AtomicU64,
}
impl CoordinatorMetrics {
	/// Create a new metrics accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record how a request was satisfied.
	pub fn record_request(&self, outcome: RequestOutcome) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);

		let counter = match outcome {
			RequestOutcome::Fresh => &self.fresh_hits,
			RequestOutcome::Cooldown => &self.cooldown_serves,
			RequestOutcome::Joined => &self.joined_flights,
			RequestOutcome::Started => &self.refreshes_started,
		};

		counter.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a successful refresh and its latency.
	pub fn record_refresh_success(&self, duration: Duration) {
		self.refresh_successes.fetch_add(1, Ordering::Relaxed);
		self.last_refresh_micros
			.store(duration.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
	}

	/// Record a failed refresh.
	pub fn record_refresh_error(&self) {
		self.refresh_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot for status reporting.
	pub fn snapshot(&self) -> CoordinatorMetricsSnapshot {
		CoordinatorMetricsSnapshot {
			total_requests: self.total_requests.load(Ordering::Relaxed),
			fresh_hits: self.fresh_hits.load(Ordering::Relaxed),
			cooldown_serves: self.cooldown_serves.load(Ordering::Relaxed),
			joined_flights: self.joined_flights.load(Ordering::Relaxed),
			refreshes_started: self.refreshes_started.load(Ordering::Relaxed),
			refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
			refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
			last_refresh_micros: match self.last_refresh_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of coordinator counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CoordinatorMetricsSnapshot {
	/// Total number of `get_valid_token`/`force_refresh` calls that produced a decision.
	pub total_requests: u64,
	/// Calls served on the lock-free path.
	pub fresh_hits: u64,
	/// Calls served from cache under the cooldown guard.
	pub cooldown_serves: u64,
	/// Calls that joined a refresh started by someone else.
	pub joined_flights: u64,
	/// Refreshes started.
	pub refreshes_started: u64,
	/// Refreshes that produced a new token.
	pub refresh_successes: u64,
	/// Refreshes that failed.
	pub refresh_errors: u64,
	/// Microsecond latency of the most recent successful refresh.
	pub last_refresh_micros: Option<u64>,
}
impl CoordinatorMetricsSnapshot {
	/// Share of requests answered from cache without waiting on a fetch.
	pub fn hit_rate(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			(self.fresh_hits + self.cooldown_serves) as f64 / self.total_requests as f64
		}
	}
}

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

#[cfg(feature = "metrics")]
pub(crate) fn record_request(coordinator: &str, outcome: RequestOutcome) {
	let mut labels = base_labels(coordinator);

	labels.push(Label::new("outcome", outcome.as_str()));

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
}
#[cfg(not(feature = "metrics"))]
pub(crate) fn record_request(_: &str, _: RequestOutcome) {}

#[cfg(feature = "metrics")]
pub(crate) fn record_refresh_success(coordinator: &str, duration: Duration) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(coordinator, "success").iter())
		.increment(1);
	metrics::histogram!(METRIC_REFRESH_DURATION, base_labels(coordinator).iter())
		.record(duration.as_secs_f64());
}
#[cfg(not(feature = "metrics"))]
pub(crate) fn record_refresh_success(_: &str, _: Duration) {}

#[cfg(feature = "metrics")]
pub(crate) fn record_refresh_error(coordinator: &str) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(coordinator, "error").iter())
		.increment(1);
	metrics::counter!(METRIC_REFRESH_ERRORS, base_labels(coordinator).iter()).increment(1);
}
#[cfg(not(feature = "metrics"))]
pub(crate) fn record_refresh_error(_: &str) {}

#[cfg(feature = "metrics")]
fn base_labels(coordinator: &str) -> LabelSet {
	let mut labels = LabelSet::new();

	labels.push(Label::new("coordinator", coordinator.to_owned()));

	labels
}

#[cfg(feature = "metrics")]
fn status_labels(coordinator: &str, status: &'static str) -> LabelSet {
	let mut labels = base_labels(coordinator);

	labels.push(Label::new("status", status));

	labels
}
