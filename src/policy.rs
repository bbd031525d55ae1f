//! Refresh policy deciding when a cached token is due for renewal.
//!
//! A token is due once `now` reaches `expires_at - (refresh_skew + jitter)`, where the jitter is
//! drawn afresh on every evaluation from `[0, jitter_ratio * refresh_skew)`. Re-drawing per call
//! spreads the trigger point of many independent coordinators across a bounded band instead of a
//! single shared boundary.

// std
use std::{cell::RefCell, fmt::Debug};
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
// self
use crate::{_prelude::*, token::Token};

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Default lead time before expiry at which a refresh becomes due.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);
/// Default floor between two successful refreshes.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
/// Default fraction of the skew added as random extra lead time.
pub const DEFAULT_JITTER_RATIO: f64 = 0.15;
/// Upper bound applied to `jitter_ratio`.
pub const MAX_JITTER_RATIO: f64 = 0.5;

/// Source of uniformly distributed samples in `[0, 1)`.
pub trait JitterSource: Debug + Send + Sync {
	/// Draw the next sample.
	fn sample(&self) -> f64;
}

/// Jitter backed by a thread-local [`SmallRng`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomJitter;
impl JitterSource for RandomJitter {
	fn sample(&self) -> f64 {
		SMALL_RNG.with(|cell| cell.borrow_mut().random::<f64>())
	}
}

/// Jitter that always yields the same sample; used to pin policy boundaries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedJitter(f64);
impl FixedJitter {
	/// Jitter that adds no extra lead time.
	pub const ZERO: Self = Self(0.);

	/// Create a fixed sample, clamped into `[0, 1)`.
	pub fn new(sample: f64) -> Self {
		if sample.is_nan() { Self::ZERO } else { Self(sample.clamp(0., 1. - f64::EPSILON)) }
	}
}
impl JitterSource for FixedJitter {
	fn sample(&self) -> f64 {
		self.0
	}
}

/// Timing configuration for proactive refreshes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefreshPolicy {
	/// How far ahead of expiry a refresh becomes due.
	#[serde(default = "default_refresh_skew")]
	pub refresh_skew: Duration,
	/// Minimum time between two successful refreshes while the cached token is still valid.
	#[serde(default = "default_min_refresh_interval")]
	pub min_refresh_interval: Duration,
	/// Fraction of `refresh_skew` added as random extra lead time; clamped into `[0, 0.5]`.
	#[serde(default = "default_jitter_ratio")]
	pub jitter_ratio: f64,
	/// Optional upper bound for a single fetch.
	#[serde(default)]
	pub fetch_timeout: Option<Duration>,
}
impl RefreshPolicy {
	/// Build a policy from its core knobs, clamping `jitter_ratio`.
	pub fn new(refresh_skew: Duration, min_refresh_interval: Duration, jitter_ratio: f64) -> Self {
		Self {
			refresh_skew,
			min_refresh_interval,
			jitter_ratio: clamp_jitter_ratio(jitter_ratio),
			fetch_timeout: None,
		}
	}

	/// Bound every fetch by `timeout`.
	pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
		self.fetch_timeout = Some(timeout);

		self
	}

	/// Return a copy with out-of-range values clamped.
	pub fn normalized(mut self) -> Self {
		self.jitter_ratio = clamp_jitter_ratio(self.jitter_ratio);

		self
	}

	/// Validate invariants that cannot be fixed by clamping.
	pub fn validate(&self) -> Result<()> {
		if TimeDelta::from_std(self.refresh_skew).is_err() {
			return Err(Error::Validation {
				field: "refresh_skew",
				reason: "Exceeds the supported time range.".into(),
			});
		}
		if TimeDelta::from_std(self.min_refresh_interval).is_err() {
			return Err(Error::Validation {
				field: "min_refresh_interval",
				reason: "Exceeds the supported time range.".into(),
			});
		}
		if let Some(timeout) = self.fetch_timeout
			&& timeout.is_zero()
		{
			return Err(Error::Validation {
				field: "fetch_timeout",
				reason: "Must be greater than zero when set.".into(),
			});
		}

		Ok(())
	}

	/// Upper bound of the random extra lead time.
	pub fn max_jitter(&self) -> Duration {
		self.refresh_skew.mul_f64(clamp_jitter_ratio(self.jitter_ratio))
	}

	/// Instant at which `token` becomes due for a given jitter `sample` in `[0, 1)`.
	///
	/// Samples outside that range are clamped; non-finite samples count as zero.
	pub fn refresh_point(&self, token: &Token, sample: f64) -> DateTime<Utc> {
		let sample = if sample.is_finite() { sample.clamp(0., 1.) } else { 0. };
		let jitter = self.max_jitter().mul_f64(sample);
		let lead =
			TimeDelta::from_std(self.refresh_skew.saturating_add(jitter)).unwrap_or(TimeDelta::MAX);

		token.expires_at().checked_sub_signed(lead).unwrap_or(DateTime::<Utc>::MIN_UTC)
	}

	/// Whether `token` should be refreshed at `now`.
	///
	/// Expired tokens are always due; otherwise a fresh jitter sample is drawn from `jitter`.
	pub fn needs_refresh(
		&self,
		token: &Token,
		now: DateTime<Utc>,
		jitter: &dyn JitterSource,
	) -> bool {
		if token.is_expired(now) {
			return true;
		}

		now >= self.refresh_point(token, jitter.sample())
	}

	/// Whether the cooldown window opened by a refresh completed at `last_refresh_at` is still
	/// active at `now`.
	pub fn in_cooldown(
		&self,
		last_refresh_at: Option<DateTime<Utc>>,
		now: DateTime<Utc>,
	) -> bool {
		let Some(last) = last_refresh_at else {
			return false;
		};
		let interval = TimeDelta::from_std(self.min_refresh_interval).unwrap_or(TimeDelta::MAX);

		now - last < interval
	}
}
impl Default for RefreshPolicy {
	fn default() -> Self {
		Self {
			refresh_skew: DEFAULT_REFRESH_SKEW,
			min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
			jitter_ratio: DEFAULT_JITTER_RATIO,
			fetch_timeout: None,
		}
	}
}

/// Clamp a jitter ratio into `[0, MAX_JITTER_RATIO]`; NaN collapses to zero.
pub fn clamp_jitter_ratio(ratio: f64) -> f64 {
	if ratio.is_nan() { 0. } else { ratio.clamp(0., MAX_JITTER_RATIO) }
}

fn default_refresh_skew() -> Duration {
	DEFAULT_REFRESH_SKEW
}

fn default_min_refresh_interval() -> Duration {
	DEFAULT_MIN_REFRESH_INTERVAL
}

fn default_jitter_ratio() -> f64 {
	DEFAULT_JITTER_RATIO
}
