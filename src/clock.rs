//! Wall-clock sources used for expiry and cooldown decisions.

// std
use std::{
	fmt::Debug,
	sync::{Mutex, PoisonError},
};
// self
use crate::_prelude::*;

/// Source of the current UTC time.
pub trait Clock: Debug + Send + Sync {
	/// Current time according to this clock.
	fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Manually driven clock for deterministic tests.
///
/// Cloning shares the underlying time, so a test can keep one handle while the coordinator owns
/// another.
#[derive(Clone, Debug)]
pub struct ManualClock {
	now: Arc<Mutex<DateTime<Utc>>>,
}
impl ManualClock {
	/// Create a clock frozen at `now`.
	pub fn new(now: DateTime<Utc>) -> Self {
		Self { now: Arc::new(Mutex::new(now)) }
	}

	/// Replace the current time.
	pub fn set(&self, now: DateTime<Utc>) {
		*self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
	}

	/// Move the clock forward by `delta`.
	pub fn advance(&self, delta: Duration) {
		let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);

		if let Ok(delta) = TimeDelta::from_std(delta)
			&& let Some(next) = now.checked_add_signed(delta)
		{
			*now = next;
		}
	}
}
impl Default for ManualClock {
	fn default() -> Self {
		Self::new(Utc::now())
	}
}
impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		*self.now.lock().unwrap_or_else(PoisonError::into_inner)
	}
}
