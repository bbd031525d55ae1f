//! Immutable bearer token value.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Opaque bearer token paired with its absolute expiry.
///
/// Every token carries a non-blank value; deserialization goes through [`Token::new`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TokenRepr")]
pub struct Token {
	value: Arc<str>,
	expires_at: DateTime<Utc>,
}
impl Token {
	/// Build a token, rejecting empty or whitespace-only values.
	pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Result<Self> {
		let value = value.into();

		if value.trim().is_empty() {
			return Err(Error::Validation {
				field: "value",
				reason: "Must not be empty or whitespace.".into(),
			});
		}

		Ok(Self { value: Arc::from(value), expires_at })
	}

	/// Build a token that expires `ttl` after `issued_at`.
	pub fn expiring_in(
		value: impl Into<String>,
		issued_at: DateTime<Utc>,
		ttl: Duration,
	) -> Result<Self> {
		let ttl = TimeDelta::from_std(ttl).map_err(|err| Error::Validation {
			field: "ttl",
			reason: format!("Out of range: {err}."),
		})?;
		let expires_at = issued_at.checked_add_signed(ttl).ok_or_else(|| Error::Validation {
			field: "ttl",
			reason: "Expiry overflows the supported time range.".into(),
		})?;

		Self::new(value, expires_at)
	}

	/// Opaque token payload.
	pub fn value(&self) -> &str {
		&self.value
	}

	/// Absolute instant at which the token stops being valid.
	pub fn expires_at(&self) -> DateTime<Utc> {
		self.expires_at
	}

	/// Whether the token has expired at `now`; expiry is exclusive.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		now >= self.expires_at
	}

	/// Time left before expiry, saturating at zero.
	pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
		(self.expires_at - now).to_std().unwrap_or_default()
	}

	pub(crate) fn is_blank(&self) -> bool {
		self.value.trim().is_empty()
	}

	#[cfg(test)]
	pub(crate) fn new_unchecked(value: &str, expires_at: DateTime<Utc>) -> Self {
		Self { value: Arc::from(value), expires_at }
	}
}
impl TryFrom<TokenRepr> for Token {
	type Error = Error;

	fn try_from(repr: TokenRepr) -> Result<Self> {
		Self::new(repr.value, repr.expires_at)
	}
}
impl Debug for Token {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("Token")
			.field("value", &"<redacted>")
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

#[derive(Deserialize)]
struct TokenRepr {
	value: String,
	expires_at: DateTime<Utc>,
}
