//! Bounded exponential backoff shared by the refresh loop and the relay.

// std
use std::time::Duration as StdDuration;
// crates.io
use rand::Rng;
// self
use crate::{_prelude::*, config::ConfigValidationError};

/// Retry budget and backoff curve for one logical operation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	/// Total attempts including the first one; must be at least 1.
	pub max_attempts: u32,
	/// Delay before the second attempt.
	#[serde(with = "humane_secs")]
	pub initial_backoff: StdDuration,
	/// Upper bound for any single delay, `Retry-After` hints included.
	#[serde(with = "humane_secs")]
	pub max_backoff: StdDuration,
	/// Fraction of each delay that is randomized, in `[0, 1]`.
	pub jitter: f64,
}
impl RetryPolicy {
	/// Policy that never retries.
	pub const fn single_attempt() -> Self {
		Self {
			max_attempts: 1,
			initial_backoff: StdDuration::ZERO,
			max_backoff: StdDuration::ZERO,
			jitter: 0.,
		}
	}

	/// Delay before attempt `attempt + 1`, where `attempt` counts completed attempts from 1.
	///
	/// A `Retry-After` hint replaces the computed delay but is still capped at
	/// [`RetryPolicy::max_backoff`].
	pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> StdDuration {
		if let Some(hint) = retry_after.and_then(|hint| StdDuration::try_from(hint).ok()) {
			return hint.min(self.max_backoff);
		}

		let exponent = attempt.saturating_sub(1).min(16);
		let base = self.initial_backoff.saturating_mul(1 << exponent).min(self.max_backoff);

		if self.jitter <= 0. || base.is_zero() {
			return base;
		}

		let spread = self.jitter.min(1.);
		let factor = rand::rng().random_range((1. - spread)..=1.);

		base.mul_f64(factor)
	}

	/// Returns `true` when another attempt is allowed after `attempt` completed attempts.
	pub fn allows_retry(&self, attempt: u32) -> bool {
		attempt < self.max_attempts
	}

	pub(crate) fn validate(&self, policy: &'static str) -> Result<(), ConfigValidationError> {
		if self.max_attempts == 0 {
			return Err(ConfigValidationError::InvalidRetryPolicy {
				policy,
				reason: "max_attempts must be at least 1",
			});
		}
		if self.initial_backoff > self.max_backoff {
			return Err(ConfigValidationError::InvalidRetryPolicy {
				policy,
				reason: "initial_backoff exceeds max_backoff",
			});
		}
		if !(0. ..=1.).contains(&self.jitter) {
			return Err(ConfigValidationError::InvalidRetryPolicy {
				policy,
				reason: "jitter must lie within [0, 1]",
			});
		}

		Ok(())
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_backoff: StdDuration::from_millis(500),
			max_backoff: StdDuration::from_secs(30),
			jitter: 0.2,
		}
	}
}

/// Durations expressed as fractional seconds in settings files.
pub(crate) mod humane_secs {
	// std
	use std::time::Duration as StdDuration;
	// crates.io
	use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

	pub fn serialize<S>(value: &StdDuration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_f64(value.as_secs_f64())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<StdDuration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let secs = f64::deserialize(deserializer)?;

		StdDuration::try_from_secs_f64(secs).map_err(D::Error::custom)
	}
}
