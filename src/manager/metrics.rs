// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for token requests issued by the refresh loop.
#[derive(Debug, Default)]
pub struct RefreshMetrics {
	attempts: AtomicU64,
	success: AtomicU64,
	failure: AtomicU64,
	cycles_failed: AtomicU64,
}
impl RefreshMetrics {
	/// Returns the total number of refresh requests.
	pub fn attempts(&self) -> u64 {
		self.attempts.load(Ordering::Relaxed)
	}

	/// Returns the number of refresh requests that installed a token (including reuses of a
	/// token another caller just acquired).
	pub fn successes(&self) -> u64 {
		self.success.load(Ordering::Relaxed)
	}

	/// Returns the number of failed refresh requests.
	pub fn failures(&self) -> u64 {
		self.failure.load(Ordering::Relaxed)
	}

	/// Returns the number of refresh cycles that exhausted their retries.
	pub fn failed_cycles(&self) -> u64 {
		self.cycles_failed.load(Ordering::Relaxed)
	}

	pub(crate) fn record_attempt(&self) {
		self.attempts.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_success(&self) {
		self.success.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failure(&self) {
		self.failure.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failed_cycle(&self) {
		self.cycles_failed.fetch_add(1, Ordering::Relaxed);
	}
}
