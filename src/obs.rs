//! Observability helpers for broker flows.
//!
//! Every flow runs inside a `session_broker.flow` span carrying the `flow` and `stage`
//! fields. With the `metrics` feature enabled, [`record_flow_outcome`] also increments the
//! `session_broker_flow_total` counter labeled by `flow` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Broker flows observed by spans and counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// Caller-initiated service token acquisition (including bootstrap).
	Acquire,
	/// Scheduled background refresh.
	Refresh,
	/// Client token → team identity exchange.
	ResolveTeam,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::Acquire => "acquire",
			FlowKind::Refresh => "refresh",
			FlowKind::ResolveTeam => "resolve_team",
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// One upstream request was issued.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
	/// Completed from existing state without an upstream request.
	Reused,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
			FlowOutcome::Reused => "reused",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
