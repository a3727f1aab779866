//! Strategy hooks that classify upstream rejections.
//!
//! The identity provider and the backend both answer failures with a status code and,
//! sometimes, an OAuth-style `error` document. Deciding whether a failure blames the
//! game server's own credentials, the player's token, or a passing upstream problem is
//! deployment-specific, so it lives behind [`AuthorityStrategy`].

// self
use crate::{_prelude::*, oauth::Authority};

/// Strategy hook that maps upstream failures into the broker taxonomy.
///
/// Implementors must be `Send + Sync`; the context only carries crate-owned primitive data
/// so strategies stay decoupled from any HTTP client.
pub trait AuthorityStrategy: Send + Sync {
	/// Classifies a non-success response.
	fn classify_rejection(&self, ctx: &ErrorContext) -> RejectionKind;
}

/// Who an upstream rejection blames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionKind {
	/// The service's own credentials or token were refused.
	ServiceRejected,
	/// The player's token was refused.
	ClientRejected,
	/// Failure is temporary and should be retried.
	Transient,
}

/// Context passed to strategies when classifying a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorContext {
	/// Authority that produced the response.
	pub authority: Authority,
	/// HTTP status code, when available.
	pub http_status: Option<u16>,
	/// OAuth-style `error` field.
	pub oauth_error: Option<String>,
	/// OAuth-style `error_description` field.
	pub error_description: Option<String>,
	/// Preview of the response body for non-JSON payloads.
	pub body_preview: Option<String>,
}
impl ErrorContext {
	const BODY_PREVIEW_LIMIT: usize = 256;

	/// Creates a new context for responses from `authority`.
	pub fn new(authority: Authority) -> Self {
		Self {
			authority,
			http_status: None,
			oauth_error: None,
			error_description: None,
			body_preview: None,
		}
	}

	/// Adds an HTTP status code.
	pub fn with_http_status(mut self, status: u16) -> Self {
		self.http_status = Some(status);

		self
	}

	/// Adds the `error` code string.
	pub fn with_oauth_error(mut self, error: impl Into<String>) -> Self {
		self.oauth_error = Some(error.into());

		self
	}

	/// Adds the `error_description` field.
	pub fn with_error_description(mut self, description: impl Into<String>) -> Self {
		self.error_description = Some(description.into());

		self
	}

	/// Adds a body preview, truncated to 256 characters.
	pub fn with_body_preview(mut self, body: impl Into<String>) -> Self {
		self.body_preview = Some(truncate_preview(body.into()));

		self
	}
}

/// Default strategy.
///
/// Structured `error` fields win, then body hints, then the status code. A 401 from either
/// authority blames the service, since every request carries the service's credentials.
/// Other 4xx codes from the backend blame the player's token.
#[derive(Debug, Default)]
pub struct DefaultAuthorityStrategy;
impl Display for DefaultAuthorityStrategy {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("default-authority-strategy")
	}
}
impl AuthorityStrategy for DefaultAuthorityStrategy {
	fn classify_rejection(&self, ctx: &ErrorContext) -> RejectionKind {
		if let Some(kind) =
			classify_error_code(ctx.oauth_error.as_deref(), ctx.error_description.as_deref())
		{
			return kind;
		}
		if let Some(kind) = classify_body(ctx.body_preview.as_deref()) {
			return kind;
		}

		classify_status(ctx.authority, ctx.http_status)
	}
}

fn truncate_preview(body: String) -> String {
	if body.chars().count() <= ErrorContext::BODY_PREVIEW_LIMIT {
		return body;
	}

	let mut buf = body.chars().take(ErrorContext::BODY_PREVIEW_LIMIT).collect::<String>();

	buf.push('…');

	buf
}

fn classify_error_code(
	error: Option<&str>,
	error_description: Option<&str>,
) -> Option<RejectionKind> {
	error
		.and_then(match_exact_value)
		.or_else(|| error_description.and_then(match_exact_value))
		.or_else(|| classify_body(error_description))
}

fn match_exact_value(value: &str) -> Option<RejectionKind> {
	const SERVICE: [&str; 4] =
		["invalid_client", "unauthorized_client", "invalid_service_token", "unsupported_grant_type"];
	const CLIENT: [&str; 4] = ["invalid_token", "invalid_grant", "expired_token", "access_denied"];
	const TRANSIENT: [&str; 3] = ["temporarily_unavailable", "server_error", "slow_down"];

	if SERVICE.iter().any(|code| value.eq_ignore_ascii_case(code)) {
		Some(RejectionKind::ServiceRejected)
	} else if CLIENT.iter().any(|code| value.eq_ignore_ascii_case(code)) {
		Some(RejectionKind::ClientRejected)
	} else if TRANSIENT.iter().any(|code| value.eq_ignore_ascii_case(code)) {
		Some(RejectionKind::Transient)
	} else {
		None
	}
}

fn classify_body(body: Option<&str>) -> Option<RejectionKind> {
	let lowered = body?.to_ascii_lowercase();

	match lowered.as_str() {
		text if text.contains("invalid_client") || text.contains("invalid_service_token") =>
			Some(RejectionKind::ServiceRejected),
		text if text.contains("invalid_token") || text.contains("expired_token") =>
			Some(RejectionKind::ClientRejected),
		text if text.contains("temporarily_unavailable") => Some(RejectionKind::Transient),
		_ => None,
	}
}

fn classify_status(authority: Authority, status: Option<u16>) -> RejectionKind {
	match (authority, status) {
		(_, Some(401)) => RejectionKind::ServiceRejected,
		(Authority::IdentityProvider, Some(400 | 403)) => RejectionKind::ServiceRejected,
		(Authority::Backend, Some(400 | 403 | 404 | 410 | 422)) => RejectionKind::ClientRejected,
		_ => RejectionKind::Transient,
	}
}
