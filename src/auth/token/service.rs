//! Service bearer token issued by the identity provider, plus its builder.

// self
use crate::{_prelude::*, auth::token::secret::TokenSecret};

/// Lifecycle status of a [`ServiceToken`] at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenStatus {
	/// The issued-at instant lies in the future (clock skew).
	Pending,
	/// Token is currently usable.
	Active,
	/// Token reached its expiry instant.
	Expired,
}

/// Errors produced by [`ServiceTokenBuilder`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum ServiceTokenBuilderError {
	/// No access token value was provided.
	#[error("Access token is required.")]
	MissingAccessToken,
	/// No lifetime was configured.
	#[error("Token lifetime must be supplied via expires_in.")]
	MissingExpiry,
	/// Lifetime was zero or negative.
	#[error("Token lifetime must be positive.")]
	NonPositiveExpiry,
	/// Issued-at plus lifetime does not fit a calendar date.
	#[error("Token lifetime overflows the supported date range.")]
	ExpiryOutOfRange,
}

/// Bearer token identifying the game server to the backend.
#[derive(Clone, Serialize, Deserialize)]
pub struct ServiceToken {
	/// Access token secret; callers must avoid logging it.
	pub access_token: TokenSecret,
	/// Token type reported by the identity provider (usually `bearer`).
	pub token_type: String,
	/// Scope string granted by the identity provider, if any.
	pub scope: Option<String>,
	/// Lifetime granted by the identity provider.
	pub expires_in: Duration,
	/// Instant the broker received the token.
	pub issued_at: OffsetDateTime,
	/// `issued_at + expires_in`.
	pub expires_at: OffsetDateTime,
}
impl ServiceToken {
	/// Returns a builder for the provided access token.
	pub fn builder(access_token: impl Into<String>) -> ServiceTokenBuilder {
		ServiceTokenBuilder::new().access_token(access_token)
	}

	/// Computes the lifecycle status at a given instant.
	pub fn status_at(&self, instant: OffsetDateTime) -> TokenStatus {
		if instant < self.issued_at {
			return TokenStatus::Pending;
		}
		if instant >= self.expires_at {
			return TokenStatus::Expired;
		}

		TokenStatus::Active
	}

	/// Returns `true` if the token has expired at the provided instant.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		matches!(self.status_at(instant), TokenStatus::Expired)
	}

	/// Returns `true` if the token is expired relative to the current clock.
	pub fn is_expired(&self) -> bool {
		self.is_expired_at(OffsetDateTime::now_utc())
	}

	/// Lifetime left at `instant`, clamped at zero.
	pub fn remaining_at(&self, instant: OffsetDateTime) -> Duration {
		let remaining = self.expires_at - instant;

		if remaining.is_negative() { Duration::ZERO } else { remaining }
	}

	/// Formats the `Authorization` header value for backend requests.
	pub(crate) fn authorization(&self) -> String {
		format!("Bearer {}", self.access_token.expose())
	}
}
impl Debug for ServiceToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ServiceToken")
			.field("access_token", &"<redacted>")
			.field("token_type", &self.token_type)
			.field("scope", &self.scope)
			.field("expires_in", &self.expires_in)
			.field("issued_at", &self.issued_at)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Builder for [`ServiceToken`].
#[derive(Clone, Debug, Default)]
pub struct ServiceTokenBuilder {
	access_token: Option<TokenSecret>,
	token_type: Option<String>,
	scope: Option<String>,
	issued_at: Option<OffsetDateTime>,
	expires_in: Option<Duration>,
}
impl ServiceTokenBuilder {
	/// Creates an empty builder.
	pub fn new() -> Self {
		Self::default()
	}

	/// Provides the access token value.
	pub fn access_token(mut self, token: impl Into<String>) -> Self {
		self.access_token = Some(TokenSecret::new(token));

		self
	}

	/// Sets the token type (defaults to `bearer`).
	pub fn token_type(mut self, token_type: impl Into<String>) -> Self {
		self.token_type = Some(token_type.into());

		self
	}

	/// Sets the granted scope string.
	pub fn scope(mut self, scope: Option<String>) -> Self {
		self.scope = scope;

		self
	}

	/// Sets the issued-at instant (defaults to now).
	pub fn issued_at(mut self, instant: OffsetDateTime) -> Self {
		self.issued_at = Some(instant);

		self
	}

	/// Sets the lifetime reported by the identity provider.
	pub fn expires_in(mut self, duration: Duration) -> Self {
		self.expires_in = Some(duration);

		self
	}

	/// Consumes the builder and produces a [`ServiceToken`].
	pub fn build(self) -> Result<ServiceToken, ServiceTokenBuilderError> {
		let access_token =
			self.access_token.ok_or(ServiceTokenBuilderError::MissingAccessToken)?;

		if access_token.is_blank() {
			return Err(ServiceTokenBuilderError::MissingAccessToken);
		}

		let expires_in = self.expires_in.ok_or(ServiceTokenBuilderError::MissingExpiry)?;

		if !expires_in.is_positive() {
			return Err(ServiceTokenBuilderError::NonPositiveExpiry);
		}

		let issued_at = self.issued_at.unwrap_or_else(OffsetDateTime::now_utc);
		let expires_at =
			issued_at.checked_add(expires_in).ok_or(ServiceTokenBuilderError::ExpiryOutOfRange)?;

		Ok(ServiceToken {
			access_token,
			token_type: self.token_type.unwrap_or_else(|| "bearer".into()),
			scope: self.scope,
			expires_in,
			issued_at,
			expires_at,
		})
	}
}
