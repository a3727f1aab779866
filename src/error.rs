//! Broker-level error types shared by the token manager, relay, and transport layers.

// self
use crate::{_prelude::*, oauth::Authority};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical broker error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Temporary upstream failure; retry with backoff.
	#[error(transparent)]
	Transient(#[from] TransientError),
	/// Transport failure (DNS, TCP, TLS, timeouts).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Upstream response violated the expected schema.
	#[error(transparent)]
	Malformed(#[from] MalformedResponse),

	/// The identity provider or backend rejected the service's own credentials.
	#[error("The {authority} rejected the service credentials: {reason}.")]
	Unauthorized {
		/// Authority that issued the rejection.
		authority: Authority,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Provider- or broker-supplied reason string.
		reason: String,
	},
	/// The backend rejected the player's token.
	#[error("The client token was rejected: {reason}.")]
	ClientTokenRejected {
		/// HTTP status code; `None` when the broker rejected the token locally.
		status: Option<u16>,
		/// Backend- or broker-supplied reason string.
		reason: String,
	},
	/// No service token has been acquired yet.
	#[error("No service token has been acquired yet.")]
	NotYetAcquired,
	/// No unexpired service token is available for a backend call.
	#[error("No valid service token is available.")]
	ServiceTokenUnavailable {
		/// Expiry of the held token, or `None` when none was ever acquired.
		expired_at: Option<OffsetDateTime>,
	},
	/// The broker is shutting down; the operation was abandoned.
	#[error("The broker is shutting down.")]
	Cancelled,
}
impl Error {
	/// Classifies the error into the broker's failure taxonomy.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Config(_) => ErrorKind::Configuration,
			Self::Transient(_) | Self::Transport(_) => ErrorKind::TransportFailure,
			Self::Malformed(_) => ErrorKind::MalformedResponse,
			Self::Unauthorized { .. } => ErrorKind::AuthorityRejected,
			Self::ClientTokenRejected { .. } => ErrorKind::ClientRejected,
			Self::NotYetAcquired | Self::ServiceTokenUnavailable { .. } =>
				ErrorKind::ServiceTokenUnavailable,
			Self::Cancelled => ErrorKind::Cancelled,
		}
	}

	/// Returns `true` when retrying the same request may succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(self.kind(), ErrorKind::TransportFailure | ErrorKind::MalformedResponse)
	}

	/// Upstream `Retry-After` hint, when one was supplied.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Transient(TransientError::Upstream { retry_after, .. }) => *retry_after,
			_ => None,
		}
	}
}

/// Failure classes callers use to pick a reaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Network-level or temporary upstream failure; always retryable.
	TransportFailure,
	/// 4xx on the service's own credentials; operator action required.
	AuthorityRejected,
	/// The player's token is invalid or expired; the player must log in again.
	ClientRejected,
	/// Protocol or schema violation; treated as transient.
	MalformedResponse,
	/// No usable service token exists.
	ServiceTokenUnavailable,
	/// Invalid local configuration.
	Configuration,
	/// Abandoned during shutdown.
	Cancelled,
}

/// Configuration and validation failures raised by the broker.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: BoxError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] oauth2::http::Error),
	/// A request body could not be encoded.
	#[error("Request body could not be encoded.")]
	EncodeRequest(#[from] serde_json::Error),
	/// A configured endpoint is not a valid URL.
	#[error("The {endpoint} endpoint is invalid.")]
	InvalidEndpoint {
		/// Which endpoint failed.
		endpoint: &'static str,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Configuration values failed validation.
	#[error(transparent)]
	Invalid(#[from] crate::config::ConfigValidationError),
	/// Layered settings could not be loaded.
	#[error("Broker settings could not be loaded.")]
	Load {
		/// Underlying figment failure.
		#[source]
		source: Box<figment::Error>,
	},
	/// Credentials or endpoints were changed after the first token fetch.
	#[error("Configuration is sealed after the first token fetch.")]
	Sealed,
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Box::new(src) }
	}
}
impl From<figment::Error> for ConfigError {
	fn from(e: figment::Error) -> Self {
		Self::Load { source: Box::new(e) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Temporary upstream failures (safe to retry).
#[derive(Debug, ThisError)]
pub enum TransientError {
	/// Upstream answered with a retryable status (429, 5xx) or an unclassified failure.
	#[error("The {authority} is temporarily unavailable: {message}.")]
	Upstream {
		/// Authority that failed.
		authority: Authority,
		/// Provider- or broker-supplied message summarizing the failure.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
}

/// Responses that violate the token or team-resolution schema.
#[derive(Debug, ThisError)]
pub enum MalformedResponse {
	/// Token endpoint responded with JSON that could not be parsed.
	#[error("Token endpoint returned malformed JSON.")]
	TokenJson {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// Token endpoint responded with something other than a token payload.
	#[error("Token endpoint returned an unexpected response: {message}.")]
	TokenEndpoint {
		/// Description of the violation.
		message: String,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// Token response omitted `expires_in`.
	#[error("Token endpoint response is missing expires_in.")]
	MissingExpiresIn,
	/// Token response carried an `expires_in` beyond the supported range.
	#[error("The expires_in value exceeds the supported range.")]
	ExpiresInOutOfRange,
	/// Token response carried a zero `expires_in` or an empty access token.
	#[error("Token endpoint returned an unusable token: {0}.")]
	UnusableToken(#[from] crate::auth::ServiceTokenBuilderError),
	/// Team endpoint responded with JSON that could not be parsed.
	#[error("Team endpoint returned malformed JSON.")]
	TeamJson {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status code.
		status: u16,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the {authority}.")]
	Network {
		/// Authority the request was addressed to.
		authority: Authority,
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling an upstream authority.")]
	Io(#[from] std::io::Error),
}
impl TransportError {
	/// Wraps a transport-specific network error for `authority`.
	pub fn network(
		authority: Authority,
		src: impl 'static + Send + Sync + std::error::Error,
	) -> Self {
		Self::Network { authority, source: Box::new(src) }
	}
}
