//! Broker configuration: endpoints, service credentials, and refresh/retry policy.
//!
//! [`BrokerConfig`] is the validated form consumed by the token manager and relay. It is
//! assembled either through [`BrokerConfig::builder`] or from layered
//! [`BrokerSettings`] (defaults, TOML file, environment). At runtime the
//! [`ConfigResolver`] hands out snapshots and accepts wholesale replacement of credentials
//! or endpoints until the first token fetch seals it.

pub mod resolver;
pub mod retry;
pub mod settings;

pub use resolver::*;
pub use retry::*;
pub use settings::*;

// std
use std::time::Duration as StdDuration;
// self
use crate::{_prelude::*, auth::ServiceCredentials, error::ConfigError};

/// Token endpoint path appended to the identity provider base URL by default.
pub const DEFAULT_TOKEN_PATH: &str = "oauth/token";
/// Team-resolution path appended to the backend base URL by default.
pub const DEFAULT_TEAM_PATH: &str = "team";
/// Default fraction of a token's lifetime after which it is refreshed.
pub const DEFAULT_REFRESH_MULTIPLIER: f64 = 0.9;
/// Upper bound on the delay before a scheduled refresh, whatever lifetime the token reports.
pub const MAX_REFRESH_DELAY: StdDuration = StdDuration::from_secs(30 * 24 * 60 * 60);

/// Errors raised while validating configuration values.
#[derive(Clone, Debug, PartialEq, ThisError)]
pub enum ConfigValidationError {
	/// A required endpoint was not configured.
	#[error("Missing {0} endpoint.")]
	MissingEndpoint(&'static str),
	/// Service credentials were not configured.
	#[error("Missing service credentials.")]
	MissingCredentials,
	/// A credential field is blank.
	#[error("Service credential field `{0}` is blank.")]
	BlankCredential(&'static str),
	/// Endpoints must use HTTPS unless they point at a loopback host or insecure endpoints are
	/// explicitly allowed.
	#[error("The {endpoint} endpoint must use HTTPS: {url}.")]
	InsecureEndpoint {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Endpoint URL that failed validation.
		url: String,
	},
	/// Base URLs must be hierarchical (`http`/`https`).
	#[error("The {endpoint} endpoint cannot be used as a base URL: {url}.")]
	NotABase {
		/// Which endpoint failed validation.
		endpoint: &'static str,
		/// Endpoint URL that failed validation.
		url: String,
	},
	/// The refresh multiplier must lie strictly between 0 and 1.
	#[error("The refresh multiplier must lie strictly between 0 and 1, got {0}.")]
	RefreshMultiplierOutOfRange(f64),
	/// Retry policy values are inconsistent.
	#[error("The {policy} retry policy is invalid: {reason}.")]
	InvalidRetryPolicy {
		/// Which policy failed validation.
		policy: &'static str,
		/// Why validation failed.
		reason: &'static str,
	},
	/// Durations must be non-zero.
	#[error("The {0} duration must be non-zero.")]
	ZeroDuration(&'static str),
}

/// Policy for re-resolving a connection that already has a cached team identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamReusePolicy {
	/// Reuse the cached identity when the same client token is presented again.
	#[default]
	ReuseSameToken,
	/// Always ask the backend, replacing the cached identity on success.
	Revalidate,
}

/// Identity-provider and backend locations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
	/// Identity provider base URL.
	pub identity_provider: Url,
	/// Backend service base URL.
	pub backend: Url,
	/// Path of the token endpoint, relative to the identity provider.
	pub token_path: String,
	/// Path of the team-resolution endpoint, relative to the backend.
	pub team_path: String,
}
impl Endpoints {
	/// Creates endpoints with the default paths.
	pub fn new(identity_provider: Url, backend: Url) -> Self {
		Self {
			identity_provider,
			backend,
			token_path: DEFAULT_TOKEN_PATH.into(),
			team_path: DEFAULT_TEAM_PATH.into(),
		}
	}

	/// Absolute URL of the client-credentials token endpoint.
	pub fn token_url(&self) -> Result<Url, ConfigError> {
		join_endpoint("token", &self.identity_provider, &self.token_path)
	}

	/// Absolute URL of the team-resolution endpoint.
	pub fn team_url(&self) -> Result<Url, ConfigError> {
		join_endpoint("team", &self.backend, &self.team_path)
	}

	fn validate(&self, allow_insecure: bool) -> Result<(), ConfigValidationError> {
		validate_endpoint("identity provider", &self.identity_provider, allow_insecure)?;
		validate_endpoint("backend", &self.backend, allow_insecure)
	}
}

/// Validated broker configuration.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
	/// Upstream locations.
	pub endpoints: Endpoints,
	/// Service credentials for the client-credentials grant.
	pub credentials: ServiceCredentials,
	/// Fraction of a token's lifetime after which it is refreshed, in `(0, 1)`.
	pub refresh_multiplier: f64,
	/// Backoff policy inside one refresh cycle (and the bootstrap acquisition).
	pub refresh_retry: RetryPolicy,
	/// Delay before the next refresh cycle after a cycle failed.
	pub failure_cooldown: StdDuration,
	/// Backoff policy for team resolution.
	pub resolve_retry: RetryPolicy,
	/// Per-request timeout applied by the built-in transport.
	pub request_timeout: StdDuration,
	/// Re-resolution policy for connections with a cached team.
	pub team_reuse: TeamReusePolicy,
	/// Accept plain-HTTP endpoints on non-loopback hosts.
	pub allow_insecure_endpoints: bool,
}
impl BrokerConfig {
	/// Returns a builder seeded with defaults.
	pub fn builder() -> BrokerConfigBuilder {
		BrokerConfigBuilder::default()
	}

	/// Delay between receiving a token with lifetime `expires_in` and refreshing it, capped at
	/// [`MAX_REFRESH_DELAY`].
	pub fn refresh_delay(&self, expires_in: Duration) -> StdDuration {
		let secs = (expires_in.as_seconds_f64().max(0.) * self.refresh_multiplier)
			.min(MAX_REFRESH_DELAY.as_secs_f64());

		StdDuration::from_secs_f64(secs)
	}

	/// Checks every invariant; builders and settings call this before handing out a config.
	pub fn validate(&self) -> Result<(), ConfigValidationError> {
		self.endpoints.validate(self.allow_insecure_endpoints)?;

		if let Some(field) = self.credentials.blank_field() {
			return Err(ConfigValidationError::BlankCredential(field));
		}
		if !(self.refresh_multiplier > 0. && self.refresh_multiplier < 1.) {
			return Err(ConfigValidationError::RefreshMultiplierOutOfRange(
				self.refresh_multiplier,
			));
		}

		self.refresh_retry.validate("refresh")?;
		self.resolve_retry.validate("resolve")?;

		if self.failure_cooldown.is_zero() {
			return Err(ConfigValidationError::ZeroDuration("failure cooldown"));
		}
		if self.request_timeout.is_zero() {
			return Err(ConfigValidationError::ZeroDuration("request timeout"));
		}

		Ok(())
	}
}

/// Builder for [`BrokerConfig`].
#[derive(Clone, Debug)]
pub struct BrokerConfigBuilder {
	identity_provider: Option<Url>,
	backend: Option<Url>,
	token_path: String,
	team_path: String,
	credentials: Option<ServiceCredentials>,
	refresh_multiplier: f64,
	refresh_retry: RetryPolicy,
	failure_cooldown: StdDuration,
	resolve_retry: RetryPolicy,
	request_timeout: StdDuration,
	team_reuse: TeamReusePolicy,
	allow_insecure_endpoints: bool,
}
impl Default for BrokerConfigBuilder {
	fn default() -> Self {
		Self {
			identity_provider: None,
			backend: None,
			token_path: DEFAULT_TOKEN_PATH.into(),
			team_path: DEFAULT_TEAM_PATH.into(),
			credentials: None,
			refresh_multiplier: DEFAULT_REFRESH_MULTIPLIER,
			refresh_retry: RetryPolicy::default(),
			failure_cooldown: StdDuration::from_secs(30),
			resolve_retry: RetryPolicy { max_attempts: 3, ..RetryPolicy::default() },
			request_timeout: StdDuration::from_secs(10),
			team_reuse: TeamReusePolicy::default(),
			allow_insecure_endpoints: false,
		}
	}
}
impl BrokerConfigBuilder {
	/// Sets the identity provider base URL.
	pub fn identity_provider(mut self, url: Url) -> Self {
		self.identity_provider = Some(url);

		self
	}

	/// Sets the backend base URL.
	pub fn backend(mut self, url: Url) -> Self {
		self.backend = Some(url);

		self
	}

	/// Overrides the token endpoint path.
	pub fn token_path(mut self, path: impl Into<String>) -> Self {
		self.token_path = path.into();

		self
	}

	/// Overrides the team-resolution endpoint path.
	pub fn team_path(mut self, path: impl Into<String>) -> Self {
		self.team_path = path.into();

		self
	}

	/// Sets the service credentials.
	pub fn credentials(mut self, credentials: ServiceCredentials) -> Self {
		self.credentials = Some(credentials);

		self
	}

	/// Overrides the refresh multiplier (defaults to 0.9).
	pub fn refresh_multiplier(mut self, multiplier: f64) -> Self {
		self.refresh_multiplier = multiplier;

		self
	}

	/// Overrides the refresh retry policy.
	pub fn refresh_retry(mut self, policy: RetryPolicy) -> Self {
		self.refresh_retry = policy;

		self
	}

	/// Overrides the cooldown after a failed refresh cycle (defaults to 30 seconds).
	pub fn failure_cooldown(mut self, cooldown: StdDuration) -> Self {
		self.failure_cooldown = cooldown;

		self
	}

	/// Overrides the team-resolution retry policy.
	pub fn resolve_retry(mut self, policy: RetryPolicy) -> Self {
		self.resolve_retry = policy;

		self
	}

	/// Overrides the request timeout (defaults to 10 seconds).
	pub fn request_timeout(mut self, timeout: StdDuration) -> Self {
		self.request_timeout = timeout;

		self
	}

	/// Overrides the team reuse policy.
	pub fn team_reuse(mut self, policy: TeamReusePolicy) -> Self {
		self.team_reuse = policy;

		self
	}

	/// Accepts plain-HTTP endpoints on non-loopback hosts.
	pub fn allow_insecure_endpoints(mut self, allow: bool) -> Self {
		self.allow_insecure_endpoints = allow;

		self
	}

	/// Consumes the builder and validates the resulting configuration.
	pub fn build(self) -> Result<BrokerConfig, ConfigValidationError> {
		let identity_provider = self
			.identity_provider
			.ok_or(ConfigValidationError::MissingEndpoint("identity provider"))?;
		let backend = self.backend.ok_or(ConfigValidationError::MissingEndpoint("backend"))?;
		let credentials = self.credentials.ok_or(ConfigValidationError::MissingCredentials)?;
		let config = BrokerConfig {
			endpoints: Endpoints {
				identity_provider,
				backend,
				token_path: self.token_path,
				team_path: self.team_path,
			},
			credentials,
			refresh_multiplier: self.refresh_multiplier,
			refresh_retry: self.refresh_retry,
			failure_cooldown: self.failure_cooldown,
			resolve_retry: self.resolve_retry,
			request_timeout: self.request_timeout,
			team_reuse: self.team_reuse,
			allow_insecure_endpoints: self.allow_insecure_endpoints,
		};

		config.validate()?;

		Ok(config)
	}
}

fn validate_endpoint(
	name: &'static str,
	url: &Url,
	allow_insecure: bool,
) -> Result<(), ConfigValidationError> {
	if url.cannot_be_a_base() {
		return Err(ConfigValidationError::NotABase { endpoint: name, url: url.to_string() });
	}

	match url.scheme() {
		"https" => Ok(()),
		"http" if allow_insecure || is_loopback(url) => Ok(()),
		_ => Err(ConfigValidationError::InsecureEndpoint { endpoint: name, url: url.to_string() }),
	}
}

fn is_loopback(url: &Url) -> bool {
	match url.host() {
		Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
		Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
		Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
		None => false,
	}
}

/// Appends `path` to `base`, treating `base` as a directory even without a trailing slash.
fn join_endpoint(name: &'static str, base: &Url, path: &str) -> Result<Url, ConfigError> {
	let mut base = base.clone();

	if !base.path().ends_with('/') {
		let directory = format!("{}/", base.path());

		base.set_path(&directory);
	}

	base.join(path.trim_start_matches('/'))
		.map_err(|source| ConfigError::InvalidEndpoint { endpoint: name, source })
}
