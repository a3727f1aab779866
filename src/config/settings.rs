//! Layered settings: built-in defaults, an optional TOML file, then `SESSION_BROKER_*`
//! environment variables.

// std
use std::{path::Path, time::Duration as StdDuration};
// crates.io
use figment::{
	Figment,
	providers::{Env, Format, Serialized, Toml},
};
// self
use crate::{
	_prelude::*,
	auth::ServiceCredentials,
	config::{BrokerConfig, BrokerConfigBuilder, RetryPolicy, TeamReusePolicy, humane_secs},
	error::ConfigError,
};

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "SESSION_BROKER_";

/// Serializable mirror of [`BrokerConfig`] used for layered loading.
///
/// Every field is optional in the sources; missing values fall back to the builder defaults.
/// Endpoints and credentials have no defaults and must come from a file or the environment.
///
/// ```toml
/// identity_provider = "https://idp.example.com"
/// backend = "https://backend.example.com"
/// refresh_multiplier = 0.8
///
/// [credentials]
/// client_id = "game-server"
/// client_secret = "..."
/// audience = "https://backend.example.com"
///
/// [resolve_retry]
/// max_attempts = 2
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
	/// Identity provider base URL.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub identity_provider: Option<Url>,
	/// Backend base URL.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub backend: Option<Url>,
	/// Token endpoint path relative to the identity provider.
	pub token_path: String,
	/// Team endpoint path relative to the backend.
	pub team_path: String,
	/// Service credentials.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub credentials: Option<ServiceCredentials>,
	/// Fraction of token lifetime after which refresh happens.
	pub refresh_multiplier: f64,
	/// Backoff policy within one refresh cycle.
	pub refresh_retry: RetryPolicy,
	/// Backoff policy for team resolution.
	pub resolve_retry: RetryPolicy,
	/// Seconds to wait after a failed refresh cycle.
	#[serde(with = "humane_secs")]
	pub failure_cooldown: StdDuration,
	/// Per-request timeout in seconds.
	#[serde(with = "humane_secs")]
	pub request_timeout: StdDuration,
	/// Re-resolution policy.
	pub team_reuse: TeamReusePolicy,
	/// Accept plain-HTTP endpoints on non-loopback hosts.
	pub allow_insecure_endpoints: bool,
}
impl BrokerSettings {
	/// Builds the provider stack: defaults, then `path` (when given), then the environment.
	pub fn figment(path: Option<&Path>) -> Figment {
		Self::layered(path, Env::prefixed(ENV_PREFIX))
	}

	/// Loads settings from the standard provider stack.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		Self::from_figment(&Self::figment(path))
	}

	/// Extracts settings from a caller-assembled [`Figment`].
	pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
		Ok(figment.extract()?)
	}

	/// Validates the settings and converts them into a [`BrokerConfig`].
	pub fn into_config(self) -> Result<BrokerConfig, ConfigError> {
		let mut builder = BrokerConfig::builder()
			.token_path(self.token_path)
			.team_path(self.team_path)
			.refresh_multiplier(self.refresh_multiplier)
			.refresh_retry(self.refresh_retry)
			.resolve_retry(self.resolve_retry)
			.failure_cooldown(self.failure_cooldown)
			.request_timeout(self.request_timeout)
			.team_reuse(self.team_reuse)
			.allow_insecure_endpoints(self.allow_insecure_endpoints);

		if let Some(url) = self.identity_provider {
			builder = builder.identity_provider(url);
		}
		if let Some(url) = self.backend {
			builder = builder.backend(url);
		}
		if let Some(credentials) = self.credentials {
			builder = builder.credentials(credentials);
		}

		Ok(builder.build()?)
	}

	fn layered(path: Option<&Path>, env: Env) -> Figment {
		let mut figment = Figment::from(Serialized::defaults(Self::default()));

		if let Some(path) = path {
			figment = figment.merge(Toml::file(path));
		}

		figment.merge(env.split("__"))
	}
}
impl Default for BrokerSettings {
	fn default() -> Self {
		let defaults = BrokerConfigBuilder::default();

		Self {
			identity_provider: None,
			backend: None,
			token_path: defaults.token_path,
			team_path: defaults.team_path,
			credentials: None,
			refresh_multiplier: defaults.refresh_multiplier,
			refresh_retry: defaults.refresh_retry,
			resolve_retry: defaults.resolve_retry,
			failure_cooldown: defaults.failure_cooldown,
			request_timeout: defaults.request_timeout,
			team_reuse: defaults.team_reuse,
			allow_insecure_endpoints: defaults.allow_insecure_endpoints,
		}
	}
}
