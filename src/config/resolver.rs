//! Runtime holder for the active [`BrokerConfig`].

// std
use std::sync::atomic::{AtomicBool, Ordering};
// self
use crate::{
	_prelude::*,
	auth::ServiceCredentials,
	config::{BrokerConfig, ConfigValidationError},
	error::ConfigError,
};

/// Hands out configuration snapshots and applies wholesale replacements.
///
/// Credentials and endpoints may be swapped until the first token fetch calls
/// [`ConfigResolver::seal`]; afterwards every reconfiguration returns [`ConfigError::Sealed`].
#[derive(Debug)]
pub struct ConfigResolver {
	current: RwLock<Arc<BrokerConfig>>,
	sealed: AtomicBool,
}
impl ConfigResolver {
	/// Wraps an already validated configuration.
	pub fn new(config: BrokerConfig) -> Self {
		Self { current: RwLock::new(Arc::new(config)), sealed: AtomicBool::new(false) }
	}

	/// Current configuration snapshot.
	pub fn snapshot(&self) -> Arc<BrokerConfig> {
		self.current.read().clone()
	}

	/// Freezes the configuration and returns the final snapshot.
	pub fn seal(&self) -> Arc<BrokerConfig> {
		// Holding the read guard excludes any writer that has not yet checked the flag.
		let guard = self.current.read();

		self.sealed.store(true, Ordering::Release);

		guard.clone()
	}

	/// Whether the configuration has been frozen by a token fetch.
	pub fn is_sealed(&self) -> bool {
		self.sealed.load(Ordering::Acquire)
	}

	/// Replaces the service credentials.
	pub fn reconfigure_credentials(&self, credentials: ServiceCredentials) -> Result<(), ConfigError> {
		if let Some(field) = credentials.blank_field() {
			return Err(ConfigValidationError::BlankCredential(field).into());
		}

		self.replace(|config| config.credentials = credentials)
	}

	/// Replaces the identity provider and backend base URLs, keeping their paths.
	pub fn reconfigure_endpoints(&self, identity_provider: Url, backend: Url) -> Result<(), ConfigError> {
		self.replace(|config| {
			config.endpoints.identity_provider = identity_provider;
			config.endpoints.backend = backend;
		})
	}

	fn replace(&self, apply: impl FnOnce(&mut BrokerConfig)) -> Result<(), ConfigError> {
		let mut guard = self.current.write();

		if self.is_sealed() {
			return Err(ConfigError::Sealed);
		}

		let mut next = BrokerConfig::clone(&guard);

		apply(&mut next);
		next.validate()?;

		*guard = Arc::new(next);

		Ok(())
	}
}
