//! Owned broker instance wiring configuration, token manager, relay, and cache together.
//!
//! A game server creates one [`Broker`] at boot, calls [`Broker::start`] to fetch the first
//! service token and launch background refresh, then routes every connecting client
//! through [`Broker::resolve_team`] and every disconnect through
//! [`Broker::release_connection`]. [`Broker::shutdown`] stops refresh, abandons in-flight
//! requests, and clears the cache.

// self
use crate::{
	_prelude::*,
	auth::{ClientToken, ConnectionId, HostId, ServiceCredentials, ServiceToken, TeamIdentity},
	cache::{TeamCache, TeamEvent},
	config::{BrokerConfig, ConfigResolver},
	http::HttpTransport,
	manager::{RefreshMetrics, RefreshTask, ServiceTokenManager},
	oauth::TransportErrorMapper,
	relay::TeamRelay,
	strategy::{AuthorityStrategy, DefaultAuthorityStrategy},
};
#[cfg(feature = "reqwest")]
use crate::{config::BrokerSettings, http::ReqwestHttpClient, oauth::ReqwestTransportErrorMapper};

#[cfg(feature = "reqwest")]
/// Broker specialized for the crate's default reqwest transport stack.
pub type ReqwestBroker = Broker<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Session credential broker for one game-server process.
pub struct Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	manager: Arc<ServiceTokenManager<C, M>>,
	relay: TeamRelay<C, M>,
	cache: Arc<TeamCache>,
	shutdown: CancellationToken,
	refresh: Mutex<Option<RefreshTask>>,
}
impl<C, M> Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a broker that reuses the caller-provided transport + mapper pair.
	pub fn with_http_client(
		config: BrokerConfig,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		Self::with_strategy(config, http_client, mapper, Arc::new(DefaultAuthorityStrategy))
	}

	/// Creates a broker with a custom rejection classifier.
	pub fn with_strategy(
		config: BrokerConfig,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
		strategy: Arc<dyn AuthorityStrategy>,
	) -> Self {
		let shutdown = CancellationToken::new();
		let manager = Arc::new(ServiceTokenManager::new(
			Arc::new(ConfigResolver::new(config)),
			http_client.into(),
			mapper.into(),
			strategy,
			shutdown.clone(),
		));
		let cache = Arc::new(TeamCache::default());
		let relay = TeamRelay::new(manager.clone(), cache.clone());

		Self { manager, relay, cache, shutdown, refresh: Mutex::new(None) }
	}

	/// Fetches the first service token (with retries) and launches background refresh.
	///
	/// A bootstrap failure is returned and no refresh task is started; calling `start` again
	/// retries. Calling it after a successful start only re-acquires.
	pub async fn start(&self) -> Result<Arc<ServiceToken>> {
		let token = self.manager.bootstrap().await?;
		let mut refresh = self.refresh.lock();

		if refresh.is_none() {
			*refresh = Some(self.manager.spawn_refresh());

			tracing::info!("Session broker started.");
		}

		Ok(token)
	}

	/// Forces a client-credentials exchange and installs the result.
	pub async fn acquire_token(&self) -> Result<Arc<ServiceToken>> {
		self.manager.acquire_token().await
	}

	/// Latest service token, possibly expired; never performs I/O.
	pub fn current_token(&self) -> Result<Arc<ServiceToken>> {
		self.manager.current_token()
	}

	/// Latest service token if it is still valid now.
	pub fn valid_token(&self) -> Result<Arc<ServiceToken>> {
		self.manager.valid_token(OffsetDateTime::now_utc())
	}

	/// Resolves and caches the team identity of a connecting client.
	pub async fn resolve_team(
		&self,
		connection: &ConnectionId,
		client_token: &ClientToken,
		host: &HostId,
	) -> Result<TeamIdentity> {
		self.relay.resolve_team(connection, client_token, host).await
	}

	/// Forgets a disconnected client once any in-flight resolution for it has settled.
	pub async fn release_connection(&self, connection: &ConnectionId) -> Option<TeamIdentity> {
		self.relay.release(connection).await
	}

	/// Cached team identity of `connection`.
	pub fn team(&self, connection: &ConnectionId) -> Option<TeamIdentity> {
		self.cache.get(connection)
	}

	/// Shared team cache.
	pub fn cache(&self) -> &Arc<TeamCache> {
		&self.cache
	}

	/// Subscribes to team cache changes.
	pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TeamEvent> {
		self.cache.subscribe()
	}

	/// Replaces the service credentials; rejected once the first token fetch has begun.
	pub fn reconfigure_credentials(&self, credentials: ServiceCredentials) -> Result<()> {
		Ok(self.manager.config().reconfigure_credentials(credentials)?)
	}

	/// Replaces the identity provider and backend base URLs; rejected once sealed.
	pub fn reconfigure_endpoints(&self, identity_provider: Url, backend: Url) -> Result<()> {
		Ok(self.manager.config().reconfigure_endpoints(identity_provider, backend)?)
	}

	/// Snapshot of the active configuration.
	pub fn config(&self) -> Arc<BrokerConfig> {
		self.manager.config().snapshot()
	}

	/// Refresh-loop counters.
	pub fn refresh_metrics(&self) -> Arc<RefreshMetrics> {
		self.manager.refresh_metrics()
	}

	/// Service token manager backing this broker.
	pub fn manager(&self) -> &Arc<ServiceTokenManager<C, M>> {
		&self.manager
	}

	/// Whether [`Broker::shutdown`] has been called.
	pub fn is_shut_down(&self) -> bool {
		self.shutdown.is_cancelled()
	}

	/// Stops refresh, abandons in-flight requests, and clears the cache.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();

		let refresh = self.refresh.lock().take();

		if let Some(task) = refresh {
			task.stop().await;
		}

		self.cache.clear();

		tracing::info!("Session broker shut down.");
	}
}
#[cfg(feature = "reqwest")]
impl Broker<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a broker with its own reqwest transport honouring `config.request_timeout`.
	pub fn new(config: BrokerConfig) -> Result<Self> {
		let http_client = ReqwestHttpClient::with_timeout(config.request_timeout)?;

		Ok(Self::with_http_client(config, http_client, ReqwestTransportErrorMapper))
	}

	/// Validates layered settings and creates a reqwest-backed broker from them.
	pub fn from_settings(settings: BrokerSettings) -> Result<Self> {
		Self::new(settings.into_config()?)
	}
}
impl<C, M> Debug for Broker<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Broker")
			.field("manager", &self.manager)
			.field("cached_teams", &self.cache.len())
			.field("refresh_running", &self.refresh.lock().is_some())
			.field("shut_down", &self.is_shut_down())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::time::Duration as StdDuration;
	// self
	use super::*;
	use crate::{_preludet::*, error::ConfigError};

	type TestBroker = Broker<ScriptedTransport, ScriptedErrorMapper>;

	fn broker(transport: &ScriptedTransport) -> TestBroker {
		Broker::with_http_client(config(), transport.clone(), ScriptedErrorMapper)
	}

	#[tokio::test(start_paused = true)]
	async fn start_bootstraps_and_schedules_refresh() {
		let transport = ScriptedTransport::default();

		transport
			.push(TOKEN_PATH, Reply::token("svc-1", 1000))
			.push(TOKEN_PATH, Reply::token("svc-2", 1000));

		let broker = broker(&transport);
		let token = broker.start().await.expect("Start should succeed.");

		assert_eq!(token.access_token.expose(), "svc-1");

		tokio::time::sleep(StdDuration::from_secs(901)).await;

		assert_eq!(
			broker.current_token().expect("Token should be current.").access_token.expose(),
			"svc-2"
		);

		broker.shutdown().await;
	}

	#[tokio::test]
	async fn reconfiguration_is_sealed_after_first_fetch() {
		let transport = ScriptedTransport::default();

		transport.push(TOKEN_PATH, Reply::token("svc-1", 1000));

		let broker = broker(&transport);

		broker
			.reconfigure_credentials(ServiceCredentials::new("rotated", "rotated-secret", "game"))
			.expect("Reconfiguration before start should apply.");
		broker.start().await.expect("Start should succeed.");

		let form = transport.recorded(TOKEN_PATH)[0].form();

		assert_eq!(form.get("client_id").map(String::as_str), Some("rotated"));
		assert!(matches!(
			broker.reconfigure_credentials(credentials()),
			Err(Error::Config(ConfigError::Sealed))
		));

		broker.shutdown().await;
	}

	#[tokio::test]
	async fn shutdown_clears_cache_and_refuses_new_work() {
		let transport = ScriptedTransport::default();

		transport
			.push(TOKEN_PATH, Reply::token("svc-1", 1000))
			.push(TEAM_PATH, Reply::team("blue-7"));

		let broker = broker(&transport);
		let conn = connection("conn-1");

		broker.start().await.expect("Start should succeed.");
		broker
			.resolve_team(&conn, &ClientToken::new("player-token"), &host())
			.await
			.expect("Resolution should succeed.");

		assert_eq!(broker.team(&conn).map(|team| team.to_string()).as_deref(), Some("blue-7"));

		broker.shutdown().await;

		assert!(broker.is_shut_down());
		assert!(broker.cache().is_empty());
		assert!(matches!(
			broker.resolve_team(&conn, &ClientToken::new("player-token"), &host()).await,
			Err(Error::Cancelled)
		));
		assert!(matches!(broker.acquire_token().await, Err(Error::Cancelled)));
		assert_eq!(transport.calls(TEAM_PATH), 1);
	}

	#[tokio::test]
	async fn failed_start_is_reported_and_can_be_retried() {
		let transport = ScriptedTransport::default();

		transport
			.push(TOKEN_PATH, Reply::json(401, r#"{"error":"invalid_client"}"#))
			.push(TOKEN_PATH, Reply::token("svc-1", 1000));

		let broker = broker(&transport);
		let err = broker.start().await.expect_err("Rejected credentials should fail start.");

		assert!(matches!(err, Error::Unauthorized { status: Some(401), .. }));
		assert!(format!("{broker:?}").contains("refresh_running: false"));
		assert!(broker.start().await.is_ok());
		assert!(format!("{broker:?}").contains("refresh_running: true"));

		broker.shutdown().await;
	}
}
