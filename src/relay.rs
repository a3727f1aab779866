//! Client token → team identity exchange against the backend.
//!
//! [`TeamRelay::resolve_team`] posts the player's token together with this server's
//! hostname, authenticated with the current service token, and stores the returned
//! [`TeamIdentity`] in the [`TeamCache`]. Resolutions for one connection are serialized;
//! different connections proceed concurrently. Failures never touch the cache.

// crates.io
use oauth2::{
	AsyncHttpClient,
	http::{
		Method, Request,
		header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
	},
};
// self
use crate::{
	_prelude::*,
	auth::{ClientToken, ConnectionId, HostId, ServiceToken, TeamIdentity},
	cache::TeamCache,
	config::TeamReusePolicy,
	error::{ConfigError, MalformedResponse},
	http::{HttpTransport, ResponseMetadataSlot},
	manager::ServiceTokenManager,
	oauth::{self, Authority, TransportErrorMapper},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	singleflight::KeyedGuards,
	strategy::ErrorContext,
};

#[derive(Serialize)]
struct TeamRequest<'a> {
	user_token: &'a str,
	server_container_hostname: &'a str,
}

#[derive(Default, Deserialize)]
struct RejectionDocument {
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	error_description: Option<String>,
}

/// Resolves team identities for connected clients.
pub struct TeamRelay<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	manager: Arc<ServiceTokenManager<C, M>>,
	cache: Arc<TeamCache>,
	guards: KeyedGuards<ConnectionId>,
}
impl<C, M> TeamRelay<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a relay that authenticates with `manager`'s token and writes into `cache`.
	pub fn new(manager: Arc<ServiceTokenManager<C, M>>, cache: Arc<TeamCache>) -> Self {
		Self { manager, cache, guards: Default::default() }
	}

	/// Cache this relay writes into.
	pub fn cache(&self) -> &Arc<TeamCache> {
		&self.cache
	}

	/// Exchanges `client_token` for the team identity of `connection`.
	///
	/// # Errors
	///
	/// - [`Error::ServiceTokenUnavailable`] when no unexpired service token exists; no request
	///   is sent.
	/// - [`Error::ClientTokenRejected`] when the client token is already expired (`status` is
	///   `None`, no request is sent) or the backend refused it.
	/// - [`Error::Unauthorized`] when the backend refused the service token.
	/// - Transport, transient, and malformed-response errors once the retry budget is spent.
	/// - [`Error::Cancelled`] when shutdown began before the result could be stored.
	pub async fn resolve_team(
		&self,
		connection: &ConnectionId,
		client_token: &ClientToken,
		host: &HostId,
	) -> Result<TeamIdentity> {
		const KIND: FlowKind = FlowKind::ResolveTeam;

		let span = FlowSpan::new(KIND, "resolve_team");
		let result = span.instrument(self.resolve(connection, client_token, host)).await;

		match &result {
			Ok(_) => obs::record_flow_outcome(KIND, FlowOutcome::Success),
			Err(e) => {
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
				tracing::warn!(connection = %connection, error = %e, "Team resolution failed.");
			},
		}

		result
	}

	/// Waits for any in-flight resolution of `connection`, then drops its cache entry.
	pub async fn release(&self, connection: &ConnectionId) -> Option<TeamIdentity> {
		let _guard = self.guards.lock(connection).await;

		self.cache.remove(connection)
	}

	async fn resolve(
		&self,
		connection: &ConnectionId,
		client_token: &ClientToken,
		host: &HostId,
	) -> Result<TeamIdentity> {
		let shutdown = self.manager.shutdown_token();

		if shutdown.is_cancelled() {
			return Err(Error::Cancelled);
		}

		let now = OffsetDateTime::now_utc();

		if client_token.is_expired_at(now) {
			return Err(Error::ClientTokenRejected {
				status: None,
				reason: "client token has expired".into(),
			});
		}

		self.manager.valid_token(now)?;

		let config = self.manager.config().snapshot();
		let fingerprint = client_token.fingerprint();
		let _guard = tokio::select! {
			biased;
			_ = shutdown.cancelled() => return Err(Error::Cancelled),
			guard = self.guards.lock(connection) => guard,
		};

		if config.team_reuse == TeamReusePolicy::ReuseSameToken {
			let cached = self
				.cache
				.entry(connection)
				.filter(|entry| entry.fingerprint.as_ref() == Some(&fingerprint));

			if let Some(entry) = cached {
				obs::record_flow_outcome(FlowKind::ResolveTeam, FlowOutcome::Reused);

				return Ok(entry.identity);
			}
		}

		let team_url = config.endpoints.team_url()?;
		let body = serde_json::to_vec(&TeamRequest {
			user_token: client_token.access_token.expose(),
			server_container_hostname: host.as_str(),
		})
		.map_err(ConfigError::from)?;
		let policy = config.resolve_retry;
		let mut attempt = 0;
		let identity = loop {
			attempt += 1;

			// Re-snapshot per attempt so a refresh that lands mid-retry is picked up.
			let service_token = self.manager.valid_token(OffsetDateTime::now_utc())?;

			obs::record_flow_outcome(FlowKind::ResolveTeam, FlowOutcome::Attempt);

			let outcome = tokio::select! {
				biased;
				_ = shutdown.cancelled() => return Err(Error::Cancelled),
				outcome = self.exchange(&team_url, &service_token, body.clone()) => outcome,
			};

			match outcome {
				Ok(identity) => break identity,
				Err(e) if e.is_retryable() && policy.allows_retry(attempt) => {
					let delay = policy.backoff(attempt, e.retry_after());

					tracing::debug!(
						connection = %connection,
						attempt,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"Team resolution attempt failed; retrying."
					);

					tokio::select! {
						biased;
						_ = shutdown.cancelled() => return Err(Error::Cancelled),
						_ = tokio::time::sleep(delay) => {},
					}
				},
				Err(e) => return Err(e),
			}
		};

		// A result that lands after shutdown began is never written.
		self.cache.store_unless_cancelled(
			connection.clone(),
			identity.clone(),
			Some(fingerprint),
			shutdown,
		)?;

		tracing::info!(connection = %connection, team = %identity, "Team identity resolved.");

		Ok(identity)
	}

	async fn exchange(
		&self,
		team_url: &Url,
		service_token: &ServiceToken,
		body: Vec<u8>,
	) -> Result<TeamIdentity> {
		let request = Request::builder()
			.method(Method::POST)
			.uri(team_url.as_str())
			.header(AUTHORIZATION, service_token.authorization())
			.header(CONTENT_TYPE, "application/json")
			.header(ACCEPT, "application/json")
			.body(body)
			.map_err(ConfigError::from)?;
		let slot = ResponseMetadataSlot::default();
		let handle = self.manager.http_client().with_metadata(slot.clone());
		let response = handle.call(request).await;
		let meta = slot.take();
		let response = response.map_err(|e| {
			self.manager.transport_mapper().map_transport_error(Authority::Backend, meta.as_ref(), e)
		})?;
		let status = response.status().as_u16();

		if !response.status().is_success() {
			let document =
				serde_json::from_slice::<RejectionDocument>(response.body()).unwrap_or_default();
			let mut ctx = ErrorContext::new(Authority::Backend).with_http_status(status);

			if let Some(error) = &document.error {
				ctx = ctx.with_oauth_error(error.clone());
			} else if !response.body().is_empty() {
				ctx = ctx.with_body_preview(String::from_utf8_lossy(response.body()));
			}
			if let Some(description) = &document.error_description {
				ctx = ctx.with_error_description(description.clone());
			}

			let message = document
				.error_description
				.or(document.error)
				.unwrap_or_else(|| format!("backend answered HTTP {status}"));

			return Err(oauth::classify(self.manager.strategy(), &ctx, message, meta.as_ref()));
		}

		let mut deserializer = serde_json::Deserializer::from_slice(response.body());

		serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| MalformedResponse::TeamJson { source, status }.into())
	}
}
impl<C, M> Debug for TeamRelay<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("TeamRelay").field("cached", &self.cache.len()).finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::time::Duration as StdDuration;
	// self
	use super::*;
	use crate::{
		_preludet::*,
		auth::TeamId,
		cache::TeamEvent,
		config::BrokerConfig,
		error::ErrorKind,
	};

	type TestRelay = TeamRelay<ScriptedTransport, ScriptedErrorMapper>;

	fn blue() -> TeamIdentity {
		TeamIdentity::new(TeamId::new("blue-7").expect("Team fixture should be valid."))
	}

	async fn relay_with(transport: &ScriptedTransport, config: BrokerConfig) -> Arc<TestRelay> {
		transport.push(TOKEN_PATH, Reply::token("svc-1", 1000));

		let manager = manager_with(transport, config);

		manager.acquire_token().await.expect("Service token should be acquired.");

		Arc::new(TeamRelay::new(manager, Arc::new(TeamCache::default())))
	}

	async fn relay(transport: &ScriptedTransport) -> Arc<TestRelay> {
		relay_with(transport, config()).await
	}

	#[tokio::test]
	async fn resolves_and_caches_team_identity() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("blue-7"));

		let relay = relay(&transport).await;
		let identity = relay
			.resolve_team(&connection("conn-1"), &ClientToken::new("player-token"), &host())
			.await
			.expect("Resolution should succeed.");

		assert_eq!(identity, blue());
		assert_eq!(relay.cache().get(&connection("conn-1")), Some(blue()));

		let recorded = transport.recorded(TEAM_PATH);

		assert_eq!(recorded.len(), 1);
		assert_eq!(recorded[0].header("authorization").as_deref(), Some("Bearer svc-1"));
		assert_eq!(
			recorded[0].json(),
			serde_json::json!({
				"user_token": "player-token",
				"server_container_hostname": "game-7f9c",
			})
		);
	}

	#[tokio::test]
	async fn missing_service_token_fails_without_requests() {
		let transport = ScriptedTransport::default();
		let relay = TeamRelay::new(manager(&transport), Arc::new(TeamCache::default()));
		let err = relay
			.resolve_team(&connection("conn-1"), &ClientToken::new("player-token"), &host())
			.await
			.expect_err("Resolution should fail fast.");

		assert!(matches!(err, Error::ServiceTokenUnavailable { expired_at: None }));
		assert_eq!(transport.calls(TEAM_PATH), 0);
		assert!(relay.cache().is_empty());
	}

	#[tokio::test]
	async fn expired_client_token_is_rejected_locally() {
		let transport = ScriptedTransport::default();
		let relay = relay(&transport).await;
		let expired = ClientToken::new("player-token")
			.with_expires_at(OffsetDateTime::now_utc() - Duration::minutes(5));
		let err = relay
			.resolve_team(&connection("conn-1"), &expired, &host())
			.await
			.expect_err("Expired tokens should be rejected.");

		assert!(matches!(err, Error::ClientTokenRejected { status: None, .. }));
		assert_eq!(transport.calls(TEAM_PATH), 0);
	}

	#[tokio::test]
	async fn team_identifiers_with_spaces_are_accepted() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("Blue Team"));

		let relay = relay(&transport).await;
		let identity = relay
			.resolve_team(&connection("conn-1"), &ClientToken::new("player-token"), &host())
			.await
			.expect("Any non-empty team identifier should resolve.");

		assert_eq!(identity.team_id.as_str(), "Blue Team");
		assert_eq!(transport.calls(TEAM_PATH), 1);
	}

	#[tokio::test]
	async fn duplicate_resolutions_share_one_request() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("blue-7").delayed(StdDuration::from_millis(50)));

		let relay = relay(&transport).await;
		let token = ClientToken::new("player-token");
		let conn = connection("conn-1");
		let host = host();
		let (a, b) = tokio::join!(
			relay.resolve_team(&conn, &token, &host),
			relay.resolve_team(&conn, &token, &host),
		);

		assert_eq!(a.expect("First resolution should succeed."), blue());
		assert_eq!(b.expect("Second resolution should succeed."), blue());
		assert_eq!(transport.calls(TEAM_PATH), 1);
		assert_eq!(relay.cache().len(), 1);
	}

	#[tokio::test]
	async fn revalidate_policy_asks_the_backend_every_time() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("blue-7"));

		let config = BrokerConfig::builder()
			.identity_provider(Url::parse(IDP).expect("URL should parse."))
			.backend(Url::parse(BACKEND).expect("URL should parse."))
			.credentials(credentials())
			.team_reuse(TeamReusePolicy::Revalidate)
			.build()
			.expect("Config should build.");
		let relay = relay_with(&transport, config).await;
		let token = ClientToken::new("player-token");
		let first = relay.resolve_team(&connection("conn-1"), &token, &host()).await;
		let second = relay.resolve_team(&connection("conn-1"), &token, &host()).await;

		assert_eq!(first.expect("First resolution should succeed."), blue());
		assert_eq!(second.expect("Second resolution should succeed."), blue());
		assert_eq!(transport.calls(TEAM_PATH), 2);
		assert_eq!(relay.cache().get(&connection("conn-1")), Some(blue()));
	}

	#[tokio::test]
	async fn new_client_token_triggers_re_resolution() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("blue-7")).push(TEAM_PATH, Reply::team("red-2"));

		let relay = relay(&transport).await;
		let conn = connection("conn-1");

		relay
			.resolve_team(&conn, &ClientToken::new("token-a"), &host())
			.await
			.expect("First resolution should succeed.");

		let second = relay
			.resolve_team(&conn, &ClientToken::new("token-b"), &host())
			.await
			.expect("Second resolution should succeed.");

		assert_eq!(second.team_id.as_str(), "red-2");
		assert_eq!(transport.calls(TEAM_PATH), 2);
	}

	#[tokio::test]
	async fn rejections_are_attributed_and_leave_cache_untouched() {
		let transport = ScriptedTransport::default();

		transport
			.push(TEAM_PATH, Reply::json(403, r#"{"error":"invalid_token"}"#))
			.push(TEAM_PATH, Reply::json(401, "unauthorized"));

		let relay = relay(&transport).await;
		let conn = connection("conn-1");

		relay.cache().set(conn.clone(), blue());

		let client = relay
			.resolve_team(&conn, &ClientToken::new("player-token"), &host())
			.await
			.expect_err("Backend should reject the client token.");

		assert!(matches!(client, Error::ClientTokenRejected { status: Some(403), .. }));

		let service = relay
			.resolve_team(&conn, &ClientToken::new("player-token"), &host())
			.await
			.expect_err("Backend should reject the service token.");

		assert_eq!(service.kind(), ErrorKind::AuthorityRejected);
		assert!(matches!(
			service,
			Error::Unauthorized { authority: Authority::Backend, status: Some(401), .. }
		));
		assert_eq!(transport.calls(TEAM_PATH), 2, "Rejections must not be retried.");
		assert_eq!(relay.cache().get(&conn), Some(blue()));
		assert_eq!(relay.cache().entry(&conn).and_then(|entry| entry.fingerprint), None);
	}

	#[tokio::test(start_paused = true)]
	async fn malformed_responses_are_retried() {
		let transport = ScriptedTransport::default();

		transport
			.push(TEAM_PATH, Reply::json(200, r#"{"team":"blue-7"}"#))
			.push(TEAM_PATH, Reply::team("blue-7"));

		let relay = relay(&transport).await;
		let identity = relay
			.resolve_team(&connection("conn-1"), &ClientToken::new("player-token"), &host())
			.await
			.expect("Second attempt should succeed.");

		assert_eq!(identity, blue());
		assert_eq!(transport.calls(TEAM_PATH), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn exhausted_retries_surface_the_last_error() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::Refused);

		let relay = relay(&transport).await;
		let err = relay
			.resolve_team(&connection("conn-1"), &ClientToken::new("player-token"), &host())
			.await
			.expect_err("Unreachable backend should fail.");

		assert_eq!(err.kind(), ErrorKind::TransportFailure);
		assert_eq!(transport.calls(TEAM_PATH), 2);
		assert!(relay.cache().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn distinct_connections_resolve_concurrently() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("blue-7").delayed(StdDuration::from_secs(5)));

		let relay = relay(&transport).await;
		let started = tokio::time::Instant::now();
		let (conn_a, conn_b) = (connection("conn-1"), connection("conn-2"));
		let (token_a, token_b) = (ClientToken::new("token-a"), ClientToken::new("token-b"));
		let host = host();
		let (a, b) = tokio::join!(
			relay.resolve_team(&conn_a, &token_a, &host),
			relay.resolve_team(&conn_b, &token_b, &host),
		);

		assert!(a.is_ok() && b.is_ok());
		assert!(started.elapsed() < StdDuration::from_secs(6), "Connections must not serialize.");
		assert_eq!(relay.cache().len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_discards_in_flight_resolution() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("blue-7").delayed(StdDuration::from_secs(5)));

		let relay = relay(&transport).await;
		let task = {
			let relay = relay.clone();

			tokio::spawn(async move {
				relay
					.resolve_team(&connection("conn-1"), &ClientToken::new("player-token"), &host())
					.await
			})
		};

		tokio::time::sleep(StdDuration::from_secs(1)).await;
		relay.manager.shutdown_token().cancel();

		let result = task.await.expect("Resolution task should not panic.");

		assert!(matches!(result, Err(Error::Cancelled)));
		assert!(relay.cache().is_empty());

		tokio::time::sleep(StdDuration::from_secs(10)).await;

		assert!(relay.cache().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn release_waits_for_in_flight_resolution() {
		let transport = ScriptedTransport::default();

		transport.push(TEAM_PATH, Reply::team("blue-7").delayed(StdDuration::from_secs(5)));

		let relay = relay(&transport).await;
		let mut events = relay.cache().subscribe();
		let task = {
			let relay = relay.clone();

			tokio::spawn(async move {
				relay
					.resolve_team(&connection("conn-1"), &ClientToken::new("player-token"), &host())
					.await
			})
		};

		tokio::time::sleep(StdDuration::from_secs(1)).await;

		let released = relay.release(&connection("conn-1")).await;

		assert_eq!(released, Some(blue()));
		assert_eq!(task.await.expect("Resolution task should not panic.").ok(), Some(blue()));
		assert!(relay.cache().is_empty());
		assert!(matches!(events.try_recv(), Ok(TeamEvent::Resolved { .. })));
		assert!(matches!(events.try_recv(), Ok(TeamEvent::Removed { .. })));
	}
}
