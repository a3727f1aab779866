//! Service token ownership: acquisition, snapshots, and the background refresh schedule.
//!
//! [`ServiceTokenManager`] keeps at most one current [`ServiceToken`] and swaps it
//! atomically, so readers always observe either the previous token or the new one in full.
//! Concurrent acquisitions are singleflighted: a caller that queued behind a successful
//! exchange receives that token instead of issuing a second request. Every success arms
//! the refresh deadline at `now + expires_in * refresh_multiplier`, which the task returned
//! by [`ServiceTokenManager::spawn_refresh`] sleeps towards.

mod metrics;
mod refresh;

pub use metrics::*;
pub use refresh::*;

// std
use std::sync::atomic::{AtomicU64, Ordering};
// crates.io
use tokio::{sync::watch, time::Instant};
// self
use crate::{
	_prelude::*,
	auth::ServiceToken,
	config::{ConfigResolver, RetryPolicy},
	http::HttpTransport,
	oauth::{ClientCredentialsFacade, TransportErrorMapper},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	strategy::AuthorityStrategy,
};

/// Owns the service token and keeps it fresh.
pub struct ServiceTokenManager<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	config: Arc<ConfigResolver>,
	http_client: Arc<C>,
	transport_mapper: Arc<M>,
	strategy: Arc<dyn AuthorityStrategy>,
	current: RwLock<Option<Arc<ServiceToken>>>,
	generation: AtomicU64,
	acquire_guard: AsyncMutex<()>,
	schedule: watch::Sender<Option<Instant>>,
	metrics: Arc<RefreshMetrics>,
	shutdown: CancellationToken,
}
impl<C, M> ServiceTokenManager<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	/// Creates a manager with no token; call [`Self::bootstrap`] or [`Self::acquire_token`]
	/// to fetch the first one.
	pub fn new(
		config: Arc<ConfigResolver>,
		http_client: Arc<C>,
		transport_mapper: Arc<M>,
		strategy: Arc<dyn AuthorityStrategy>,
		shutdown: CancellationToken,
	) -> Self {
		Self {
			config,
			http_client,
			transport_mapper,
			strategy,
			current: RwLock::new(None),
			generation: AtomicU64::new(0),
			acquire_guard: AsyncMutex::new(()),
			schedule: watch::Sender::new(None),
			metrics: Default::default(),
			shutdown,
		}
	}

	/// Performs the client-credentials grant and installs the result as the current token.
	///
	/// On failure the previous token, if any, stays current.
	pub async fn acquire_token(&self) -> Result<Arc<ServiceToken>> {
		self.fetch(FlowKind::Acquire, "acquire_token").await
	}

	/// First acquisition, retried per the refresh policy; the final error is returned.
	pub async fn bootstrap(&self) -> Result<Arc<ServiceToken>> {
		let policy = self.config.snapshot().refresh_retry;

		self.fetch_with_retries(FlowKind::Acquire, &policy).await
	}

	/// Latest token without any I/O; it may already be expired.
	pub fn current_token(&self) -> Result<Arc<ServiceToken>> {
		self.current.read().clone().ok_or(Error::NotYetAcquired)
	}

	/// Latest token when it is still valid at `now`.
	pub fn valid_token(&self, now: OffsetDateTime) -> Result<Arc<ServiceToken>> {
		let current = self.current.read().clone();

		match current {
			Some(token) if !token.is_expired_at(now) => Ok(token),
			Some(token) => Err(Error::ServiceTokenUnavailable { expired_at: Some(token.expires_at) }),
			None => Err(Error::ServiceTokenUnavailable { expired_at: None }),
		}
	}

	/// Deadline of the next scheduled refresh, if a token has been installed.
	pub fn next_refresh(&self) -> Option<Instant> {
		*self.schedule.borrow()
	}

	/// Counters for refresh-loop requests.
	pub fn refresh_metrics(&self) -> Arc<RefreshMetrics> {
		self.metrics.clone()
	}

	pub(crate) fn config(&self) -> &ConfigResolver {
		&self.config
	}

	pub(crate) fn http_client(&self) -> &Arc<C> {
		&self.http_client
	}

	pub(crate) fn transport_mapper(&self) -> &Arc<M> {
		&self.transport_mapper
	}

	pub(crate) fn strategy(&self) -> &dyn AuthorityStrategy {
		self.strategy.as_ref()
	}

	pub(crate) fn shutdown_token(&self) -> &CancellationToken {
		&self.shutdown
	}

	async fn fetch_with_retries(
		&self,
		kind: FlowKind,
		policy: &RetryPolicy,
	) -> Result<Arc<ServiceToken>> {
		let mut attempt = 0;

		loop {
			attempt += 1;

			match self.fetch(kind, "fetch_with_retries").await {
				Ok(token) => return Ok(token),
				Err(e) if e.is_retryable() && policy.allows_retry(attempt) => {
					let delay = policy.backoff(attempt, e.retry_after());

					tracing::warn!(
						flow = kind.as_str(),
						attempt,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"Service token request failed; retrying."
					);

					tokio::select! {
						biased;
						_ = self.shutdown.cancelled() => return Err(Error::Cancelled),
						_ = tokio::time::sleep(delay) => {},
					}
				},
				Err(e) => return Err(e),
			}
		}
	}

	async fn fetch(&self, kind: FlowKind, stage: &'static str) -> Result<Arc<ServiceToken>> {
		let span = FlowSpan::new(kind, stage);
		let observed = self.generation.load(Ordering::Acquire);
		let result = span
			.instrument(async {
				if self.shutdown.is_cancelled() {
					return Err(Error::Cancelled);
				}

				let _singleflight = self.acquire_guard.lock().await;

				if self.generation.load(Ordering::Acquire) != observed {
					let current = self.current.read().clone();

					if let Some(token) = current {
						obs::record_flow_outcome(kind, FlowOutcome::Reused);

						return Ok(token);
					}
				}

				let config = self.config.seal();
				let token_url = config.endpoints.token_url()?;
				let facade = ClientCredentialsFacade::new(
					&token_url,
					&config.credentials,
					self.http_client.clone(),
					self.transport_mapper.clone(),
				)?;

				obs::record_flow_outcome(kind, FlowOutcome::Attempt);

				if kind == FlowKind::Refresh {
					self.metrics.record_attempt();
				}

				let token = tokio::select! {
					biased;
					_ = self.shutdown.cancelled() => return Err(Error::Cancelled),
					result = facade.exchange(self.strategy.as_ref()) => result?,
				};
				let token = Arc::new(token);
				let delay = config.refresh_delay(token.expires_in);

				*self.current.write() = Some(token.clone());
				self.generation.fetch_add(1, Ordering::AcqRel);
				self.schedule.send_replace(Instant::now().checked_add(delay));

				tracing::info!(
					expires_in = token.expires_in.whole_seconds(),
					refresh_in_secs = delay.as_secs(),
					"Service token installed."
				);

				Ok(token)
			})
			.await;

		match &result {
			Ok(_) => {
				obs::record_flow_outcome(kind, FlowOutcome::Success);

				if kind == FlowKind::Refresh {
					self.metrics.record_success();
				}
			},
			Err(_) => {
				obs::record_flow_outcome(kind, FlowOutcome::Failure);

				if kind == FlowKind::Refresh {
					self.metrics.record_failure();
				}
			},
		}

		result
	}
}
impl<C, M> Debug for ServiceTokenManager<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ServiceTokenManager")
			.field("current", &self.current.read())
			.field("next_refresh", &self.next_refresh())
			.field("metrics", &self.metrics)
			.finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		_preludet::*,
		config::MAX_REFRESH_DELAY,
		error::{ErrorKind, MalformedResponse},
	};

	#[tokio::test]
	async fn acquire_installs_token_and_arms_refresh() {
		let transport = ScriptedTransport::default();

		transport.push(TOKEN_PATH, Reply::token("svc-1", 1000));

		let manager = manager(&transport);

		assert!(matches!(manager.current_token(), Err(Error::NotYetAcquired)));

		let before = Instant::now();
		let token = manager.acquire_token().await.expect("Acquisition should succeed.");

		assert_eq!(token.access_token.expose(), "svc-1");
		assert_eq!(token.scope.as_deref(), Some("game.session"));
		assert_eq!(
			manager.current_token().expect("Token should be current.").access_token.expose(),
			"svc-1"
		);

		let deadline = manager.next_refresh().expect("Refresh should be scheduled.");
		let delay = deadline - before;

		assert!(delay >= std::time::Duration::from_secs(900));
		assert!(delay < std::time::Duration::from_secs(901));
		assert!(manager.config().is_sealed());
	}

	#[tokio::test]
	async fn failed_acquisition_keeps_previous_token() {
		let transport = ScriptedTransport::default();

		transport
			.push(TOKEN_PATH, Reply::token("svc-1", 1000))
			.push(TOKEN_PATH, Reply::json(401, r#"{"error":"invalid_client"}"#));

		let manager = manager(&transport);

		manager.acquire_token().await.expect("First acquisition should succeed.");

		let err = manager.acquire_token().await.expect_err("Second acquisition should fail.");

		assert_eq!(err.kind(), ErrorKind::AuthorityRejected);
		assert_eq!(
			manager.current_token().expect("Token should be kept.").access_token.expose(),
			"svc-1"
		);
	}

	#[tokio::test]
	async fn oversized_lifetimes_are_rejected_or_capped() {
		let transport = ScriptedTransport::default();

		transport
			.push(TOKEN_PATH, Reply::token("svc-1", 1000))
			.push(TOKEN_PATH, Reply::token("svc-huge", 400_000_000_000))
			.push(TOKEN_PATH, Reply::token("svc-long", 200_000_000_000));

		let manager = manager(&transport);

		manager.acquire_token().await.expect("First acquisition should succeed.");

		let err = manager.acquire_token().await.expect_err("Overflowing lifetime must fail.");

		assert!(matches!(err, Error::Malformed(MalformedResponse::ExpiresInOutOfRange)));
		assert_eq!(
			manager.current_token().expect("Token should be kept.").access_token.expose(),
			"svc-1"
		);

		let before = Instant::now();

		manager.acquire_token().await.expect("A far but representable expiry should install.");

		let delay = manager.next_refresh().expect("Refresh should be scheduled.") - before;

		assert!(delay <= MAX_REFRESH_DELAY + std::time::Duration::from_secs(1));
	}

	#[tokio::test]
	async fn concurrent_acquisitions_share_one_request() {
		let transport = ScriptedTransport::default();

		transport.push(
			TOKEN_PATH,
			Reply::token("svc-1", 1000).delayed(std::time::Duration::from_millis(50)),
		);

		let manager = manager(&transport);
		let (a, b, c) =
			tokio::join!(manager.acquire_token(), manager.acquire_token(), manager.acquire_token());

		for token in [a, b, c] {
			assert_eq!(token.expect("Every caller should get a token.").access_token.expose(), "svc-1");
		}

		assert_eq!(transport.calls(TOKEN_PATH), 1);
	}

	#[tokio::test]
	async fn valid_token_rejects_expired_tokens() {
		let transport = ScriptedTransport::default();

		transport.push(TOKEN_PATH, Reply::token("svc-1", 60));

		let manager = manager(&transport);

		assert!(matches!(
			manager.valid_token(OffsetDateTime::now_utc()),
			Err(Error::ServiceTokenUnavailable { expired_at: None })
		));

		let token = manager.acquire_token().await.expect("Acquisition should succeed.");

		assert!(manager.valid_token(OffsetDateTime::now_utc()).is_ok());
		assert!(matches!(
			manager.valid_token(token.expires_at + Duration::seconds(1)),
			Err(Error::ServiceTokenUnavailable { expired_at: Some(at) }) if at == token.expires_at
		));
	}

	#[tokio::test(start_paused = true)]
	async fn bootstrap_retries_transient_failures() {
		let transport = ScriptedTransport::default();

		transport
			.push(TOKEN_PATH, Reply::json(503, r#"{"error":"temporarily_unavailable"}"#))
			.push(TOKEN_PATH, Reply::token("svc-1", 1000));

		let manager = manager(&transport);
		let token = manager.bootstrap().await.expect("Bootstrap should recover.");

		assert_eq!(token.access_token.expose(), "svc-1");
		assert_eq!(transport.calls(TOKEN_PATH), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn bootstrap_surfaces_exhausted_retries() {
		let transport = ScriptedTransport::default();

		transport.push(TOKEN_PATH, Reply::Refused);

		let manager = manager(&transport);
		let err = manager.bootstrap().await.expect_err("Bootstrap should give up.");

		assert_eq!(err.kind(), ErrorKind::TransportFailure);
		assert_eq!(transport.calls(TOKEN_PATH), 3);
		assert!(manager.next_refresh().is_none());
	}

	#[tokio::test]
	async fn cancelled_manager_refuses_to_fetch() {
		let transport = ScriptedTransport::default();

		transport.push(TOKEN_PATH, Reply::token("svc-1", 1000));

		let manager = manager(&transport);

		manager.shutdown_token().cancel();

		assert!(matches!(manager.acquire_token().await, Err(Error::Cancelled)));
		assert_eq!(transport.calls(TOKEN_PATH), 0);
	}
}
