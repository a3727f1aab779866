//! Service-token broker for game servers. It keeps a client-credentials token fresh in the
//! background and exchanges each player's token for the team identity that scopes their
//! session.
//!
//! The crate is organised leaf-first:
//!
//! - [`config`] resolves endpoints, service credentials, and retry/refresh policy.
//! - [`manager`] owns the service token and its background refresh task.
//! - [`relay`] exchanges client tokens for [`auth::TeamIdentity`] values.
//! - [`cache`] keeps the connection → team mapping for the lifetime of each connection.
//! - [`broker`] wires everything into one explicitly owned instance.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod manager;
pub mod oauth;
pub mod obs;
pub mod relay;
pub mod strategy;

mod singleflight;

#[cfg(test)]
pub(crate) mod _preludet {
	//! Scripted transport and fixtures shared by the crate's unit tests.

	pub use crate::_prelude::*;

	// std
	use std::{
		collections::{BTreeMap, VecDeque},
		time::Duration as StdDuration,
	};
	// crates.io
	use oauth2::{
		AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse,
		http::{HeaderMap, StatusCode},
	};
	// self
	use crate::{
		auth::{ConnectionId, HostId, ServiceCredentials},
		config::{BrokerConfig, ConfigResolver, RetryPolicy},
		error::TransportError,
		http::{HttpTransport, ResponseMetadata, ResponseMetadataSlot},
		manager::ServiceTokenManager,
		oauth::{Authority, TransportErrorMapper},
		strategy::DefaultAuthorityStrategy,
	};

	pub type TestManager = ServiceTokenManager<ScriptedTransport, ScriptedErrorMapper>;

	pub const IDP: &str = "https://idp.example.com";
	pub const BACKEND: &str = "https://backend.example.com";
	pub const TOKEN_PATH: &str = "/oauth/token";
	pub const TEAM_PATH: &str = "/team";

	/// Network failure raised by [`ScriptedTransport`].
	#[derive(Debug)]
	pub struct ScriptedTransportError;
	impl Display for ScriptedTransportError {
		fn fmt(&self, f: &mut Formatter) -> FmtResult {
			f.write_str("Scripted connection refused.")
		}
	}
	impl StdError for ScriptedTransportError {}

	/// Canned reply served for a request path.
	#[derive(Clone, Debug)]
	pub enum Reply {
		Json { status: u16, body: String, delay: Option<StdDuration>, retry_after: Option<u64> },
		Refused,
	}
	impl Reply {
		pub fn json(status: u16, body: impl Into<String>) -> Self {
			Self::Json { status, body: body.into(), delay: None, retry_after: None }
		}

		pub fn token(access: &str, expires_in: i64) -> Self {
			Self::json(
				200,
				format!(
					"{{\"access_token\":\"{access}\",\"token_type\":\"bearer\",\"expires_in\":{expires_in},\"scope\":\"game.session\"}}"
				),
			)
		}

		pub fn team(team: &str) -> Self {
			Self::json(200, format!("{{\"teamID\":\"{team}\"}}"))
		}

		pub fn delayed(self, by: StdDuration) -> Self {
			match self {
				Self::Json { status, body, retry_after, .. } =>
					Self::Json { status, body, delay: Some(by), retry_after },
				other => other,
			}
		}

		pub fn with_retry_after(self, secs: u64) -> Self {
			match self {
				Self::Json { status, body, delay, .. } =>
					Self::Json { status, body, delay, retry_after: Some(secs) },
				other => other,
			}
		}
	}

	/// Request captured by [`ScriptedTransport`].
	#[derive(Clone, Debug)]
	pub struct Recorded {
		pub path: String,
		pub headers: HeaderMap,
		pub body: Vec<u8>,
		pub at: tokio::time::Instant,
	}
	impl Recorded {
		pub fn form(&self) -> BTreeMap<String, String> {
			url::form_urlencoded::parse(&self.body).into_owned().collect()
		}

		pub fn json(&self) -> serde_json::Value {
			serde_json::from_slice(&self.body).expect("Recorded body should be JSON.")
		}

		pub fn header(&self, name: &str) -> Option<String> {
			self.headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_owned)
		}
	}

	#[derive(Default)]
	struct Script {
		replies: HashMap<String, VecDeque<Reply>>,
		recorded: Vec<Recorded>,
	}

	/// In-memory transport that serves queued replies per path; the last reply repeats.
	#[derive(Clone, Default)]
	pub struct ScriptedTransport(Arc<Mutex<Script>>);
	impl ScriptedTransport {
		pub fn push(&self, path: &str, reply: Reply) -> &Self {
			self.0.lock().replies.entry(path.to_owned()).or_default().push_back(reply);

			self
		}

		pub fn recorded(&self, path: &str) -> Vec<Recorded> {
			self.0.lock().recorded.iter().filter(|r| r.path == path).cloned().collect()
		}

		pub fn calls(&self, path: &str) -> usize {
			self.recorded(path).len()
		}

		fn next(&self, request: &HttpRequest) -> Reply {
			let path = request.uri().path().to_owned();
			let mut script = self.0.lock();

			script.recorded.push(Recorded {
				path: path.clone(),
				headers: request.headers().clone(),
				body: request.body().clone(),
				at: tokio::time::Instant::now(),
			});

			let queue = script.replies.entry(path).or_default();

			if queue.len() > 1 {
				queue.pop_front().unwrap_or(Reply::Refused)
			} else {
				queue.front().cloned().unwrap_or_else(|| Reply::json(404, "{}"))
			}
		}
	}
	impl HttpTransport for ScriptedTransport {
		type Handle = ScriptedHandle;
		type TransportError = ScriptedTransportError;

		fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
			ScriptedHandle { transport: self.clone(), slot }
		}
	}

	pub struct ScriptedHandle {
		transport: ScriptedTransport,
		slot: ResponseMetadataSlot,
	}
	impl<'c> AsyncHttpClient<'c> for ScriptedHandle {
		type Error = HttpClientError<ScriptedTransportError>;
		type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send>>;

		fn call(&'c self, request: HttpRequest) -> Self::Future {
			Box::pin(async move {
				self.slot.take();

				match self.transport.next(&request) {
					Reply::Refused =>
						Err(HttpClientError::Reqwest(Box::new(ScriptedTransportError))),
					Reply::Json { status, body, delay, retry_after } => {
						if let Some(delay) = delay {
							tokio::time::sleep(delay).await;
						}

						self.slot.store(ResponseMetadata {
							status: Some(status),
							retry_after: retry_after.map(|secs| Duration::seconds(secs as i64)),
						});

						let mut response = HttpResponse::new(body.into_bytes());

						*response.status_mut() =
							StatusCode::from_u16(status).expect("Scripted status should be valid.");
						response.headers_mut().insert(
							"content-type",
							"application/json".parse().expect("Header value should parse."),
						);

						Ok(response)
					},
				}
			})
		}
	}

	/// Maps scripted transport failures onto [`TransportError::Network`].
	#[derive(Clone, Debug, Default)]
	pub struct ScriptedErrorMapper;
	impl TransportErrorMapper<ScriptedTransportError> for ScriptedErrorMapper {
		fn map_transport_error(
			&self,
			authority: Authority,
			_metadata: Option<&ResponseMetadata>,
			error: HttpClientError<ScriptedTransportError>,
		) -> Error {
			match error {
				HttpClientError::Reqwest(inner) => TransportError::network(authority, *inner).into(),
				other => TransportError::Io(std::io::Error::other(other.to_string())).into(),
			}
		}
	}

	pub fn credentials() -> ServiceCredentials {
		ServiceCredentials::new("game-server", "server-secret", "https://backend.example.com")
	}

	pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
		RetryPolicy {
			max_attempts,
			initial_backoff: StdDuration::from_secs(1),
			max_backoff: StdDuration::from_secs(8),
			jitter: 0.,
		}
	}

	pub fn config() -> BrokerConfig {
		BrokerConfig::builder()
			.identity_provider(Url::parse(IDP).expect("Identity provider URL should parse."))
			.backend(Url::parse(BACKEND).expect("Backend URL should parse."))
			.credentials(credentials())
			.refresh_retry(fast_retry(3))
			.resolve_retry(fast_retry(2))
			.build()
			.expect("Test configuration should be valid.")
	}

	pub fn manager(transport: &ScriptedTransport) -> Arc<TestManager> {
		manager_with(transport, config())
	}

	pub fn manager_with(transport: &ScriptedTransport, config: BrokerConfig) -> Arc<TestManager> {
		Arc::new(ServiceTokenManager::new(
			Arc::new(ConfigResolver::new(config)),
			Arc::new(transport.clone()),
			Arc::new(ScriptedErrorMapper),
			Arc::new(DefaultAuthorityStrategy),
			CancellationToken::new(),
		))
	}

	pub fn connection(value: &str) -> ConnectionId {
		ConnectionId::new(value).expect("Connection fixture should be valid.")
	}

	pub fn host() -> HostId {
		HostId::new("game-7f9c").expect("Host fixture should be valid.")
	}
}

mod _prelude {
	pub use std::{
		collections::HashMap,
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		hash::Hash,
		pin::Pin,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use tokio_util::sync::CancellationToken;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

#[cfg(feature = "reqwest")] pub use reqwest;
pub use tokio_util::sync::CancellationToken;
pub use url;
#[cfg(test)] use {color_eyre as _, httpmock as _, tracing_subscriber as _};
