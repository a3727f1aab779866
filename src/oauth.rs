//! Client-credentials facade over the `oauth2` crate plus upstream error mapping.

pub use oauth2;

// crates.io
use oauth2::{
	AuthType, ClientId, ClientSecret, EndpointNotSet, EndpointSet, HttpClientError,
	RequestTokenError, TokenResponse, TokenUrl,
	basic::{BasicClient, BasicErrorResponse, BasicRequestTokenError},
};
// self
use crate::{
	_prelude::*,
	auth::{ServiceCredentials, ServiceToken, ServiceTokenBuilderError},
	error::{ConfigError, MalformedResponse, TransientError, TransportError},
	http::{HttpTransport, ResponseMetadata, ResponseMetadataSlot},
	strategy::{AuthorityStrategy, ErrorContext, RejectionKind},
};

type ConfiguredBasicClient =
	BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;
type FacadeTokenResponse = oauth2::basic::BasicTokenResponse;

/// Upstream authority a request is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
	/// Identity provider issuing service tokens.
	IdentityProvider,
	/// Game backend resolving team identifiers.
	Backend,
}
impl Authority {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			Authority::IdentityProvider => "identity provider",
			Authority::Backend => "backend",
		}
	}
}
impl Display for Authority {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Maps HTTP transport failures into broker [`Error`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport into a broker error.
	fn map_transport_error(
		&self,
		authority: Authority,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> Error;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		authority: Authority,
		meta: Option<&ResponseMetadata>,
		err: HttpClientError<ReqwestError>,
	) -> Error {
		match err {
			HttpClientError::Reqwest(inner) => map_reqwest_error(authority, meta, *inner),
			HttpClientError::Http(inner) => ConfigError::from(inner).into(),
			HttpClientError::Io(inner) => TransportError::Io(inner).into(),
			HttpClientError::Other(message) => TransientError::Upstream {
				authority,
				message: format!("HTTP client error: {message}"),
				status: meta_status(meta),
				retry_after: meta_retry_after(meta),
			}
			.into(),
			_ => TransientError::Upstream {
				authority,
				message: "HTTP client error".into(),
				status: meta_status(meta),
				retry_after: meta_retry_after(meta),
			}
			.into(),
		}
	}
}

/// Executes the client-credentials grant against the identity provider's token endpoint.
pub(crate) struct ClientCredentialsFacade<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	oauth_client: ConfiguredBasicClient,
	audience: String,
	http_client: Arc<C>,
	error_mapper: Arc<M>,
}
impl<C, M> ClientCredentialsFacade<C, M>
where
	C: ?Sized + HttpTransport,
	M: ?Sized + TransportErrorMapper<C::TransportError>,
{
	pub(crate) fn new(
		token_url: &Url,
		credentials: &ServiceCredentials,
		http_client: Arc<C>,
		error_mapper: Arc<M>,
	) -> Result<Self> {
		let token_url = TokenUrl::new(token_url.to_string())
			.map_err(|source| ConfigError::InvalidEndpoint { endpoint: "token", source })?;
		let oauth_client = BasicClient::new(ClientId::new(credentials.client_id.clone()))
			.set_client_secret(ClientSecret::new(credentials.client_secret.expose().to_owned()))
			.set_token_uri(token_url)
			.set_auth_type(AuthType::RequestBody);

		Ok(Self { oauth_client, audience: credentials.audience.clone(), http_client, error_mapper })
	}

	/// Sends `grant_type=client_credentials` with the client id, secret, and audience in the
	/// form body.
	pub(crate) async fn exchange(&self, strategy: &dyn AuthorityStrategy) -> Result<ServiceToken> {
		let meta = ResponseMetadataSlot::default();
		let instrumented = self.http_client.with_metadata(meta.clone());
		let response = self
			.oauth_client
			.exchange_client_credentials()
			.add_extra_param("audience", self.audience.as_str())
			.request_async(&instrumented)
			.await
			.map_err(|err| map_request_error(strategy, meta.take(), err, self.error_mapper.as_ref()))?;

		map_token_response(response)
	}
}

fn map_token_response(response: FacadeTokenResponse) -> Result<ServiceToken> {
	let expires_in = response.expires_in().ok_or(MalformedResponse::MissingExpiresIn)?.as_secs();
	let expires_in = i64::try_from(expires_in).map_err(|_| MalformedResponse::ExpiresInOutOfRange)?;
	let scope = response.scopes().map(|scopes| {
		scopes.iter().map(|scope| scope.as_str()).collect::<Vec<_>>().join(" ")
	});

	ServiceToken::builder(response.access_token().secret().to_owned())
		.token_type(response.token_type().as_ref())
		.scope(scope)
		.expires_in(Duration::seconds(expires_in))
		.build()
		.map_err(|err| match err {
			ServiceTokenBuilderError::ExpiryOutOfRange => MalformedResponse::ExpiresInOutOfRange,
			other => MalformedResponse::UnusableToken(other),
		})
		.map_err(Error::from)
}

fn map_request_error<E, M>(
	strategy: &dyn AuthorityStrategy,
	meta: Option<ResponseMetadata>,
	err: BasicRequestTokenError<HttpClientError<E>>,
	mapper: &M,
) -> Error
where
	E: 'static + Send + Sync + StdError,
	M: ?Sized + TransportErrorMapper<E>,
{
	let meta_ref = meta.as_ref();
	let status = meta_status(meta_ref);
	let rejected = status.filter(|code| !(200..300).contains(code));

	match err {
		RequestTokenError::ServerResponse(response) =>
			map_server_response_error(strategy, response, meta_ref),
		RequestTokenError::Request(error) =>
			mapper.map_transport_error(Authority::IdentityProvider, meta_ref, error),
		// Non-2xx bodies that are not OAuth error documents still get classified by status.
		RequestTokenError::Parse(_, body) if rejected.is_some() => {
			let ctx = ErrorContext::new(Authority::IdentityProvider)
				.with_http_status(rejected.unwrap_or_default())
				.with_body_preview(String::from_utf8_lossy(&body));

			classify(strategy, &ctx, "Token endpoint rejected the request.".into(), meta_ref)
		},
		RequestTokenError::Other(message) if rejected.is_some() => {
			let ctx = ErrorContext::new(Authority::IdentityProvider)
				.with_http_status(rejected.unwrap_or_default());

			classify(strategy, &ctx, message, meta_ref)
		},
		RequestTokenError::Parse(source, _) => MalformedResponse::TokenJson { source, status }.into(),
		RequestTokenError::Other(message) =>
			MalformedResponse::TokenEndpoint { message, status }.into(),
	}
}

fn map_server_response_error(
	strategy: &dyn AuthorityStrategy,
	response: BasicErrorResponse,
	meta: Option<&ResponseMetadata>,
) -> Error {
	let mut ctx = ErrorContext::new(Authority::IdentityProvider)
		.with_oauth_error(response.error().as_ref().to_string());

	if let Some(description) = response.error_description() {
		ctx = ctx.with_error_description(description.clone());
	}
	if let Some(status) = meta_status(meta) {
		ctx = ctx.with_http_status(status);
	}

	let message = match response.error_description() {
		Some(description) => format!("{}: {description}", response.error().as_ref()),
		None => response.error().as_ref().to_string(),
	};

	classify(strategy, &ctx, message, meta)
}

/// Turns a strategy verdict into a broker error.
pub(crate) fn classify(
	strategy: &dyn AuthorityStrategy,
	ctx: &ErrorContext,
	message: String,
	meta: Option<&ResponseMetadata>,
) -> Error {
	match strategy.classify_rejection(ctx) {
		RejectionKind::ServiceRejected =>
			Error::Unauthorized { authority: ctx.authority, status: ctx.http_status, reason: message },
		// The identity provider only ever sees our own credentials.
		RejectionKind::ClientRejected if ctx.authority == Authority::IdentityProvider =>
			Error::Unauthorized { authority: ctx.authority, status: ctx.http_status, reason: message },
		RejectionKind::ClientRejected =>
			Error::ClientTokenRejected { status: ctx.http_status, reason: message },
		RejectionKind::Transient => TransientError::Upstream {
			authority: ctx.authority,
			message,
			status: ctx.http_status,
			retry_after: meta_retry_after(meta),
		}
		.into(),
	}
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(
	authority: Authority,
	meta: Option<&ResponseMetadata>,
	err: ReqwestError,
) -> Error {
	if err.is_builder() {
		return ConfigError::from(err).into();
	}
	if err.is_timeout() {
		return TransientError::Upstream {
			authority,
			message: "request timed out".into(),
			status: meta_status(meta).or_else(|| err.status().map(|code| code.as_u16())),
			retry_after: meta_retry_after(meta),
		}
		.into();
	}

	TransportError::network(authority, err).into()
}

pub(crate) fn meta_status(meta: Option<&ResponseMetadata>) -> Option<u16> {
	meta.and_then(|value| value.status)
}

pub(crate) fn meta_retry_after(meta: Option<&ResponseMetadata>) -> Option<Duration> {
	meta.and_then(|value| value.retry_after)
}
