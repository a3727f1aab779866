//! Walks a game server through its session lifecycle against a mocked identity provider and
//! backend: boot the broker, admit two players, drop one, then shut down.

// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use tracing_subscriber::EnvFilter;
// self
use session_broker::{
	auth::{ClientToken, ConnectionId, HostId, ServiceCredentials},
	broker::ReqwestBroker,
	config::BrokerConfig,
	url::Url,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let server = MockServer::start_async().await;

	server
		.mock_async(|when, then| {
			when.method(POST).path("/oauth/token");
			then.status(200).header("content-type", "application/json").body(
				"{\"access_token\":\"svc-demo\",\"token_type\":\"bearer\",\"expires_in\":3600}",
			);
		})
		.await;
	server
		.mock_async(|when, then| {
			when.method(POST).path("/team").header("authorization", "Bearer svc-demo");
			then.status(200).header("content-type", "application/json").body("{\"teamID\":\"red-3\"}");
		})
		.await;

	let base = Url::parse(&server.base_url())?;
	let config = BrokerConfig::builder()
		.identity_provider(base.clone())
		.backend(base)
		.credentials(ServiceCredentials::new("demo-server", "demo-secret", "game-backend"))
		.build()?;
	let broker = ReqwestBroker::new(config)?;
	let token = broker.start().await?;

	println!("Service token acquired, expires at {}.", token.expires_at);

	let host = HostId::new("game-demo-01")?;
	let mut events = broker.subscribe();

	for (connection, player_token) in [("conn-alice", "alice-token"), ("conn-bob", "bob-token")] {
		let connection = ConnectionId::new(connection)?;
		let team =
			broker.resolve_team(&connection, &ClientToken::new(player_token), &host).await?;

		println!("{connection} joined team {team}.");
	}

	broker.release_connection(&ConnectionId::new("conn-bob")?).await;

	while let Ok(event) = events.try_recv() {
		println!("Cache event: {event:?}.");
	}

	println!("{} connection(s) still cached.", broker.cache().len());

	broker.shutdown().await;

	Ok(())
}
