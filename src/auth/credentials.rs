//! Service credentials presented to the identity provider.

// self
use crate::{_prelude::*, auth::TokenSecret};

/// Client identity the game server uses for the client-credentials grant.
///
/// Values are replaced wholesale through the configuration resolver; there are no
/// field-level setters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCredentials {
	/// OAuth 2.0 client identifier.
	pub client_id: String,
	/// Confidential client secret.
	pub client_secret: TokenSecret,
	/// Audience (resource) the issued service token must be valid for.
	pub audience: String,
}
impl ServiceCredentials {
	/// Creates a credential set.
	pub fn new(
		client_id: impl Into<String>,
		client_secret: impl Into<TokenSecret>,
		audience: impl Into<String>,
	) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret: client_secret.into(),
			audience: audience.into(),
		}
	}

	/// Returns the name of the first blank field, if any.
	pub(crate) fn blank_field(&self) -> Option<&'static str> {
		if self.client_id.trim().is_empty() {
			Some("client_id")
		} else if self.client_secret.is_blank() {
			Some("client_secret")
		} else if self.audience.trim().is_empty() {
			Some("audience")
		} else {
			None
		}
	}
}
impl Debug for ServiceCredentials {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ServiceCredentials")
			.field("client_id", &self.client_id)
			.field("client_secret", &"<redacted>")
			.field("audience", &self.audience)
			.finish()
	}
}
