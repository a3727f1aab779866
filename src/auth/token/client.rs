//! End-user tokens forwarded by connecting clients.
//!
//! A [`ClientToken`] is consumed by a single resolution attempt and never stored. The
//! broker keeps only its [`TokenFingerprint`] so a re-submitted token can be recognised
//! without retaining the secret itself.

// crates.io
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::{_prelude::*, auth::token::secret::TokenSecret};

/// Player profile attached to a client token by the identity provider's SDK.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	/// Stable user identifier at the identity provider.
	pub user_id: String,
	/// Display name, if the client shared one.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub display_name: Option<String>,
}

/// Token a client forwards when it connects.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientToken {
	/// The player's access token.
	pub access_token: TokenSecret,
	/// Profile claimed by the client, when provided.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub profile: Option<UserProfile>,
	/// Expiry instant (unix seconds on the wire), when provided.
	#[serde(default, with = "time::serde::timestamp::option")]
	pub expires_at: Option<OffsetDateTime>,
}
impl ClientToken {
	/// Wraps a bare access token without profile or expiry metadata.
	pub fn new(access_token: impl Into<TokenSecret>) -> Self {
		Self { access_token: access_token.into(), profile: None, expires_at: None }
	}

	/// Attaches the player's profile.
	pub fn with_profile(mut self, profile: UserProfile) -> Self {
		self.profile = Some(profile);

		self
	}

	/// Attaches the expiry instant reported by the client.
	pub fn with_expires_at(mut self, instant: OffsetDateTime) -> Self {
		self.expires_at = Some(instant);

		self
	}

	/// Returns `true` when the token carries an expiry at or before `instant`.
	pub fn is_expired_at(&self, instant: OffsetDateTime) -> bool {
		self.expires_at.is_some_and(|expires_at| expires_at <= instant)
	}

	/// One-way fingerprint of the access token.
	pub fn fingerprint(&self) -> TokenFingerprint {
		TokenFingerprint::of(&self.access_token)
	}
}
impl Debug for ClientToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ClientToken")
			.field("access_token", &"<redacted>")
			.field("profile", &self.profile)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// SHA-256 digest of a client access token, base64url encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenFingerprint(String);
impl TokenFingerprint {
	/// Computes the fingerprint of `secret`.
	pub fn of(secret: &TokenSecret) -> Self {
		let digest = Sha256::digest(secret.expose().as_bytes());

		Self(URL_SAFE_NO_PAD.encode(digest))
	}

	/// Returns the encoded digest.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}
impl Display for TokenFingerprint {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.0)
	}
}
