//! Team identity resolved by the backend for a connection.

// self
use crate::{_prelude::*, auth::TeamId};

/// Durable team identity that scopes a connection's game state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamIdentity {
	/// Backend-assigned team identifier.
	#[serde(rename = "teamID")]
	pub team_id: TeamId,
}
impl TeamIdentity {
	/// Wraps a team identifier.
	pub fn new(team_id: TeamId) -> Self {
		Self { team_id }
	}
}
impl Display for TeamIdentity {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		Display::fmt(&self.team_id, f)
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn parses_backend_payload() {
		let identity: TeamIdentity = serde_json::from_str(r#"{"teamID":"blue-7"}"#)
			.expect("Team payload should deserialize.");

		assert_eq!(identity.team_id.as_str(), "blue-7");
		assert_eq!(identity.to_string(), "blue-7");
		assert!(serde_json::from_str::<TeamIdentity>(r#"{"teamID":""}"#).is_err());
	}
}
