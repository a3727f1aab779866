//! Process-wide connection → team mapping.
//!
//! Entries live exactly as long as their connection: the relay writes them after a
//! successful resolution and [`TeamCache::remove`] (or the relay's `release`) drops them on
//! disconnect. Every change is broadcast as a [`TeamEvent`] so the session owner can react
//! without polling.

// crates.io
use tokio::sync::broadcast;
// self
use crate::{
	_prelude::*,
	auth::{ConnectionId, TeamIdentity, TokenFingerprint},
};

/// Change notification emitted by [`TeamCache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TeamEvent {
	/// A connection's team identity was stored.
	Resolved {
		/// Affected connection.
		connection: ConnectionId,
		/// Stored identity.
		identity: TeamIdentity,
	},
	/// A connection's entry was dropped.
	Removed {
		/// Affected connection.
		connection: ConnectionId,
		/// Identity that was stored.
		identity: TeamIdentity,
	},
}

/// Cached identity plus the bookkeeping the relay needs for re-resolution decisions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedTeam {
	/// Resolved identity.
	pub identity: TeamIdentity,
	/// Fingerprint of the client token that produced the identity; `None` for manual inserts.
	pub fingerprint: Option<TokenFingerprint>,
	/// When the identity was stored.
	pub resolved_at: OffsetDateTime,
}

/// Connection-keyed team identity store.
#[derive(Debug)]
pub struct TeamCache {
	entries: RwLock<HashMap<ConnectionId, CachedTeam>>,
	events: broadcast::Sender<TeamEvent>,
}
impl TeamCache {
	const DEFAULT_EVENT_CAPACITY: usize = 64;

	/// Creates an empty cache whose event channel buffers `capacity` notifications per
	/// subscriber.
	pub fn with_event_capacity(capacity: usize) -> Self {
		let (events, _) = broadcast::channel(capacity.max(1));

		Self { entries: Default::default(), events }
	}

	/// Returns the identity cached for `connection`.
	pub fn get(&self, connection: &ConnectionId) -> Option<TeamIdentity> {
		self.entries.read().get(connection).map(|entry| entry.identity.clone())
	}

	/// Returns the full entry cached for `connection`.
	pub fn entry(&self, connection: &ConnectionId) -> Option<CachedTeam> {
		self.entries.read().get(connection).cloned()
	}

	/// Stores `identity` for `connection`, returning the identity it replaced.
	pub fn set(&self, connection: ConnectionId, identity: TeamIdentity) -> Option<TeamIdentity> {
		self.store(connection, identity, None)
	}

	/// Removes the entry for `connection`, returning its identity.
	pub fn remove(&self, connection: &ConnectionId) -> Option<TeamIdentity> {
		let removed = self.entries.write().remove(connection)?;

		self.notify(TeamEvent::Removed {
			connection: connection.clone(),
			identity: removed.identity.clone(),
		});

		Some(removed.identity)
	}

	/// Drops every entry, emitting a removal event for each.
	pub fn clear(&self) {
		let drained = std::mem::take(&mut *self.entries.write());

		for (connection, entry) in drained {
			self.notify(TeamEvent::Removed { connection, identity: entry.identity });
		}
	}

	/// Number of cached connections.
	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	/// Whether the cache holds no entries.
	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}

	/// Subscribes to change notifications issued after this call.
	pub fn subscribe(&self) -> broadcast::Receiver<TeamEvent> {
		self.events.subscribe()
	}

	pub(crate) fn store(
		&self,
		connection: ConnectionId,
		identity: TeamIdentity,
		fingerprint: Option<TokenFingerprint>,
	) -> Option<TeamIdentity> {
		let entry =
			CachedTeam { identity: identity.clone(), fingerprint, resolved_at: OffsetDateTime::now_utc() };
		let previous = self.entries.write().insert(connection.clone(), entry);

		self.notify(TeamEvent::Resolved { connection, identity });

		previous.map(|entry| entry.identity)
	}

	/// Stores like [`Self::store`] unless `shutdown` is already cancelled.
	///
	/// Cancellation is checked while the write lock is held, so a teardown that cancels and then
	/// clears can never be followed by a late write.
	pub(crate) fn store_unless_cancelled(
		&self,
		connection: ConnectionId,
		identity: TeamIdentity,
		fingerprint: Option<TokenFingerprint>,
		shutdown: &CancellationToken,
	) -> Result<Option<TeamIdentity>> {
		let entry =
			CachedTeam { identity: identity.clone(), fingerprint, resolved_at: OffsetDateTime::now_utc() };
		let previous = {
			let mut entries = self.entries.write();

			if shutdown.is_cancelled() {
				return Err(Error::Cancelled);
			}

			entries.insert(connection.clone(), entry)
		};

		self.notify(TeamEvent::Resolved { connection, identity });

		Ok(previous.map(|entry| entry.identity))
	}

	fn notify(&self, event: TeamEvent) {
		// No subscribers is fine.
		let _ = self.events.send(event);
	}
}
impl Default for TeamCache {
	fn default() -> Self {
		Self::with_event_capacity(Self::DEFAULT_EVENT_CAPACITY)
	}
}
