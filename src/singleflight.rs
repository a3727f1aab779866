//! Keyed async guards that serialize work per key and forget idle keys.

// crates.io
use async_lock::MutexGuardArc;
// self
use crate::_prelude::*;

type GuardMap<K> = Arc<Mutex<HashMap<K, Arc<AsyncMutex<()>>>>>;

/// Map of per-key async mutexes; entries disappear once nobody holds or awaits them.
#[derive(Debug)]
pub(crate) struct KeyedGuards<K>
where
	K: Clone + Eq + Hash,
{
	guards: GuardMap<K>,
}
impl<K> KeyedGuards<K>
where
	K: Clone + Eq + Hash,
{
	/// Waits for exclusive access to `key`.
	pub(crate) async fn lock(&self, key: &K) -> KeyedGuard<K> {
		// Built before waiting so a cancelled waiter still prunes the key on drop.
		let mut keyed = KeyedGuard { guard: None, key: key.clone(), guards: self.guards.clone() };
		// Declared after `keyed` so it drops first and releases its reference to the mutex.
		let acquire = {
			let mutex = {
				let mut guards = self.guards.lock();

				guards.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
			};

			async move { mutex.lock_arc().await }
		};

		keyed.guard = Some(acquire.await);

		keyed
	}

	/// Number of keys currently held or awaited.
	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.guards.lock().len()
	}
}
impl<K> Default for KeyedGuards<K>
where
	K: Clone + Eq + Hash,
{
	fn default() -> Self {
		Self { guards: Default::default() }
	}
}

/// Exclusive access to one key; prunes the key on drop when no one else is waiting.
pub(crate) struct KeyedGuard<K>
where
	K: Clone + Eq + Hash,
{
	guard: Option<MutexGuardArc<()>>,
	key: K,
	guards: GuardMap<K>,
}
impl<K> Drop for KeyedGuard<K>
where
	K: Clone + Eq + Hash,
{
	fn drop(&mut self) {
		drop(self.guard.take());

		let mut guards = self.guards.lock();

		// Waiters clone the mutex under this same lock, so a count of one means the map holds
		// the only reference.
		if guards.get(&self.key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
			guards.remove(&self.key);
		}
	}
}
