//! Thread-safe in-memory [`KvStore`] implementation for single-node deployments and tests.

// self
use crate::{
	_prelude::*,
	clock::Clock,
	rendezvous::{Answer, Rendezvous, RendezvousHandle},
	store::{KvStore, PutOutcome, StoreError, StoreFuture, TtlValue},
};

#[derive(Debug, Default)]
struct MemoryState {
	timed: HashMap<String, TtlValue>,
	durable: HashMap<String, String>,
	waiters: HashMap<String, RendezvousHandle>,
}

type StateMap = Arc<RwLock<MemoryState>>;

/// Storage backend that keeps values, deadlines, and waiters in-process.
///
/// Expiry is lazy: an entry past its deadline stays resident until the next read of that key
/// removes it.
#[derive(Clone, Debug)]
pub struct MemoryStore {
	state: StateMap,
	clock: Arc<dyn Clock>,
}
impl MemoryStore {
	/// Creates an empty store reading time from `clock`.
	pub fn new(clock: Arc<dyn Clock>) -> Self {
		Self { state: Default::default(), clock }
	}

	/// Returns `true` if `key` is physically held, ignoring deadlines.
	pub fn is_resident(&self, key: &str) -> bool {
		let state = self.state.read();

		state.timed.contains_key(key) || state.durable.contains_key(key)
	}

	/// Number of registered waiters that have not been answered or timed out.
	pub fn waiter_count(&self) -> usize {
		self.state.read().waiters.values().filter(|handle| handle.is_open()).count()
	}

	fn put_with_ttl_now(&self, key: &str, value: &str, ttl: Duration) -> PutOutcome {
		let now = self.clock.now_utc();
		let mut state = self.state.write();

		if state.timed.get(key).is_some_and(|entry| entry.is_live_at(now)) {
			return PutOutcome::Existing;
		}

		state.timed.insert(key.to_owned(), TtlValue::new(value, now, ttl));

		PutOutcome::Created
	}

	fn get_with_ttl_now(&self, key: &str) -> Result<String, StoreError> {
		let now = self.clock.now_utc();

		{
			let state = self.state.read();

			match state.timed.get(key) {
				Some(entry) if entry.is_live_at(now) => return Ok(entry.value.clone()),
				Some(_) => {},
				None => return Err(StoreError::NotFound { key: key.to_owned() }),
			}
		}

		let mut state = self.state.write();

		// Another writer may have replaced the entry between the two locks.
		match state.timed.get(key) {
			Some(entry) if entry.is_live_at(now) => Ok(entry.value.clone()),
			Some(_) => {
				state.timed.remove(key);
				tracing::debug!(key, "Removed expired entry on read.");

				Err(StoreError::Expired { key: key.to_owned() })
			},
			None => Err(StoreError::NotFound { key: key.to_owned() }),
		}
	}

	fn put_now(&self, key: &str, value: &str) -> PutOutcome {
		let mut state = self.state.write();

		if state.durable.contains_key(key) {
			return PutOutcome::Existing;
		}

		state.durable.insert(key.to_owned(), value.to_owned());

		PutOutcome::Created
	}

	fn block_now(&self, key: &str, ttl: Duration) -> Rendezvous {
		let rendezvous = Rendezvous::new(key);
		let handle = rendezvous.handle();
		let previous = self.state.write().waiters.insert(key.to_owned(), handle.clone());

		if previous.is_some_and(|previous| previous.close()) {
			tracing::debug!(key, "Replaced an open waiter; the previous one was closed.");
		}

		let state = self.state.clone();
		let key = key.to_owned();

		rendezvous.arm_deadline(ttl, move |fired| {
			let mut state = state.write();

			if state.waiters.get(&key).is_some_and(|current| current.same_as(fired)) {
				state.waiters.remove(&key);
			}
		});

		rendezvous
	}

	fn unblock_now(&self, key: &str, answer: Answer) -> Result<(), StoreError> {
		let handle = self
			.state
			.write()
			.waiters
			.remove(key)
			.ok_or_else(|| StoreError::NoWaiter { key: key.to_owned() })?;

		handle.say(answer).map_err(|_| StoreError::NoWaiter { key: key.to_owned() })
	}
}
impl KvStore for MemoryStore {
	fn put_with_ttl<'a>(
		&'a self,
		key: &'a str,
		value: &'a str,
		ttl: Duration,
	) -> StoreFuture<'a, PutOutcome> {
		Box::pin(async move { Ok(self.put_with_ttl_now(key, value, ttl)) })
	}

	fn get_with_ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String> {
		Box::pin(async move { self.get_with_ttl_now(key) })
	}

	fn put<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, PutOutcome> {
		Box::pin(async move { Ok(self.put_now(key, value)) })
	}

	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String> {
		Box::pin(async move {
			self.state
				.read()
				.durable
				.get(key)
				.cloned()
				.ok_or_else(|| StoreError::NotFound { key: key.to_owned() })
		})
	}

	fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
		Box::pin(async move { Ok(self.state.read().durable.contains_key(key)) })
	}

	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		Box::pin(async move {
			let mut state = self.state.write();

			state.timed.remove(key);
			state.durable.remove(key);

			Ok(())
		})
	}

	fn block<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, Rendezvous> {
		Box::pin(async move { Ok(self.block_now(key, ttl)) })
	}

	fn unblock<'a>(&'a self, key: &'a str, answer: Answer, _ttl: Duration) -> StoreFuture<'a, ()> {
		Box::pin(async move { self.unblock_now(key, answer) })
	}
}
