//! Key/value contracts with optional per-key expiry plus the blocking approval primitive.
//!
//! Two backends implement [`KvStore`]: [`MemoryStore`] keeps everything in-process and
//! [`RedisStore`] shares state across replicas. Both honour the same contract:
//!
//! - `put_with_ttl`/`put` only create; an existing live value is kept and reported as
//!   [`PutOutcome::Existing`].
//! - `get_with_ttl` never returns a value whose deadline has passed. Reading an expired entry
//!   removes it and reports [`StoreError::Expired`].
//! - `block`/`unblock` hand a single [`Answer`] from one request to exactly one waiter.

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")] pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")] pub use self::redis::RedisStore;

// crates.io
use serde::de::DeserializeOwned;
use time::format_description::well_known::Rfc3339;
// self
use crate::{
	_prelude::*,
	clock::Clock,
	config::StoreSettings,
	rendezvous::{Answer, Rendezvous},
};

/// Boxed future returned by [`KvStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Storage backend contract shared by every gate component.
pub trait KvStore
where
	Self: Debug + Send + Sync,
{
	/// Stores `value` under `key` until `ttl` elapses, unless a live value already exists.
	fn put_with_ttl<'a>(
		&'a self,
		key: &'a str,
		value: &'a str,
		ttl: Duration,
	) -> StoreFuture<'a, PutOutcome>;

	/// Returns the live value stored with a deadline.
	fn get_with_ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String>;

	/// Stores `value` under `key` without expiry, unless a value already exists.
	fn put<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, PutOutcome>;

	/// Returns the value stored without expiry.
	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String>;

	/// Reports whether a value stored without expiry exists.
	fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool>;

	/// Removes `key`; absent keys are not an error.
	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

	/// Registers the single waiter for `key`; the returned rendezvous closes after `ttl`.
	fn block<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, Rendezvous>;

	/// Delivers `answer` to the waiter registered for `key`.
	///
	/// Fails with [`StoreError::NoWaiter`] when no open waiter exists. `ttl` bounds how long
	/// an undelivered answer may linger on shared backends.
	fn unblock<'a>(&'a self, key: &'a str, answer: Answer, ttl: Duration) -> StoreFuture<'a, ()>;
}

/// Result of a create-if-absent write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutOutcome {
	/// The value was written.
	Created,
	/// A live value already existed and was left untouched.
	Existing,
}
impl PutOutcome {
	/// Returns `true` when the value was written.
	pub const fn is_created(self) -> bool {
		matches!(self, PutOutcome::Created)
	}
}

/// Error type produced by [`KvStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// No value exists for the key.
	#[error("Key `{key}` was not found.")]
	NotFound {
		/// Missing key.
		key: String,
	},
	/// The value existed but its deadline passed; it has been removed.
	#[error("Key `{key}` has expired.")]
	Expired {
		/// Expired key.
		key: String,
	},
	/// `unblock` found no open waiter for the key.
	#[error("No waiter is blocked on `{key}`.")]
	NoWaiter {
		/// Rendezvous key.
		key: String,
	},
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}
impl StoreError {
	/// Returns `true` when the key is simply absent (missing or expired).
	pub fn is_absent(&self) -> bool {
		matches!(self, StoreError::NotFound { .. } | StoreError::Expired { .. })
	}
}

/// Value paired with the instant it stops being readable.
///
/// Shared backends persist it as `{"value": .., "until": <unix seconds>}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlValue {
	/// Stored payload.
	pub value: String,
	/// First instant at which the value is no longer readable.
	#[serde(with = "time::serde::timestamp")]
	pub until: OffsetDateTime,
}
impl TtlValue {
	/// Builds a record expiring `ttl` after `now`.
	///
	/// An empty payload is replaced with the RFC 3339 expiry so flag-style keys stay
	/// self-describing.
	pub fn new(value: &str, now: OffsetDateTime, ttl: Duration) -> Self {
		let until = now + ttl;
		let value = if value.is_empty() {
			until.format(&Rfc3339).unwrap_or_else(|_| until.unix_timestamp().to_string())
		} else {
			value.to_owned()
		};

		Self { value, until }
	}

	/// Returns `true` while `now` is strictly before the deadline.
	pub fn is_live_at(&self, now: OffsetDateTime) -> bool {
		now < self.until
	}

	/// Time left before the deadline, saturating at zero.
	pub fn remaining(&self, now: OffsetDateTime) -> Duration {
		if self.is_live_at(now) { (self.until - now).unsigned_abs() } else { Duration::ZERO }
	}
}

/// Serializes a record into the JSON stored by shared backends.
pub fn encode_record<T>(record: &T) -> Result<String, StoreError>
where
	T: Serialize,
{
	serde_json::to_string(record)
		.map_err(|e| StoreError::Serialization { message: e.to_string() })
}

/// Deserializes a stored JSON record, reporting the failing field path.
pub fn decode_record<T>(key: &str, raw: &str) -> Result<T, StoreError>
where
	T: DeserializeOwned,
{
	let mut deserializer = serde_json::Deserializer::from_str(raw);

	serde_path_to_error::deserialize(&mut deserializer)
		.map_err(|e| StoreError::Serialization { message: format!("record `{key}`: {e}") })
}

/// Builds the backend selected by `settings`.
pub async fn connect(settings: &StoreSettings, clock: Arc<dyn Clock>) -> Result<Arc<dyn KvStore>> {
	match settings {
		StoreSettings::Memory => Ok(Arc::new(MemoryStore::new(clock))),
		#[cfg(feature = "redis")]
		StoreSettings::Redis(redis) => Ok(Arc::new(RedisStore::connect(redis, clock).await?)),
		#[cfg(not(feature = "redis"))]
		StoreSettings::Redis(_) =>
			Err(crate::error::ConfigError::UnsupportedStore { kind: settings.kind() }.into()),
	}
}
