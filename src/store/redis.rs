//! Redis-backed [`KvStore`] shared by every gate replica, fronted by a bounded local read cache.
//!
//! Timed values are stored as JSON [`TtlValue`] records with a matching server-side lease, so
//! Redis evicts them on its own even when nobody reads them again. Waiters park on `BLPOP`
//! over a dedicated connection; a marker key advertises that a waiter is live so answers
//! arriving after the deadline are rejected instead of lingering in the list.

// crates.io
use ::redis::{Client, RedisError, aio::ConnectionManager};
use moka::future::Cache;
// self
use crate::{
	_prelude::*,
	clock::Clock,
	config::RedisSettings,
	rendezvous::{Answer, Rendezvous},
	store::{KvStore, PutOutcome, StoreError, StoreFuture, TtlValue, decode_record, encode_record, keys},
};

const MIB: u64 = 1024 * 1024;
const ENTRY_OVERHEAD: usize = 64;
const BLPOP_GRACE: Duration = Duration::from_secs(5);
const MIN_LEASE: Duration = Duration::from_millis(1);
const MIN_ANSWER_LEASE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
struct CachedValue {
	value: String,
	lease: Duration,
	until: OffsetDateTime,
}

struct LeaseExpiry;
impl moka::Expiry<String, CachedValue> for LeaseExpiry {
	fn expire_after_create(
		&self,
		_key: &String,
		value: &CachedValue,
		_created_at: std::time::Instant,
	) -> Option<Duration> {
		Some(value.lease)
	}
}

/// Storage backend persisting values in Redis.
#[derive(Clone)]
pub struct RedisStore {
	client: Client,
	connection: ConnectionManager,
	cache: Cache<String, CachedValue>,
	clock: Arc<dyn Clock>,
}
impl RedisStore {
	/// Connects to the server described by `settings`.
	pub async fn connect(settings: &RedisSettings, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
		let client = Client::open(settings.connection_url()).map_err(backend)?;
		let connection = ConnectionManager::new(client.clone()).await.map_err(backend)?;
		let cache = Cache::builder()
			.max_capacity(settings.memory_cache_mb.saturating_mul(MIB))
			.weigher(|key: &String, value: &CachedValue| -> u32 {
				entry_weight(key, &value.value)
			})
			.expire_after(LeaseExpiry)
			.build();

		tracing::info!(address = %settings.address, db = settings.db, "Connected to Redis store.");

		Ok(Self { client, connection, cache, clock })
	}

	async fn delete_remote(&self, key: &str) -> Result<(), StoreError> {
		let mut connection = self.connection.clone();
		let _: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut connection).await.map_err(backend)?;

		self.cache.invalidate(key).await;

		Ok(())
	}

	async fn set_if_absent(
		&self,
		key: &str,
		value: &str,
		lease: Option<Duration>,
	) -> Result<PutOutcome, StoreError> {
		let mut connection = self.connection.clone();
		let mut command = ::redis::cmd("SET");

		command.arg(key).arg(value).arg("NX");

		if let Some(lease) = lease {
			command.arg("PX").arg(lease_millis(lease));
		}

		let reply: Option<String> = command.query_async(&mut connection).await.map_err(backend)?;

		Ok(if reply.is_some() { PutOutcome::Created } else { PutOutcome::Existing })
	}

	async fn get_with_ttl_now(&self, key: &str) -> Result<String, StoreError> {
		let now = self.clock.now_utc();

		if let Some(cached) = self.cache.get(key).await {
			if now < cached.until {
				return Ok(cached.value);
			}

			// The remote key may already hold a newer value, so only the local copy goes.
			self.cache.invalidate(key).await;
		}

		let mut connection = self.connection.clone();
		let raw: Option<String> =
			::redis::cmd("GET").arg(key).query_async(&mut connection).await.map_err(backend)?;
		let raw = raw.ok_or_else(|| StoreError::NotFound { key: key.to_owned() })?;
		let record: TtlValue = decode_record(key, &raw)?;

		if !record.is_live_at(now) {
			self.delete_remote(key).await?;
			tracing::debug!(key, "Removed expired entry on read.");

			return Err(StoreError::Expired { key: key.to_owned() });
		}

		self.cache
			.insert(
				key.to_owned(),
				CachedValue {
					value: record.value.clone(),
					lease: record.remaining(now),
					until: record.until,
				},
			)
			.await;

		Ok(record.value)
	}

	async fn block_now(&self, key: &str, ttl: Duration) -> Result<Rendezvous, StoreError> {
		let marker = keys::waiter_marker(key);
		let mut connection = self.connection.clone();
		let _: () = ::redis::cmd("SET")
			.arg(&marker)
			.arg("1")
			.arg("PX")
			.arg(lease_millis(ttl))
			.query_async(&mut connection)
			.await
			.map_err(backend)?;
		// BLPOP parks its connection, so it must never run on the shared manager.
		let mut listener = self.client.get_multiplexed_async_connection().await.map_err(backend)?;
		let rendezvous = Rendezvous::new(key);
		let handle = rendezvous.handle();
		let key = key.to_owned();
		let timeout_secs = ttl.max(MIN_LEASE).as_secs_f64();

		rendezvous.arm_deadline(ttl, |_| {});

		tokio::spawn(async move {
			let pop = async {
				let popped: Option<(String, String)> = ::redis::cmd("BLPOP")
					.arg(&key)
					.arg(timeout_secs)
					.query_async(&mut listener)
					.await?;

				Ok::<_, RedisError>(popped)
			};
			let popped = tokio::time::timeout(ttl + BLPOP_GRACE, pop).await;

			match popped {
				Ok(Ok(Some((_, answer)))) =>
					if handle.say(Answer::parse(&answer)).is_err() {
						tracing::debug!(key = %key, "Answer arrived after the waiter closed.");
					},
				Ok(Ok(None)) | Err(_) => {
					handle.close();
				},
				Ok(Err(e)) => {
					tracing::warn!(key = %key, error = %e, "Waiting for an answer failed.");
					handle.close();
				},
			}
		});

		Ok(rendezvous)
	}

	async fn unblock_now(&self, key: &str, answer: Answer, ttl: Duration) -> Result<(), StoreError> {
		let mut connection = self.connection.clone();
		let claimed: i64 = ::redis::cmd("DEL")
			.arg(keys::waiter_marker(key))
			.query_async(&mut connection)
			.await
			.map_err(backend)?;

		if claimed == 0 {
			return Err(StoreError::NoWaiter { key: key.to_owned() });
		}

		let _: i64 = ::redis::cmd("LPUSH")
			.arg(key)
			.arg(answer.as_str())
			.query_async(&mut connection)
			.await
			.map_err(backend)?;
		let _: i64 = ::redis::cmd("PEXPIRE")
			.arg(key)
			.arg(lease_millis(ttl.max(MIN_ANSWER_LEASE)))
			.query_async(&mut connection)
			.await
			.map_err(backend)?;

		Ok(())
	}
}
impl Debug for RedisStore {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RedisStore")
			.field("cached_entries", &self.cache.entry_count())
			.field("clock", &self.clock)
			.finish_non_exhaustive()
	}
}
impl KvStore for RedisStore {
	fn put_with_ttl<'a>(
		&'a self,
		key: &'a str,
		value: &'a str,
		ttl: Duration,
	) -> StoreFuture<'a, PutOutcome> {
		Box::pin(async move {
			let record = TtlValue::new(value, self.clock.now_utc(), ttl);
			let outcome =
				self.set_if_absent(key, &encode_record(&record)?, Some(ttl.max(MIN_LEASE))).await?;

			if outcome.is_created() {
				self.cache.invalidate(key).await;
			}

			Ok(outcome)
		})
	}

	fn get_with_ttl<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String> {
		Box::pin(self.get_with_ttl_now(key))
	}

	fn put<'a>(&'a self, key: &'a str, value: &'a str) -> StoreFuture<'a, PutOutcome> {
		Box::pin(self.set_if_absent(key, value, None))
	}

	fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, String> {
		Box::pin(async move {
			let mut connection = self.connection.clone();
			let raw: Option<String> =
				::redis::cmd("GET").arg(key).query_async(&mut connection).await.map_err(backend)?;

			raw.ok_or_else(|| StoreError::NotFound { key: key.to_owned() })
		})
	}

	fn has<'a>(&'a self, key: &'a str) -> StoreFuture<'a, bool> {
		Box::pin(async move {
			let mut connection = self.connection.clone();
			let count: i64 =
				::redis::cmd("EXISTS").arg(key).query_async(&mut connection).await.map_err(backend)?;

			Ok(count > 0)
		})
	}

	fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
		Box::pin(self.delete_remote(key))
	}

	fn block<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, Rendezvous> {
		Box::pin(self.block_now(key, ttl))
	}

	fn unblock<'a>(&'a self, key: &'a str, answer: Answer, ttl: Duration) -> StoreFuture<'a, ()> {
		Box::pin(self.unblock_now(key, answer, ttl))
	}
}

fn backend(e: RedisError) -> StoreError {
	StoreError::Backend { message: e.to_string() }
}

fn lease_millis(lease: Duration) -> u64 {
	u64::try_from(lease.max(MIN_LEASE).as_millis()).unwrap_or(u64::MAX)
}

fn entry_weight(key: &str, value: &str) -> u32 {
	u32::try_from(key.len() + value.len() + ENTRY_OVERHEAD).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn leases_never_round_down_to_zero() {
		assert_eq!(lease_millis(Duration::ZERO), 1);
		assert_eq!(lease_millis(Duration::from_micros(10)), 1);
		assert_eq!(lease_millis(Duration::from_secs(90)), 90_000);
	}

	#[test]
	fn cache_weight_counts_key_and_value_bytes() {
		assert_eq!(entry_weight("allow:user:10.0.0.1", "x"), 19 + 1 + ENTRY_OVERHEAD as u32);
	}

	#[test]
	fn expiry_policy_uses_the_remaining_lease() {
		let cached = CachedValue {
			value: "v".into(),
			lease: Duration::from_secs(42),
			until: OffsetDateTime::UNIX_EPOCH,
		};

		assert_eq!(
			moka::Expiry::expire_after_create(
				&LeaseExpiry,
				&"k".to_owned(),
				&cached,
				std::time::Instant::now()
			),
			Some(Duration::from_secs(42))
		);
	}
}
