//! Stateful decision core for an access-gating edge service: expiring stores, blocking
//! human approvals, TOTP registrations, and rate-limited notification delivery.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]
// The self dev-dependency only exists to switch on `test` for integration tests.
#![cfg_attr(test, allow(unused_crate_dependencies))]

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ext;
pub mod gate;
pub mod obs;
pub mod rendezvous;
pub mod store;
pub mod token;
#[cfg(any(test, feature = "test"))]
pub mod _preludet {
	//! Convenience re-exports and fakes for integration tests; enabled via `cfg(test)` or the
	//! `test` crate feature.

	pub use crate::_prelude::*;

	// std
	use std::{collections::HashSet, net::IpAddr};
	// self
	use crate::{
		clock::{Clock, ManualClock},
		config::GateSettings,
		ext::{
			Addressable, DirectoryError, DirectoryFuture, NotifyError, NotifyFuture, Notifier,
			UserDirectory, UserEntry, Whitelist,
		},
		gate::AccessGate,
		store::{KvStore, MemoryStore},
	};

	/// Message captured by [`RecordingNotifier`].
	#[derive(Clone, Debug, PartialEq, Eq)]
	pub struct SentMessage {
		/// Recipient/sender block handed to the notifier.
		pub address: Addressable,
		/// Subject line.
		pub subject: String,
		/// Short message (SMS-sized).
		pub short_message: String,
		/// Long-form body.
		pub body: String,
	}

	/// Notifier that records every message and optionally fails on demand.
	#[derive(Debug, Default)]
	pub struct RecordingNotifier {
		sent: Mutex<Vec<SentMessage>>,
		fail: AtomicBool,
	}
	impl RecordingNotifier {
		/// Returns every message captured so far.
		pub fn sent(&self) -> Vec<SentMessage> {
			self.sent.lock().clone()
		}

		/// Returns the most recent message, if any.
		pub fn last(&self) -> Option<SentMessage> {
			self.sent.lock().last().cloned()
		}

		/// Makes subsequent sends fail with a transport error.
		pub fn fail_sends(&self, fail: bool) {
			self.fail.store(fail, Ordering::SeqCst);
		}
	}
	impl Notifier for RecordingNotifier {
		fn send<'a>(
			&'a self,
			address: &'a Addressable,
			subject: &'a str,
			short_message: &'a str,
			body: &'a str,
		) -> NotifyFuture<'a> {
			Box::pin(async move {
				if self.fail.load(Ordering::SeqCst) {
					return Err(NotifyError::new("recording notifier configured to fail"));
				}

				self.sent.lock().push(SentMessage {
					address: address.clone(),
					subject: subject.to_owned(),
					short_message: short_message.to_owned(),
					body: body.to_owned(),
				});

				Ok("recorded".to_owned())
			})
		}
	}

	/// Directory backed by a fixed list of users.
	#[derive(Clone, Debug, Default)]
	pub struct StaticDirectory {
		users: Vec<UserEntry>,
		offline: bool,
	}
	impl StaticDirectory {
		/// Creates a directory serving the provided users.
		pub fn new(users: impl IntoIterator<Item = UserEntry>) -> Self {
			Self { users: users.into_iter().collect(), offline: false }
		}

		/// Creates a directory whose every lookup fails with a connection error.
		pub fn offline() -> Self {
			Self { users: Vec::new(), offline: true }
		}
	}
	impl UserDirectory for StaticDirectory {
		fn search<'a>(&'a self, uid: &'a str) -> DirectoryFuture<'a> {
			Box::pin(async move {
				if self.offline {
					return Err(DirectoryError::Connection { message: "directory offline".into() });
				}

				self.users
					.iter()
					.find(|user| user.uid == uid)
					.cloned()
					.ok_or_else(|| DirectoryError::NoUser { uid: uid.to_owned() })
			})
		}
	}

	/// Whitelist backed by a fixed set of addresses.
	#[derive(Clone, Debug, Default)]
	pub struct StaticWhitelist(HashSet<IpAddr>);
	impl StaticWhitelist {
		/// Creates a whitelist allowing exactly the provided addresses.
		pub fn new(ips: impl IntoIterator<Item = IpAddr>) -> Self {
			Self(ips.into_iter().collect())
		}
	}
	impl Whitelist for StaticWhitelist {
		fn is_allowed(&self, ip: IpAddr) -> bool {
			self.0.contains(&ip)
		}
	}

	/// Builds a user entry fixture.
	pub fn user(uid: &str) -> UserEntry {
		UserEntry {
			uid: uid.to_owned(),
			email: format!("{uid}@example.com"),
			mobile: "+10000000000".to_owned(),
			name: uid.to_owned(),
		}
	}

	/// Parses settings fixtures, panicking on invalid JSON.
	pub fn settings(json: &str) -> GateSettings {
		GateSettings::from_json_str(json).expect("Settings fixture should parse.")
	}

	/// Constructs an [`AccessGate`] over an in-memory store, a recording notifier registered as
	/// the `email` channel, a static directory with `alice`, and an empty whitelist.
	pub async fn build_memory_gate(
		settings: GateSettings,
		clock: Arc<ManualClock>,
	) -> (AccessGate, Arc<MemoryStore>, Arc<RecordingNotifier>) {
		let clock_dyn: Arc<dyn Clock> = clock;
		let store_backend = Arc::new(MemoryStore::new(clock_dyn.clone()));
		let store: Arc<dyn KvStore> = store_backend.clone();
		let notifier = Arc::new(RecordingNotifier::default());
		let gate = AccessGate::builder(settings)
			.clock(clock_dyn)
			.store(store)
			.directory(Arc::new(StaticDirectory::new([user("alice")])))
			.whitelist(Arc::new(StaticWhitelist::default()))
			.transport("email", notifier.clone())
			.build()
			.await
			.expect("Memory-backed gate should build.");

		(gate, store_backend, notifier)
	}
}

mod _prelude {
	pub use std::{
		collections::HashMap,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		sync::{
			Arc,
			atomic::{AtomicBool, AtomicU64, Ordering},
		},
		time::Duration,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::OffsetDateTime;
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use url;
