//! Wall-clock abstraction so expiry decisions can be driven deterministically in tests.

// self
use crate::_prelude::*;

/// Source of the current UTC instant used for every expiry decision.
pub trait Clock
where
	Self: Debug + Send + Sync,
{
	/// Returns the current UTC instant.
	fn now_utc(&self) -> OffsetDateTime;
}

/// Clock backed by the operating system wall time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now_utc(&self) -> OffsetDateTime {
		OffsetDateTime::now_utc()
	}
}

/// Shared, manually advanced clock for tests.
#[cfg(any(test, feature = "test"))]
#[derive(Debug)]
pub struct ManualClock(Mutex<OffsetDateTime>);
#[cfg(any(test, feature = "test"))]
impl ManualClock {
	/// Creates a clock frozen at the provided instant.
	pub fn new(now: OffsetDateTime) -> Self {
		Self(Mutex::new(now))
	}

	/// Creates a clock frozen at the current wall time, which keeps TOTP codes realistic.
	pub fn starting_now() -> Self {
		Self::new(OffsetDateTime::now_utc())
	}

	/// Moves the clock forward.
	pub fn advance(&self, by: Duration) {
		let mut now = self.0.lock();

		*now += by;
	}
}
#[cfg(any(test, feature = "test"))]
impl Clock for ManualClock {
	fn now_utc(&self) -> OffsetDateTime {
		*self.0.lock()
	}
}
