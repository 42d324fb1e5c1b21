//! Pending numeric codes and authenticator registrations scoped to one issuer.
//!
//! Per user the service moves between four states: no challenge, a pending numeric code, a
//! temporary (unconfirmed) authenticator registration, and a confirmed registration. Every
//! transient state lives in the store with a deadline, so an abandoned challenge simply
//! expires back to "no challenge".

pub mod registration;

pub use registration::{OtpRegistration, ProvisioningImage};

// crates.io
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
// self
use crate::{
	_prelude::*,
	clock::Clock,
	store::{KvStore, StoreError, decode_record, encode_record, keys},
};

/// Length of the numeric codes sent to users.
pub const NUMERIC_CODE_LEN: usize = 6;
/// Random bytes behind a registration key.
pub const REGISTRATION_KEY_BYTES: usize = 64;
/// Random bytes behind an approval token.
pub const APPROVAL_TOKEN_BYTES: usize = 8;

/// Errors raised by [`TokenService`].
#[derive(Debug, ThisError)]
pub enum TokenError {
	/// A challenge is already outstanding for the user.
	#[error("A challenge is already pending.")]
	AlreadyPending,
	/// The presented code did not match.
	#[error("The presented code is invalid.")]
	InvalidCode,
	/// A confirmed registration already exists; it is never replaced.
	#[error("An authenticator is already registered for `{uid}`.")]
	AlreadyRegistered {
		/// User identifier.
		uid: String,
	},
	/// The user has no confirmed authenticator registration.
	#[error("No authenticator is registered for `{uid}`.")]
	NoRegistration {
		/// User identifier.
		uid: String,
	},
	/// Secret generation or provisioning URL handling failed.
	#[error("Authenticator secret failure: {message}.")]
	Secret {
		/// Human-readable error payload.
		message: String,
	},
	/// The provisioning image could not be rendered.
	#[error("Provisioning image failure: {message}.")]
	Image {
		/// Human-readable error payload.
		message: String,
	},
	/// Underlying store failure.
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Challenge bookkeeping for a single issuer.
#[derive(Clone, Debug)]
pub struct TokenService {
	store: Arc<dyn KvStore>,
	clock: Arc<dyn Clock>,
	issuer: String,
	registration_timeout: Duration,
}
impl TokenService {
	/// Creates a service writing through `store`.
	pub fn new(
		store: Arc<dyn KvStore>,
		clock: Arc<dyn Clock>,
		issuer: impl Into<String>,
		registration_timeout: Duration,
	) -> Self {
		Self { store, clock, issuer: issuer.into(), registration_timeout }
	}

	/// Issuer label scoping every key.
	pub fn issuer(&self) -> &str {
		&self.issuer
	}

	/// Returns the creation time of the outstanding numeric code.
	pub async fn check_pending_token(&self, uid: &str) -> Result<OffsetDateTime, TokenError> {
		let key = keys::pending_token(uid, &self.issuer);
		let raw = self.store.get_with_ttl(&key).await?;
		let seconds = raw
			.parse::<i64>()
			.map_err(|e| StoreError::Serialization { message: format!("record `{key}`: {e}") })?;

		OffsetDateTime::from_unix_timestamp(seconds)
			.map_err(|e| StoreError::Serialization { message: format!("record `{key}`: {e}") }.into())
	}

	/// Records a numeric code issued at `created_at`; fails with
	/// [`TokenError::AlreadyPending`] and changes nothing if one is outstanding.
	pub async fn issue_pending_token(
		&self,
		uid: &str,
		created_at: OffsetDateTime,
		ttl: Duration,
	) -> Result<(), TokenError> {
		let key = keys::pending_token(uid, &self.issuer);
		let outcome =
			self.store.put_with_ttl(&key, &created_at.unix_timestamp().to_string(), ttl).await?;

		if outcome.is_created() { Ok(()) } else { Err(TokenError::AlreadyPending) }
	}

	/// Drops the outstanding numeric code, if any.
	pub async fn remove_pending_token(&self, uid: &str) -> Result<(), TokenError> {
		Ok(self.store.delete(&keys::pending_token(uid, &self.issuer)).await?)
	}

	/// Reports whether the user completed an authenticator registration.
	pub async fn has_confirmed_registration(&self, uid: &str) -> Result<bool, TokenError> {
		Ok(self.store.has(&keys::confirmed_otp(uid, &self.issuer)).await?)
	}

	/// Reports whether an unconfirmed registration is still open for the user.
	pub async fn has_pending_registration(&self, uid: &str) -> Result<bool, TokenError> {
		match self.store.get_with_ttl(&keys::temporary_otp(uid, &self.issuer)).await {
			Ok(_) => Ok(true),
			Err(e) if e.is_absent() => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Checks a one-time code against the user's confirmed registration.
	pub async fn validate_one_time_code(&self, uid: &str, code: &str) -> Result<bool, TokenError> {
		let key = keys::confirmed_otp(uid, &self.issuer);
		let raw = match self.store.get(&key).await {
			Ok(raw) => raw,
			Err(e) if e.is_absent() => return Err(TokenError::NoRegistration { uid: uid.to_owned() }),
			Err(e) => return Err(e.into()),
		};
		let registration: OtpRegistration = decode_record(&key, &raw)?;

		registration.check(code, self.clock.now_utc())
	}

	/// Opens a temporary registration and returns the key it can be retrieved by.
	///
	/// The registration is stored twice: under the issuer (so a second request can see one is
	/// pending) and under the random key handed to the user. Fails with
	/// [`TokenError::AlreadyPending`] and writes nothing else while another registration is open.
	pub async fn begin_temporary_registration(&self, uid: &str) -> Result<String, TokenError> {
		let registration = OtpRegistration::generate(&self.issuer, uid)?;
		let value = encode_record(&registration)?;
		let registration_key = random_key(REGISTRATION_KEY_BYTES);
		let claimed = self
			.store
			.put_with_ttl(&keys::temporary_otp(uid, &self.issuer), &value, self.registration_timeout)
			.await?;

		if !claimed.is_created() {
			return Err(TokenError::AlreadyPending);
		}

		self.store
			.put_with_ttl(&keys::temporary_otp(uid, &registration_key), &value, self.registration_timeout)
			.await?;

		Ok(registration_key)
	}

	/// Drops both copies of a temporary registration.
	pub async fn cancel_temporary_registration(
		&self,
		uid: &str,
		registration_key: &str,
	) -> Result<(), TokenError> {
		self.store.delete(&keys::temporary_otp(uid, registration_key)).await?;
		self.store.delete(&keys::temporary_otp(uid, &self.issuer)).await?;

		Ok(())
	}

	/// Confirms a temporary registration when `code` matches its secret.
	///
	/// An existing confirmed registration is kept and reported as
	/// [`TokenError::AlreadyRegistered`]; the temporary copies are then left to expire.
	pub async fn complete_temporary_registration(
		&self,
		uid: &str,
		registration_key: &str,
		code: &str,
	) -> Result<(), TokenError> {
		let key = keys::temporary_otp(uid, registration_key);
		let raw = self.store.get_with_ttl(&key).await?;
		let registration: OtpRegistration = decode_record(&key, &raw)?;

		if !registration.check(code, self.clock.now_utc())? {
			return Err(TokenError::InvalidCode);
		}

		let confirmed =
			self.store.put(&keys::confirmed_otp(uid, &self.issuer), &encode_record(&registration)?).await?;

		if !confirmed.is_created() {
			return Err(TokenError::AlreadyRegistered { uid: uid.to_owned() });
		}

		self.store.delete(&key).await?;
		self.store.delete(&keys::temporary_otp(uid, &self.issuer)).await?;

		Ok(())
	}

	/// Renders the provisioning QR image of a pending registration.
	pub async fn render_provisioning_image(
		&self,
		uid: &str,
		registration_key: &str,
	) -> Result<ProvisioningImage, TokenError> {
		let key = keys::temporary_otp(uid, registration_key);
		let raw = self.store.get_with_ttl(&key).await?;
		let registration: OtpRegistration = decode_record(&key, &raw)?;

		registration.provisioning_image()
	}
}

/// Generates a random code of `len` decimal digits.
pub fn numeric_code(len: usize) -> String {
	let mut rng = rand::rng();

	(0..len).map(|_| char::from(b'0' + rng.random_range(0..10_u8))).collect()
}

/// Interleaves the first character of `spacer` between the digits of `code`.
pub fn spaced_code(spacer: &str, code: &str) -> String {
	let Some(separator) = spacer.chars().next() else {
		return code.to_owned();
	};
	let mut spaced = String::with_capacity(code.len() * 2);

	for (i, digit) in code.chars().enumerate() {
		if i > 0 {
			spaced.push(separator);
		}

		spaced.push(digit);
	}

	spaced
}

/// Compares numeric codes digit by digit, ignoring separators and whitespace.
pub fn codes_match(expected: &str, presented: &str) -> bool {
	let expected = expected.chars().filter(char::is_ascii_digit);
	let presented = presented.chars().filter(char::is_ascii_digit);
	let expected = expected.collect::<String>();

	!expected.is_empty() && expected == presented.collect::<String>()
}

/// Returns `bytes` random bytes encoded as path-safe base64.
pub fn random_key(bytes: usize) -> String {
	let mut buf = vec![0_u8; bytes];

	rand::rng().fill(buf.as_mut_slice());

	URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;
	use crate::{clock::ManualClock, store::MemoryStore};

	fn service() -> (TokenService, Arc<ManualClock>) {
		let clock = Arc::new(ManualClock::new(macros::datetime!(2025-01-15 12:00 UTC)));
		let store = Arc::new(MemoryStore::new(clock.clone()));

		(TokenService::new(store, clock.clone(), "acme", Duration::from_secs(900)), clock)
	}

	#[test]
	fn numeric_codes_are_digits() {
		let code = numeric_code(NUMERIC_CODE_LEN);

		assert_eq!(code.len(), NUMERIC_CODE_LEN);
		assert!(code.chars().all(|c| c.is_ascii_digit()));
	}

	#[test]
	fn spacing_uses_the_first_spacer_character() {
		assert_eq!(spaced_code("-x", "123456"), "1-2-3-4-5-6");
		assert_eq!(spaced_code("", "123456"), "123456");
		assert_eq!(spaced_code(" ", "12"), "1 2");
	}

	#[test]
	fn code_comparison_ignores_separators() {
		assert!(codes_match("123456", "1-2-3 4 5 6"));
		assert!(!codes_match("123456", "123457"));
		assert!(!codes_match("", ""));
	}

	#[test]
	fn random_keys_are_path_safe() {
		let key = random_key(REGISTRATION_KEY_BYTES);

		assert_eq!(key.len(), 86);
		assert!(key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
		assert_ne!(key, random_key(REGISTRATION_KEY_BYTES));
	}

	#[tokio::test]
	async fn pending_tokens_are_single_flight() {
		let (service, clock) = service();
		let first = clock.now_utc();
		let ttl = Duration::from_secs(60);

		service.issue_pending_token("alice", first, ttl).await.expect("First issue should succeed.");
		clock.advance(Duration::from_secs(5));

		assert!(matches!(
			service.issue_pending_token("alice", clock.now_utc(), ttl).await,
			Err(TokenError::AlreadyPending)
		));
		assert_eq!(service.check_pending_token("alice").await.expect("Token is pending."), first);

		service.remove_pending_token("alice").await.expect("Removal should succeed.");

		assert!(matches!(
			service.check_pending_token("alice").await,
			Err(TokenError::Store(StoreError::NotFound { .. }))
		));
	}

	#[tokio::test]
	async fn unconfirmed_users_cannot_validate_codes() {
		let (service, _) = service();

		assert!(!service.has_confirmed_registration("alice").await.expect("Lookup should run."));
		assert!(matches!(
			service.validate_one_time_code("alice", "123456").await,
			Err(TokenError::NoRegistration { .. })
		));
	}

	#[tokio::test]
	async fn registration_images_expire_with_the_registration() {
		let (service, clock) = service();
		let key = service.begin_temporary_registration("alice").await.expect("Registration.");

		assert!(service.has_pending_registration("alice").await.expect("Lookup should run."));
		assert!(service.render_provisioning_image("alice", &key).await.is_ok());

		clock.advance(Duration::from_secs(901));

		assert!(!service.has_pending_registration("alice").await.expect("Lookup should run."));
		assert!(matches!(
			service.render_provisioning_image("alice", &key).await,
			Err(TokenError::Store(StoreError::Expired { .. }))
		));
	}
}
