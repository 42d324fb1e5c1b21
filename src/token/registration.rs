//! Authenticator registrations: secret generation, code checks, and provisioning images.

// crates.io
use base64::{Engine, engine::general_purpose::STANDARD};
use totp_rs::{Algorithm, Secret, TOTP};
// self
use crate::{_prelude::*, token::TokenError};

const DIGITS: usize = 6;
const SKEW: u8 = 1;
const STEP_SECONDS: u64 = 30;

/// Stored authenticator secret plus its `otpauth://` provisioning URL.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRegistration {
	/// Base32 shared secret.
	pub private_key: String,
	/// Provisioning URL consumed by authenticator apps.
	pub url: String,
}
impl OtpRegistration {
	/// Generates a fresh secret bound to `issuer` and `account`.
	pub fn generate(issuer: &str, account: &str) -> Result<Self, TokenError> {
		let secret = Secret::generate_secret()
			.to_bytes()
			.map_err(|e| TokenError::Secret { message: e.to_string() })?;
		let totp = TOTP::new(
			Algorithm::SHA1,
			DIGITS,
			SKEW,
			STEP_SECONDS,
			secret,
			Some(issuer.to_owned()),
			account.to_owned(),
		)
		.map_err(|e| TokenError::Secret { message: e.to_string() })?;

		Ok(Self { private_key: totp.get_secret_base32(), url: totp.get_url() })
	}

	/// Checks `code` at `now`, accepting the current step and its immediate neighbours.
	pub fn check(&self, code: &str, now: OffsetDateTime) -> Result<bool, TokenError> {
		let Ok(timestamp) = u64::try_from(now.unix_timestamp()) else {
			return Ok(false);
		};

		Ok(self.totp()?.check(code.trim(), timestamp))
	}

	/// Produces the code an authenticator would show at `at`.
	pub fn code_at(&self, at: OffsetDateTime) -> Result<String, TokenError> {
		let timestamp = u64::try_from(at.unix_timestamp())
			.map_err(|e| TokenError::Secret { message: e.to_string() })?;

		Ok(self.totp()?.generate(timestamp))
	}

	/// Renders the provisioning URL as a PNG QR code.
	pub fn provisioning_image(&self) -> Result<ProvisioningImage, TokenError> {
		let png = self.totp()?.get_qr_png().map_err(|message| TokenError::Image { message })?;

		Ok(ProvisioningImage { png })
	}

	fn totp(&self) -> Result<TOTP, TokenError> {
		TOTP::from_url(&self.url).map_err(|e| TokenError::Secret { message: e.to_string() })
	}
}
impl Debug for OtpRegistration {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("OtpRegistration")
			.field("private_key", &"<redacted>")
			.field("url", &"<redacted>")
			.finish()
	}
}

/// Scannable QR image of a provisioning URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningImage {
	/// PNG-encoded image bytes.
	pub png: Vec<u8>,
}
impl ProvisioningImage {
	/// Standard base64 form, ready for a `data:image/png;base64,` URI.
	pub fn to_base64(&self) -> String {
		STANDARD.encode(&self.png)
	}
}
