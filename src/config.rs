//! JSON-backed gate settings with defaults, duration parsing, and validation.

// self
use crate::{_prelude::*, error::ConfigError};

const DEFAULT_ACCESS_DURATION: Duration = Duration::from_secs(10 * 60 * 60);
const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_OTP_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_MESSENGER_RATE: Duration = Duration::from_secs(1);
const DEFAULT_MESSENGER_BURST: usize = 20;
const DEFAULT_MEMORY_CACHE_MB: u64 = 30;
const DEFAULT_GRANT_SCOPE: &str = "user";

/// Challenge flow a gate drives once an identity has been resolved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
	#[default]
	/// Short numeric code delivered out of band.
	Token,
	/// Time-based one-time password from a registered authenticator.
	Otp,
	/// Human-approved yes/no link.
	Link,
}
impl Flow {
	/// Returns a stable label suitable for logs and settings.
	pub const fn as_str(self) -> &'static str {
		match self {
			Flow::Token => "token",
			Flow::Otp => "otp",
			Flow::Link => "link",
		}
	}
}
impl Display for Flow {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Top-level gate settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSettings {
	/// Flow driven for unknown clients.
	#[serde(default)]
	pub operation_mode: Flow,
	/// Issuer label scoping pending tokens and OTP registrations.
	#[serde(default)]
	pub issuer: String,
	/// Public base URL of the authentication host (used to build links).
	pub issuer_base: String,
	/// Optional spacer whose first character separates digits in short messages.
	#[serde(default)]
	pub spacing: String,
	/// Scope segment of grant keys (`allow:<scope>:<ip>`).
	#[serde(default = "default_grant_scope")]
	pub grant_scope: String,
	/// Channel names tried in order when delivering challenges.
	#[serde(default)]
	pub channels: Vec<String>,
	/// Lifetime of a grant once a challenge succeeds.
	#[serde(default = "default_access_duration", with = "duration_serde")]
	pub access_duration: Duration,
	/// Lifetime of a numeric code or approval window.
	#[serde(default = "default_token_duration", with = "duration_serde")]
	pub token_duration: Duration,
	/// Outbound messenger settings.
	#[serde(default)]
	pub messenger: MessengerSettings,
	/// Store backend selection.
	#[serde(default)]
	pub store: StoreSettings,
	/// One-time-password registration settings.
	#[serde(default)]
	pub otp: OtpSettings,
}
impl GateSettings {
	/// Decodes settings from JSON and validates them.
	pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
		let de = &mut serde_json::Deserializer::from_str(json);
		let settings: Self =
			serde_path_to_error::deserialize(de).map_err(|source| ConfigError::Parse { source })?;

		settings.validate()?;

		Ok(settings)
	}

	/// Parses `issuer_base` into an absolute URL.
	pub fn issuer_base_url(&self) -> Result<Url, ConfigError> {
		let url = Url::parse(&self.issuer_base)
			.map_err(|source| ConfigError::InvalidIssuerBase { source })?;

		if url.host_str().is_none() {
			return Err(ConfigError::InvalidIssuerBase { source: url::ParseError::EmptyHost });
		}

		Ok(url)
	}

	/// Checks cross-field constraints.
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.issuer_base_url()?;

		if self.operation_mode == Flow::Otp {
			if self.issuer.trim().is_empty() {
				return Err(ConfigError::MissingIssuer);
			}
			if self.otp.channel.is_none() {
				return Err(ConfigError::MissingOtpChannel);
			}
		}
		if self.messenger.burst == 0 {
			return Err(ConfigError::InvalidBurst);
		}
		if self.messenger.rate.is_zero() {
			return Err(ConfigError::InvalidRate);
		}

		Ok(())
	}
}

/// Sender identity and throttling for outbound messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessengerSettings {
	/// Period between dispatch permits.
	#[serde(default = "default_messenger_rate", with = "duration_serde")]
	pub rate: Duration,
	/// Number of permits that may accumulate.
	#[serde(default = "default_messenger_burst")]
	pub burst: usize,
	/// Sender shown to recipients.
	#[serde(default)]
	pub from: SenderSettings,
}
impl Default for MessengerSettings {
	fn default() -> Self {
		Self {
			rate: DEFAULT_MESSENGER_RATE,
			burst: DEFAULT_MESSENGER_BURST,
			from: SenderSettings::default(),
		}
	}
}

/// Sender name and address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSettings {
	/// Display name.
	#[serde(default)]
	pub name: String,
	/// Mail address.
	#[serde(default)]
	pub email: String,
}

/// One-time-password registration settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpSettings {
	/// Lifetime of a temporary registration.
	#[serde(default = "default_otp_timeout", with = "duration_serde")]
	pub timeout: Duration,
	/// Channel delivering registration links.
	#[serde(default)]
	pub channel: Option<String>,
}
impl Default for OtpSettings {
	fn default() -> Self {
		Self { timeout: DEFAULT_OTP_TIMEOUT, channel: None }
	}
}

/// Closed set of store backends, tagged by `type`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreSettings {
	#[default]
	/// Process-local maps.
	Memory,
	/// Shared Redis server fronted by a local read-through cache.
	Redis(RedisSettings),
}
impl StoreSettings {
	/// Returns the backend tag.
	pub const fn kind(&self) -> &'static str {
		match self {
			StoreSettings::Memory => "memory",
			StoreSettings::Redis(_) => "redis",
		}
	}
}

/// Connection and cache settings for the Redis backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisSettings {
	/// `host:port` of the server.
	pub address: String,
	/// Optional password.
	#[serde(default)]
	pub password: Option<String>,
	/// Logical database index.
	#[serde(default)]
	pub db: i64,
	/// Memory budget of the local read-through cache.
	#[serde(default = "default_memory_cache_mb")]
	pub memory_cache_mb: u64,
}
impl RedisSettings {
	/// Builds the `redis://` connection URL.
	pub fn connection_url(&self) -> String {
		match &self.password {
			Some(password) => format!("redis://:{password}@{}/{}", self.address, self.db),
			None => format!("redis://{}/{}", self.address, self.db),
		}
	}
}
impl Debug for RedisSettings {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RedisSettings")
			.field("address", &self.address)
			.field("password", &self.password.as_ref().map(|_| "<redacted>"))
			.field("db", &self.db)
			.field("memory_cache_mb", &self.memory_cache_mb)
			.finish()
	}
}

/// Parses `90`, `90s`, `250ms`, `15m`, `10h`, or `1d`.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
	let invalid = || ConfigError::InvalidDuration { value: value.to_owned() };
	let trimmed = value.trim();
	let split = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());
	let (digits, unit) = trimmed.split_at(split);
	let amount: u64 = digits.parse().map_err(|_| invalid())?;
	let duration = match unit {
		"ms" => Duration::from_millis(amount),
		"" | "s" => Duration::from_secs(amount),
		"m" => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
		"h" => Duration::from_secs(amount.checked_mul(60 * 60).ok_or_else(invalid)?),
		"d" => Duration::from_secs(amount.checked_mul(24 * 60 * 60).ok_or_else(invalid)?),
		_ => return Err(invalid()),
	};

	Ok(duration)
}

mod duration_serde {
	// crates.io
	use serde::{Deserializer, Serializer, de::Error as DeError};
	// self
	use super::*;

	#[derive(Deserialize)]
	#[serde(untagged)]
	enum RawDuration {
		Seconds(u64),
		Text(String),
	}

	pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		if value.subsec_millis() == 0 {
			serializer.serialize_str(&format!("{}s", value.as_secs()))
		} else {
			serializer.serialize_str(&format!("{}ms", value.as_millis()))
		}
	}

	pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		match RawDuration::deserialize(deserializer)? {
			RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
			RawDuration::Text(text) => parse_duration(&text).map_err(D::Error::custom),
		}
	}
}

fn default_grant_scope() -> String {
	DEFAULT_GRANT_SCOPE.to_owned()
}

fn default_access_duration() -> Duration {
	DEFAULT_ACCESS_DURATION
}

fn default_token_duration() -> Duration {
	DEFAULT_TOKEN_DURATION
}

fn default_otp_timeout() -> Duration {
	DEFAULT_OTP_TIMEOUT
}

fn default_messenger_rate() -> Duration {
	DEFAULT_MESSENGER_RATE
}

fn default_messenger_burst() -> usize {
	DEFAULT_MESSENGER_BURST
}

fn default_memory_cache_mb() -> u64 {
	DEFAULT_MEMORY_CACHE_MB
}
