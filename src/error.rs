//! Gate-level error types shared across stores, challenge flows, and collaborators.

// self
use crate::{
	_prelude::*,
	config::Flow,
	dispatch::DispatchError,
	ext::DirectoryError,
	gate::PublicMessage,
	rendezvous::RendezvousError,
	store::StoreError,
	token::TokenError,
};

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Canonical gate error exposed by public APIs.
///
/// `Display` output is meant for operators. Untrusted callers only ever see
/// [`Error::public_message`].
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Token or one-time-password failure.
	#[error(transparent)]
	Token(#[from] TokenError),
	/// Rate-limited delivery failure.
	#[error(transparent)]
	Dispatch(#[from] DispatchError),
	/// Identity lookup failure.
	#[error(transparent)]
	Directory(#[from] DirectoryError),
	/// Approval wait ended without an answer.
	#[error(transparent)]
	Rendezvous(#[from] RendezvousError),

	/// None of the configured channels maps to a registered transport.
	#[error("No message transport is configured for channels {channels:?}.")]
	NoTransport {
		/// Channel names that were tried, in order.
		channels: Vec<String>,
	},
	/// The requested flow is not the one this gate runs.
	#[error("Flow `{flow}` is not enabled on this gate.")]
	FlowDisabled {
		/// Flow requested by the caller.
		flow: Flow,
	},
}
impl Error {
	/// Collapses the error into the opaque message shown to untrusted callers.
	pub fn public_message(&self) -> PublicMessage {
		match self {
			Self::Directory(_) => PublicMessage::UnknownUser,
			Self::Token(TokenError::InvalidCode | TokenError::AlreadyRegistered { .. })
			| Self::FlowDisabled { .. } => PublicMessage::Forbidden,
			Self::Token(TokenError::Store(e)) | Self::Storage(e) if e.is_absent() =>
				PublicMessage::Forbidden,
			Self::Rendezvous(_) | Self::Token(TokenError::AlreadyPending) => PublicMessage::Reload,
			_ => PublicMessage::Internal,
		}
	}

	/// Returns `true` when the failure points at the gate itself rather than the caller.
	pub fn is_internal(&self) -> bool {
		matches!(self.public_message(), PublicMessage::Internal)
			|| matches!(self, Self::Directory(DirectoryError::Connection { .. }))
	}
}

/// Configuration and validation failures raised while assembling a gate.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// Settings JSON could not be decoded.
	#[error("Settings are invalid: {source}.")]
	Parse {
		/// Path-aware decoding failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
	/// `issuer_base` must be an absolute URL.
	#[error("The issuer_base must be an absolute URL such as https://auth.example.com.")]
	InvalidIssuerBase {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// OTP mode requires an issuer label.
	#[error("The otp operation mode requires an issuer.")]
	MissingIssuer,
	/// OTP mode requires a channel that delivers registration links.
	#[error("The otp operation mode requires otp.channel to name a registered transport.")]
	MissingOtpChannel,
	/// Burst must admit at least one send.
	#[error("The messenger burst must be at least 1.")]
	InvalidBurst,
	/// Rate period must be positive.
	#[error("The messenger rate must be greater than zero.")]
	InvalidRate,
	/// Duration string could not be parsed.
	#[error("Duration `{value}` is invalid; use seconds or a value like 90s, 15m, 10h, 1d.")]
	InvalidDuration {
		/// Raw value that failed to parse.
		value: String,
	},
	/// The selected store backend was compiled out.
	#[error("Store backend `{kind}` is not available in this build.")]
	UnsupportedStore {
		/// Backend tag from the settings.
		kind: &'static str,
	},
	/// A collaborator required by the builder was not supplied.
	#[error("The gate builder is missing the {name} collaborator.")]
	MissingCollaborator {
		/// Collaborator label.
		name: &'static str,
	},
}
