//! Observability helpers for gate flows.
//!
//! Every gate operation runs inside an `access_gate.flow` span carrying the `flow` and `stage`
//! fields. With the `metrics` feature, each attempt/success/failure also increments the
//! `access_gate_flow_total` counter labeled by `flow` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// crates.io
use sha2::{Digest, Sha256};
// self
use crate::{_prelude::*, config::Flow};

const FINGERPRINT_BYTES: usize = 8;

/// Flow kinds observed by the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// Numeric code delivered out of band.
	Token,
	/// Time-based one-time password check.
	Otp,
	/// Human-approved link.
	Link,
	/// Authenticator registration.
	Registration,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::Token => "token",
			FlowKind::Otp => "otp",
			FlowKind::Link => "link",
			FlowKind::Registration => "registration",
		}
	}
}
impl From<Flow> for FlowKind {
	fn from(flow: Flow) -> Self {
		match flow {
			Flow::Token => FlowKind::Token,
			Flow::Otp => FlowKind::Otp,
			Flow::Link => FlowKind::Link,
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to a gate operation.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure or denial returned to the caller.
	Failure,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Short SHA-256 fingerprint for logging secrets (codes, tokens, keys) without revealing them.
pub fn fingerprint(secret: &str) -> String {
	let digest = Sha256::digest(secret.as_bytes());

	digest.iter().take(FINGERPRINT_BYTES).map(|byte| format!("{byte:02x}")).collect()
}
