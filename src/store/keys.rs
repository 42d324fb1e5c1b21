//! Key namespaces shared by every gate component.

// std
use std::net::IpAddr;

/// Grant for a client address: `allow:<scope>:<ip>`.
pub fn grant(scope: &str, ip: IpAddr) -> String {
	format!("allow:{scope}:{ip}")
}

/// Pending numeric code or approval token: `tmptoken:<uid>:<issuer>`.
pub fn pending_token(uid: &str, issuer: &str) -> String {
	format!("tmptoken:{uid}:{issuer}")
}

/// Confirmed authenticator secret: `otp:<uid>:<issuer>`.
pub fn confirmed_otp(uid: &str, issuer: &str) -> String {
	format!("otp:{uid}:{issuer}")
}

/// Unconfirmed authenticator secret: `tmpotp:<uid>:<issuer or registration key>`.
pub fn temporary_otp(uid: &str, discriminator: &str) -> String {
	format!("tmpotp:{uid}:{discriminator}")
}

/// Approval request details: `blockinfo:<token>`.
pub fn block_info(token: &str) -> String {
	format!("blockinfo:{token}")
}

/// Approval rendezvous: `block:<token>`.
pub fn block(token: &str) -> String {
	format!("block:{token}")
}

/// Marker advertising a live waiter on shared backends.
pub fn waiter_marker(block_key: &str) -> String {
	format!("{block_key}:waiter")
}
