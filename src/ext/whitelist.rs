//! Network allow-list contract.

// std
use std::net::IpAddr;

/// Addresses that bypass every challenge.
pub trait Whitelist
where
	Self: Send + Sync,
{
	/// Returns `true` when `ip` is always allowed.
	fn is_allowed(&self, ip: IpAddr) -> bool;
}

/// Whitelist that allows nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenyAll;
impl Whitelist for DenyAll {
	fn is_allowed(&self, _ip: IpAddr) -> bool {
		false
	}
}
