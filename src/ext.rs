//! Collaborator contracts consumed by the gate.
//!
//! The crate ships no directory, transport, or whitelist adapters. Surrounding services plug
//! in their own LDAP/file directories, mail/SMS transports, and network allow-lists by
//! implementing these traits.

pub mod directory;
pub mod notifier;
pub mod whitelist;

pub use directory::*;
pub use notifier::*;
pub use whitelist::*;
