//! Identity lookup contract.

// self
use crate::_prelude::*;

/// Boxed future returned by [`UserDirectory::search`].
pub type DirectoryFuture<'a> = Pin<Box<dyn Future<Output = Result<UserEntry, DirectoryError>> + 'a + Send>>;

/// Resolves user identifiers to contact details.
///
/// Implementations backed by files or remote directories refresh their snapshot in their own
/// background task; `search` only reads the current view.
pub trait UserDirectory
where
	Self: Send + Sync,
{
	/// Looks up a single user.
	fn search<'a>(&'a self, uid: &'a str) -> DirectoryFuture<'a>;
}

/// Contact details of a resolved user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
	/// Stable user identifier.
	pub uid: String,
	/// Mail address.
	pub email: String,
	/// Mobile number for short messages.
	pub mobile: String,
	/// Display name.
	pub name: String,
}

/// Directory lookup failures.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum DirectoryError {
	/// No user matches the identifier.
	#[error("User `{uid}` does not exist.")]
	NoUser {
		/// Identifier that was searched.
		uid: String,
	},
	/// The directory could not be reached.
	#[error("Directory connection failed: {message}.")]
	Connection {
		/// Human-readable error payload.
		message: String,
	},
}
