//! Outbound message transport contract.

// self
use crate::_prelude::*;

/// Boxed future returned by [`Notifier::send`].
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<String, NotifyError>> + 'a + Send>>;

/// Delivers a human-facing message over one channel (mail, SMS, chat, ...).
pub trait Notifier
where
	Self: Send + Sync,
{
	/// Sends a message and returns the transport's response text.
	///
	/// `short_message` suits SMS-sized channels; `body` is the long form.
	fn send<'a>(
		&'a self,
		address: &'a Addressable,
		subject: &'a str,
		short_message: &'a str,
		body: &'a str,
	) -> NotifyFuture<'a>;
}

/// Sender and recipient block handed to a [`Notifier`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressable {
	/// Sender mail address.
	pub from_mail: String,
	/// Sender display name.
	pub from_name: String,
	/// Recipient mail address.
	pub to_mail: String,
	/// Recipient mobile number.
	pub to_mobile: String,
	/// Recipient display name.
	pub to_name: String,
}

/// Transport failure reported by a [`Notifier`].
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Notifier failed: {message}.")]
pub struct NotifyError {
	/// Human-readable error payload.
	pub message: String,
}
impl NotifyError {
	/// Wraps a transport failure message.
	pub fn new(message: impl Into<String>) -> Self {
		Self { message: message.into() }
	}
}
