//! Single-use, single-waiter rendezvous used to suspend an approval request until a human
//! answers or the deadline fires.
//!
//! A [`Rendezvous`] owns the receiving half of a one-shot handoff. Every other party (the
//! answering request, the deadline timer, a store's remote listener) holds a
//! [`RendezvousHandle`] onto the same guarded slot. Delivering an answer and closing on
//! deadline both go through one `take`, so exactly one of them can ever succeed.

// crates.io
use tokio::sync::oneshot;
// self
use crate::_prelude::*;

/// Answer delivered to a waiting approval request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Answer {
	/// The approver allowed the request.
	Yes,
	/// The approver denied the request.
	No,
}
impl Answer {
	/// Maps a boolean decision onto an answer.
	pub const fn from_bool(yes: bool) -> Self {
		if yes { Answer::Yes } else { Answer::No }
	}

	/// Parses a wire value; anything other than a case-insensitive `yes` means no.
	pub fn parse(value: &str) -> Self {
		Self::from_bool(value.trim().eq_ignore_ascii_case("yes"))
	}

	/// Returns the wire value.
	pub const fn as_str(self) -> &'static str {
		match self {
			Answer::Yes => "yes",
			Answer::No => "no",
		}
	}
}
impl Display for Answer {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Failures observed on either side of a rendezvous.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum RendezvousError {
	/// The rendezvous closed without an answer (deadline fired or the answering side died).
	#[error("Approval wait ended without an answer.")]
	Timeout,
	/// An answer was already delivered, or the rendezvous was already closed.
	#[error("Rendezvous is already resolved.")]
	AlreadyResolved,
}

#[derive(Debug)]
struct Slot {
	sender: Mutex<Option<oneshot::Sender<Answer>>>,
}
impl Slot {
	fn take(&self) -> Option<oneshot::Sender<Answer>> {
		self.sender.lock().take()
	}
}

/// Answering side of a [`Rendezvous`]; cheap to clone and safe to share across tasks.
#[derive(Clone, Debug)]
pub struct RendezvousHandle {
	slot: Arc<Slot>,
}
impl RendezvousHandle {
	/// Delivers an answer. Only the first of [`say`](Self::say) / [`close`](Self::close) wins.
	pub fn say(&self, answer: Answer) -> Result<(), RendezvousError> {
		let sender = self.slot.take().ok_or(RendezvousError::AlreadyResolved)?;

		// A dropped receiver means the waiter gave up; the slot is still consumed.
		sender.send(answer).map_err(|_| RendezvousError::AlreadyResolved)
	}

	/// Closes the rendezvous without an answer; returns `true` if it was still open.
	pub fn close(&self) -> bool {
		self.slot.take().is_some()
	}

	/// Returns `true` while neither an answer nor a close has happened.
	pub fn is_open(&self) -> bool {
		self.slot.sender.lock().is_some()
	}

	/// Returns `true` if both handles refer to the same rendezvous.
	pub fn same_as(&self, other: &RendezvousHandle) -> bool {
		Arc::ptr_eq(&self.slot, &other.slot)
	}
}

/// Waiting side of a single-use rendezvous bound to a key.
#[derive(Debug)]
pub struct Rendezvous {
	key: String,
	receiver: oneshot::Receiver<Answer>,
	handle: RendezvousHandle,
}
impl Rendezvous {
	/// Opens a new rendezvous for the provided key.
	pub fn new(key: impl Into<String>) -> Self {
		let (sender, receiver) = oneshot::channel();
		let handle = RendezvousHandle { slot: Arc::new(Slot { sender: Mutex::new(Some(sender)) }) };

		Self { key: key.into(), receiver, handle }
	}

	/// Returns an answering handle onto this rendezvous.
	pub fn handle(&self) -> RendezvousHandle {
		self.handle.clone()
	}

	/// Delivers an answer through this rendezvous' own handle.
	pub fn say(&self, answer: Answer) -> Result<(), RendezvousError> {
		self.handle.say(answer)
	}

	/// Suspends until an answer arrives or the rendezvous is closed.
	pub async fn wait_for(self) -> Result<Answer, RendezvousError> {
		self.receiver.await.map_err(|_| RendezvousError::Timeout)
	}

	/// Closes the rendezvous once `ttl` elapses unless it resolved earlier; `on_fire` runs
	/// before the close attempt so owners can drop their bookkeeping.
	pub fn arm_deadline<F>(&self, ttl: Duration, on_fire: F)
	where
		F: 'static + Send + FnOnce(&RendezvousHandle),
	{
		let handle = self.handle();
		let key = self.key.clone();

		tokio::spawn(async move {
			tokio::time::sleep(ttl).await;
			on_fire(&handle);

			if handle.close() {
				tracing::debug!(key = %key, "Rendezvous deadline fired before an answer arrived.");
			}
		});
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn answers_parse_leniently() {
		assert_eq!(Answer::parse("yes"), Answer::Yes);
		assert_eq!(Answer::parse(" YES "), Answer::Yes);
		assert_eq!(Answer::parse("no"), Answer::No);
		assert_eq!(Answer::parse("maybe"), Answer::No);
		assert_eq!(Answer::from_bool(true).as_str(), "yes");
	}

	#[tokio::test]
	async fn answer_is_delivered_once() {
		let rendezvous = Rendezvous::new("block:tok");
		let handle = rendezvous.handle();

		handle.say(Answer::Yes).expect("First answer should be delivered.");

		assert_eq!(handle.say(Answer::No), Err(RendezvousError::AlreadyResolved));
		assert!(!handle.close(), "A resolved rendezvous cannot be closed again.");
		assert_eq!(rendezvous.wait_for().await, Ok(Answer::Yes));
	}

	#[tokio::test]
	async fn close_wins_over_late_answer() {
		let rendezvous = Rendezvous::new("block:tok");
		let handle = rendezvous.handle();

		assert!(handle.close());
		assert!(!handle.is_open());
		assert_eq!(rendezvous.say(Answer::Yes), Err(RendezvousError::AlreadyResolved));
		assert_eq!(rendezvous.wait_for().await, Err(RendezvousError::Timeout));
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_closes_an_unanswered_rendezvous() {
		let rendezvous = Rendezvous::new("block:tok");
		let handle = rendezvous.handle();
		let fired = Arc::new(AtomicBool::new(false));
		let fired_flag = fired.clone();

		rendezvous.arm_deadline(Duration::from_secs(5), move |_| {
			fired_flag.store(true, Ordering::SeqCst);
		});

		assert_eq!(rendezvous.wait_for().await, Err(RendezvousError::Timeout));
		assert!(fired.load(Ordering::SeqCst));
		assert_eq!(handle.say(Answer::Yes), Err(RendezvousError::AlreadyResolved));
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn racing_answer_and_close_resolve_exactly_once() {
		for _ in 0..200 {
			let rendezvous = Rendezvous::new("block:race");
			let answerer = rendezvous.handle();
			let closer = rendezvous.handle();
			let say = tokio::spawn(async move { answerer.say(Answer::Yes).is_ok() });
			let close = tokio::spawn(async move { closer.close() });
			let said = say.await.expect("Answer task should not panic.");
			let closed = close.await.expect("Close task should not panic.");
			let waited = rendezvous.wait_for().await;

			assert!(said ^ closed, "Exactly one side must win (said={said}, closed={closed}).");
			assert_eq!(waited.is_ok(), said);
		}
	}
}
