//! Token-bucket throttle in front of a [`Notifier`].
//!
//! A ticker adds one permit per period into a buffer holding at most `burst` permits (the
//! buffer starts full). A single worker drains the request queue in submission order, waits
//! for a permit, and forwards the message, so sends never overlap on one notifier.
//!
//! Callers may give up while queued: dropping the future returned by
//! [`RateLimitedDispatcher::send`] closes its reply channel and the worker skips the request
//! without spending a permit on it.

// crates.io
use tokio::{
	sync::{
		mpsc::{self, error::TrySendError},
		oneshot,
	},
	time::{self as tokio_time, Instant, MissedTickBehavior},
};
// self
use crate::{
	_prelude::*,
	ext::{Addressable, Notifier, NotifyError},
};

/// Delivery failures surfaced to callers.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum DispatchError {
	/// The dispatcher worker is gone.
	#[error("Dispatcher `{channel}` is closed.")]
	Closed {
		/// Channel the dispatcher serves.
		channel: String,
	},
	/// The notifier rejected the message.
	#[error(transparent)]
	Notify(#[from] NotifyError),
}

/// Message forwarded to the notifier once a permit is available.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
	/// Sender and recipient block.
	pub address: Addressable,
	/// Subject line.
	pub subject: String,
	/// SMS-sized text.
	pub short_message: String,
	/// Long-form text.
	pub body: String,
}

/// Thread-safe counters for dispatched messages.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
	sent: AtomicU64,
	failed: AtomicU64,
	cancelled: AtomicU64,
}
impl DispatchMetrics {
	/// Messages the notifier accepted.
	pub fn sent(&self) -> u64 {
		self.sent.load(Ordering::Relaxed)
	}

	/// Messages the notifier rejected.
	pub fn failed(&self) -> u64 {
		self.failed.load(Ordering::Relaxed)
	}

	/// Requests abandoned by their callers before a permit was spent.
	pub fn cancelled(&self) -> u64 {
		self.cancelled.load(Ordering::Relaxed)
	}

	fn record_sent(&self) {
		self.sent.fetch_add(1, Ordering::Relaxed);
	}

	fn record_failed(&self) {
		self.failed.fetch_add(1, Ordering::Relaxed);
	}

	fn record_cancelled(&self) {
		self.cancelled.fetch_add(1, Ordering::Relaxed);
	}
}

struct SendRequest {
	message: OutboundMessage,
	reply: oneshot::Sender<Result<String, DispatchError>>,
}

/// Rate-limited, order-preserving front for one notifier channel.
///
/// Must be created inside a tokio runtime; dropping the last handle stops the worker and
/// the ticker.
#[derive(Clone, Debug)]
pub struct RateLimitedDispatcher {
	channel: String,
	queue: mpsc::UnboundedSender<SendRequest>,
	metrics: Arc<DispatchMetrics>,
}
impl RateLimitedDispatcher {
	/// Spawns the ticker and worker for `notifier`.
	pub fn spawn(
		channel: impl Into<String>,
		notifier: Arc<dyn Notifier>,
		rate: Duration,
		burst: usize,
	) -> Self {
		let channel = channel.into();
		let burst = burst.max(1);
		let (queue, requests) = mpsc::unbounded_channel();
		let (permit_tx, permit_rx) = mpsc::channel(burst);
		let metrics = Arc::new(DispatchMetrics::default());

		for _ in 0..burst {
			let _ = permit_tx.try_send(());
		}

		tokio::spawn(run_ticker(permit_tx.clone(), rate));
		tokio::spawn(run_worker(
			channel.clone(),
			notifier,
			requests,
			permit_tx,
			permit_rx,
			metrics.clone(),
		));

		tracing::debug!(channel = %channel, ?rate, burst, "Started rate-limited dispatcher.");

		Self { channel, queue, metrics }
	}

	/// Channel name this dispatcher serves.
	pub fn channel(&self) -> &str {
		&self.channel
	}

	/// Counters for this dispatcher.
	pub fn metrics(&self) -> &DispatchMetrics {
		&self.metrics
	}

	/// Queues a message and waits until the notifier handled it.
	pub async fn send(&self, message: OutboundMessage) -> Result<String, DispatchError> {
		let (reply, response) = oneshot::channel();

		self.queue
			.send(SendRequest { message, reply })
			.map_err(|_| DispatchError::Closed { channel: self.channel.clone() })?;

		response.await.map_err(|_| DispatchError::Closed { channel: self.channel.clone() })?
	}
}

async fn run_ticker(permits: mpsc::Sender<()>, rate: Duration) {
	let rate = rate.max(Duration::from_millis(1));
	let mut ticker = tokio_time::interval_at(Instant::now() + rate, rate);

	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		ticker.tick().await;

		// A full buffer drops the tick; a closed one means the worker is gone.
		if let Err(TrySendError::Closed(())) = permits.try_send(()) {
			break;
		}
	}
}

async fn run_worker(
	channel: String,
	notifier: Arc<dyn Notifier>,
	mut requests: mpsc::UnboundedReceiver<SendRequest>,
	refund: mpsc::Sender<()>,
	mut permits: mpsc::Receiver<()>,
	metrics: Arc<DispatchMetrics>,
) {
	while let Some(SendRequest { message, mut reply }) = requests.recv().await {
		if reply.is_closed() {
			metrics.record_cancelled();

			continue;
		}

		tokio::select! {
			biased;

			_ = reply.closed() => {
				metrics.record_cancelled();

				continue;
			},
			permit = permits.recv() => if permit.is_none() {
				let _ = reply.send(Err(DispatchError::Closed { channel: channel.clone() }));

				break;
			},
		}

		if reply.is_closed() {
			let _ = refund.try_send(());

			metrics.record_cancelled();

			continue;
		}

		let result = notifier
			.send(&message.address, &message.subject, &message.short_message, &message.body)
			.await;

		match &result {
			Ok(_) => metrics.record_sent(),
			Err(e) => {
				metrics.record_failed();
				tracing::warn!(channel = %channel, error = %e, "Notifier rejected a message.");
			},
		}

		let _ = reply.send(result.map_err(DispatchError::from));
	}

	tracing::debug!(channel = %channel, "Dispatcher worker stopped.");
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::_preludet::RecordingNotifier;

	fn message(n: usize) -> OutboundMessage {
		OutboundMessage {
			address: Addressable { to_mail: format!("user{n}@example.com"), ..Default::default() },
			subject: "Your login token".into(),
			short_message: format!("{n}"),
			body: format!("Your token: {n}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn refused_messages_are_counted_and_returned() {
		let notifier = Arc::new(RecordingNotifier::default());
		let dispatcher =
			RateLimitedDispatcher::spawn("email", notifier.clone(), Duration::from_secs(1), 2);

		notifier.fail_sends(true);

		assert!(matches!(dispatcher.send(message(0)).await, Err(DispatchError::Notify(_))));
		assert_eq!(dispatcher.metrics().failed(), 1);
		assert_eq!(dispatcher.metrics().sent(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn sends_preserve_submission_order() {
		let notifier = Arc::new(RecordingNotifier::default());
		let dispatcher =
			RateLimitedDispatcher::spawn("email", notifier.clone(), Duration::from_millis(10), 1);

		for n in 0..4 {
			dispatcher.send(message(n)).await.expect("Send should succeed.");
		}

		let order = notifier.sent().into_iter().map(|sent| sent.short_message).collect::<Vec<_>>();

		assert_eq!(order, ["0", "1", "2", "3"]);
	}
}
