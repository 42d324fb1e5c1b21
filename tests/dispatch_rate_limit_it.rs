// crates.io
use tokio::{task::JoinSet, time};
// self
use access_gate::{
	_preludet::*,
	dispatch::{OutboundMessage, RateLimitedDispatcher},
	ext::Addressable,
};

fn message(n: usize) -> OutboundMessage {
	OutboundMessage {
		address: Addressable { to_mail: format!("user{n}@example.com"), ..Default::default() },
		subject: "Your login token".into(),
		short_message: n.to_string(),
		body: format!("Your token: {n}"),
	}
}

fn spawn_sends(dispatcher: &RateLimitedDispatcher, count: usize) -> JoinSet<String> {
	let mut sends = JoinSet::new();

	for n in 0..count {
		let dispatcher = dispatcher.clone();

		sends.spawn(async move {
			dispatcher.send(message(n)).await.expect("Queued send should succeed.")
		});
	}

	sends
}

#[tokio::test(start_paused = true)]
async fn a_full_bucket_sends_everything_at_once() {
	let notifier = Arc::new(RecordingNotifier::default());
	let dispatcher = RateLimitedDispatcher::spawn("email", notifier.clone(), Duration::from_secs(1), 20);
	let sends = spawn_sends(&dispatcher, 5);

	time::timeout(Duration::from_secs(3), sends.join_all())
		.await
		.expect("All five sends should complete within three seconds.");

	assert_eq!(notifier.sent().len(), 5);
	assert_eq!(dispatcher.metrics().sent(), 5);
}

#[tokio::test(start_paused = true)]
async fn a_small_bucket_releases_one_send_per_period() {
	let notifier = Arc::new(RecordingNotifier::default());
	let dispatcher = RateLimitedDispatcher::spawn("sms", notifier.clone(), Duration::from_secs(1), 2);
	let sends = spawn_sends(&dispatcher, 5);

	time::sleep(Duration::from_millis(100)).await;

	assert_eq!(notifier.sent().len(), 2, "Only the initial burst may go out immediately.");

	time::sleep(Duration::from_secs(3)).await;

	assert_eq!(notifier.sent().len(), 5);
	assert_eq!(sends.join_all().await.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn callers_giving_up_do_not_spend_permits() {
	let notifier = Arc::new(RecordingNotifier::default());
	let dispatcher = RateLimitedDispatcher::spawn("email", notifier.clone(), Duration::from_secs(1), 1);

	dispatcher.send(message(0)).await.expect("The burst permit should cover the first send.");

	let abandoned = time::timeout(Duration::from_millis(100), dispatcher.send(message(1))).await;

	assert!(abandoned.is_err(), "The second send must still be waiting for a permit.");

	time::sleep(Duration::from_millis(10)).await;

	assert_eq!(dispatcher.metrics().cancelled(), 1);

	dispatcher.send(message(2)).await.expect("A later send should get the next permit.");

	let delivered =
		notifier.sent().into_iter().map(|sent| sent.short_message).collect::<Vec<_>>();

	assert_eq!(delivered, ["0", "2"]);
	assert_eq!(dispatcher.metrics().sent(), 2);
}
