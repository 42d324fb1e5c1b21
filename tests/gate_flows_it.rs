// std
use std::net::IpAddr;
// crates.io
use tokio::time;
// self
use access_gate::{
	_preludet::*,
	clock::{Clock, ManualClock},
	config::Flow,
	gate::{AccessGate, BlockInfo, ChallengeDescriptor, Proof, ProofOutcome, PublicMessage},
	store::{KvStore, decode_record, keys},
	token::OtpRegistration,
};

const TOKEN_SETTINGS: &str = r#"{
	"operation_mode": "token",
	"issuer": "acme",
	"issuer_base": "https://auth.example.com",
	"spacing": "-",
	"channels": ["sms", "email"],
	"access_duration": "10h",
	"token_duration": 60
}"#;
const LINK_SETTINGS: &str = r#"{
	"operation_mode": "link",
	"issuer": "acme",
	"issuer_base": "https://auth.example.com",
	"channels": ["email"],
	"token_duration": 60
}"#;
const OTP_SETTINGS: &str = r#"{
	"operation_mode": "otp",
	"issuer": "acme",
	"issuer_base": "https://auth.example.com",
	"channels": ["email"],
	"otp": {"channel": "email", "timeout": "15m"}
}"#;

fn client_ip() -> IpAddr {
	"10.0.0.1".parse().expect("IP fixture should parse.")
}

#[tokio::test]
async fn numeric_codes_grant_access_until_the_grant_expires() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, notifier) = build_memory_gate(settings(TOKEN_SETTINGS), clock.clone()).await;
	let ip = client_ip();

	assert!(!gate.is_authorized(ip).await.expect("Lookup should run."));

	let ChallengeDescriptor::NumericCode { code: Some(code), .. } =
		gate.begin_challenge(Flow::Token, "alice", ip).await.expect("Challenge should start.")
	else {
		panic!("A fresh challenge must issue a code.");
	};
	let sent = notifier.last().expect("The code should have been delivered.");
	let spaced = code.chars().map(String::from).collect::<Vec<_>>().join("-");

	assert_eq!(sent.short_message, spaced);
	assert_eq!(sent.address.to_mail, "alice@example.com");
	assert!(sent.body.contains(&code));

	let repeated =
		gate.begin_challenge(Flow::Token, "alice", ip).await.expect("Repeat should succeed.");

	assert!(matches!(repeated, ChallengeDescriptor::NumericCode { code: None, .. }));
	assert_eq!(notifier.sent().len(), 1, "A pending code must not be sent twice.");

	let outcome = gate
		.submit_proof("alice", ip, Proof::NumericCode { expected: code.clone(), presented: spaced })
		.await
		.expect("Proof should be evaluated.");

	assert_eq!(outcome, ProofOutcome::granted());
	assert!(gate.is_authorized(ip).await.expect("Lookup should run."));
	assert!(gate.tokens().check_pending_token("alice").await.is_err());

	clock.advance(Duration::from_secs(10 * 60 * 60 + 1));

	assert!(!gate.is_authorized(ip).await.expect("Lookup should run."));
}

#[tokio::test]
async fn wrong_or_unsolicited_codes_are_forbidden() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, _) = build_memory_gate(settings(TOKEN_SETTINGS), clock).await;
	let ip = client_ip();
	let unsolicited = gate
		.submit_proof(
			"alice",
			ip,
			Proof::NumericCode { expected: "123456".into(), presented: "123456".into() },
		)
		.await
		.expect("Proof should be evaluated.");

	assert_eq!(unsolicited, ProofOutcome::denied(PublicMessage::Forbidden));

	let ChallengeDescriptor::NumericCode { code: Some(code), .. } =
		gate.begin_challenge(Flow::Token, "alice", ip).await.expect("Challenge should start.")
	else {
		panic!("A fresh challenge must issue a code.");
	};
	let wrong = if code == "000000" { "111111" } else { "000000" };
	let outcome = gate
		.submit_proof("alice", ip, Proof::NumericCode { expected: code, presented: wrong.into() })
		.await
		.expect("Proof should be evaluated.");

	assert_eq!(outcome, ProofOutcome::denied(PublicMessage::Forbidden));
	assert!(!gate.is_authorized(ip).await.expect("Lookup should run."));
}

#[tokio::test]
async fn unknown_users_and_missing_transports_surface_opaque_messages() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, _) = build_memory_gate(settings(TOKEN_SETTINGS), clock.clone()).await;
	let err = gate
		.begin_challenge(Flow::Token, "mallory", client_ip())
		.await
		.expect_err("Unknown users must be refused.");

	assert_eq!(err.public_message(), PublicMessage::UnknownUser);

	let sms_only = settings(
		r#"{"issuer": "acme", "issuer_base": "https://auth.example.com", "channels": ["sms"]}"#,
	);
	let (gate, _, _) = build_memory_gate(sms_only, clock).await;
	let err = gate
		.begin_challenge(Flow::Token, "alice", client_ip())
		.await
		.expect_err("No transport matches the configured channels.");

	assert!(matches!(err, Error::NoTransport { .. }));
	assert_eq!(err.public_message(), PublicMessage::Internal);
	assert!(
		gate.tokens().check_pending_token("alice").await.is_err(),
		"An undelivered code must not stay pending."
	);
}

#[tokio::test]
async fn failed_deliveries_release_the_pending_code() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, notifier) = build_memory_gate(settings(TOKEN_SETTINGS), clock).await;

	notifier.fail_sends(true);

	let err = gate
		.begin_challenge(Flow::Token, "alice", client_ip())
		.await
		.expect_err("A refused delivery must fail the challenge.");

	assert!(matches!(err, Error::Dispatch(_)));

	notifier.fail_sends(false);

	let retry =
		gate.begin_challenge(Flow::Token, "alice", client_ip()).await.expect("Retry should run.");

	assert!(matches!(retry, ChallengeDescriptor::NumericCode { code: Some(_), .. }));
}

#[tokio::test]
async fn whitelisted_addresses_skip_every_challenge() {
	let ip = client_ip();
	let gate = AccessGate::builder(settings(TOKEN_SETTINGS))
		.store(Arc::new(access_gate::store::MemoryStore::new(Arc::new(ManualClock::starting_now()))))
		.directory(Arc::new(StaticDirectory::new([user("alice")])))
		.whitelist(Arc::new(StaticWhitelist::new([ip])))
		.build()
		.await
		.expect("Gate should build.");

	assert!(gate.is_authorized(ip).await.expect("Lookup should run."));
	assert_eq!(
		gate.begin_challenge(Flow::Token, "alice", ip).await.expect("Challenge should run."),
		ChallengeDescriptor::Granted
	);
}

#[tokio::test(start_paused = true)]
async fn approved_links_grant_the_waiting_request() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, notifier) = build_memory_gate(settings(LINK_SETTINGS), clock).await;
	let ip = client_ip();
	let ChallengeDescriptor::Approval { token } =
		gate.begin_challenge(Flow::Link, "alice", ip).await.expect("Challenge should start.")
	else {
		panic!("Link mode must hand out an approval token.");
	};
	let sent = notifier.last().expect("The link should have been delivered.");

	assert!(sent.short_message.contains(&format!("https://auth.example.com/allow?t={token}")));
	assert_eq!(
		gate.render_approval_prompt(&token).await.expect("Prompt lookup should run."),
		Some(BlockInfo { user: "alice".into(), ip: ip.to_string() })
	);

	let (outcome, answered) = tokio::join!(
		gate.submit_proof("alice", ip, Proof::Approval { token: token.clone() }),
		async {
			time::sleep(Duration::from_millis(100)).await;

			gate.answer_approval(&token, true).await
		},
	);

	answered.expect("Answering should succeed.");

	assert_eq!(outcome.expect("Wait should resolve."), ProofOutcome::granted());
	assert!(gate.is_authorized(ip).await.expect("Lookup should run."));
}

#[tokio::test(start_paused = true)]
async fn unanswered_links_ask_the_client_to_reload() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, _) = build_memory_gate(settings(LINK_SETTINGS), clock).await;
	let ip = client_ip();
	let ChallengeDescriptor::Approval { token } =
		gate.begin_challenge(Flow::Link, "alice", ip).await.expect("Challenge should start.")
	else {
		panic!("Link mode must hand out an approval token.");
	};
	let (outcome, declined) = tokio::join!(
		gate.submit_proof("alice", ip, Proof::Approval { token: token.clone() }),
		async {
			time::sleep(Duration::from_millis(100)).await;

			gate.answer_approval(&token, false).await
		},
	);

	declined.expect("Declining should succeed.");

	assert_eq!(
		outcome.expect("Wait should resolve."),
		ProofOutcome::denied(PublicMessage::Reload)
	);
	assert!(!gate.is_authorized(ip).await.expect("Lookup should run."));

	gate.answer_approval(&token, true).await.expect("Late approvals are dropped quietly.");

	assert!(!gate.is_authorized(ip).await.expect("Lookup should run."));
}

#[tokio::test(start_paused = true)]
async fn approval_tokens_are_bound_to_their_user() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, _) = build_memory_gate(settings(LINK_SETTINGS), clock).await;
	let ChallengeDescriptor::Approval { token } =
		gate.begin_challenge(Flow::Link, "alice", client_ip()).await.expect("Challenge.")
	else {
		panic!("Link mode must hand out an approval token.");
	};
	let outcome = gate
		.submit_proof("bob", client_ip(), Proof::Approval { token })
		.await
		.expect("Proof should be evaluated.");

	assert_eq!(outcome, ProofOutcome::denied(PublicMessage::Forbidden));

	let unknown = gate
		.submit_proof("alice", client_ip(), Proof::Approval { token: "missing".into() })
		.await
		.expect("Proof should be evaluated.");

	assert_eq!(unknown, ProofOutcome::denied(PublicMessage::Forbidden));
}

#[tokio::test]
async fn otp_users_register_then_sign_in_with_authenticator_codes() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, store, notifier) = build_memory_gate(settings(OTP_SETTINGS), clock.clone()).await;
	let ip = client_ip();

	assert_eq!(
		gate.begin_challenge(Flow::Otp, "alice", ip).await.expect("Challenge should run."),
		ChallengeDescriptor::OtpRequired { register: true }
	);
	assert!(gate.begin_registration("alice").await.expect("Registration should start."));
	assert!(
		!gate.begin_registration("alice").await.expect("Repeat should run."),
		"A pending registration must not be re-sent."
	);
	assert_eq!(notifier.sent().len(), 1);

	let link = notifier.last().expect("The signup link should have been delivered.").short_message;
	let (_, registration_key) =
		link.split_once("#/signup/alice/").expect("The link should carry the registration key.");
	let image = gate.registration_image("alice", registration_key).await.expect("QR image.");

	assert!(!image.to_base64().is_empty());

	let record_key = keys::temporary_otp("alice", registration_key);
	let raw = store.get_with_ttl(&record_key).await.expect("Temporary registration is live.");
	let registration: OtpRegistration =
		decode_record(&record_key, &raw).expect("Temporary registration should decode.");
	let code = registration.code_at(clock.now_utc()).expect("Code should generate.");

	gate.complete_registration("alice", registration_key, &code)
		.await
		.expect("The current code should confirm the registration.");

	assert_eq!(
		gate.begin_challenge(Flow::Otp, "alice", ip).await.expect("Challenge should run."),
		ChallengeDescriptor::OtpRequired { register: false }
	);
	assert!(!gate.begin_registration("alice").await.expect("Registered users are skipped."));

	let wrong = if code == "000000" { "111111" } else { "000000" };

	assert_eq!(
		gate.submit_proof("alice", ip, Proof::OneTimeCode(wrong.into())).await.expect("Proof."),
		ProofOutcome::denied(PublicMessage::Forbidden)
	);
	assert_eq!(
		gate.submit_proof("alice", ip, Proof::OneTimeCode(code)).await.expect("Proof."),
		ProofOutcome::granted()
	);
	assert!(gate.is_authorized(ip).await.expect("Lookup should run."));
}

#[tokio::test]
async fn registrations_with_a_wrong_code_stay_pending() {
	let clock = Arc::new(ManualClock::starting_now());
	let (gate, _, notifier) = build_memory_gate(settings(OTP_SETTINGS), clock).await;

	assert!(gate.begin_registration("alice").await.expect("Registration should start."));

	let link = notifier.last().expect("The signup link should have been delivered.").short_message;
	let (_, registration_key) =
		link.split_once("#/signup/alice/").expect("The link should carry the registration key.");
	let err = gate
		.complete_registration("alice", registration_key, "not-a-code")
		.await
		.expect_err("A wrong code must not confirm the registration.");

	assert_eq!(err.public_message(), PublicMessage::Forbidden);
	assert!(gate.tokens().has_pending_registration("alice").await.expect("Lookup should run."));
	assert!(!gate.tokens().has_confirmed_registration("alice").await.expect("Lookup should run."));
}
