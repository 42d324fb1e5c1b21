//! Access decisions and challenge orchestration.
//!
//! [`AccessGate`] answers "is this client allowed?" and, when it is not, drives the configured
//! challenge flow end to end: numeric codes, authenticator codes, or human-approved links.
//! Every failure leaving the gate collapses to a [`PublicMessage`]; operator detail stays in
//! the logs.

pub mod builder;

pub use builder::AccessGateBuilder;

// std
use std::net::IpAddr;
// self
use crate::{
	_prelude::*,
	clock::Clock,
	config::{Flow, GateSettings},
	dispatch::{OutboundMessage, RateLimitedDispatcher},
	ext::{Addressable, UserDirectory, UserEntry, Whitelist},
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	rendezvous::{Answer, RendezvousError},
	store::{KvStore, StoreError, decode_record, encode_record, keys},
	token::{self, APPROVAL_TOKEN_BYTES, NUMERIC_CODE_LEN, ProvisioningImage, TokenError, TokenService},
};

/// Opaque message shown to untrusted callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicMessage {
	/// The proof was wrong, missing, or expired.
	Forbidden,
	/// The identity could not be resolved.
	UnknownUser,
	/// The client should reload and start over.
	Reload,
	/// The gate failed on its own side.
	Internal,
}
impl PublicMessage {
	/// Returns the text shown to the client.
	pub const fn as_str(self) -> &'static str {
		match self {
			PublicMessage::Forbidden => "Access denied.",
			PublicMessage::UnknownUser => "Unknown user.",
			PublicMessage::Reload => "Please reload.",
			PublicMessage::Internal => "Internal error.",
		}
	}
}
impl Display for PublicMessage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// What the gateway should present after a challenge was requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChallengeDescriptor {
	/// The client is already authorized.
	Granted,
	/// A numeric code is outstanding.
	NumericCode {
		/// When the outstanding code was issued.
		created_at: OffsetDateTime,
		/// The freshly issued code, to be sealed into client state; `None` when an earlier
		/// code is still pending and nothing was sent.
		code: Option<String>,
	},
	/// The client must present an authenticator code.
	OtpRequired {
		/// `true` when the user has no confirmed authenticator yet.
		register: bool,
	},
	/// An approval link was sent; the client should wait on `token`.
	Approval {
		/// Approval token identifying the request.
		token: String,
	},
}

/// Evidence presented on a follow-up request.
#[derive(Clone, PartialEq, Eq)]
pub enum Proof {
	/// Numeric code: the sealed expected value and what the user typed.
	NumericCode {
		/// Code issued by [`AccessGate::begin_challenge`].
		expected: String,
		/// Code presented by the user.
		presented: String,
	},
	/// Authenticator code.
	OneTimeCode(String),
	/// Wait for a human to approve the link identified by `token`.
	Approval {
		/// Approval token from [`ChallengeDescriptor::Approval`].
		token: String,
	},
}
impl Proof {
	/// Flow the proof belongs to.
	pub const fn flow(&self) -> Flow {
		match self {
			Proof::NumericCode { .. } => Flow::Token,
			Proof::OneTimeCode(_) => Flow::Otp,
			Proof::Approval { .. } => Flow::Link,
		}
	}
}
impl Debug for Proof {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Proof::NumericCode { .. } => f.write_str("Proof::NumericCode(..)"),
			Proof::OneTimeCode(_) => f.write_str("Proof::OneTimeCode(..)"),
			Proof::Approval { token } =>
				f.debug_struct("Proof::Approval").field("token", &obs::fingerprint(token)).finish(),
		}
	}
}

/// Result of [`AccessGate::submit_proof`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofOutcome {
	/// `true` when a grant was written.
	pub granted: bool,
	/// Message for the client when not granted.
	pub message: Option<PublicMessage>,
}
impl ProofOutcome {
	/// Access was granted.
	pub const fn granted() -> Self {
		Self { granted: true, message: None }
	}

	/// Access was not granted.
	pub const fn denied(message: PublicMessage) -> Self {
		Self { granted: false, message: Some(message) }
	}
}

/// Approval request details shown to the approver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
	/// User asking for access.
	pub user: String,
	/// Address the request came from.
	pub ip: String,
}

/// Stateful access decision core.
pub struct AccessGate {
	settings: GateSettings,
	issuer_base: Url,
	clock: Arc<dyn Clock>,
	store: Arc<dyn KvStore>,
	tokens: TokenService,
	directory: Arc<dyn UserDirectory>,
	whitelist: Arc<dyn Whitelist>,
	transports: HashMap<String, RateLimitedDispatcher>,
	flow_guards: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}
impl AccessGate {
	/// Starts building a gate for `settings`.
	pub fn builder(settings: GateSettings) -> AccessGateBuilder {
		AccessGateBuilder::new(settings)
	}

	/// Effective settings.
	pub fn settings(&self) -> &GateSettings {
		&self.settings
	}

	/// Token and registration bookkeeping shared with the gate.
	pub fn tokens(&self) -> &TokenService {
		&self.tokens
	}

	/// Rate-limited dispatcher registered under `channel`.
	pub fn transport(&self, channel: &str) -> Option<&RateLimitedDispatcher> {
		self.transports.get(channel)
	}

	/// Reports whether `ip` may pass without a challenge.
	pub async fn is_authorized(&self, ip: IpAddr) -> Result<bool> {
		if self.whitelist.is_allowed(ip) {
			tracing::debug!(%ip, "Address is whitelisted.");

			return Ok(true);
		}

		match self.store.get_with_ttl(&keys::grant(&self.settings.grant_scope, ip)).await {
			Ok(_) => Ok(true),
			Err(e) if e.is_absent() => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// Resolves `uid` and starts `flow` for a client at `ip`.
	pub async fn begin_challenge(
		&self,
		flow: Flow,
		uid: &str,
		ip: IpAddr,
	) -> Result<ChallengeDescriptor> {
		observe(flow.into(), "begin_challenge", self.begin_challenge_inner(flow, uid, ip), |_| true)
			.await
	}

	/// Validates proof from `uid` at `ip`; a successful proof grants `ip` access.
	///
	/// Wrong or expired proofs and approval timeouts are ordinary denials, not errors.
	pub async fn submit_proof(&self, uid: &str, ip: IpAddr, proof: Proof) -> Result<ProofOutcome> {
		observe(
			proof.flow().into(),
			"submit_proof",
			self.submit_proof_inner(uid, ip, &proof),
			|outcome: &ProofOutcome| outcome.granted,
		)
		.await
	}

	/// Looks up the approval request behind `token`, if it is still open.
	pub async fn render_approval_prompt(&self, token: &str) -> Result<Option<BlockInfo>> {
		self.block_info(token).await
	}

	/// Records the approver's decision.
	///
	/// Only an approval is forwarded; a refusal lets the waiter run into its deadline. An
	/// approval that finds no waiter (too late, or answered twice) is logged and dropped.
	pub async fn answer_approval(&self, token: &str, yes: bool) -> Result<()> {
		let fingerprint = obs::fingerprint(token);

		if !yes {
			tracing::info!(token = %fingerprint, "Approval declined.");

			return Ok(());
		}

		match self
			.store
			.unblock(&keys::block(token), Answer::Yes, self.settings.token_duration)
			.await
		{
			Ok(()) => {
				tracing::info!(token = %fingerprint, "Approval delivered.");

				Ok(())
			},
			Err(StoreError::NoWaiter { .. }) => {
				tracing::warn!(token = %fingerprint, "Approval arrived without a waiting request.");

				Ok(())
			},
			Err(e) => Err(e.into()),
		}
	}

	/// Opens an authenticator registration for `uid` and mails the signup link.
	///
	/// Returns `false` without sending anything when the user is already registered or a
	/// registration is still pending.
	pub async fn begin_registration(&self, uid: &str) -> Result<bool> {
		let started = self.begin_registration_inner(uid);

		observe(FlowKind::Registration, "begin_registration", started, |sent| *sent).await
	}

	/// Renders the QR image of a pending registration.
	pub async fn registration_image(
		&self,
		uid: &str,
		registration_key: &str,
	) -> Result<ProvisioningImage> {
		self.ensure_flow(Flow::Otp)?;

		Ok(self.tokens.render_provisioning_image(uid, registration_key).await?)
	}

	/// Confirms a pending registration with the first code from the authenticator.
	pub async fn complete_registration(
		&self,
		uid: &str,
		registration_key: &str,
		code: &str,
	) -> Result<()> {
		let completed = self.complete_registration_inner(uid, registration_key, code);

		observe(FlowKind::Registration, "complete_registration", completed, |_| true).await
	}

	async fn begin_challenge_inner(
		&self,
		flow: Flow,
		uid: &str,
		ip: IpAddr,
	) -> Result<ChallengeDescriptor> {
		self.ensure_flow(flow)?;

		if self.is_authorized(ip).await? {
			return Ok(ChallengeDescriptor::Granted);
		}

		let user = self.directory.search(uid).await?;

		match flow {
			Flow::Token => self.send_numeric_code(&user).await,
			Flow::Otp => {
				let registered = self.tokens.has_confirmed_registration(&user.uid).await?;

				Ok(ChallengeDescriptor::OtpRequired { register: !registered })
			},
			Flow::Link => self.send_approval_link(&user, ip).await,
		}
	}

	async fn send_numeric_code(&self, user: &UserEntry) -> Result<ChallengeDescriptor> {
		let guard = self.flow_guard(&keys::pending_token(&user.uid, self.tokens.issuer()));
		let _guard = guard.lock().await;

		if let Some(created_at) = self.pending_since(&user.uid).await? {
			tracing::info!(uid = %user.uid, "Numeric code already pending; nothing sent.");

			return Ok(ChallengeDescriptor::NumericCode { created_at, code: None });
		}

		let now = self.clock.now_utc();
		let created_at = now - Duration::from_nanos(u64::from(now.nanosecond()));
		let code = token::numeric_code(NUMERIC_CODE_LEN);

		match self
			.tokens
			.issue_pending_token(&user.uid, created_at, self.settings.token_duration)
			.await
		{
			Ok(()) => {},
			// Another replica won the race; its code is the one in flight.
			Err(TokenError::AlreadyPending) => {
				let created_at = self.tokens.check_pending_token(&user.uid).await?;

				return Ok(ChallengeDescriptor::NumericCode { created_at, code: None });
			},
			Err(e) => return Err(e.into()),
		}

		let short_message = token::spaced_code(&self.settings.spacing, &code);
		let body = format!("Your token: {code}");

		if let Err(e) = self.deliver(user, "Your login token", &short_message, &body).await {
			if let Err(cleanup) = self.tokens.remove_pending_token(&user.uid).await {
				tracing::warn!(uid = %user.uid, error = %cleanup, "Failed to drop an undelivered code.");
			}

			return Err(e);
		}

		tracing::info!(uid = %user.uid, code = %obs::fingerprint(&code), "Numeric code sent.");

		Ok(ChallengeDescriptor::NumericCode { created_at, code: Some(code) })
	}

	async fn send_approval_link(
		&self,
		user: &UserEntry,
		ip: IpAddr,
	) -> Result<ChallengeDescriptor> {
		let token = token::random_key(APPROVAL_TOKEN_BYTES);
		let info = BlockInfo { user: user.uid.clone(), ip: ip.to_string() };

		self.store
			.put_with_ttl(&keys::block_info(&token), &encode_record(&info)?, self.settings.token_duration)
			.await?;

		let link = self.approval_link(&token);
		let body = format!(
			"{} asked to sign in from {ip}. Open this link within {} seconds to allow it: {link}",
			user.name,
			self.settings.token_duration.as_secs(),
		);

		self.deliver(user, "Your login request", &format!("Signin: {link}"), &body).await?;

		tracing::info!(uid = %user.uid, token = %obs::fingerprint(&token), "Approval link sent.");

		Ok(ChallengeDescriptor::Approval { token })
	}

	async fn submit_proof_inner(&self, uid: &str, ip: IpAddr, proof: &Proof) -> Result<ProofOutcome> {
		self.ensure_flow(proof.flow())?;

		let valid = match proof {
			Proof::NumericCode { expected, presented } => {
				if self.pending_since(uid).await?.is_none() {
					tracing::info!(uid, "Numeric code presented without a pending challenge.");

					return Ok(ProofOutcome::denied(PublicMessage::Forbidden));
				}

				token::codes_match(expected, presented)
			},
			Proof::OneTimeCode(code) => match self.tokens.validate_one_time_code(uid, code).await {
				Ok(valid) => valid,
				Err(TokenError::NoRegistration { .. }) => false,
				Err(e) => return Err(e.into()),
			},
			Proof::Approval { token } => return self.await_approval(uid, ip, token).await,
		};

		if !valid {
			tracing::info!(uid, flow = %proof.flow(), "Proof rejected.");

			return Ok(ProofOutcome::denied(PublicMessage::Forbidden));
		}

		self.grant(uid, ip).await?;

		Ok(ProofOutcome::granted())
	}

	async fn await_approval(&self, uid: &str, ip: IpAddr, token: &str) -> Result<ProofOutcome> {
		let Some(info) = self.block_info(token).await? else {
			return Ok(ProofOutcome::denied(PublicMessage::Forbidden));
		};

		if info.user != uid {
			tracing::warn!(uid, token = %obs::fingerprint(token), "Approval token belongs to another user.");

			return Ok(ProofOutcome::denied(PublicMessage::Forbidden));
		}

		let rendezvous = self.store.block(&keys::block(token), self.settings.token_duration).await?;

		match rendezvous.wait_for().await {
			Ok(Answer::Yes) => {
				self.grant(uid, ip).await?;

				Ok(ProofOutcome::granted())
			},
			Ok(Answer::No) => Ok(ProofOutcome::denied(PublicMessage::Forbidden)),
			Err(RendezvousError::Timeout | RendezvousError::AlreadyResolved) => {
				tracing::info!(uid, "Approval window closed without an answer.");

				Ok(ProofOutcome::denied(PublicMessage::Reload))
			},
		}
	}

	async fn begin_registration_inner(&self, uid: &str) -> Result<bool> {
		self.ensure_flow(Flow::Otp)?;

		let user = self.directory.search(uid).await?;
		let guard = self.flow_guard(&keys::temporary_otp(&user.uid, self.tokens.issuer()));
		let _guard = guard.lock().await;

		if self.tokens.has_confirmed_registration(&user.uid).await?
			|| self.tokens.has_pending_registration(&user.uid).await?
		{
			tracing::info!(uid = %user.uid, "Registration exists or is pending; nothing sent.");

			return Ok(false);
		}

		let channel = self.settings.otp.channel.clone().unwrap_or_default();
		let dispatcher = self
			.transports
			.get(&channel)
			.ok_or_else(|| Error::NoTransport { channels: vec![channel.clone()] })?;
		let registration_key = match self.tokens.begin_temporary_registration(&user.uid).await {
			Ok(registration_key) => registration_key,
			// Another replica opened one between the check and the write.
			Err(TokenError::AlreadyPending) => {
				tracing::info!(uid = %user.uid, "Registration opened elsewhere; nothing sent.");

				return Ok(false);
			},
			Err(e) => return Err(e.into()),
		};
		let link = self.signup_link(&user.uid, &registration_key);
		let body = format!("Finish setting up your authenticator for {}: {link}", self.tokens.issuer());

		if let Err(e) = self.dispatch(dispatcher, &user, "Your registration", link.as_str(), &body).await {
			if let Err(cleanup) =
				self.tokens.cancel_temporary_registration(&user.uid, &registration_key).await
			{
				tracing::warn!(uid = %user.uid, error = %cleanup, "Failed to drop an undelivered registration.");
			}

			return Err(e);
		}

		tracing::info!(
			uid = %user.uid,
			key = %obs::fingerprint(&registration_key),
			"Registration link sent."
		);

		Ok(true)
	}

	async fn complete_registration_inner(
		&self,
		uid: &str,
		registration_key: &str,
		code: &str,
	) -> Result<()> {
		self.ensure_flow(Flow::Otp)?;
		self.tokens.complete_temporary_registration(uid, registration_key, code).await?;

		tracing::info!(uid, "Authenticator registration confirmed.");

		Ok(())
	}

	async fn grant(&self, uid: &str, ip: IpAddr) -> Result<()> {
		self.store
			.put_with_ttl(&keys::grant(&self.settings.grant_scope, ip), "", self.settings.access_duration)
			.await?;
		self.tokens.remove_pending_token(uid).await?;

		tracing::info!(uid, %ip, "Access granted.");

		Ok(())
	}

	async fn pending_since(&self, uid: &str) -> Result<Option<OffsetDateTime>> {
		match self.tokens.check_pending_token(uid).await {
			Ok(created_at) => Ok(Some(created_at)),
			Err(TokenError::Store(e)) if e.is_absent() => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn block_info(&self, token: &str) -> Result<Option<BlockInfo>> {
		let key = keys::block_info(token);

		match self.store.get_with_ttl(&key).await {
			Ok(raw) => Ok(Some(decode_record(&key, &raw)?)),
			Err(e) if e.is_absent() => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn deliver(
		&self,
		user: &UserEntry,
		subject: &str,
		short_message: &str,
		body: &str,
	) -> Result<String> {
		let dispatcher = self
			.settings
			.channels
			.iter()
			.find_map(|channel| self.transports.get(channel))
			.ok_or_else(|| Error::NoTransport { channels: self.settings.channels.clone() })?;

		self.dispatch(dispatcher, user, subject, short_message, body).await
	}

	async fn dispatch(
		&self,
		dispatcher: &RateLimitedDispatcher,
		user: &UserEntry,
		subject: &str,
		short_message: &str,
		body: &str,
	) -> Result<String> {
		let sender = &self.settings.messenger.from;
		let message = OutboundMessage {
			address: Addressable {
				from_mail: sender.email.clone(),
				from_name: sender.name.clone(),
				to_mail: user.email.clone(),
				to_mobile: user.mobile.clone(),
				to_name: user.name.clone(),
			},
			subject: subject.to_owned(),
			short_message: short_message.to_owned(),
			body: body.to_owned(),
		};
		let response = dispatcher.send(message).await?;

		tracing::debug!(channel = dispatcher.channel(), uid = %user.uid, %response, "Message delivered.");

		Ok(response)
	}

	fn ensure_flow(&self, flow: Flow) -> Result<()> {
		if flow == self.settings.operation_mode { Ok(()) } else { Err(Error::FlowDisabled { flow }) }
	}

	fn approval_link(&self, token: &str) -> Url {
		let mut link = self.issuer_base.clone();
		let path = format!("{}/allow", link.path().trim_end_matches('/'));

		link.set_path(&path);
		link.query_pairs_mut().append_pair("t", token);

		link
	}

	fn signup_link(&self, uid: &str, registration_key: &str) -> Url {
		let mut link = self.issuer_base.clone();
		let uid = url::form_urlencoded::byte_serialize(uid.as_bytes()).collect::<String>();

		link.set_fragment(Some(&format!("/signup/{uid}/{registration_key}")));

		link
	}

	fn flow_guard(&self, key: &str) -> Arc<AsyncMutex<()>> {
		let mut guards = self.flow_guards.lock();

		guards.entry(key.to_owned()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
	}
}
impl Debug for AccessGate {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AccessGate")
			.field("operation_mode", &self.settings.operation_mode)
			.field("issuer", &self.settings.issuer)
			.field("store", &self.store)
			.field("transports", &self.transports.keys().collect::<Vec<_>>())
			.finish_non_exhaustive()
	}
}

async fn observe<T, F, S>(kind: FlowKind, stage: &'static str, fut: F, succeeded: S) -> Result<T>
where
	F: Future<Output = Result<T>>,
	S: FnOnce(&T) -> bool,
{
	obs::record_flow_outcome(kind, FlowOutcome::Attempt);

	let result = FlowSpan::new(kind, stage).instrument(fut).await;
	let outcome = match &result {
		Ok(value) if succeeded(value) => FlowOutcome::Success,
		Ok(_) => FlowOutcome::Failure,
		Err(e) if e.is_internal() => {
			tracing::error!(flow = %kind, stage, error = %e, "Gate operation failed.");

			FlowOutcome::Failure
		},
		Err(e) => {
			tracing::info!(flow = %kind, stage, error = %e, "Gate operation refused.");

			FlowOutcome::Failure
		},
	};

	obs::record_flow_outcome(kind, outcome);

	result
}
