//! Composition root for [`AccessGate`].

// self
use crate::{
	_prelude::*,
	clock::{Clock, SystemClock},
	config::{Flow, GateSettings},
	dispatch::RateLimitedDispatcher,
	error::ConfigError,
	ext::{DenyAll, Notifier, UserDirectory, Whitelist},
	gate::AccessGate,
	store::{self, KvStore},
	token::TokenService,
};

/// Builder wiring settings and collaborators into an [`AccessGate`].
///
/// Only the directory is mandatory. Without an explicit store the backend named in the
/// settings is connected; the clock defaults to [`SystemClock`] and the whitelist to
/// [`DenyAll`].
pub struct AccessGateBuilder {
	settings: GateSettings,
	clock: Option<Arc<dyn Clock>>,
	store: Option<Arc<dyn KvStore>>,
	directory: Option<Arc<dyn UserDirectory>>,
	whitelist: Option<Arc<dyn Whitelist>>,
	transports: Vec<(String, Arc<dyn Notifier>)>,
}
impl AccessGateBuilder {
	/// Creates a builder for `settings`.
	pub fn new(settings: GateSettings) -> Self {
		Self {
			settings,
			clock: None,
			store: None,
			directory: None,
			whitelist: None,
			transports: Vec::new(),
		}
	}

	/// Overrides the clock used for every expiry decision.
	pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);

		self
	}

	/// Uses an already constructed store instead of connecting the configured backend.
	pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
		self.store = Some(store);

		self
	}

	/// Sets the identity directory.
	pub fn directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
		self.directory = Some(directory);

		self
	}

	/// Sets the network allow-list.
	pub fn whitelist(mut self, whitelist: Arc<dyn Whitelist>) -> Self {
		self.whitelist = Some(whitelist);

		self
	}

	/// Registers `notifier` as the transport for `channel`.
	pub fn transport(mut self, channel: impl Into<String>, notifier: Arc<dyn Notifier>) -> Self {
		self.transports.push((channel.into(), notifier));

		self
	}

	/// Validates the settings, connects the store, and starts one dispatcher per transport.
	///
	/// Must run inside a tokio runtime.
	pub async fn build(self) -> Result<AccessGate> {
		let Self { settings, clock, store, directory, whitelist, transports } = self;

		settings.validate()?;

		let issuer_base = settings.issuer_base_url()?;
		let directory = directory.ok_or(ConfigError::MissingCollaborator { name: "directory" })?;
		let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
		let store = match store {
			Some(store) => store,
			None => store::connect(&settings.store, clock.clone()).await?,
		};
		let transports = transports
			.into_iter()
			.map(|(channel, notifier)| {
				let dispatcher = RateLimitedDispatcher::spawn(
					channel.clone(),
					notifier,
					settings.messenger.rate,
					settings.messenger.burst,
				);

				(channel, dispatcher)
			})
			.collect::<HashMap<_, _>>();

		if settings.operation_mode == Flow::Otp
			&& !settings.otp.channel.as_ref().is_some_and(|channel| transports.contains_key(channel))
		{
			return Err(ConfigError::MissingOtpChannel.into());
		}

		let tokens =
			TokenService::new(store.clone(), clock.clone(), settings.issuer.clone(), settings.otp.timeout);

		tracing::info!(
			mode = %settings.operation_mode,
			store = settings.store.kind(),
			transports = transports.len(),
			"Access gate ready."
		);

		Ok(AccessGate {
			issuer_base,
			clock,
			store,
			tokens,
			directory,
			whitelist: whitelist.unwrap_or_else(|| Arc::new(DenyAll)),
			transports,
			flow_guards: Default::default(),
			settings,
		})
	}
}
impl Debug for AccessGateBuilder {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AccessGateBuilder")
			.field("settings", &self.settings)
			.field("has_store", &self.store.is_some())
			.field("has_directory", &self.directory.is_some())
			.field("transports", &self.transports.iter().map(|(name, _)| name).collect::<Vec<_>>())
			.finish_non_exhaustive()
	}
}
