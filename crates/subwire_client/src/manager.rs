#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use subwire_domain::{ApiError, TopicKey, TopicKind};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::EventSubListener;
use crate::api::{CreatedSubscription, EventSubApi};
use crate::frame::Notification;
use crate::pool::{ConnectionPool, ConnectionsHandler, CreateDisposition, PlaceResult, PoolSettings};
use crate::raid::RaidTopicDeduper;
use crate::resolver::IdResolver;
use crate::transport::{TransportEvent, WsConnector, default_connector};

/// Default upstream EventSub websocket endpoint.
pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Manager configuration.
#[derive(Clone)]
pub struct EventSubConfig {
	pub ws_url: String,
	/// Per-session cost budget; the upstream platform publishes 10 for websocket transports.
	pub cost_budget: u32,
	/// Hard cap on concurrent sessions; the upstream platform publishes 3.
	pub max_sessions: usize,
	pub welcome_timeout: Duration,
	/// Added on top of twice the keepalive window before a session is declared dead.
	pub keepalive_grace: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub mailbox_capacity: usize,
	/// Test seam: replaces the real websocket connector.
	pub ws_connector: Option<WsConnector>,
}

impl Default for EventSubConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			cost_budget: 10,
			max_sessions: 3,
			welcome_timeout: Duration::from_secs(15),
			keepalive_grace: Duration::from_secs(3),
			reconnect_min_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(60),
			mailbox_capacity: 256,
			ws_connector: None,
		}
	}
}

/// Everything that lands in the manager mailbox: application commands and
/// completions posted back by background I/O tasks. Processing is strictly
/// sequential, so all state mutation is serialized here.
pub(crate) enum Msg {
	Listen { keys: Vec<TopicKey> },
	Unlisten { keys: Vec<TopicKey> },
	ListenRaid { channel: String },
	UnlistenRaid { channel: String },
	SetLocalUsername { username: String },
	TokenUpdated,
	Reconnect,
	Disconnect,
	IsConnected { resp: oneshot::Sender<bool> },
	StatusText { resp: oneshot::Sender<String> },
	TopicsText { resp: oneshot::Sender<String> },

	Transport { session: u32, event: TransportEvent },
	CreateResult {
		session: u32,
		key: TopicKey,
		result: Result<CreatedSubscription, ApiError>,
	},
	IdResolved {
		login: String,
		result: Result<Option<String>, ApiError>,
	},
	RequestId { login: String },
	ReopenSession { session: u32 },
	Reconcile,
	LogActiveTopics,
	EmitInfo { text: String },
}

/// Handle to the running subscription manager.
///
/// Cloneable; every method posts to the manager task, so calls from any task
/// are safe and never block on network I/O.
#[derive(Clone)]
pub struct EventSubManager {
	tx: mpsc::Sender<Msg>,
}

impl EventSubManager {
	/// Spawn the manager task. Subscriptions live for this run only; nothing
	/// is persisted.
	pub fn start(
		cfg: EventSubConfig,
		api: Arc<dyn EventSubApi>,
		listener: Arc<dyn EventSubListener>,
	) -> anyhow::Result<Self> {
		let (tx, rx) = mpsc::channel(cfg.mailbox_capacity.max(16));
		let task = ManagerTask::new(cfg, api, listener, tx.clone())?;
		tokio::spawn(task.run(rx));
		Ok(Self { tx })
	}

	async fn send(&self, msg: Msg) {
		if self.tx.send(msg).await.is_err() {
			warn!("eventsub manager task is gone");
		}
	}

	fn keys(kinds: &[TopicKind], channel: &str) -> Vec<TopicKey> {
		kinds.iter().map(|k| TopicKey::new(*k, channel)).collect()
	}

	pub async fn listen_raid(&self, channel: &str) {
		self.send(Msg::ListenRaid {
			channel: channel.to_string(),
		})
		.await;
	}

	pub async fn unlisten_raid(&self, channel: &str) {
		self.send(Msg::UnlistenRaid {
			channel: channel.to_string(),
		})
		.await;
	}

	pub async fn listen_poll(&self, channel: &str) {
		self.listen(&[TopicKind::PollBegin, TopicKind::PollEnd], channel).await;
	}

	pub async fn unlisten_poll(&self, channel: &str) {
		self.unlisten(&[TopicKind::PollBegin, TopicKind::PollEnd], channel).await;
	}

	pub async fn listen_shield(&self, channel: &str) {
		self.listen(&[TopicKind::ShieldBegin, TopicKind::ShieldEnd], channel).await;
	}

	pub async fn unlisten_shield(&self, channel: &str) {
		self.unlisten(&[TopicKind::ShieldBegin, TopicKind::ShieldEnd], channel).await;
	}

	pub async fn listen_shoutouts(&self, channel: &str) {
		self.listen(&[TopicKind::ShoutoutCreate], channel).await;
	}

	pub async fn unlisten_shoutouts(&self, channel: &str) {
		self.unlisten(&[TopicKind::ShoutoutCreate], channel).await;
	}

	pub async fn listen_mod_actions(&self, channel: &str) {
		self.listen(&[TopicKind::ChannelModerate], channel).await;
	}

	pub async fn unlisten_mod_actions(&self, channel: &str) {
		self.unlisten(&[TopicKind::ChannelModerate], channel).await;
	}

	pub async fn listen_automod(&self, channel: &str) {
		self.listen(&[TopicKind::AutoModMessageHold, TopicKind::AutoModMessageUpdate], channel)
			.await;
	}

	pub async fn unlisten_automod(&self, channel: &str) {
		self.unlisten(&[TopicKind::AutoModMessageHold, TopicKind::AutoModMessageUpdate], channel)
			.await;
	}

	pub async fn listen_suspicious(&self, channel: &str) {
		self.listen(&[TopicKind::SuspiciousMessage, TopicKind::SuspiciousUpdate], channel)
			.await;
	}

	pub async fn unlisten_suspicious(&self, channel: &str) {
		self.unlisten(&[TopicKind::SuspiciousMessage, TopicKind::SuspiciousUpdate], channel)
			.await;
	}

	pub async fn listen_warnings(&self, channel: &str) {
		self.listen(&[TopicKind::WarningAcknowledge], channel).await;
	}

	pub async fn unlisten_warnings(&self, channel: &str) {
		self.unlisten(&[TopicKind::WarningAcknowledge], channel).await;
	}

	pub async fn listen_message_held(&self, channel: &str) {
		self.listen(&Self::message_held_kinds(), channel).await;
	}

	pub async fn unlisten_message_held(&self, channel: &str) {
		self.unlisten(&Self::message_held_kinds(), channel).await;
	}

	pub async fn listen_points(&self, channel: &str) {
		self.listen(
			&[TopicKind::PointsRedemptionAdd, TopicKind::PointsRedemptionUpdate],
			channel,
		)
		.await;
	}

	pub async fn unlisten_points(&self, channel: &str) {
		self.unlisten(
			&[TopicKind::PointsRedemptionAdd, TopicKind::PointsRedemptionUpdate],
			channel,
		)
		.await;
	}

	fn message_held_kinds() -> Vec<TopicKind> {
		let mut kinds = vec![TopicKind::UserMessageUpdate];
		#[cfg(feature = "user-message-hold")]
		kinds.insert(0, TopicKind::UserMessageHold);
		kinds
	}

	async fn listen(&self, kinds: &[TopicKind], channel: &str) {
		self.send(Msg::Listen {
			keys: Self::keys(kinds, channel),
		})
		.await;
	}

	async fn unlisten(&self, kinds: &[TopicKind], channel: &str) {
		self.send(Msg::Unlisten {
			keys: Self::keys(kinds, channel),
		})
		.await;
	}

	/// Set the authenticated user's login. Required before any topic that
	/// needs the local user id can become ready; pending topics flush once
	/// the id resolves.
	pub async fn set_local_username(&self, username: &str) {
		self.send(Msg::SetLocalUsername {
			username: username.to_string(),
		})
		.await;
	}

	/// The bearer token changed; later API calls must carry the new
	/// credentials. Existing subscriptions are not re-created.
	pub async fn token_updated(&self) {
		self.send(Msg::TokenUpdated).await;
	}

	pub async fn reconnect(&self) {
		self.send(Msg::Reconnect).await;
	}

	pub async fn disconnect(&self) {
		self.send(Msg::Disconnect).await;
	}

	pub async fn is_connected(&self) -> bool {
		let (tx, rx) = oneshot::channel();
		self.send(Msg::IsConnected { resp: tx }).await;
		match tokio::time::timeout(QUERY_TIMEOUT, rx).await {
			Ok(Ok(v)) => v,
			_ => false,
		}
	}

	pub async fn status_text(&self) -> String {
		let (tx, rx) = oneshot::channel();
		self.send(Msg::StatusText { resp: tx }).await;
		match tokio::time::timeout(QUERY_TIMEOUT, rx).await {
			Ok(Ok(v)) => v,
			_ => "manager unavailable".to_string(),
		}
	}

	/// Diagnostic listing of placed topics per session plus the pending set.
	pub async fn topics_text(&self) -> String {
		let (tx, rx) = oneshot::channel();
		self.send(Msg::TopicsText { resp: tx }).await;
		match tokio::time::timeout(QUERY_TIMEOUT, rx).await {
			Ok(Ok(v)) => v,
			_ => "manager unavailable".to_string(),
		}
	}
}

/// Bridges pool callbacks to the application listener. Lives inside the pool
/// and therefore only runs on the manager task.
struct ListenerBridge {
	listener: Arc<dyn EventSubListener>,
	events: mpsc::Sender<Msg>,
	limit_notified: bool,
}

impl ConnectionsHandler for ListenerBridge {
	fn on_recv(&mut self, session: u32, raw: &str, decoded: Option<Notification>) {
		self.listener.info(&format!("[{session}]--> {raw}"));
		if let Some(n) = decoded {
			self.listener.event(&n.event_type, &n.payload);
		}
	}

	fn on_send_info(&mut self, text: String) {
		self.listener.info(&text);
	}

	fn on_register_error(&mut self, status: u16) {
		if status == 429 {
			if self.limit_notified {
				return;
			}
			self.limit_notified = true;
			self.listener.info(
				"[session.eventsub.limit] EventSub reached an unexpected request limit; \
				 some features will not fully work until the limit clears. Limits are \
				 per account/client id, so other running clients count against this one.",
			);
			// Dump the topic state once so the first limit hit can be diagnosed.
			let _ = self.events.try_send(Msg::LogActiveTopics);
		} else {
			self.listener
				.info(&format!("[session.eventsub.error] create-subscription failed with HTTP {status}"));
		}
	}
}

/// Single owner of pool, pending set and name map; drains the mailbox.
struct ManagerTask {
	api: Arc<dyn EventSubApi>,
	listener: Arc<dyn EventSubListener>,
	events: mpsc::Sender<Msg>,
	pool: ConnectionPool,
	resolver: IdResolver,
	pending: Vec<TopicKey>,
	raid: RaidTopicDeduper,
	local_username: Option<String>,
	/// Cleared by `disconnect()`; while false nothing is placed or re-opened.
	active: bool,
	capacity_notified: bool,
	last_status: String,
	run_id: String,
}

impl ManagerTask {
	fn new(
		cfg: EventSubConfig,
		api: Arc<dyn EventSubApi>,
		listener: Arc<dyn EventSubListener>,
		events: mpsc::Sender<Msg>,
	) -> anyhow::Result<Self> {
		let url = Url::parse(&cfg.ws_url).with_context(|| format!("parse eventsub ws url: {}", cfg.ws_url))?;
		let connector = cfg.ws_connector.clone().unwrap_or_else(default_connector);

		let settings = PoolSettings {
			url,
			cost_budget: cfg.cost_budget,
			max_sessions: cfg.max_sessions,
			welcome_timeout: cfg.welcome_timeout,
			keepalive_grace: cfg.keepalive_grace,
			reconnect_min_delay: cfg.reconnect_min_delay,
			reconnect_max_delay: cfg.reconnect_max_delay,
		};
		let bridge = ListenerBridge {
			listener: Arc::clone(&listener),
			events: events.clone(),
			limit_notified: false,
		};
		let pool = ConnectionPool::new(settings, connector, Arc::clone(&api), events.clone(), Box::new(bridge));
		let resolver = IdResolver::new(Arc::clone(&api), events.clone());

		Ok(Self {
			api,
			listener,
			events,
			pool,
			resolver,
			pending: Vec::new(),
			raid: RaidTopicDeduper::default(),
			local_username: None,
			active: true,
			capacity_notified: false,
			last_status: String::new(),
			run_id: uuid::Uuid::new_v4().to_string(),
		})
	}

	async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
		info!(run = %self.run_id, "eventsub manager started");

		while let Some(msg) = rx.recv().await {
			match msg {
				Msg::Listen { keys } => self.cmd_listen(keys),
				Msg::Unlisten { keys } => self.cmd_unlisten(keys),
				Msg::ListenRaid { channel } => {
					if self.raid.listen(&channel) {
						self.cmd_listen(vec![TopicKey::new(TopicKind::Raid, &channel)]);
					}
				}
				Msg::UnlistenRaid { channel } => {
					if self.raid.unlisten(&channel) {
						self.cmd_unlisten(vec![TopicKey::new(TopicKind::Raid, &channel)]);
					}
				}
				Msg::SetLocalUsername { username } => self.cmd_set_local_username(username),
				Msg::TokenUpdated => {
					self.api.token_updated();
					self.listener.info("api token updated");
				}
				Msg::Reconnect => {
					info!("reconnect requested");
					let repend = self.pool.disconnect();
					self.repend(repend);
					self.active = true;
					self.reconcile();
				}
				Msg::Disconnect => {
					info!("disconnect requested");
					self.active = false;
					let repend = self.pool.disconnect();
					self.repend(repend);
					self.emit_status();
				}
				Msg::IsConnected { resp } => {
					let _ = resp.send(self.pool.is_connected());
				}
				Msg::StatusText { resp } => {
					let _ = resp.send(self.pool.status_line(self.pending.len()));
				}
				Msg::TopicsText { resp } => {
					let _ = resp.send(self.pool.topics_text(&self.pending, &self.resolver));
				}

				Msg::Transport { session, event } => {
					let local = self.local_id().map(str::to_string);
					let outcome = self.pool.handle_transport(
						session,
						event,
						&self.resolver,
						local.as_deref(),
						!self.pending.is_empty(),
					);
					self.repend(outcome.repend);
					if outcome.welcomed {
						self.reconcile();
					}
					if outcome.changed {
						self.emit_status();
					}
				}
				Msg::CreateResult { session, key, result } => match self.pool.create_result(session, key, result) {
					CreateDisposition::Recorded | CreateDisposition::Dropped => {}
					CreateDisposition::Repend { key, retry_after } => {
						self.repend(vec![key]);
						if let Some(delay) = retry_after {
							let events = self.events.clone();
							tokio::spawn(async move {
								tokio::time::sleep(delay).await;
								let _ = events.send(Msg::Reconcile).await;
							});
						}
					}
				},
				Msg::IdResolved { login, result } => {
					if self.resolver.complete(&login, result) {
						self.reconcile();
					}
				}
				Msg::RequestId { login } => self.resolver.request(&login),
				Msg::ReopenSession { session } => {
					if self.active {
						self.pool.reopen(session);
					}
				}
				Msg::Reconcile => self.reconcile(),
				Msg::LogActiveTopics => self.log_active_topics(),
				Msg::EmitInfo { text } => self.listener.info(&text),
			}
		}

		debug!(run = %self.run_id, "eventsub manager mailbox closed");
	}

	fn cmd_listen(&mut self, keys: Vec<TopicKey>) {
		self.active = true;
		for key in keys {
			self.add_topic(key);
		}
		self.reconcile();
	}

	fn add_topic(&mut self, key: TopicKey) {
		// Re-listening to a placed topic is a no-op; re-listening to a
		// pending one just re-triggers the readiness check.
		if !self.pool.contains(&key) && !self.pending.contains(&key) {
			debug!(topic = %key, "queueing topic");
			self.pending.push(key.clone());
		}

		self.resolver.request(key.channel());
		if key.kind().needs_local_id()
			&& let Some(local) = self.local_username.clone()
		{
			self.resolver.request(&local);
		}
	}

	fn cmd_unlisten(&mut self, keys: Vec<TopicKey>) {
		for key in keys {
			self.pending.retain(|k| k != &key);
			self.pool.remove(&key);
		}
		self.reconcile();
	}

	fn cmd_set_local_username(&mut self, username: String) {
		let username = username.trim().to_ascii_lowercase();
		if username.is_empty() || self.local_username.as_deref() == Some(&username) {
			return;
		}
		info!(username = %username, "local username set");
		self.local_username = Some(username.clone());
		self.resolver.request(&username);
	}

	fn local_id(&self) -> Option<&str> {
		self.local_username.as_deref().and_then(|u| self.resolver.lookup(u))
	}

	fn is_ready(&self, key: &TopicKey) -> bool {
		if self.resolver.lookup(key.channel()).is_none() {
			return false;
		}
		!key.kind().needs_local_id() || self.local_id().is_some()
	}

	/// Try to place every pending-but-ready subscription. Runs whenever an id
	/// resolves, a session is welcomed, or the desired set changes.
	fn reconcile(&mut self) {
		if !self.active {
			return;
		}

		let ready: Vec<TopicKey> = self.pending.iter().filter(|k| self.is_ready(k)).cloned().collect();
		if !ready.is_empty() {
			self.pending.retain(|k| !ready.contains(k));

			let local = self.local_id().map(str::to_string);
			for key in ready {
				let Some(broadcaster_id) = self.resolver.lookup(key.channel()).map(str::to_string) else {
					self.pending.push(key);
					continue;
				};

				match self.pool.place(&key, &broadcaster_id, local.as_deref()) {
					PlaceResult::Placed => {}
					PlaceResult::Waiting => self.pending.push(key),
					PlaceResult::CapacityExhausted => {
						self.notify_capacity_exhausted();
						self.pending.push(key);
					}
				}
			}
		}

		self.emit_status();
	}

	fn repend(&mut self, keys: Vec<TopicKey>) {
		for key in keys {
			if !self.pending.contains(&key) {
				self.pending.push(key);
			}
		}
	}

	fn notify_capacity_exhausted(&mut self) {
		if self.capacity_notified {
			return;
		}
		self.capacity_notified = true;
		self.listener.info(
			"[session.eventsub.maxtopics] every session is at its cost budget and the \
			 session cap is reached; new topics stay queued",
		);
	}

	/// Dump the local topic view and ask the server for its own, once.
	fn log_active_topics(&mut self) {
		self.listener.info(&format!(
			"[Current topics]\n{}",
			self.pool.topics_text(&self.pending, &self.resolver)
		));

		let api = Arc::clone(&self.api);
		let events = self.events.clone();
		tokio::spawn(async move {
			let text = match api.list_subscriptions().await {
				Ok(list) => format!(
					"[Current topics according to API]\ntotal: {:?}, cost: {:?}/{:?}\nper session: {:?}",
					list.total,
					list.total_cost,
					list.max_total_cost,
					list.count_by_session()
				),
				Err(e) => format!("failed to list server subscriptions: {e}"),
			};
			let _ = events.send(Msg::EmitInfo { text }).await;
		});
	}

	fn emit_status(&mut self) {
		let status = self.pool.status_line(self.pending.len());
		if status != self.last_status {
			self.last_status = status.clone();
			self.listener.status_changed(&status);
		}
	}
}
