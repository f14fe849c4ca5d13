#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use subwire_domain::{ApiError, TopicKey};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{CreatedSubscription, EventSubApi};
use crate::frame::{self, Notification};
use crate::manager::Msg;
use crate::resolver::IdResolver;
use crate::session::{PlaceOutcome, Session, SessionState, spawn_delete};
use crate::transport::{self, TransportEvent, WsConnector};

/// Pool-facing callbacks, handed in by the manager at construction.
///
/// `on_recv` fires for every inbound frame (with the decoded notification
/// when there is one), `on_send_info` for every submitted request, and
/// `on_register_error` when the server rejects a create with an HTTP error.
pub(crate) trait ConnectionsHandler: Send + 'static {
	fn on_recv(&mut self, session: u32, raw: &str, decoded: Option<Notification>);
	fn on_send_info(&mut self, text: String);
	fn on_register_error(&mut self, status: u16);
}

#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
	pub(crate) url: Url,
	/// Per-session cost budget (B).
	pub(crate) cost_budget: u32,
	pub(crate) max_sessions: usize,
	pub(crate) welcome_timeout: Duration,
	pub(crate) keepalive_grace: Duration,
	pub(crate) reconnect_min_delay: Duration,
	pub(crate) reconnect_max_delay: Duration,
}

/// Result of trying to place one ready subscription somewhere in the pool.
pub(crate) enum PlaceResult {
	Placed,
	/// No session could take it yet, but one is on the way; retry on the next
	/// reconcile pass.
	Waiting,
	/// Every session is at budget and the session cap is reached.
	CapacityExhausted,
}

/// What a transport event did to the pool, for the manager to act on.
#[derive(Debug, Default)]
pub(crate) struct TransportOutcome {
	/// A session reached WELCOMED; pending subscriptions are worth retrying.
	pub(crate) welcomed: bool,
	/// Subscriptions that lost their session and must go back to pending.
	pub(crate) repend: Vec<TopicKey>,
	/// Connectivity changed; the status summary should be refreshed.
	pub(crate) changed: bool,
}

/// Outcome of a completed create request.
pub(crate) enum CreateDisposition {
	Recorded,
	Repend { key: TopicKey, retry_after: Option<Duration> },
	Dropped,
}

/// Owns the sessions and shards subscriptions across them under the budget.
pub(crate) struct ConnectionPool {
	settings: PoolSettings,
	connector: WsConnector,
	api: Arc<dyn EventSubApi>,
	events: mpsc::Sender<Msg>,
	handler: Box<dyn ConnectionsHandler>,
	sessions: Vec<Session>,
	next_index: u32,
}

impl ConnectionPool {
	pub(crate) fn new(
		settings: PoolSettings,
		connector: WsConnector,
		api: Arc<dyn EventSubApi>,
		events: mpsc::Sender<Msg>,
		handler: Box<dyn ConnectionsHandler>,
	) -> Self {
		Self {
			settings,
			connector,
			api,
			events,
			handler,
			sessions: Vec::new(),
			next_index: 0,
		}
	}

	fn position(&self, index: u32) -> Option<usize> {
		self.sessions.iter().position(|s| s.index == index)
	}

	fn session_mut(&mut self, index: u32) -> Option<&mut Session> {
		self.sessions.iter_mut().find(|s| s.index == index)
	}

	pub(crate) fn contains(&self, key: &TopicKey) -> bool {
		self.sessions.iter().any(|s| s.placed.contains_key(key))
	}

	pub(crate) fn is_connected(&self) -> bool {
		self.sessions.iter().any(|s| s.state == SessionState::Welcomed)
	}

	fn open_session(&mut self, url: Url, replaces: Option<u32>) -> u32 {
		let index = self.next_index;
		self.next_index += 1;

		info!(session = index, url = %url, replaces = ?replaces, "opening eventsub session");
		let transport = transport::spawn(
			index,
			url.clone(),
			self.connector.clone(),
			self.settings.welcome_timeout,
			self.events.clone(),
		);
		self.sessions.push(Session::new(index, url, transport, replaces));
		index
	}

	/// First-fit placement over sessions in creation order.
	pub(crate) fn place(&mut self, key: &TopicKey, broadcaster_id: &str, local_user_id: Option<&str>) -> PlaceResult {
		let api = Arc::clone(&self.api);
		let events = self.events.clone();
		let budget = self.settings.cost_budget;

		let mut waiting = false;
		let mut placed: Option<(u32, String)> = None;

		for s in self.sessions.iter_mut() {
			if s.state == SessionState::Closed && s.reopen_scheduled {
				waiting = true;
				continue;
			}
			match s.place(key, broadcaster_id, local_user_id, budget, &api, &events) {
				PlaceOutcome::Placed { request } => {
					placed = Some((s.index, request));
					break;
				}
				PlaceOutcome::NoSessionIdYet => waiting = true,
				PlaceOutcome::CostExceeded | PlaceOutcome::Unavailable => {}
			}
		}

		if let Some((index, request)) = placed {
			let line = self.sent_line(index, &request);
			self.handler.on_send_info(line);
			return PlaceResult::Placed;
		}
		if waiting {
			return PlaceResult::Waiting;
		}
		if self.sessions.len() < self.settings.max_sessions {
			let url = self.settings.url.clone();
			self.open_session(url, None);
			return PlaceResult::Waiting;
		}
		PlaceResult::CapacityExhausted
	}

	/// Delete a subscription wherever it is placed. False when unknown.
	pub(crate) fn remove(&mut self, key: &TopicKey) -> bool {
		let api = Arc::clone(&self.api);
		for s in self.sessions.iter_mut() {
			if s.remove(key, &api) {
				debug!(session = s.index, topic = %key, "removed subscription");
				return true;
			}
		}
		false
	}

	pub(crate) fn handle_transport(
		&mut self,
		index: u32,
		event: TransportEvent,
		resolver: &IdResolver,
		local_user_id: Option<&str>,
		pending_nonempty: bool,
	) -> TransportOutcome {
		match event {
			TransportEvent::Opened => {
				debug!(session = index, "transport open; awaiting welcome");
				TransportOutcome {
					changed: true,
					..TransportOutcome::default()
				}
			}
			TransportEvent::Frame(raw) => self.handle_frame(index, &raw, resolver, local_user_id),
			TransportEvent::Closed { cause } => self.handle_closed(index, &cause, pending_nonempty),
		}
	}

	fn handle_frame(&mut self, index: u32, raw: &str, resolver: &IdResolver, local_user_id: Option<&str>) -> TransportOutcome {
		let mut out = TransportOutcome::default();

		let message_type = match frame::peek_message_type(raw) {
			Ok(t) => t,
			Err(e) => {
				warn!(session = index, error = %format!("{e:#}"), "unparseable frame");
				self.handler.on_recv(index, raw.trim(), None);
				return out;
			}
		};

		match message_type.as_str() {
			"session_welcome" => {
				self.handler.on_recv(index, raw.trim(), None);
				match frame::parse_welcome(raw) {
					Ok(welcome) => {
						let session = welcome.payload.session;
						out = self.handle_welcome(index, session.id, session.keepalive_timeout_seconds, resolver, local_user_id);
					}
					Err(e) => warn!(session = index, error = %format!("{e:#}"), "bad session_welcome"),
				}
			}
			"session_keepalive" => {
				self.handler.on_recv(index, raw.trim(), None);
			}
			"notification" => match frame::parse_notification(raw) {
				Ok(n) => self.handler.on_recv(index, raw.trim(), Some(n)),
				Err(e) => {
					warn!(session = index, error = %format!("{e:#}"), "bad notification");
					self.handler.on_recv(index, raw.trim(), None);
				}
			},
			"session_reconnect" => {
				self.handler.on_recv(index, raw.trim(), None);
				match frame::parse_reconnect(raw) {
					Ok(msg) => {
						self.start_replacement(index, &msg.payload.session.reconnect_url);
						out.changed = true;
					}
					Err(e) => warn!(session = index, error = %format!("{e:#}"), "bad session_reconnect"),
				}
			}
			"revocation" => match frame::parse_revocation(raw) {
				Ok(msg) => {
					let sub = msg.payload.subscription;
					self.handle_revocation(index, &sub.id);
					let payload = serde_json::json!({
						"id": sub.id,
						"status": sub.status,
						"type": sub.event_type,
					});
					self.handler.on_recv(
						index,
						raw.trim(),
						Some(Notification {
							event_type: "revocation".to_string(),
							payload,
						}),
					);
					out.changed = true;
				}
				Err(e) => {
					warn!(session = index, error = %format!("{e:#}"), "bad revocation");
					self.handler.on_recv(index, raw.trim(), None);
				}
			},
			other => {
				debug!(session = index, message_type = other, "ignoring unknown frame type");
				self.handler.on_recv(index, raw.trim(), None);
			}
		}

		out
	}

	fn handle_welcome(
		&mut self,
		index: u32,
		session_id: String,
		keepalive_seconds: Option<u64>,
		resolver: &IdResolver,
		local_user_id: Option<&str>,
	) -> TransportOutcome {
		let grace = self.settings.keepalive_grace;
		let Some(s) = self.session_mut(index) else {
			return TransportOutcome::default();
		};

		info!(session = index, session_id = %session_id, keepalive = ?keepalive_seconds, "session welcomed");
		s.note_welcome(session_id, keepalive_seconds, grace);
		s.reopen_scheduled = false;
		let replaces = s.replaces.take();

		let mut out = TransportOutcome {
			welcomed: true,
			changed: true,
			repend: Vec::new(),
		};
		if let Some(old_index) = replaces {
			out.repend = self.transfer(old_index, index, resolver, local_user_id);
		}
		out
	}

	/// Move every subscription from the old session to its welcomed
	/// replacement, re-submitting creates against the new session id, then
	/// close the old session. Frames from the old session already in the
	/// mailbox are still dispatched when they arrive.
	fn transfer(&mut self, old_index: u32, new_index: u32, resolver: &IdResolver, local_user_id: Option<&str>) -> Vec<TopicKey> {
		let Some(old_pos) = self.position(old_index) else {
			return Vec::new();
		};
		let moved = self.sessions[old_pos].take_placed();

		let api = Arc::clone(&self.api);
		let events = self.events.clone();
		let budget = self.settings.cost_budget;

		let mut repend = Vec::new();
		let mut sent = Vec::new();
		if let Some(new_s) = self.sessions.iter_mut().find(|s| s.index == new_index) {
			for (key, _placed) in moved {
				let Some(broadcaster_id) = resolver.lookup(key.channel()) else {
					repend.push(key);
					continue;
				};
				match new_s.place(&key, broadcaster_id, local_user_id, budget, &api, &events) {
					PlaceOutcome::Placed { request } => sent.push(request),
					_ => repend.push(key),
				}
			}
		} else {
			repend.extend(moved.into_iter().map(|(k, _)| k));
		}

		for request in sent {
			let line = self.sent_line(new_index, &request);
			self.handler.on_send_info(line);
		}

		if let Some(pos) = self.position(old_index) {
			let old = self.sessions.remove(pos);
			old.transport.close();
			info!(session = old_index, replacement = new_index, "closed session after handoff");
		}

		repend
	}

	fn start_replacement(&mut self, index: u32, reconnect_url: &str) {
		let url = match Url::parse(reconnect_url) {
			Ok(u) => u,
			Err(e) => {
				warn!(session = index, reconnect_url, error = %e, "invalid reconnect url; using configured endpoint");
				self.settings.url.clone()
			}
		};

		let Some(s) = self.session_mut(index) else {
			return;
		};
		if s.state != SessionState::Welcomed {
			debug!(session = index, state = ?s.state, "ignoring session_reconnect outside WELCOMED");
			return;
		}
		s.state = SessionState::Reconnecting;

		info!(session = index, url = %url, "server requested session reconnect");
		self.open_session(url, Some(index));
	}

	fn handle_revocation(&mut self, index: u32, server_id: &str) {
		for s in self.sessions.iter_mut() {
			if let Some(key) = s.key_for_server_id(server_id) {
				info!(session = s.index, topic = %key, "subscription revoked by server");
				s.forget(&key);
				return;
			}
		}
		debug!(session = index, subscription = server_id, "revocation for unknown subscription");
	}

	fn handle_closed(&mut self, index: u32, cause: &str, pending_nonempty: bool) -> TransportOutcome {
		let Some(pos) = self.position(index) else {
			debug!(session = index, cause, "close event for already-removed session");
			return TransportOutcome::default();
		};

		let mut out = TransportOutcome {
			changed: true,
			..TransportOutcome::default()
		};

		// A replacement that died before welcome: keep the session it was
		// meant to replace.
		if let Some(old_index) = self.sessions[pos].replaces {
			warn!(session = index, cause, "replacement session died before welcome");
			self.sessions.remove(pos);
			if let Some(old) = self.session_mut(old_index)
				&& old.state == SessionState::Reconnecting
			{
				old.state = SessionState::Welcomed;
			}
			return out;
		}

		info!(session = index, cause, "session closed");
		let attempt;
		{
			let s = &mut self.sessions[pos];
			s.state = SessionState::Closed;
			s.session_id = None;
			out.repend = s.take_placed().into_iter().map(|(k, _)| k).collect();
			attempt = s.backoff_attempt;
		}

		if out.repend.is_empty() && !pending_nonempty {
			self.sessions.remove(pos);
			return out;
		}

		{
			let url = self.settings.url.clone();
			let s = &mut self.sessions[pos];
			s.backoff_attempt = attempt.saturating_add(1);
			s.reopen_scheduled = true;
			s.url = url;
		}

		let delay = backoff_delay(attempt, self.settings.reconnect_min_delay, self.settings.reconnect_max_delay);
		debug!(session = index, attempt, ?delay, "scheduling session re-open");
		let events = self.events.clone();
		tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = events.send(Msg::ReopenSession { session: index }).await;
		});

		out
	}

	/// Re-open a closed session slot once its backoff pause elapsed.
	pub(crate) fn reopen(&mut self, index: u32) {
		let connector = self.connector.clone();
		let welcome_timeout = self.settings.welcome_timeout;
		let events = self.events.clone();

		let Some(s) = self.session_mut(index) else {
			return;
		};
		if s.state != SessionState::Closed || !s.reopen_scheduled {
			return;
		}

		info!(session = index, "re-opening session");
		s.reopen_scheduled = false;
		s.state = SessionState::Connecting;
		s.session_id = None;
		s.transport = transport::spawn(index, s.url.clone(), connector, welcome_timeout, events);
	}

	pub(crate) fn create_result(
		&mut self,
		index: u32,
		key: TopicKey,
		result: Result<CreatedSubscription, ApiError>,
	) -> CreateDisposition {
		match result {
			Ok(created) => {
				if let Some(s) = self.session_mut(index)
					&& s.placed.contains_key(&key)
				{
					s.server_total_cost = created.total_cost;
					if let Some(p) = s.placed.get_mut(&key) {
						p.server_id = Some(created.id.clone());
					}
					debug!(session = index, topic = %key, subscription = %created.id, "subscription created");
					return CreateDisposition::Recorded;
				}

				// Unlistened while the create was in flight; clean up server side.
				spawn_delete(&self.api, created.id);
				CreateDisposition::Dropped
			}
			Err(e) => {
				if let Some(s) = self.session_mut(index) {
					s.forget(&key);
				}

				match e {
					ApiError::RateLimited => {
						warn!(session = index, topic = %key, "create rejected: rate limited");
						self.handler.on_register_error(429);
						CreateDisposition::Repend { key, retry_after: None }
					}
					e if e.is_terminal() => {
						warn!(session = index, topic = %key, error = %e, "create rejected; dropping topic");
						if let ApiError::Status { status, .. } = &e {
							self.handler.on_register_error(*status);
						}
						CreateDisposition::Dropped
					}
					e => {
						warn!(session = index, topic = %key, error = %e, "create failed; will retry");
						CreateDisposition::Repend {
							key,
							retry_after: Some(Duration::from_secs(5)),
						}
					}
				}
			}
		}
	}

	/// Close everything; returns the subscriptions that were placed so the
	/// manager can queue them for a later reconnect.
	pub(crate) fn disconnect(&mut self) -> Vec<TopicKey> {
		let mut repend = Vec::new();
		for mut s in self.sessions.drain(..) {
			s.transport.close();
			repend.extend(s.take_placed().into_iter().map(|(k, _)| k));
		}
		repend
	}

	fn sent_line(&self, index: u32, request: &str) -> String {
		let topics_here = self
			.sessions
			.iter()
			.find(|s| s.index == index)
			.map(|s| s.placed.len())
			.unwrap_or(0);
		let total: usize = self.sessions.iter().map(|s| s.placed.len()).sum();
		format!("[{index}({topics_here})/{}({total})]<-- {request}", self.sessions.len())
	}

	pub(crate) fn status_line(&self, pending: usize) -> String {
		let ready = self.sessions.iter().filter(|s| s.state == SessionState::Welcomed).count();
		let topics: usize = self.sessions.iter().map(|s| s.placed.len()).sum();
		format!(
			"connections: {} ({} ready), topics: {} ({} pending)",
			self.sessions.len(),
			ready,
			topics,
			pending
		)
	}

	/// Diagnostic listing of placed topics per session plus the pending set.
	pub(crate) fn topics_text(&self, pending: &[TopicKey], resolver: &IdResolver) -> String {
		let mut b = String::new();

		for s in &self.sessions {
			match &s.session_id {
				Some(id) => b.push_str(&format!("[{} {}]\n", s.index, id)),
				None => b.push_str(&format!("[{} ({:?})]\n", s.index, s.state)),
			}

			let mut topics: Vec<&TopicKey> = s.placed.keys().collect();
			topics.sort_by(|a, b| {
				a.channel()
					.cmp(b.channel())
					.then(a.kind().event_type().cmp(b.kind().event_type()))
			});

			let mut count = 0;
			let mut current: Option<&str> = None;
			for t in topics {
				if current.is_some() && current != Some(t.channel()) {
					b.push_str("---\n");
					count = 0;
				}
				count += 1;
				current = Some(t.channel());
				b.push_str(&format!("{count}. {t} ({})\n", t.kind().descriptor().expected_cost));
			}

			if let Some(cost) = s.server_total_cost {
				b.push_str(&format!("server cost: {cost}\n"));
			}
		}

		if !pending.is_empty() {
			b.push_str("[pending]\n");
			for t in pending {
				if resolver.is_not_found(t.channel()) {
					b.push_str(&format!("{t} (login unknown)\n"));
				} else {
					b.push_str(&format!("{t}\n"));
				}
			}
		}

		b
	}
}

/// Exponential backoff, doubling from `min` up to `max`.
pub(crate) fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	Duration::from_millis(ms.min(u64::MAX as u128) as u64).clamp(min, max)
}
