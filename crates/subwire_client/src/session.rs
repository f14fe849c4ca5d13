#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use subwire_domain::{TopicKey, build_create_body};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::api::EventSubApi;
use crate::manager::Msg;
use crate::transport::TransportHandle;

/// Keepalive window the server applies when the welcome does not carry one.
const DEFAULT_KEEPALIVE_SECONDS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
	Connecting,
	Welcomed,
	/// The server directed this session elsewhere; a replacement is being opened.
	Reconnecting,
	Closed,
}

/// Result of asking a session to take one subscription.
pub(crate) enum PlaceOutcome {
	/// Accepted; the create request (serialized) has been submitted.
	Placed { request: String },
	/// Not welcomed yet; worth retrying once the session is.
	NoSessionIdYet,
	CostExceeded,
	/// Reconnecting or closed; not a placement candidate at all.
	Unavailable,
}

#[derive(Debug)]
pub(crate) struct PlacedSubscription {
	pub(crate) expected_cost: u32,
	/// Server-assigned id, set once the create response arrives.
	pub(crate) server_id: Option<String>,
}

/// One websocket session and the subscriptions bound to it.
#[derive(Debug)]
pub(crate) struct Session {
	pub(crate) index: u32,
	pub(crate) state: SessionState,
	pub(crate) url: Url,
	pub(crate) session_id: Option<String>,
	pub(crate) keepalive_seconds: u64,
	pub(crate) transport: TransportHandle,
	pub(crate) placed: HashMap<TopicKey, PlacedSubscription>,
	pub(crate) used_cost: u32,
	/// Session cost as last reported by the server, for diagnostics only.
	pub(crate) server_total_cost: Option<u64>,
	pub(crate) backoff_attempt: u32,
	/// Set on replacement sessions opened for a `session_reconnect`.
	pub(crate) replaces: Option<u32>,
	pub(crate) reopen_scheduled: bool,
}

impl Session {
	pub(crate) fn new(index: u32, url: Url, transport: TransportHandle, replaces: Option<u32>) -> Self {
		Self {
			index,
			state: SessionState::Connecting,
			url,
			session_id: None,
			keepalive_seconds: DEFAULT_KEEPALIVE_SECONDS,
			transport,
			placed: HashMap::new(),
			used_cost: 0,
			server_total_cost: None,
			backoff_attempt: 0,
			replaces,
			reopen_scheduled: false,
		}
	}

	/// Record the welcome and widen the watchdog to the keepalive window.
	pub(crate) fn note_welcome(&mut self, session_id: String, keepalive_seconds: Option<u64>, grace: Duration) {
		self.session_id = Some(session_id);
		self.keepalive_seconds = keepalive_seconds.unwrap_or(DEFAULT_KEEPALIVE_SECONDS);
		self.state = SessionState::Welcomed;
		self.backoff_attempt = 0;
		self.transport
			.set_watchdog(Duration::from_secs(self.keepalive_seconds * 2) + grace);
	}

	/// Try to bind one subscription to this session and submit its create request.
	pub(crate) fn place(
		&mut self,
		key: &TopicKey,
		broadcaster_id: &str,
		local_user_id: Option<&str>,
		budget: u32,
		api: &Arc<dyn EventSubApi>,
		events: &mpsc::Sender<Msg>,
	) -> PlaceOutcome {
		match self.state {
			SessionState::Connecting => return PlaceOutcome::NoSessionIdYet,
			SessionState::Reconnecting | SessionState::Closed => return PlaceOutcome::Unavailable,
			SessionState::Welcomed => {}
		}
		let Some(session_id) = self.session_id.clone() else {
			return PlaceOutcome::NoSessionIdYet;
		};

		let cost = key.kind().descriptor().expected_cost;
		if self.used_cost + cost > budget {
			return PlaceOutcome::CostExceeded;
		}

		let Some(body) = build_create_body(key.kind(), broadcaster_id, local_user_id, &session_id) else {
			warn!(session = self.index, topic = %key, "tried to place a topic whose ids are not resolved");
			return PlaceOutcome::NoSessionIdYet;
		};
		let request = serde_json::to_string(&body).unwrap_or_else(|_| format!("{body:?}"));

		self.placed.insert(
			key.clone(),
			PlacedSubscription {
				expected_cost: cost,
				server_id: None,
			},
		);
		self.used_cost += cost;

		let api = Arc::clone(api);
		let events = events.clone();
		let key = key.clone();
		let index = self.index;
		tokio::spawn(async move {
			let result = api.create_subscription(&body).await;
			let _ = events
				.send(Msg::CreateResult {
					session: index,
					key,
					result,
				})
				.await;
		});

		PlaceOutcome::Placed { request }
	}

	/// Drop one subscription, deleting it server-side if it was ever created.
	/// Returns false when the key is not placed here.
	pub(crate) fn remove(&mut self, key: &TopicKey, api: &Arc<dyn EventSubApi>) -> bool {
		let Some(placed) = self.placed.remove(key) else {
			return false;
		};
		self.used_cost = self.used_cost.saturating_sub(placed.expected_cost);

		if let Some(id) = placed.server_id {
			spawn_delete(api, id);
		}
		true
	}

	/// Forget a subscription without touching the server (its create failed).
	pub(crate) fn forget(&mut self, key: &TopicKey) {
		if let Some(placed) = self.placed.remove(key) {
			self.used_cost = self.used_cost.saturating_sub(placed.expected_cost);
		}
	}

	/// Take every placed subscription, zeroing the cost tally.
	pub(crate) fn take_placed(&mut self) -> Vec<(TopicKey, PlacedSubscription)> {
		self.used_cost = 0;
		self.server_total_cost = None;
		self.placed.drain().collect()
	}

	/// Find the placed key owning a server subscription id.
	pub(crate) fn key_for_server_id(&self, server_id: &str) -> Option<TopicKey> {
		self.placed
			.iter()
			.find(|(_, p)| p.server_id.as_deref() == Some(server_id))
			.map(|(k, _)| k.clone())
	}
}

/// Fire-and-forget server-side delete; failures are only logged.
pub(crate) fn spawn_delete(api: &Arc<dyn EventSubApi>, id: String) {
	let api = Arc::clone(api);
	tokio::spawn(async move {
		match api.delete_subscription(&id).await {
			Ok(()) => debug!(subscription = %id, "deleted server subscription"),
			Err(e) => warn!(subscription = %id, error = %e, "failed to delete server subscription"),
		}
	});
}
