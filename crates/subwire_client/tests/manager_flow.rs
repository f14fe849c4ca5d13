//! End-to-end manager scenarios against a scripted local EventSub server and
//! a mock API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use subwire_client::api::{CreatedSubscription, EventSubApi, SubscriptionList};
use subwire_client::{ApiError, CreateSubscriptionBody, EventSubConfig, EventSubListener, EventSubManager};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;

// ---------------------------------------------------------------------------
// Scripted websocket server

struct ServerConn {
	frames: mpsc::UnboundedSender<String>,
	closed: Arc<AtomicBool>,
}

impl ServerConn {
	fn send(&self, frame: String) {
		self.frames.send(frame).expect("server connection writer gone");
	}

	fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}
}

/// Accepts websocket connections and hands each to the test for scripting.
async fn start_server() -> (String, mpsc::UnboundedReceiver<ServerConn>) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind local server");
	let addr = listener.local_addr().expect("local addr");
	let (conn_tx, conn_rx) = mpsc::unbounded_channel();

	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			let conn_tx = conn_tx.clone();
			tokio::spawn(async move {
				let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
					return;
				};
				let (mut sink, mut read) = ws.split();
				let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
				let closed = Arc::new(AtomicBool::new(false));

				if conn_tx
					.send(ServerConn {
						frames: frame_tx,
						closed: Arc::clone(&closed),
					})
					.is_err()
				{
					return;
				}

				let writer = tokio::spawn(async move {
					while let Some(frame) = frame_rx.recv().await {
						if sink.send(Message::Text(frame.into())).await.is_err() {
							break;
						}
					}
				});

				while let Some(msg) = read.next().await {
					if msg.is_err() {
						break;
					}
				}
				closed.store(true, Ordering::SeqCst);
				writer.abort();
			});
		}
	});

	(format!("ws://{addr}"), conn_rx)
}

fn welcome_frame(session_id: &str, keepalive_seconds: u64) -> String {
	serde_json::json!({
		"metadata": { "message_id": "m-welcome", "message_type": "session_welcome" },
		"payload": { "session": {
			"id": session_id,
			"status": "connected",
			"keepalive_timeout_seconds": keepalive_seconds,
			"reconnect_url": null
		} }
	})
	.to_string()
}

fn keepalive_frame() -> String {
	serde_json::json!({
		"metadata": { "message_type": "session_keepalive" },
		"payload": {}
	})
	.to_string()
}

fn reconnect_frame(url: &str) -> String {
	serde_json::json!({
		"metadata": { "message_type": "session_reconnect" },
		"payload": { "session": { "id": "old", "reconnect_url": url } }
	})
	.to_string()
}

fn notification_frame(sub_type: &str, event: serde_json::Value) -> String {
	serde_json::json!({
		"metadata": { "message_type": "notification", "subscription_type": sub_type },
		"payload": {
			"subscription": { "id": "sub-x", "type": sub_type },
			"event": event
		}
	})
	.to_string()
}

fn revocation_frame(subscription_id: &str, sub_type: &str) -> String {
	serde_json::json!({
		"metadata": { "message_type": "revocation" },
		"payload": { "subscription": {
			"id": subscription_id,
			"status": "authorization_revoked",
			"type": sub_type
		} }
	})
	.to_string()
}

// ---------------------------------------------------------------------------
// Mock API

#[derive(Default)]
struct MockApi {
	ids: Mutex<HashMap<String, String>>,
	waiters: Mutex<HashMap<String, Vec<oneshot::Sender<Option<String>>>>>,
	creates: Mutex<Vec<(CreateSubscriptionBody, String)>>,
	deletes: Mutex<Vec<String>>,
	create_attempts: AtomicU64,
	rate_limit_creates: AtomicBool,
	next_id: AtomicU64,
}

impl MockApi {
	fn with_users(users: &[(&str, &str)]) -> Arc<Self> {
		let api = MockApi::default();
		{
			let mut ids = api.ids.lock().unwrap();
			for (login, id) in users {
				ids.insert(login.to_string(), id.to_string());
			}
		}
		Arc::new(api)
	}

	/// Make a login resolvable and wake every lookup waiting on it.
	fn resolve(&self, login: &str, id: &str) {
		self.ids.lock().unwrap().insert(login.to_string(), id.to_string());
		if let Some(waiters) = self.waiters.lock().unwrap().remove(login) {
			for w in waiters {
				let _ = w.send(Some(id.to_string()));
			}
		}
	}

	fn creates(&self) -> Vec<(CreateSubscriptionBody, String)> {
		self.creates.lock().unwrap().clone()
	}

	fn create_count(&self) -> usize {
		self.creates.lock().unwrap().len()
	}

	fn create_attempts(&self) -> u64 {
		self.create_attempts.load(Ordering::SeqCst)
	}

	fn deletes(&self) -> Vec<String> {
		self.deletes.lock().unwrap().clone()
	}

	fn counts_by_session(&self) -> HashMap<String, usize> {
		let mut counts = HashMap::new();
		for (body, _) in self.creates() {
			*counts.entry(body.transport.session_id.clone()).or_insert(0) += 1;
		}
		counts
	}

	fn id_for_type(&self, event_type: &str) -> Option<String> {
		self.creates()
			.into_iter()
			.find(|(body, _)| body.event_type == event_type)
			.map(|(_, id)| id)
	}
}

#[async_trait::async_trait]
impl EventSubApi for MockApi {
	async fn user_id_for_login(&self, login: &str) -> Result<Option<String>, ApiError> {
		let rx;
		{
			let ids = self.ids.lock().unwrap();
			if let Some(id) = ids.get(login) {
				return Ok(Some(id.clone()));
			}
			let (tx, wait_rx) = oneshot::channel();
			self.waiters.lock().unwrap().entry(login.to_string()).or_default().push(tx);
			rx = wait_rx;
		}
		Ok(rx.await.unwrap_or(None))
	}

	async fn create_subscription(&self, body: &CreateSubscriptionBody) -> Result<CreatedSubscription, ApiError> {
		self.create_attempts.fetch_add(1, Ordering::SeqCst);
		if self.rate_limit_creates.load(Ordering::SeqCst) {
			return Err(ApiError::RateLimited);
		}

		let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
		let id = format!("sub-{n}");
		self.creates.lock().unwrap().push((body.clone(), id.clone()));
		Ok(CreatedSubscription {
			id,
			total_cost: None,
			max_total_cost: None,
		})
	}

	async fn delete_subscription(&self, id: &str) -> Result<(), ApiError> {
		self.deletes.lock().unwrap().push(id.to_string());
		Ok(())
	}

	async fn list_subscriptions(&self) -> Result<SubscriptionList, ApiError> {
		Ok(SubscriptionList::default())
	}

	fn token_updated(&self) {}
}

// ---------------------------------------------------------------------------
// Recording listener

#[derive(Default)]
struct RecordingListener {
	infos: Mutex<Vec<String>>,
	events: Mutex<Vec<(String, serde_json::Value)>>,
	statuses: Mutex<Vec<String>>,
}

impl RecordingListener {
	fn infos_containing(&self, needle: &str) -> usize {
		self.infos.lock().unwrap().iter().filter(|i| i.contains(needle)).count()
	}

	fn events_of(&self, event_type: &str) -> Vec<serde_json::Value> {
		self.events
			.lock()
			.unwrap()
			.iter()
			.filter(|(t, _)| t == event_type)
			.map(|(_, p)| p.clone())
			.collect()
	}

	fn last_status(&self) -> Option<String> {
		self.statuses.lock().unwrap().last().cloned()
	}
}

impl EventSubListener for RecordingListener {
	fn info(&self, text: &str) {
		self.infos.lock().unwrap().push(text.to_string());
	}

	fn event(&self, event_type: &str, payload: &serde_json::Value) {
		self.events.lock().unwrap().push((event_type.to_string(), payload.clone()));
	}

	fn status_changed(&self, summary: &str) {
		self.statuses.lock().unwrap().push(summary.to_string());
	}
}

// ---------------------------------------------------------------------------
// Harness helpers

fn test_config(ws_url: &str) -> EventSubConfig {
	EventSubConfig {
		ws_url: ws_url.to_string(),
		welcome_timeout: Duration::from_secs(5),
		reconnect_min_delay: Duration::from_millis(50),
		reconnect_max_delay: Duration::from_millis(500),
		..EventSubConfig::default()
	}
}

async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + limit;
	while Instant::now() < deadline {
		if cond() {
			return true;
		}
		sleep(Duration::from_millis(10)).await;
	}
	cond()
}

async fn next_conn(conns: &mut mpsc::UnboundedReceiver<ServerConn>) -> ServerConn {
	timeout(Duration::from_secs(5), conns.recv())
		.await
		.expect("timed out waiting for a server connection")
		.expect("server task gone")
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn single_listen_emits_moderate_create() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001"), ("me", "42")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener.clone()).expect("start manager");

	mgr.set_local_username("me").await;
	mgr.listen_mod_actions("alice").await;

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 1).await);
	let (body, _) = &api.creates()[0];
	assert_eq!(body.event_type, "channel.moderate");
	assert_eq!(body.version, "2");
	assert_eq!(
		body.condition,
		serde_json::json!({ "broadcaster_user_id": "1001", "moderator_user_id": "42" })
	);
	assert_eq!(body.transport.method, "websocket");
	assert_eq!(body.transport.session_id, "s1");

	assert!(mgr.is_connected().await);
	assert!(listener.last_status().is_some());
}

#[tokio::test]
async fn shield_stays_pending_until_local_id_resolves() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener).expect("start manager");

	mgr.set_local_username("me").await;
	mgr.listen_shield("alice").await;

	sleep(Duration::from_millis(300)).await;
	assert_eq!(api.create_attempts(), 0, "no create may be emitted before the local id resolves");

	api.resolve("me", "42");

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 2).await);
	let mut types: Vec<&'static str> = api.creates().iter().map(|(b, _)| b.event_type).collect();
	types.sort_unstable();
	assert_eq!(types, vec!["channel.shield_mode.begin", "channel.shield_mode.end"]);
	for (body, _) in api.creates() {
		assert_eq!(
			body.condition,
			serde_json::json!({ "broadcaster_user_id": "1001", "moderator_user_id": "42" })
		);
	}
}

#[tokio::test]
async fn raid_cost_shards_across_two_sessions() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("c1", "1"), ("c2", "2"), ("c3", "3"), ("c4", "4"), ("c5", "5")]);
	let listener = Arc::new(RecordingListener::default());
	let mut cfg = test_config(&url);
	cfg.cost_budget = 3;
	let mgr = EventSubManager::start(cfg, api.clone(), listener).expect("start manager");

	for channel in ["c1", "c2", "c3", "c4", "c5"] {
		mgr.listen_raid(channel).await;
	}

	let conn1 = next_conn(&mut conns).await;
	conn1.send(welcome_frame("s1", 10));

	let conn2 = next_conn(&mut conns).await;
	conn2.send(welcome_frame("s2", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 5).await);

	let counts = api.counts_by_session();
	assert_eq!(counts.get("s1"), Some(&3), "first session takes topics up to the budget");
	assert_eq!(counts.get("s2"), Some(&2), "overflow lands on the second session");
	assert!(api.creates().iter().all(|(b, _)| b.event_type == "channel.raid"));
}

#[tokio::test]
async fn reconnect_handoff_recreates_on_new_session() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener.clone()).expect("start manager");

	mgr.listen_poll("alice").await;
	mgr.listen_raid("alice").await;

	let conn1 = next_conn(&mut conns).await;
	conn1.send(welcome_frame("s1", 10));
	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 3).await);

	// Server re-homes the session; a notification delivered on the old
	// session during the overlap must not be lost.
	conn1.send(reconnect_frame(&url));
	conn1.send(notification_frame(
		"channel.raid",
		serde_json::json!({ "from_broadcaster_user_login": "alice", "viewers": 3 }),
	));

	let conn2 = next_conn(&mut conns).await;
	conn2.send(welcome_frame("s2", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 6).await);
	let counts = api.counts_by_session();
	assert_eq!(counts.get("s1"), Some(&3));
	assert_eq!(counts.get("s2"), Some(&3), "every subscription is re-created on the new session");

	let mut old_types: Vec<&'static str> = api
		.creates()
		.iter()
		.filter(|(b, _)| b.transport.session_id == "s1")
		.map(|(b, _)| b.event_type)
		.collect();
	let mut new_types: Vec<&'static str> = api
		.creates()
		.iter()
		.filter(|(b, _)| b.transport.session_id == "s2")
		.map(|(b, _)| b.event_type)
		.collect();
	old_types.sort_unstable();
	new_types.sort_unstable();
	assert_eq!(old_types, new_types);

	assert_eq!(listener.events_of("channel.raid").len(), 1, "overlap notification dispatched");
	assert!(wait_until(Duration::from_secs(3), || conn1.is_closed()).await, "old session closes after handoff");

	let status = mgr.status_text().await;
	assert!(status.contains("connections: 1"), "pool shrinks back to one session: {status}");
}

#[tokio::test]
async fn rate_limited_create_notifies_exactly_once() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	api.rate_limit_creates.store(true, Ordering::SeqCst);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener.clone()).expect("start manager");

	mgr.listen_poll("alice").await;

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_attempts() >= 2).await);
	assert!(wait_until(Duration::from_secs(3), || listener.infos_containing("eventsub.limit") == 1).await);

	// No automatic retry: the attempts counter stays put until the next
	// reconcile trigger.
	let attempts = api.create_attempts();
	sleep(Duration::from_millis(300)).await;
	assert_eq!(api.create_attempts(), attempts);

	// A fresh listen reconciles and retries, but the notification stays
	// one-per-run.
	mgr.listen_raid("alice").await;
	assert!(wait_until(Duration::from_secs(3), || api.create_attempts() > attempts).await);
	sleep(Duration::from_millis(200)).await;
	assert_eq!(listener.infos_containing("eventsub.limit"), 1);
}

#[tokio::test]
async fn unlisten_before_resolution_emits_no_create() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener).expect("start manager");

	mgr.listen_raid("bob").await;
	sleep(Duration::from_millis(150)).await;
	mgr.unlisten_raid("bob").await;

	api.resolve("bob", "7");
	sleep(Duration::from_millis(300)).await;

	assert_eq!(api.create_attempts(), 0, "create must not be emitted after unlisten");
	assert!(conns.try_recv().is_err(), "no session should have been opened");
}

#[tokio::test]
async fn listen_is_idempotent_and_unlisten_deletes() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener).expect("start manager");

	mgr.listen_poll("alice").await;

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));
	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 2).await);

	// Listening again to the same topics must not create anything new.
	mgr.listen_poll("alice").await;
	sleep(Duration::from_millis(300)).await;
	assert_eq!(api.create_count(), 2);

	mgr.unlisten_poll("alice").await;
	assert!(wait_until(Duration::from_secs(3), || api.deletes().len() == 2).await);

	let created: Vec<String> = api.creates().into_iter().map(|(_, id)| id).collect();
	let mut deleted = api.deletes();
	deleted.sort_unstable();
	let mut expected = created.clone();
	expected.sort_unstable();
	assert_eq!(deleted, expected);
}

#[tokio::test]
async fn raid_deduper_keeps_subscription_until_last_unlisten() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("me", "42")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener).expect("start manager");

	mgr.set_local_username("me").await;
	mgr.listen_raid("me").await;
	mgr.listen_raid("me").await;

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));
	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 1).await);

	mgr.unlisten_raid("me").await;
	sleep(Duration::from_millis(300)).await;
	assert!(api.deletes().is_empty(), "one interest remains; subscription must survive");

	mgr.unlisten_raid("me").await;
	assert!(wait_until(Duration::from_secs(3), || api.deletes().len() == 1).await);
}

#[tokio::test]
async fn keepalive_watchdog_reopens_session() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	let listener = Arc::new(RecordingListener::default());
	let mut cfg = test_config(&url);
	cfg.keepalive_grace = Duration::from_millis(200);
	let mgr = EventSubManager::start(cfg, api.clone(), listener).expect("start manager");

	mgr.listen_poll("alice").await;

	let conn1 = next_conn(&mut conns).await;
	conn1.send(welcome_frame("s1", 1));
	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 2).await);

	// A keepalive resets the watchdog once...
	sleep(Duration::from_millis(500)).await;
	conn1.send(keepalive_frame());

	// ...then the server goes silent and the watchdog declares the session
	// dead; the pool re-opens it with backoff and re-creates everything.
	let conn2 = timeout(Duration::from_secs(10), conns.recv())
		.await
		.expect("watchdog should force a reconnect")
		.expect("server task gone");
	conn2.send(welcome_frame("s2", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 4).await);
	let counts = api.counts_by_session();
	assert_eq!(counts.get("s2"), Some(&2), "topics re-created on the fresh session");
}

#[tokio::test]
async fn revocation_removes_subscription_and_notifies() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener.clone()).expect("start manager");

	mgr.listen_poll("alice").await;

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));
	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 2).await);

	let begin_id = api.id_for_type("channel.poll.begin").expect("poll.begin created");
	// Let the create responses flow back so the server ids are recorded.
	sleep(Duration::from_millis(200)).await;
	conn.send(revocation_frame(&begin_id, "channel.poll.begin"));

	assert!(wait_until(Duration::from_secs(3), || !listener.events_of("revocation").is_empty()).await);
	let revoked = &listener.events_of("revocation")[0];
	assert_eq!(revoked["id"], begin_id.as_str());
	assert_eq!(revoked["status"], "authorization_revoked");

	let topics = mgr.topics_text().await;
	assert!(topics.contains("channel.poll.end"), "surviving topic still listed: {topics}");
	assert!(!topics.contains("channel.poll.begin"), "revoked topic gone: {topics}");
}

#[tokio::test]
async fn notifications_dispatch_with_type_and_payload() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener.clone()).expect("start manager");

	mgr.listen_points("alice").await;

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));
	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 2).await);

	conn.send(notification_frame(
		"channel.channel_points_custom_reward_redemption.add",
		serde_json::json!({ "user_login": "viewer", "reward": { "title": "hydrate" } }),
	));

	assert!(
		wait_until(Duration::from_secs(3), || {
			!listener
				.events_of("channel.channel_points_custom_reward_redemption.add")
				.is_empty()
		})
		.await
	);
	let payload = &listener.events_of("channel.channel_points_custom_reward_redemption.add")[0];
	assert_eq!(payload["reward"]["title"], "hydrate");

	// Wire traffic shows up on the info channel.
	assert!(listener.infos_containing("-->") >= 1);
	assert!(listener.infos_containing("<--") >= 1);
}

#[tokio::test]
async fn capacity_exhaustion_notifies_once_and_queues() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("c1", "1"), ("c2", "2"), ("c3", "3")]);
	let listener = Arc::new(RecordingListener::default());
	let mut cfg = test_config(&url);
	cfg.cost_budget = 1;
	cfg.max_sessions = 1;
	let mgr = EventSubManager::start(cfg, api.clone(), listener.clone()).expect("start manager");

	mgr.listen_raid("c1").await;
	mgr.listen_raid("c2").await;

	let conn = next_conn(&mut conns).await;
	conn.send(welcome_frame("s1", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 1).await);
	assert!(wait_until(Duration::from_secs(3), || listener.infos_containing("eventsub.maxtopics") == 1).await);

	// Further listens queue silently; the notification stays one-per-run.
	mgr.listen_raid("c3").await;
	sleep(Duration::from_millis(300)).await;
	assert_eq!(api.create_count(), 1);
	assert_eq!(listener.infos_containing("eventsub.maxtopics"), 1);

	let status = mgr.status_text().await;
	assert!(status.contains("(2 pending)"), "queued topics visible in status: {status}");
}

#[tokio::test]
async fn disconnect_closes_and_reconnect_recreates() {
	let (url, mut conns) = start_server().await;
	let api = MockApi::with_users(&[("alice", "1001")]);
	let listener = Arc::new(RecordingListener::default());
	let mgr = EventSubManager::start(test_config(&url), api.clone(), listener).expect("start manager");

	mgr.listen_poll("alice").await;

	let conn1 = next_conn(&mut conns).await;
	conn1.send(welcome_frame("s1", 10));
	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 2).await);
	assert!(mgr.is_connected().await);

	mgr.disconnect().await;
	assert!(wait_until(Duration::from_secs(3), || conn1.is_closed()).await);
	assert!(!mgr.is_connected().await);

	mgr.reconnect().await;
	let conn2 = next_conn(&mut conns).await;
	conn2.send(welcome_frame("s2", 10));

	assert!(wait_until(Duration::from_secs(3), || api.create_count() == 4).await);
	assert!(mgr.is_connected().await);
}
