#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use subwire_domain::{ApiError, CreateSubscriptionBody};
use tracing::debug;
use url::Url;

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const USERS_PATH: &str = "/helix/users";

/// One subscription created on the server.
///
/// `total_cost`/`max_total_cost` mirror the server-reported session numbers;
/// the client never computes its own authoritative figures.
#[derive(Debug, Clone)]
pub struct CreatedSubscription {
	pub id: String,
	pub total_cost: Option<u64>,
	pub max_total_cost: Option<u64>,
}

/// One subscription as reported by the list endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiSubscription {
	pub id: String,

	#[serde(default)]
	pub status: Option<String>,

	#[serde(rename = "type")]
	pub event_type: String,

	#[serde(default)]
	pub condition: serde_json::Value,

	#[serde(default)]
	pub transport: Option<serde_json::Value>,
}

impl ApiSubscription {
	/// Session id from the transport block, if this is a websocket subscription.
	pub fn session_id(&self) -> Option<&str> {
		self.transport.as_ref()?.get("session_id")?.as_str()
	}
}

/// Aggregated result of listing all subscriptions for the account.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionList {
	pub data: Vec<ApiSubscription>,
	pub total: Option<u64>,
	pub total_cost: Option<u64>,
	pub max_total_cost: Option<u64>,
}

impl SubscriptionList {
	/// Subscription count per server session id ("-" for non-websocket transports).
	pub fn count_by_session(&self) -> BTreeMap<String, usize> {
		let mut counts = BTreeMap::new();
		for sub in &self.data {
			let key = sub.session_id().unwrap_or("-").to_string();
			*counts.entry(key).or_insert(0) += 1;
		}
		counts
	}
}

/// Abstract contract of the upstream HTTP API, as consumed by the manager.
///
/// Implementations must be safe for concurrent use; every call may run on its
/// own task.
#[async_trait::async_trait]
pub trait EventSubApi: Send + Sync + 'static {
	/// Resolve a login to its numeric user id. `Ok(None)` means the login does not exist.
	async fn user_id_for_login(&self, login: &str) -> Result<Option<String>, ApiError>;

	async fn create_subscription(&self, body: &CreateSubscriptionBody) -> Result<CreatedSubscription, ApiError>;

	async fn delete_subscription(&self, id: &str) -> Result<(), ApiError>;

	async fn list_subscriptions(&self) -> Result<SubscriptionList, ApiError>;

	/// The bearer token changed; subsequent requests must carry the new credentials.
	fn token_updated(&self);
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// Send a request, mapping rate limiting and auth rejection to typed errors.
///
/// A 429 with a usable retry delay is retried once; so is a 5xx after a short
/// pause. Returns the final status and body for the caller to interpret.
async fn send_checked(req: reqwest::RequestBuilder, label: &'static str) -> Result<(StatusCode, String), ApiError> {
	let retry_builder = req.try_clone();
	let mut resp = req
		.send()
		.await
		.map_err(|e| ApiError::Transport(format!("{label} send: {e}")))?;

	if resp.status() == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder.as_ref().and_then(|r| r.try_clone())
		&& delay <= Duration::from_secs(5)
	{
		tokio::time::sleep(delay).await;
		resp = retry
			.send()
			.await
			.map_err(|e| ApiError::Transport(format!("{label} retry send: {e}")))?;
	} else if resp.status().is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		resp = retry
			.send()
			.await
			.map_err(|e| ApiError::Transport(format!("{label} retry send: {e}")))?;
	}

	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		return Err(ApiError::Auth { status: status.as_u16() });
	}
	if status == StatusCode::TOO_MANY_REQUESTS {
		return Err(ApiError::RateLimited);
	}

	let body = resp
		.text()
		.await
		.map_err(|e| ApiError::Transport(format!("{label} read body: {e}")))?;

	Ok((status, body))
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
	data: Vec<User>,
}

#[derive(Debug, Deserialize)]
struct User {
	id: String,

	#[allow(dead_code)]
	login: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
	data: Vec<CreatedData>,

	#[serde(default)]
	total_cost: Option<u64>,

	#[serde(default)]
	max_total_cost: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CreatedData {
	id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
	data: Vec<ApiSubscription>,

	#[serde(default)]
	total: Option<u64>,

	#[serde(default)]
	total_cost: Option<u64>,

	#[serde(default)]
	max_total_cost: Option<u64>,

	#[serde(default)]
	pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
	#[serde(default)]
	cursor: Option<String>,
}

/// Production implementation of [`EventSubApi`] against the upstream HTTP API.
#[derive(Debug)]
pub struct HelixApi {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: RwLock<String>,
}

impl HelixApi {
	pub fn new(base_url: Url, client_id: impl Into<String>, bearer_token: impl Into<String>) -> Result<Self, ApiError> {
		let http = reqwest::Client::builder()
			.user_agent("subwire/0.1 (eventsub-ws)")
			.build()
			.map_err(|e| ApiError::Transport(format!("build http client: {e}")))?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
			bearer_token: RwLock::new(bearer_token.into()),
		})
	}

	/// Swap in a fresh bearer token. Requests already in flight keep the old one.
	pub fn update_token(&self, token: impl Into<String>) {
		if let Ok(mut guard) = self.bearer_token.write() {
			*guard = token.into();
		}
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		let token = self.bearer_token.read().map(|t| t.clone()).unwrap_or_default();
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {token}"))
	}

	fn url(&self, path_and_query: &str) -> Result<Url, ApiError> {
		self.base_url
			.join(path_and_query)
			.map_err(|e| ApiError::Transport(format!("join url {path_and_query}: {e}")))
	}

	async fn list_page(&self, after: Option<&str>) -> Result<ListResponse, ApiError> {
		let mut path = EVENTSUB_SUBSCRIPTIONS_PATH.to_string();
		if let Some(after) = after {
			path.push_str("?after=");
			path.push_str(&urlencoding::encode(after));
		}
		let url = self.url(&path)?;

		let (status, body) = send_checked(self.authed(self.http.get(url)), "GET /helix/eventsub/subscriptions").await?;
		if !status.is_success() {
			return Err(ApiError::Status {
				status: status.as_u16(),
				body,
			});
		}

		serde_json::from_str(&body).map_err(|e| ApiError::Transport(format!("parse subscription list: {e}")))
	}
}

#[async_trait::async_trait]
impl EventSubApi for HelixApi {
	async fn user_id_for_login(&self, login: &str) -> Result<Option<String>, ApiError> {
		let url = self.url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)))?;

		let (status, body) = send_checked(self.authed(self.http.get(url)), "GET /helix/users").await?;
		if !status.is_success() {
			return Err(ApiError::Status {
				status: status.as_u16(),
				body,
			});
		}

		let parsed: UsersResponse =
			serde_json::from_str(&body).map_err(|e| ApiError::Transport(format!("parse users: {e}")))?;
		Ok(parsed.data.into_iter().next().map(|u| u.id))
	}

	async fn create_subscription(&self, body: &CreateSubscriptionBody) -> Result<CreatedSubscription, ApiError> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;

		let (status, text) = send_checked(
			self.authed(self.http.post(url)).json(body),
			"POST /helix/eventsub/subscriptions",
		)
		.await?;

		if !status.is_success() {
			return Err(ApiError::Status {
				status: status.as_u16(),
				body: text,
			});
		}

		let parsed: CreateResponse =
			serde_json::from_str(&text).map_err(|e| ApiError::Transport(format!("parse create response: {e}")))?;
		let created = parsed.data.into_iter().next().ok_or_else(|| ApiError::Transport(
			"create subscription returned empty data".to_string(),
		))?;

		Ok(CreatedSubscription {
			id: created.id,
			total_cost: parsed.total_cost,
			max_total_cost: parsed.max_total_cost,
		})
	}

	async fn delete_subscription(&self, id: &str) -> Result<(), ApiError> {
		let url = self.url(&format!("{EVENTSUB_SUBSCRIPTIONS_PATH}?id={}", urlencoding::encode(id)))?;

		let (status, body) = send_checked(self.authed(self.http.delete(url)), "DELETE /helix/eventsub/subscriptions").await?;
		if status == StatusCode::NO_CONTENT || status.is_success() {
			return Ok(());
		}

		Err(ApiError::Status {
			status: status.as_u16(),
			body,
		})
	}

	async fn list_subscriptions(&self) -> Result<SubscriptionList, ApiError> {
		let mut out = SubscriptionList::default();
		let mut after: Option<String> = None;

		loop {
			let page = self.list_page(after.as_deref()).await?;

			if out.total.is_none() {
				out.total = page.total;
				out.total_cost = page.total_cost;
				out.max_total_cost = page.max_total_cost;
			}
			out.data.extend(page.data);

			after = page.pagination.and_then(|p| p.cursor);
			if after.is_none() {
				break;
			}
		}

		Ok(out)
	}

	fn token_updated(&self) {
		// Headers are rebuilt from the shared token on every request.
		debug!("api token updated");
	}
}
