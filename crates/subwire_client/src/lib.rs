#![forbid(unsafe_code)]

pub mod api;
mod frame;
mod manager;
mod pool;
mod raid;
mod resolver;
mod session;
mod transport;

pub use api::{EventSubApi, HelixApi};
pub use manager::{DEFAULT_EVENTSUB_WS_URL, EventSubConfig, EventSubManager};
pub use subwire_domain::{ApiError, CreateSubscriptionBody, TopicKey, TopicKind, WebsocketTransport, build_create_body};
pub use transport::{BoxFuture, WsConnector, WsStream};

/// Callback surface the application hands to the manager.
///
/// All three methods are invoked from the manager task, one call at a time;
/// implementations never see concurrent callers.
pub trait EventSubListener: Send + Sync + 'static {
	/// Free-form diagnostics, including wire traffic summaries.
	fn info(&self, text: &str);

	/// A decoded server notification: subscription type plus its opaque event payload.
	fn event(&self, event_type: &str, payload: &serde_json::Value);

	/// Connectivity state summary changed.
	fn status_changed(&self, summary: &str);
}
