#![forbid(unsafe_code)]

use anyhow::Context;
use serde::Deserialize;

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
pub(crate) struct FramePeek {
	pub(crate) metadata: FramePeekMetadata,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FramePeekMetadata {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WelcomeFrame {
	pub(crate) payload: WelcomePayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WelcomePayload {
	pub(crate) session: WelcomeSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WelcomeSession {
	pub(crate) id: String,

	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReconnectFrame {
	pub(crate) payload: ReconnectPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReconnectPayload {
	pub(crate) session: ReconnectSession,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReconnectSession {
	pub(crate) reconnect_url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationFrame {
	pub(crate) metadata: FramePeekMetadata,
	pub(crate) payload: NotificationPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NotificationPayload {
	pub(crate) event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevocationFrame {
	pub(crate) payload: RevocationPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevocationPayload {
	pub(crate) subscription: RevokedSubscription,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RevokedSubscription {
	pub(crate) id: String,

	#[serde(default)]
	pub(crate) status: Option<String>,

	#[serde(rename = "type")]
	#[serde(default)]
	pub(crate) event_type: Option<String>,
}

/// A decoded `notification` frame ready for listener dispatch.
#[derive(Debug, Clone)]
pub(crate) struct Notification {
	pub(crate) event_type: String,
	pub(crate) payload: serde_json::Value,
}

/// Extract `metadata.message_type` from a raw frame.
pub(crate) fn peek_message_type(raw: &str) -> anyhow::Result<String> {
	let peek: FramePeek = serde_json::from_str(raw).context("parse frame metadata peek")?;
	Ok(peek.metadata.message_type)
}

pub(crate) fn parse_welcome(raw: &str) -> anyhow::Result<WelcomeFrame> {
	serde_json::from_str(raw).context("parse session_welcome")
}

pub(crate) fn parse_reconnect(raw: &str) -> anyhow::Result<ReconnectFrame> {
	serde_json::from_str(raw).context("parse session_reconnect")
}

pub(crate) fn parse_notification(raw: &str) -> anyhow::Result<Notification> {
	let msg: NotificationFrame = serde_json::from_str(raw).context("parse notification")?;
	let event_type = msg
		.metadata
		.subscription_type
		.context("notification frame missing metadata.subscription_type")?;
	Ok(Notification {
		event_type,
		payload: msg.payload.event,
	})
}

pub(crate) fn parse_revocation(raw: &str) -> anyhow::Result<RevocationFrame> {
	serde_json::from_str(raw).context("parse revocation")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn welcome_extracts_session_id_and_keepalive() {
		let raw = r#"{
			"metadata": { "message_id": "m1", "message_type": "session_welcome", "message_timestamp": "2024-01-01T00:00:00Z" },
			"payload": { "session": { "id": "sess-abc", "status": "connected", "connected_at": "2024-01-01T00:00:00Z", "keepalive_timeout_seconds": 10, "reconnect_url": null } }
		}"#;
		assert_eq!(peek_message_type(raw).unwrap(), "session_welcome");
		let welcome = parse_welcome(raw).unwrap();
		assert_eq!(welcome.payload.session.id, "sess-abc");
		assert_eq!(welcome.payload.session.keepalive_timeout_seconds, Some(10));
	}

	#[test]
	fn reconnect_extracts_url() {
		let raw = r#"{
			"metadata": { "message_type": "session_reconnect" },
			"payload": { "session": { "id": "sess-abc", "reconnect_url": "wss://example.invalid/ws?id=1" } }
		}"#;
		let msg = parse_reconnect(raw).unwrap();
		assert_eq!(msg.payload.session.reconnect_url, "wss://example.invalid/ws?id=1");
	}

	#[test]
	fn notification_carries_type_and_opaque_event() {
		let raw = r#"{
			"metadata": { "message_type": "notification", "subscription_type": "channel.raid" },
			"payload": {
				"subscription": { "id": "sub-1", "type": "channel.raid" },
				"event": { "from_broadcaster_user_login": "somebody", "viewers": 5 }
			}
		}"#;
		let n = parse_notification(raw).unwrap();
		assert_eq!(n.event_type, "channel.raid");
		assert_eq!(n.payload["viewers"], 5);
	}

	#[test]
	fn revocation_extracts_subscription_id_and_status() {
		let raw = r#"{
			"metadata": { "message_type": "revocation" },
			"payload": { "subscription": { "id": "sub-9", "status": "authorization_revoked", "type": "channel.moderate" } }
		}"#;
		let msg = parse_revocation(raw).unwrap();
		assert_eq!(msg.payload.subscription.id, "sub-9");
		assert_eq!(msg.payload.subscription.status.as_deref(), Some("authorization_revoked"));
	}

	#[test]
	fn garbage_frames_fail_to_peek() {
		assert!(peek_message_type("not json").is_err());
		assert!(peek_message_type(r#"{"payload":{}}"#).is_err());
	}
}
