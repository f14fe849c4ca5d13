#![forbid(unsafe_code)]

use core::fmt;

use serde::Serialize;
use thiserror::Error;

/// Server-side event topic kinds supported by the manager.
///
/// Each kind maps to exactly one EventSub subscription type string; intents
/// that cover several types (poll, shield, automod, ...) fan out to several
/// kinds at the manager surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
	Raid,
	PollBegin,
	PollEnd,
	ShieldBegin,
	ShieldEnd,
	ShoutoutCreate,
	ChannelModerate,
	AutoModMessageHold,
	AutoModMessageUpdate,
	SuspiciousMessage,
	SuspiciousUpdate,
	WarningAcknowledge,
	#[cfg(feature = "user-message-hold")]
	UserMessageHold,
	UserMessageUpdate,
	PointsRedemptionAdd,
	PointsRedemptionUpdate,
}

/// Shape of the `condition` block in a create-subscription request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionShape {
	/// `from_broadcaster_user_id` only (raids originating from the channel).
	FromBroadcaster,
	/// `broadcaster_user_id` only.
	Broadcaster,
	/// `broadcaster_user_id` + `moderator_user_id` (local user).
	BroadcasterModerator,
	/// `broadcaster_user_id` + `user_id` (local user).
	BroadcasterUser,
}

impl ConditionShape {
	/// Whether this shape requires the local user id in addition to the broadcaster id.
	pub const fn needs_local_id(self) -> bool {
		matches!(self, Self::BroadcasterModerator | Self::BroadcasterUser)
	}
}

/// Fixed per-kind subscription parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicDescriptor {
	pub event_type: &'static str,
	pub version: &'static str,
	pub shape: ConditionShape,
	/// Cost the server counts against the per-session budget.
	pub expected_cost: u32,
}

impl TopicKind {
	/// Descriptor table. The only place type strings, versions and costs live.
	pub const fn descriptor(self) -> TopicDescriptor {
		use ConditionShape::*;

		match self {
			Self::Raid => TopicDescriptor {
				event_type: "channel.raid",
				version: "1",
				shape: FromBroadcaster,
				expected_cost: 1,
			},
			Self::PollBegin => TopicDescriptor {
				event_type: "channel.poll.begin",
				version: "1",
				shape: Broadcaster,
				expected_cost: 0,
			},
			Self::PollEnd => TopicDescriptor {
				event_type: "channel.poll.end",
				version: "1",
				shape: Broadcaster,
				expected_cost: 0,
			},
			Self::ShieldBegin => TopicDescriptor {
				event_type: "channel.shield_mode.begin",
				version: "1",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::ShieldEnd => TopicDescriptor {
				event_type: "channel.shield_mode.end",
				version: "1",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::ShoutoutCreate => TopicDescriptor {
				event_type: "channel.shoutout.create",
				version: "1",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::ChannelModerate => TopicDescriptor {
				event_type: "channel.moderate",
				version: "2",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::AutoModMessageHold => TopicDescriptor {
				event_type: "automod.message.hold",
				version: "2",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::AutoModMessageUpdate => TopicDescriptor {
				event_type: "automod.message.update",
				version: "2",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::SuspiciousMessage => TopicDescriptor {
				event_type: "channel.suspicious_user.message",
				version: "1",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::SuspiciousUpdate => TopicDescriptor {
				event_type: "channel.suspicious_user.update",
				version: "1",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			Self::WarningAcknowledge => TopicDescriptor {
				event_type: "channel.warning.acknowledge",
				version: "1",
				shape: BroadcasterModerator,
				expected_cost: 0,
			},
			#[cfg(feature = "user-message-hold")]
			Self::UserMessageHold => TopicDescriptor {
				event_type: "channel.chat.user_message_hold",
				version: "1",
				shape: BroadcasterUser,
				expected_cost: 0,
			},
			Self::UserMessageUpdate => TopicDescriptor {
				event_type: "channel.chat.user_message_update",
				version: "1",
				shape: BroadcasterUser,
				expected_cost: 0,
			},
			Self::PointsRedemptionAdd => TopicDescriptor {
				event_type: "channel.channel_points_custom_reward_redemption.add",
				version: "1",
				shape: Broadcaster,
				expected_cost: 0,
			},
			Self::PointsRedemptionUpdate => TopicDescriptor {
				event_type: "channel.channel_points_custom_reward_redemption.update",
				version: "1",
				shape: Broadcaster,
				expected_cost: 0,
			},
		}
	}

	/// Subscription type string as sent to the server.
	pub const fn event_type(self) -> &'static str {
		self.descriptor().event_type
	}

	/// Whether the kind can only become ready once the local user id is resolved.
	pub const fn needs_local_id(self) -> bool {
		self.descriptor().shape.needs_local_id()
	}
}

/// Identity of one desired subscription: `(kind, channel login)`.
///
/// Logins are stored lowercased so lookups are case-insensitive at the call
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
	kind: TopicKind,
	channel: String,
}

impl TopicKey {
	pub fn new(kind: TopicKind, channel: impl AsRef<str>) -> Self {
		Self {
			kind,
			channel: channel.as_ref().trim().to_ascii_lowercase(),
		}
	}

	pub fn kind(&self) -> TopicKind {
		self.kind
	}

	/// Channel login the topic is scoped to.
	pub fn channel(&self) -> &str {
		&self.channel
	}
}

impl fmt::Display for TopicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {}", self.kind.event_type(), self.channel)
	}
}

/// `transport` block of a create-subscription request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebsocketTransport {
	pub method: &'static str,
	pub session_id: String,
}

/// Body of a create-subscription request, ready for the API client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateSubscriptionBody {
	#[serde(rename = "type")]
	pub event_type: &'static str,
	pub version: &'static str,
	pub condition: serde_json::Value,
	pub transport: WebsocketTransport,
}

/// Build the create-request body for one topic.
///
/// Pure function of `(kind, resolved ids, session_id)`. Returns `None` when
/// the kind needs the local user id and it is not available yet; callers only
/// invoke this for ready subscriptions, so `None` means a bookkeeping bug
/// upstream rather than an expected state.
pub fn build_create_body(
	kind: TopicKind,
	broadcaster_id: &str,
	local_user_id: Option<&str>,
	session_id: &str,
) -> Option<CreateSubscriptionBody> {
	let desc = kind.descriptor();

	let condition = match desc.shape {
		ConditionShape::FromBroadcaster => serde_json::json!({ "from_broadcaster_user_id": broadcaster_id }),
		ConditionShape::Broadcaster => serde_json::json!({ "broadcaster_user_id": broadcaster_id }),
		ConditionShape::BroadcasterModerator => serde_json::json!({
			"broadcaster_user_id": broadcaster_id,
			"moderator_user_id": local_user_id?,
		}),
		ConditionShape::BroadcasterUser => serde_json::json!({
			"broadcaster_user_id": broadcaster_id,
			"user_id": local_user_id?,
		}),
	};

	Some(CreateSubscriptionBody {
		event_type: desc.event_type,
		version: desc.version,
		condition,
		transport: WebsocketTransport {
			method: "websocket",
			session_id: session_id.to_string(),
		},
	})
}

/// Failures surfaced by the API collaborator.
#[derive(Debug, Error, Clone)]
pub enum ApiError {
	/// HTTP 429: the account hit the subscription request limit.
	#[error("rate limited")]
	RateLimited,

	/// HTTP 401/403: the bearer token was rejected.
	#[error("auth rejected (status={status})")]
	Auth { status: u16 },

	/// Any other non-success HTTP status.
	#[error("request failed (status={status}): {body}")]
	Status { status: u16, body: String },

	/// Connection-level failure before a status was received.
	#[error("transport: {0}")]
	Transport(String),
}

impl ApiError {
	/// Whether retrying the same request can ever succeed.
	///
	/// Client errors other than rate limiting and auth mean the server will
	/// never accept the request as-is; the subscription should be dropped
	/// instead of re-queued.
	pub fn is_terminal(&self) -> bool {
		match self {
			Self::RateLimited | Self::Auth { .. } | Self::Transport(_) => false,
			Self::Status { status, .. } => (400..500).contains(status) && *status != 408,
		}
	}
}
