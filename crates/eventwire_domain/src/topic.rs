//! Legacy PubSub topic strings and their EventSub fan-out.
//!
//! A topic is `<prefix>.<id>[.<id>]`. The prefix selects a [`TopicKind`]; the
//! remaining segments fill that kind's identifier slots in order.

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

use crate::{Condition, SubscriptionRequest};

/// Segment separator in topic strings.
pub const SEPARATOR: char = '.';

/// Errors for parsing legacy topics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopicError {
	#[error("empty topic")]
	Empty,
	#[error("unknown topic kind: {0}")]
	UnknownKind(String),
	#[error("topic {topic:?} needs {expected} identifier(s), found {found}")]
	MissingIdentifier {
		topic: String,
		expected: usize,
		found: usize,
	},
	#[error("topic {topic:?} takes {expected} identifier(s), found {found}")]
	UnexpectedIdentifier {
		topic: String,
		expected: usize,
		found: usize,
	},
}

/// Legacy topic family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
	BitsEvents,
	BitsBadgeUnlocks,
	ChannelPoints,
	SubscribeEvents,
	ModeratorActions,
	AutomodQueue,
	UserModerationNotifications,
	Whispers,
	Raid,
	HypeTrain,
	Polls,
	VideoPlayback,
}

/// Role of an identifier segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
	Channel,
	User,
	Moderator,
}

struct TopicRow {
	kind: TopicKind,

	/// First entry is canonical.
	prefixes: &'static [&'static str],
	slots: &'static [Slot],
	events: &'static [&'static str],
	version: &'static str,

	/// `(condition key, slot index)`.
	condition: &'static [(&'static str, usize)],
}

const BROADCASTER_FROM_CHANNEL: &[(&str, usize)] = &[("broadcaster_user_id", 0)];

static TOPICS: &[TopicRow] = &[
	TopicRow {
		kind: TopicKind::BitsEvents,
		prefixes: &["channel-bits-events-v2", "channel-bits-events-v1"],
		slots: &[Slot::Channel],
		events: &["channel.cheer"],
		version: "1",
		condition: BROADCASTER_FROM_CHANNEL,
	},
	TopicRow {
		kind: TopicKind::BitsBadgeUnlocks,
		prefixes: &["channel-bits-badge-unlocks"],
		slots: &[Slot::Channel],
		events: &["channel.chat.notification"],
		version: "1",
		condition: &[("broadcaster_user_id", 0), ("user_id", 0)],
	},
	TopicRow {
		kind: TopicKind::ChannelPoints,
		prefixes: &["channel-points-channel-v1"],
		slots: &[Slot::Channel],
		events: &["channel.channel_points_custom_reward_redemption.add"],
		version: "1",
		condition: BROADCASTER_FROM_CHANNEL,
	},
	TopicRow {
		kind: TopicKind::SubscribeEvents,
		prefixes: &["channel-subscribe-events-v1"],
		slots: &[Slot::Channel],
		events: &["channel.subscribe", "channel.subscription.gift", "channel.subscription.message"],
		version: "1",
		condition: BROADCASTER_FROM_CHANNEL,
	},
	TopicRow {
		kind: TopicKind::ModeratorActions,
		prefixes: &["chat_moderator_actions"],
		slots: &[Slot::User, Slot::Channel],
		events: &["channel.moderate"],
		version: "2",
		condition: &[("broadcaster_user_id", 1), ("moderator_user_id", 0)],
	},
	TopicRow {
		kind: TopicKind::AutomodQueue,
		prefixes: &["automod-queue"],
		slots: &[Slot::Moderator, Slot::Channel],
		events: &["automod.message.hold", "automod.message.update"],
		version: "1",
		condition: &[("broadcaster_user_id", 1), ("moderator_user_id", 0)],
	},
	TopicRow {
		kind: TopicKind::UserModerationNotifications,
		prefixes: &["user-moderation-notifications"],
		slots: &[Slot::User, Slot::Channel],
		events: &["channel.chat.user_message_hold", "channel.chat.user_message_update"],
		version: "1",
		condition: &[("broadcaster_user_id", 1), ("user_id", 0)],
	},
	TopicRow {
		kind: TopicKind::Whispers,
		prefixes: &["whispers"],
		slots: &[Slot::User],
		events: &["user.whisper.message"],
		version: "1",
		condition: &[("user_id", 0)],
	},
	TopicRow {
		kind: TopicKind::Raid,
		prefixes: &["raid"],
		slots: &[Slot::Channel],
		events: &["channel.raid"],
		version: "1",
		condition: &[("to_broadcaster_user_id", 0)],
	},
	TopicRow {
		kind: TopicKind::HypeTrain,
		prefixes: &["hype-train-events-v1"],
		slots: &[Slot::Channel],
		events: &["channel.hype_train.begin", "channel.hype_train.progress", "channel.hype_train.end"],
		version: "1",
		condition: BROADCASTER_FROM_CHANNEL,
	},
	TopicRow {
		kind: TopicKind::Polls,
		prefixes: &["polls"],
		slots: &[Slot::Channel],
		events: &["channel.poll.begin", "channel.poll.progress", "channel.poll.end"],
		version: "1",
		condition: BROADCASTER_FROM_CHANNEL,
	},
	TopicRow {
		kind: TopicKind::VideoPlayback,
		prefixes: &["video-playback-by-id"],
		slots: &[Slot::Channel],
		events: &["stream.online", "stream.offline"],
		version: "1",
		condition: BROADCASTER_FROM_CHANNEL,
	},
];

impl TopicKind {
	pub const ALL: [TopicKind; 12] = [
		TopicKind::BitsEvents,
		TopicKind::BitsBadgeUnlocks,
		TopicKind::ChannelPoints,
		TopicKind::SubscribeEvents,
		TopicKind::ModeratorActions,
		TopicKind::AutomodQueue,
		TopicKind::UserModerationNotifications,
		TopicKind::Whispers,
		TopicKind::Raid,
		TopicKind::HypeTrain,
		TopicKind::Polls,
		TopicKind::VideoPlayback,
	];

	fn row(self) -> &'static TopicRow {
		// Every kind has exactly one row; the fallback is never taken.
		TOPICS.iter().find(|t| t.kind == self).unwrap_or(&TOPICS[0])
	}

	/// Resolve a first segment (any accepted version suffix) to its kind.
	pub fn from_prefix(prefix: &str) -> Option<Self> {
		TOPICS.iter().find(|t| t.prefixes.contains(&prefix)).map(|t| t.kind)
	}

	/// Canonical prefix used when formatting.
	pub fn prefix(self) -> &'static str {
		self.row().prefixes[0]
	}

	/// Identifier slots, in topic order.
	pub fn slots(self) -> &'static [Slot] {
		self.row().slots
	}

	pub fn arity(self) -> usize {
		self.row().slots.len()
	}

	/// EventSub subscription types this kind fans out to, in creation order.
	pub fn event_types(self) -> &'static [&'static str] {
		self.row().events
	}

	/// EventSub version shared by all of this kind's event types.
	pub fn event_version(self) -> &'static str {
		self.row().version
	}

	/// Format a topic string, or `None` for a wrong id count or an empty id.
	pub fn build(self, ids: &[&str]) -> Option<String> {
		format_topic(self.prefix(), self.arity(), ids)
	}
}

impl fmt::Display for TopicKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.prefix())
	}
}

impl FromStr for TopicKind {
	type Err = TopicError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(TopicError::Empty);
		}
		TopicKind::from_prefix(s).ok_or_else(|| TopicError::UnknownKind(s.to_string()))
	}
}

fn format_topic(prefix: &str, arity: usize, ids: &[&str]) -> Option<String> {
	if ids.len() != arity || ids.iter().any(|id| id.is_empty() || id.contains(SEPARATOR)) {
		return None;
	}

	let mut out = String::from(prefix);
	for id in ids {
		out.push(SEPARATOR);
		out.push_str(id);
	}
	Some(out)
}

fn check_ids(kind: TopicKind, ids: &[String], topic: &str) -> Result<(), TopicError> {
	let expected = kind.arity();
	let found = ids.iter().filter(|id| !id.is_empty()).count();

	if found < ids.len() || ids.len() < expected {
		return Err(TopicError::MissingIdentifier {
			topic: topic.to_string(),
			expected,
			found,
		});
	}
	if ids.len() > expected || ids.iter().any(|id| id.contains(SEPARATOR)) {
		return Err(TopicError::UnexpectedIdentifier {
			topic: topic.to_string(),
			expected,
			found,
		});
	}
	Ok(())
}

/// Parsed legacy topic. Version suffixes are not retained.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LegacyTopic {
	kind: TopicKind,
	ids: Vec<String>,
}

impl LegacyTopic {
	/// Construct from a kind and its identifiers.
	pub fn new(kind: TopicKind, ids: Vec<String>) -> Result<Self, TopicError> {
		check_ids(kind, &ids, kind.prefix())?;
		Ok(Self { kind, ids })
	}

	/// Parse a topic string such as `channel-subscribe-events-v1.12345`.
	pub fn parse(s: &str) -> Result<Self, TopicError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(TopicError::Empty);
		}

		let mut segments = s.split(SEPARATOR);
		let prefix = segments.next().unwrap_or_default();
		let kind = TopicKind::from_prefix(prefix).ok_or_else(|| TopicError::UnknownKind(prefix.to_string()))?;

		let ids: Vec<String> = segments.map(str::to_string).collect();
		check_ids(kind, &ids, s)?;
		Ok(Self { kind, ids })
	}

	pub fn kind(&self) -> TopicKind {
		self.kind
	}

	pub fn ids(&self) -> &[String] {
		&self.ids
	}

	fn slot(&self, role: Slot) -> Option<&str> {
		self.kind
			.slots()
			.iter()
			.position(|s| *s == role)
			.and_then(|i| self.ids.get(i))
			.map(String::as_str)
	}

	pub fn channel_id(&self) -> Option<&str> {
		self.slot(Slot::Channel)
	}

	pub fn user_id(&self) -> Option<&str> {
		self.slot(Slot::User)
	}

	pub fn moderator_id(&self) -> Option<&str> {
		self.slot(Slot::Moderator)
	}

	pub fn event_types(&self) -> &'static [&'static str] {
		self.kind.event_types()
	}

	/// One create request per fan-out event type, conditions filled from the ids.
	pub fn subscription_requests(&self) -> Vec<SubscriptionRequest> {
		let row = self.kind.row();
		let condition: Condition = row
			.condition
			.iter()
			.filter_map(|(key, slot)| self.ids.get(*slot).map(|id| ((*key).to_string(), id.clone())))
			.collect();

		row.events
			.iter()
			.map(|event_type| SubscriptionRequest::new(*event_type, row.version, condition.clone()))
			.collect()
	}

	/// Canonical topic string.
	pub fn to_topic_string(&self) -> String {
		self.to_string()
	}
}

impl fmt::Display for LegacyTopic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.kind.prefix())?;
		for id in &self.ids {
			write!(f, "{SEPARATOR}{id}")?;
		}
		Ok(())
	}
}

impl FromStr for LegacyTopic {
	type Err = TopicError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		LegacyTopic::parse(s)
	}
}

/// Parse a topic string.
pub fn parse_topic(s: &str) -> Result<LegacyTopic, TopicError> {
	LegacyTopic::parse(s)
}

/// Build a topic string from a kind prefix (any accepted version) and ids.
///
/// Returns an empty string for an unknown prefix or a wrong id count.
pub fn build_topic(prefix: &str, ids: &[&str]) -> String {
	TopicKind::from_prefix(prefix)
		.and_then(|kind| format_topic(prefix, kind.arity(), ids))
		.unwrap_or_default()
}

/// EventSub types for a topic string; empty when the topic does not parse.
pub fn event_types_for(s: &str) -> Vec<&'static str> {
	LegacyTopic::parse(s).map(|t| t.event_types().to_vec()).unwrap_or_default()
}
