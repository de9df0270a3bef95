// Shared data types and small helpers used across crates.
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),
    #[error("invalid priority: {0}")]
    InvalidPriority(u8),
    #[error("invalid since cursor: {0}")]
    InvalidSince(String),
}

/// Longest topic name accepted by [`validate_topic`].
pub const MAX_TOPIC_LEN: usize = 64;

/// Topic names are 1..=64 characters of `[-_A-Za-z0-9]`.
///
/// ```
/// assert!(herald_common::validate_topic("alerts").is_ok());
/// assert!(herald_common::validate_topic("no spaces").is_err());
/// ```
pub fn validate_topic(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_TOPIC_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTopic(name.to_string()))
    }
}

/// Time-sortable message identifier (UUIDv7).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
        Ok(Self(uuid))
    }
}

/// Kind of event carried on a subscriber's delivery channel. Only
/// [`EventKind::Message`] is cached and counted; the rest are control signals.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Open,
    Keepalive,
    Message,
    PollRequest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Min = 1,
    Low = 2,
    Default = 3,
    High = 4,
    Max = 5,
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Priority::Min),
            2 => Ok(Priority::Low),
            3 => Ok(Priority::Default),
            4 => Ok(Priority::High),
            5 => Ok(Priority::Max),
            other => Err(Error::InvalidPriority(other)),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value as u8
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Publisher-supplied payload. Opaque to dispatch; only the body size is
/// inspected at admission.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(rename = "message", default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_click(mut self, url: impl Into<String>) -> Self {
        self.click = Some(url.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// An immutable notification. `time` is the moment the message becomes
/// visible: creation time for immediate messages, release time for delayed
/// ones.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
    pub event: EventKind,
    pub topic: String,
    #[serde(flatten)]
    pub content: MessageContent,
}

impl Message {
    pub fn new(topic: impl Into<String>, content: MessageContent, time: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            // Unix seconds on the wire, the same unit `since` takes.
            time: time.trunc_subsecs(0),
            event: EventKind::Message,
            topic: topic.into(),
            content,
        }
    }

    pub fn control(kind: EventKind, topic: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            event: kind,
            ..Self::new(topic, MessageContent::default(), time)
        }
    }

    pub fn open(topic: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::control(EventKind::Open, topic, time)
    }

    pub fn keepalive(topic: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self::control(EventKind::Keepalive, topic, time)
    }

    pub fn is_message(&self) -> bool {
        self.event == EventKind::Message
    }

    pub fn body(&self) -> &str {
        &self.content.body
    }
}

/// Lower bound for backlog replay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Since {
    /// Everything retained for the topic.
    All,
    /// Messages with `time >= t`.
    Time(DateTime<Utc>),
    /// Messages newer than `now - d`; resolved to [`Since::Time`] at query time.
    Ago(Duration),
    /// Messages published after the given id. An id that is no longer
    /// retained yields everything retained.
    Id(MessageId),
}

impl Since {
    pub fn resolve(self, now: DateTime<Utc>) -> Since {
        match self {
            Since::Ago(ago) => {
                let ago = chrono::Duration::from_std(ago).unwrap_or(chrono::Duration::MAX);
                Since::Time(now.checked_sub_signed(ago).unwrap_or(DateTime::<Utc>::MIN_UTC))
            }
            other => other,
        }
    }
}

impl FromStr for Since {
    type Err = Error;

    /// Accepts `all`, unix seconds (`0` means everything), a relative
    /// duration such as `30s`, `10m`, `2h`, `1d`, or a message id.
    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("all") {
            return Ok(Since::All);
        }
        if let Ok(secs) = input.parse::<i64>() {
            return DateTime::<Utc>::from_timestamp(secs, 0)
                .map(Since::Time)
                .ok_or_else(|| Error::InvalidSince(input.to_string()));
        }
        if let Some(duration) = parse_relative(input) {
            return Ok(Since::Ago(duration));
        }
        input
            .parse::<MessageId>()
            .map(Since::Id)
            .map_err(|_| Error::InvalidSince(input.to_string()))
    }
}

fn parse_relative(input: &str) -> Option<Duration> {
    let split = input.len().checked_sub(1)?;
    if !input.is_char_boundary(split) {
        return None;
    }
    let (amount, unit) = input.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return None,
    };
    amount.checked_mul(unit_secs).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp")
    }

    #[test]
    fn topic_names_follow_allowed_alphabet() {
        assert!(validate_topic("alerts").is_ok());
        assert!(validate_topic("build-status_2").is_ok());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LEN)).is_ok());
        assert_eq!(
            validate_topic(""),
            Err(Error::InvalidTopic(String::new()))
        );
        assert!(validate_topic("a/b").is_err());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LEN + 1)).is_err());
    }

    #[test]
    fn message_ids_parse_from_display() {
        let id = MessageId::new();
        let parsed: MessageId = id.to_string().parse().expect("parse");
        assert_eq!(id, parsed);
        let err = "nope".parse::<MessageId>().expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "nope"));
    }

    #[test]
    fn message_json_uses_wire_field_names() {
        let content = MessageContent::text("hello")
            .with_title("greeting")
            .with_priority(Priority::High)
            .with_tags(["wave"]);
        let message = Message::new("alerts", content, at(1_700_000_000));
        let json = serde_json::to_value(&message).expect("json");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["event"], "message");
        assert_eq!(json["priority"], 4);
        assert_eq!(json["time"], 1_700_000_000i64);
        assert!(json.get("click").is_none());

        let decoded: Message = serde_json::from_value(json).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn message_time_is_whole_seconds() {
        let time = at(1_700_000_000) + chrono::Duration::milliseconds(750);
        let message = Message::new("alerts", MessageContent::text("x"), time);
        assert_eq!(message.time, at(1_700_000_000));
        let json = serde_json::to_string(&message).expect("json");
        let decoded: Message = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded.time, message.time);
        assert_eq!("1700000000".parse::<Since>(), Ok(Since::Time(message.time)));
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert_eq!(Priority::try_from(0), Err(Error::InvalidPriority(0)));
        assert_eq!(Priority::try_from(6), Err(Error::InvalidPriority(6)));
        assert_eq!(u8::from(Priority::Max), 5);
    }

    #[test]
    fn control_events_are_not_messages() {
        let keepalive = Message::keepalive("alerts", at(10));
        assert_eq!(keepalive.event, EventKind::Keepalive);
        assert!(!keepalive.is_message());
        assert!(Message::new("alerts", MessageContent::text("x"), at(10)).is_message());
    }

    #[test]
    fn since_parses_all_supported_forms() {
        assert_eq!("all".parse::<Since>(), Ok(Since::All));
        assert_eq!("0".parse::<Since>(), Ok(Since::Time(at(0))));
        assert_eq!("1700000000".parse::<Since>(), Ok(Since::Time(at(1_700_000_000))));
        assert_eq!("10m".parse::<Since>(), Ok(Since::Ago(Duration::from_secs(600))));
        assert_eq!("1d".parse::<Since>(), Ok(Since::Ago(Duration::from_secs(86_400))));
        let id = MessageId::new();
        assert_eq!(id.to_string().parse::<Since>(), Ok(Since::Id(id)));
        assert!(matches!("soon".parse::<Since>(), Err(Error::InvalidSince(_))));
    }

    #[test]
    fn relative_since_resolves_against_now() {
        let resolved = Since::Ago(Duration::from_secs(60)).resolve(at(1_000));
        assert_eq!(resolved, Since::Time(at(940)));
        assert_eq!(Since::All.resolve(at(1_000)), Since::All);
    }
}
