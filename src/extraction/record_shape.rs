//! Tagged-variant record classifier shared by the DOM and network channels.
//!
//! A slot (or a decoded payload object) is offered to an ordered list of
//! [`ShapePredicate`]s; the first one that recognises it yields a typed
//! [`RecordCandidate`]. Normalisation into a canonical [`Record`] is a
//! separate, pure step so both channels apply identical rules.

use crate::core::types::{
    Direction, Record, RecordKind, SourceChannel, TEMP_ID_PREFIX, UNKNOWN_AUTHOR,
};
use aho_corasick::AhoCorasick;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Field-name vocabulary used to recognise and read records.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordKeys {
    pub id: Vec<String>,
    pub content: Vec<String>,
    /// Sender / participant reference (string id or nested object).
    pub participant: Vec<String>,
    pub author_name: Vec<String>,
    pub parent: Vec<String>,
    pub timestamp: Vec<String>,
    /// Keys holding a direction string ("in", "outgoing", ...).
    pub direction: Vec<String>,
    /// Boolean keys where `true` means the record was sent by the account.
    pub outbound_flags: Vec<String>,
    /// Boolean keys where `true` means the record was received.
    pub inbound_flags: Vec<String>,
    /// Keys under which a component nests the record object itself.
    pub containers: Vec<String>,
    /// Keys only conversation-list entries carry.
    pub conversation_markers: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for RecordKeys {
    fn default() -> Self {
        Self {
            id: strings(&["id", "messageId", "message_id", "msgId", "uuid"]),
            content: strings(&["text", "content", "body", "message_text", "messageText"]),
            participant: strings(&[
                "senderId", "sender_id", "fromId", "authorId", "userId", "sender", "author", "from",
            ]),
            author_name: strings(&["senderName", "authorName", "displayName", "username", "name"]),
            parent: strings(&[
                "conversationId",
                "conversation_id",
                "chatId",
                "chat_id",
                "threadId",
                "thread_id",
            ]),
            timestamp: strings(&[
                "timestamp", "createdAt", "created_at", "sentAt", "sent_at", "time", "date",
            ]),
            direction: strings(&["direction"]),
            outbound_flags: strings(&[
                "isOutgoing", "outgoing", "isMine", "fromMe", "isSelf", "isSent",
            ]),
            inbound_flags: strings(&["isIncoming", "incoming", "isReceived"]),
            containers: strings(&["message", "msg", "item", "conversation", "chat", "data"]),
            conversation_markers: strings(&[
                "lastMessage",
                "last_message",
                "unreadCount",
                "unread_count",
                "participants",
            ]),
        }
    }
}

impl RecordKeys {
    /// Keys whose presence marks an object as record-shaped.
    pub fn indicators(&self) -> impl Iterator<Item = &str> {
        self.id
            .iter()
            .chain(&self.content)
            .chain(&self.participant)
            .map(String::as_str)
    }

    /// Every key the capture script should keep when pruning slots.
    pub fn keys_of_interest(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .indicators()
            .map(str::to_string)
            .chain(self.containers.iter().cloned())
            .chain(self.conversation_markers.iter().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn has_indicator(&self, obj: &Map<String, Value>) -> bool {
        self.indicators()
            .any(|k| obj.get(k).is_some_and(|v| !v.is_null()))
    }
}

/// Record fields as read from a source object. Everything is optional; the
/// network channel keeps records in this form so absent fields stay absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFields {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub content: Option<String>,
    pub author_id: Option<String>,
    pub author_name: Option<String>,
    pub timestamp: Option<i64>,
    pub direction: Option<Direction>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordCandidate {
    Message(RawFields),
    Conversation(RawFields),
}

impl RecordCandidate {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordCandidate::Message(_) => RecordKind::Message,
            RecordCandidate::Conversation(_) => RecordKind::Conversation,
        }
    }

    pub fn fields(&self) -> &RawFields {
        match self {
            RecordCandidate::Message(f) | RecordCandidate::Conversation(f) => f,
        }
    }

    pub fn into_fields(self) -> RawFields {
        match self {
            RecordCandidate::Message(f) | RecordCandidate::Conversation(f) => f,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMatch {
    Candidate(RecordCandidate),
    NoMatch,
}

pub trait ShapePredicate: Send + Sync {
    fn name(&self) -> &'static str;
    fn classify(&self, obj: &Map<String, Value>, keys: &RecordKeys) -> ShapeMatch;
}

/// A component prop such as `{message: {...}, isMine: true}`: the record sits
/// one level down, direction flags may sit on the outer object.
pub struct NestedRecordShape;

impl ShapePredicate for NestedRecordShape {
    fn name(&self) -> &'static str {
        "nested"
    }

    fn classify(&self, obj: &Map<String, Value>, keys: &RecordKeys) -> ShapeMatch {
        for container in &keys.containers {
            let Some(inner) = obj.get(container).and_then(Value::as_object) else {
                continue;
            };
            if !keys.has_indicator(inner) {
                continue;
            }
            let mut fields = read_fields(inner, keys);
            if fields.direction.is_none() {
                fields.direction = read_direction(obj, keys);
            }
            let conversation = container == "conversation"
                || container == "chat"
                || has_any(inner, &keys.conversation_markers);
            return ShapeMatch::Candidate(if conversation {
                RecordCandidate::Conversation(fields)
            } else {
                RecordCandidate::Message(fields)
            });
        }
        ShapeMatch::NoMatch
    }
}

pub struct ConversationShape;

impl ShapePredicate for ConversationShape {
    fn name(&self) -> &'static str {
        "conversation"
    }

    fn classify(&self, obj: &Map<String, Value>, keys: &RecordKeys) -> ShapeMatch {
        if keys.has_indicator(obj) && has_any(obj, &keys.conversation_markers) {
            let mut fields = read_fields(obj, keys);
            // A conversation's own id is its thread id.
            if fields.parent_id.is_none() {
                fields.parent_id = fields.id.clone();
            }
            if fields.content.is_none() {
                fields.content = last_message_text(obj, keys);
            }
            return ShapeMatch::Candidate(RecordCandidate::Conversation(fields));
        }
        ShapeMatch::NoMatch
    }
}

pub struct MessageShape;

impl ShapePredicate for MessageShape {
    fn name(&self) -> &'static str {
        "message"
    }

    fn classify(&self, obj: &Map<String, Value>, keys: &RecordKeys) -> ShapeMatch {
        if keys.has_indicator(obj) {
            ShapeMatch::Candidate(RecordCandidate::Message(read_fields(obj, keys)))
        } else {
            ShapeMatch::NoMatch
        }
    }
}

/// Ordered predicate list; first match wins.
pub struct Classifier {
    keys: RecordKeys,
    predicates: Vec<Box<dyn ShapePredicate>>,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field(
                "predicates",
                &self.predicates.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::standard(RecordKeys::default())
    }
}

impl Classifier {
    pub fn standard(keys: RecordKeys) -> Self {
        Self {
            keys,
            predicates: vec![
                Box::new(NestedRecordShape),
                Box::new(ConversationShape),
                Box::new(MessageShape),
            ],
        }
    }

    pub fn with_predicates(keys: RecordKeys, predicates: Vec<Box<dyn ShapePredicate>>) -> Self {
        Self { keys, predicates }
    }

    pub fn keys(&self) -> &RecordKeys {
        &self.keys
    }

    pub fn classify(&self, value: &Value) -> ShapeMatch {
        let Some(obj) = value.as_object() else {
            return ShapeMatch::NoMatch;
        };
        for predicate in &self.predicates {
            if let ShapeMatch::Candidate(c) = predicate.classify(obj, &self.keys) {
                return ShapeMatch::Candidate(c);
            }
        }
        ShapeMatch::NoMatch
    }
}

// ── Field readers ────────────────────────────────────────────────────────────

fn has_any(obj: &Map<String, Value>, keys: &[String]) -> bool {
    keys.iter().any(|k| obj.contains_key(k))
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_string(obj: &Map<String, Value>, keys: &[String]) -> Option<String> {
    keys.iter().find_map(|k| obj.get(k).and_then(scalar_string))
}

fn read_participant(
    obj: &Map<String, Value>,
    keys: &RecordKeys,
) -> (Option<String>, Option<String>) {
    for key in &keys.participant {
        match obj.get(key) {
            Some(Value::Object(person)) => {
                let id = ["id", "userId", "uid", "pk"]
                    .iter()
                    .find_map(|k| person.get(*k).and_then(scalar_string));
                let name = first_string(person, &keys.author_name);
                if id.is_some() || name.is_some() {
                    return (id, name);
                }
            }
            Some(v) => {
                if let Some(id) = scalar_string(v) {
                    return (Some(id), None);
                }
            }
            None => {}
        }
    }
    (None, None)
}

fn read_direction(obj: &Map<String, Value>, keys: &RecordKeys) -> Option<Direction> {
    for key in &keys.outbound_flags {
        if let Some(b) = obj.get(key).and_then(Value::as_bool) {
            return Some(if b { Direction::Outbound } else { Direction::Inbound });
        }
    }
    for key in &keys.inbound_flags {
        if let Some(b) = obj.get(key).and_then(Value::as_bool) {
            return Some(if b { Direction::Inbound } else { Direction::Outbound });
        }
    }
    keys.direction
        .iter()
        .find_map(|k| obj.get(k).and_then(Value::as_str))
        .and_then(parse_direction)
}

fn last_message_text(obj: &Map<String, Value>, keys: &RecordKeys) -> Option<String> {
    ["lastMessage", "last_message"].iter().find_map(|k| match obj.get(*k)? {
        Value::Object(m) => first_string(m, &keys.content),
        other => scalar_string(other),
    })
}

pub fn read_fields(obj: &Map<String, Value>, keys: &RecordKeys) -> RawFields {
    let (author_id, nested_name) = read_participant(obj, keys);
    RawFields {
        id: first_string(obj, &keys.id),
        parent_id: first_string(obj, &keys.parent),
        content: keys
            .content
            .iter()
            .find_map(|k| obj.get(k).and_then(Value::as_str))
            .map(str::to_string),
        author_id,
        author_name: first_string(obj, &keys.author_name).or(nested_name),
        timestamp: keys
            .timestamp
            .iter()
            .find_map(|k| obj.get(k).and_then(parse_timestamp)),
        direction: read_direction(obj, keys),
    }
}

/// Accepts epoch seconds, epoch milliseconds, numeric strings and RFC 3339.
pub fn parse_timestamp(v: &Value) -> Option<i64> {
    let raw = match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i64>() {
                n
            } else {
                return chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis());
            }
        }
        _ => return None,
    };
    if raw <= 0 {
        return None;
    }
    // Anything below 1e12 is too small to be milliseconds in this century.
    Some(if raw < 1_000_000_000_000 { raw * 1000 } else { raw })
}

pub fn parse_direction(s: &str) -> Option<Direction> {
    match s.trim().to_ascii_lowercase().as_str() {
        "in" | "inbound" | "incoming" | "received" | "receive" => Some(Direction::Inbound),
        "out" | "outbound" | "outgoing" | "sent" | "send" => Some(Direction::Outbound),
        _ => None,
    }
}

const OUTBOUND_CLASS_HINTS: &[&str] = &["outgoing", "outbound", "--sent", "-mine", "--self"];
const INBOUND_CLASS_HINTS: &[&str] = &["incoming", "inbound", "received", "--other"];

static CLASS_HINT_MATCHER: OnceLock<Option<AhoCorasick>> = OnceLock::new();

fn class_hint_matcher() -> Option<&'static AhoCorasick> {
    CLASS_HINT_MATCHER
        .get_or_init(|| {
            let patterns: Vec<&str> = OUTBOUND_CLASS_HINTS
                .iter()
                .chain(INBOUND_CLASS_HINTS)
                .copied()
                .collect();
            AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(patterns)
                .ok()
        })
        .as_ref()
}

/// Direction guessed from a row's class attribute, used only when the state
/// carried no direction of its own. Ambiguous class names yield `None`.
pub fn class_direction_hint(class_name: &str) -> Option<Direction> {
    let matcher = class_hint_matcher()?;
    let mut outbound = false;
    let mut inbound = false;
    for m in matcher.find_iter(class_name) {
        if m.pattern().as_usize() < OUTBOUND_CLASS_HINTS.len() {
            outbound = true;
        } else {
            inbound = true;
        }
    }
    match (outbound, inbound) {
        (true, false) => Some(Direction::Outbound),
        (false, true) => Some(Direction::Inbound),
        _ => None,
    }
}

// ── Normalisation ────────────────────────────────────────────────────────────

/// Per-pass inputs to [`normalize`].
#[derive(Debug, Clone)]
pub struct NormalizeContext<'a> {
    pub extracted_at: i64,
    pub sequence_index: u64,
    pub max_content_chars: usize,
    pub channel: SourceChannel,
    pub direction_hint: Option<Direction>,
    /// Account id of the logged-in operator; authored records are outbound.
    pub self_author_id: Option<&'a str>,
}

pub fn clip_content(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().take(max_chars).collect()
    }
}

pub fn synthesized_id(extracted_at: i64, sequence_index: u64) -> String {
    format!("{TEMP_ID_PREFIX}{extracted_at}_{sequence_index}")
}

pub fn normalize(candidate: RecordCandidate, ctx: &NormalizeContext<'_>) -> Record {
    let kind = candidate.kind();
    let fields = candidate.into_fields();

    let author_id = fields
        .author_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
    let direction = fields
        .direction
        .or(ctx.direction_hint)
        .or_else(|| {
            ctx.self_author_id
                .filter(|me| *me == author_id)
                .map(|_| Direction::Outbound)
        })
        .unwrap_or(Direction::Unknown);
    let (timestamp, timestamp_synthesized) = match fields.timestamp {
        Some(ts) => (ts, false),
        None => (ctx.extracted_at, true),
    };

    Record {
        record_id: fields
            .id
            .unwrap_or_else(|| synthesized_id(ctx.extracted_at, ctx.sequence_index)),
        parent_id: fields.parent_id,
        kind,
        direction,
        content: clip_content(fields.content.as_deref().unwrap_or_default(), ctx.max_content_chars),
        author_id,
        author_name: fields
            .author_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
        timestamp,
        timestamp_synthesized,
        source_channel: ctx.channel,
        sequence_index: ctx.sequence_index,
    }
}
