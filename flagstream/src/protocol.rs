//! Wire protocol for the streaming channel: the data-sync envelope, the
//! authenticated handshake token and the outbound control messages.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Value, json};

use crate::store::{AllData, Category};
use crate::types::{Entity, FeatureFlag, Segment};

pub(crate) const USER_AGENT: &str = "flagstream-server-sdk";

const MSG_DATA_SYNC: &str = "data-sync";
const EVENT_TYPE_FULL: &str = "full";
const EVENT_TYPE_PATCH: &str = "patch";

/// Digit substitution alphabet for the handshake token.
const DIGIT_ALPHABET: [char; 10] = ['Q', 'B', 'W', 'S', 'P', 'H', 'D', 'X', 'Z', 'U'];

/// Kind of a data-sync payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncEventType {
    Full,
    Patch,
}

/// A decoded data-sync payload: the dataset version (max entity timestamp)
/// and the categorized entities.
#[derive(Debug)]
pub(crate) struct SyncPayload {
    pub event_type: SyncEventType,
    pub version: i64,
    pub data: AllData,
}

/// Decode a server message.
///
/// `Err` means the text is not JSON at all (a fatal condition for the
/// stream); `Ok(None)` means valid JSON that is not a data-sync payload and
/// should be ignored; `Ok(Some)` carries the decoded dataset.
pub(crate) fn parse_sync_message(text: &str) -> Result<Option<SyncPayload>, serde_json::Error> {
    let envelope: Value = serde_json::from_str(text)?;
    let message_type = envelope
        .get("messageType")
        .and_then(Value::as_str)
        .unwrap_or("pong");
    if message_type != MSG_DATA_SYNC {
        return Ok(None);
    }
    let Some(data) = envelope.get("data").filter(|d| d.is_object()) else {
        return Ok(None);
    };
    let event_type = match data.get("eventType").and_then(Value::as_str) {
        Some(EVENT_TYPE_FULL) => SyncEventType::Full,
        Some(EVENT_TYPE_PATCH) => SyncEventType::Patch,
        _ => return Ok(None),
    };
    let (Some(flags), Some(segments)) = (
        data.get("featureFlags").and_then(Value::as_array),
        data.get("segments").and_then(Value::as_array),
    ) else {
        return Ok(None);
    };

    let mut version = 0;
    let mut flag_entities = HashMap::new();
    for raw in flags {
        let Some(entity) = flag_entity(raw) else {
            return Ok(None);
        };
        version = version.max(entity.timestamp);
        flag_entities.insert(entity.id.clone(), Arc::new(entity));
    }
    let mut segment_entities = HashMap::new();
    for raw in segments {
        let Some(entity) = segment_entity(raw) else {
            return Ok(None);
        };
        version = version.max(entity.timestamp);
        segment_entities.insert(entity.id.clone(), Arc::new(entity));
    }

    let mut data = AllData::new();
    data.insert(Category::FeatureFlags, flag_entities);
    data.insert(Category::Segments, segment_entities);
    Ok(Some(SyncPayload {
        event_type,
        version,
        data,
    }))
}

fn flag_entity(raw: &Value) -> Option<Entity> {
    let timestamp = millis_from_iso(raw.get("updatedAt").and_then(Value::as_str).unwrap_or(""));
    // The client-side id of a flag is its key; the server id is kept on the
    // definition itself.
    let key = raw
        .get("key")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .or_else(|| raw.get("id").and_then(Value::as_str))?;
    if raw.get("isArchived").and_then(Value::as_bool).unwrap_or(false) {
        return Some(Entity::archived(key, timestamp));
    }
    let key = key.to_string();
    let mut flag: FeatureFlag = serde_json::from_value(raw.clone()).ok()?;
    flag.key = key.clone();
    flag.build_variation_map();
    Some(Entity::flag(key, timestamp, flag))
}

fn segment_entity(raw: &Value) -> Option<Entity> {
    let timestamp = millis_from_iso(raw.get("updatedAt").and_then(Value::as_str).unwrap_or(""));
    let id = raw.get("id").and_then(Value::as_str)?;
    if raw.get("isArchived").and_then(Value::as_bool).unwrap_or(false) {
        return Some(Entity::archived(id, timestamp));
    }
    let segment: Segment = serde_json::from_value(raw.clone()).ok()?;
    Some(Entity::segment(id, timestamp, segment))
}

/// Parse an ISO-8601 timestamp into epoch milliseconds; 0 when unparseable.
pub(crate) fn millis_from_iso(value: &str) -> i64 {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed.timestamp_millis();
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc().timestamp_millis();
    }
    0
}

/// The initial request sent once the channel is open.
pub(crate) fn data_sync_request(version: i64) -> String {
    json!({"messageType": MSG_DATA_SYNC, "data": {"timestamp": version}}).to_string()
}

/// Heartbeat message.
pub(crate) fn ping_message() -> String {
    json!({"messageType": "ping", "data": null}).to_string()
}

fn encode_number(number: u64, length: usize) -> String {
    let padded = format!("000000000000{number}");
    padded[padded.len() - length..]
        .chars()
        .map(|c| DIGIT_ALPHABET[(c as u8 - b'0') as usize])
        .collect()
}

/// Build the handshake token: the secret (trailing `=` stripped) split at a
/// random offset with the encoded timestamp spliced in, prefixed by the
/// encoded offset and timestamp length.
pub(crate) fn build_token(env_secret: &str) -> String {
    let text = env_secret.trim_end_matches('=');
    let now = Utc::now().timestamp_millis().max(0) as u64;
    let timestamp_code = encode_number(now, now.to_string().len());
    let start = ((fastrand::f64() * text.len() as f64).floor() as usize).max(2);
    let split = start.min(text.len());
    let (head, tail) = text.split_at(split);
    format!(
        "{}{}{}{}{}",
        encode_number(start as u64, 3),
        encode_number(timestamp_code.len() as u64, 2),
        head,
        timestamp_code,
        tail
    )
}
