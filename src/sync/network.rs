//! Network channel: raw intercepted bodies in, optional-field records out.

use crate::core::error::NetworkDecodeError;
use crate::core::types::RecordKind;
use crate::extraction::record_shape::{Classifier, RawFields, ShapeMatch};
use base64::Engine;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// One response body captured from the record-listing endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub url: String,
    pub body: String,
    pub base64_encoded: bool,
    pub received_at: i64,
}

impl RawResponse {
    pub fn json(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
            base64_encoded: false,
            received_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Passive buffer drained whenever the merger runs.
pub trait NetworkChannel: Send + Sync {
    fn drain(&self) -> Vec<RawResponse>;
}

/// Capped FIFO of captured bodies; the oldest body is dropped on overflow.
#[derive(Debug, Clone)]
pub struct NetworkBuffer {
    inner: Arc<Mutex<VecDeque<RawResponse>>>,
    capacity: usize,
}

impl NetworkBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, response: RawResponse) {
        let Ok(mut buf) = self.inner.lock() else {
            return;
        };
        if buf.len() >= self.capacity {
            buf.pop_front();
            warn!("network buffer full ({}), dropping oldest body", self.capacity);
        }
        buf.push_back(response);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NetworkBuffer {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NetworkChannel for NetworkBuffer {
    fn drain(&self) -> Vec<RawResponse> {
        self.inner
            .lock()
            .map(|mut b| b.drain(..).collect())
            .unwrap_or_default()
    }
}

/// A record as the network channel saw it. Absent fields stay `None` so the
/// merger can tell "not supplied" from "supplied".
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRecord {
    pub kind: RecordKind,
    pub fields: RawFields,
    pub received_at: i64,
}

#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub records: Vec<NetworkRecord>,
    pub bodies: usize,
    pub errors: usize,
}

pub struct NetworkDecoder {
    classifier: Classifier,
    list_keys: Vec<String>,
    max_depth: usize,
}

impl NetworkDecoder {
    pub fn new(classifier: Classifier, list_keys: Vec<String>) -> Self {
        Self {
            classifier,
            list_keys,
            max_depth: 6,
        }
    }

    pub fn default_list_keys() -> Vec<String> {
        ["messages", "items", "data", "list", "results", "conversations", "threads", "edges"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn decode(&self, raw: &RawResponse) -> Result<Vec<NetworkRecord>, NetworkDecodeError> {
        let text = if raw.base64_encoded {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(raw.body.trim())
                .map_err(|_| NetworkDecodeError::InvalidBase64 {
                    url: raw.url.clone(),
                })?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            raw.body.clone()
        };
        let json: Value =
            serde_json::from_str(&text).map_err(|source| NetworkDecodeError::InvalidJson {
                url: raw.url.clone(),
                source,
            })?;

        let mut out = Vec::new();
        let mut found_list = false;
        self.collect(&json, 0, &mut found_list, raw.received_at, &mut out);
        if !found_list {
            return Err(NetworkDecodeError::NoRecordList {
                url: raw.url.clone(),
            });
        }
        Ok(out)
    }

    /// Decode every body; failing bodies are dropped and counted.
    pub fn decode_all(&self, raws: &[RawResponse]) -> DecodedBatch {
        let mut batch = DecodedBatch {
            bodies: raws.len(),
            ..Default::default()
        };
        for raw in raws {
            match self.decode(raw) {
                Ok(records) => batch.records.extend(records),
                Err(e) => {
                    warn!("dropping network body: {}", e);
                    batch.errors += 1;
                }
            }
        }
        batch
    }

    fn collect(
        &self,
        value: &Value,
        depth: usize,
        found_list: &mut bool,
        received_at: i64,
        out: &mut Vec<NetworkRecord>,
    ) {
        if depth > self.max_depth {
            return;
        }
        match value {
            Value::Array(items) if depth == 0 => {
                *found_list = true;
                self.classify_items(items, received_at, out);
            }
            Value::Object(obj) => {
                for key in &self.list_keys {
                    match obj.get(key) {
                        Some(Value::Array(items)) => {
                            *found_list = true;
                            self.classify_items(items, received_at, out);
                        }
                        Some(nested @ Value::Object(_)) => {
                            self.collect(nested, depth + 1, found_list, received_at, out)
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    fn classify_items(&self, items: &[Value], received_at: i64, out: &mut Vec<NetworkRecord>) {
        for item in items {
            // GraphQL-style connections wrap each entry in `{node: {...}}`.
            let item = item.get("node").filter(|n| n.is_object()).unwrap_or(item);
            if let ShapeMatch::Candidate(c) = self.classifier.classify(item) {
                out.push(NetworkRecord {
                    kind: c.kind(),
                    fields: c.into_fields(),
                    received_at,
                });
            }
        }
    }
}

impl Default for NetworkDecoder {
    fn default() -> Self {
        Self::new(Classifier::default(), Self::default_list_keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_nested_list() {
        let body = json!({
            "data": {"thread": {"messages": [
                {"id": "R1", "senderId": "user-1", "text": "hi", "createdAt": 1_700_000_000}
            ]}}
        });
        let decoder = NetworkDecoder::new(
            Classifier::default(),
            vec!["data".into(), "thread".into(), "messages".into()],
        );
        let records = decoder
            .decode(&RawResponse::json("https://x.test/api/inbox", body.to_string()))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields.id.as_deref(), Some("R1"));
        assert_eq!(records[0].fields.author_id.as_deref(), Some("user-1"));
        assert_eq!(records[0].fields.timestamp, Some(1_700_000_000_000));
    }

    #[test]
    fn test_base64_body() {
        let body = json!([{"id": "a", "text": "x"}]).to_string();
        let raw = RawResponse {
            url: "u".into(),
            body: base64::engine::general_purpose::STANDARD.encode(body),
            base64_encoded: true,
            received_at: 0,
        };
        assert_eq!(NetworkDecoder::default().decode(&raw).unwrap().len(), 1);
    }

    #[test]
    fn test_bad_body_is_counted_not_fatal() {
        let decoder = NetworkDecoder::default();
        let batch = decoder.decode_all(&[
            RawResponse::json("u1", "{not json"),
            RawResponse::json("u2", json!({"items": [{"id": "ok"}]}).to_string()),
            RawResponse::json("u3", json!({"status": "fine"}).to_string()),
        ]);
        assert_eq!(batch.bodies, 3);
        assert_eq!(batch.errors, 2);
        assert_eq!(batch.records.len(), 1);
    }

    #[test]
    fn test_buffer_drops_oldest() {
        let buf = NetworkBuffer::new(2);
        for i in 0..3 {
            buf.push(RawResponse::json(format!("u{i}"), "[]"));
        }
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].url, "u1");
        assert!(buf.is_empty());
    }
}
