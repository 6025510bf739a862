use serde::{Deserialize, Serialize};

/// Placeholder used for author fields the page never exposed.
pub const UNKNOWN_AUTHOR: &str = "unknown";

/// Prefix of identifiers synthesized for records that carry no stable id.
pub const TEMP_ID_PREFIX: &str = "temp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    #[default]
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Unknown => "unknown",
        }
    }
}

/// Provenance of a record. Ordering is the fold rank: `Merged` beats
/// `Network` beats `Dom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceChannel {
    Dom,
    Network,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    #[default]
    Message,
    Conversation,
}

/// Canonical extracted unit: one message or one conversation-list entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub record_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub kind: RecordKind,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub content: String,
    pub author_id: String,
    pub author_name: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// `true` when `timestamp` was assigned locally because the source had none.
    #[serde(default)]
    pub timestamp_synthesized: bool,
    pub source_channel: SourceChannel,
    pub sequence_index: u64,
}

impl Record {
    pub fn has_synthesized_id(&self) -> bool {
        self.record_id.starts_with(TEMP_ID_PREFIX)
    }

    /// Total order used for every record list this crate returns.
    pub fn order_key(&self) -> (i64, u64) {
        (self.timestamp, self.sequence_index)
    }
}

/// Sort ascending by timestamp, ties broken by sequence index.
pub fn sort_records(records: &mut [Record]) {
    records.sort_by_key(Record::order_key);
}

// ── Pagination diagnostics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationState {
    Idle,
    Scrolling,
    Extracting,
    Comparing,
    Continuing,
    Converged,
    Exhausted,
}

impl PaginationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaginationState::Converged | PaginationState::Exhausted)
    }
}

/// One Paginator cycle, kept only to decide convergence and for operators
/// troubleshooting selector mismatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionAttempt {
    pub attempt: u32,
    /// Nodes that matched the class heuristic this cycle.
    pub candidates_matched: usize,
    /// Records produced by this cycle (after merging).
    pub records_observed: usize,
    pub cumulative_unique: usize,
    pub grew: bool,
    #[serde(default)]
    pub network_bodies: usize,
    #[serde(default)]
    pub network_decode_errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationOutcome {
    pub records: Vec<Record>,
    pub state: PaginationState,
    pub attempts_used: u32,
    pub attempts: Vec<ExtractionAttempt>,
}

impl PaginationOutcome {
    pub fn total(&self) -> usize {
        self.records.len()
    }

    /// Per-attempt cumulative counts, in attempt order.
    pub fn cumulative_counts(&self) -> Vec<usize> {
        self.attempts.iter().map(|a| a.cumulative_unique).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, ts: i64, idx: u64) -> Record {
        Record {
            record_id: id.to_string(),
            parent_id: None,
            kind: RecordKind::Message,
            direction: Direction::Unknown,
            content: String::new(),
            author_id: UNKNOWN_AUTHOR.to_string(),
            author_name: UNKNOWN_AUTHOR.to_string(),
            timestamp: ts,
            timestamp_synthesized: false,
            source_channel: SourceChannel::Dom,
            sequence_index: idx,
        }
    }

    #[test]
    fn test_sort_records_breaks_ties_by_sequence_index() {
        let mut records = vec![record("c", 20, 0), record("b", 10, 5), record("a", 10, 2)];
        sort_records(&mut records);
        let ids: Vec<&str> = records.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_channel_rank_order() {
        assert!(SourceChannel::Merged > SourceChannel::Network);
        assert!(SourceChannel::Network > SourceChannel::Dom);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_value(record("R1", 1, 0)).unwrap();
        assert_eq!(json["recordId"], "R1");
        assert_eq!(json["sourceChannel"], "dom");
        assert_eq!(json["direction"], "unknown");
    }
}
