use super::network::NetworkRecord;
use crate::core::types::{sort_records, Direction, Record, RecordKind, SourceChannel};
use crate::extraction::record_shape::{
    clip_content, normalize, NormalizeContext, RawFields, RecordCandidate,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Which channel wins when both carry different non-empty `content`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPriority {
    #[default]
    PreferNetwork,
    PreferDom,
    PreferLonger,
}

#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub content: ContentPriority,
    /// Max timestamp distance for matching id-less network records by content.
    pub timestamp_tolerance_ms: i64,
    pub max_content_chars: usize,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            content: ContentPriority::PreferNetwork,
            timestamp_tolerance_ms: 2000,
            max_content_chars: 2000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutput {
    /// Deduplicated, sorted by `(timestamp, sequence_index)`.
    pub records: Vec<Record>,
    pub merged_by_id: usize,
    pub merged_by_content: usize,
    pub network_only: usize,
    pub dom_duplicates_dropped: usize,
}

/// Reconciles the DOM and network views of the same records.
#[derive(Debug, Clone, Default)]
pub struct ChannelMerger {
    policy: MergePolicy,
}

impl ChannelMerger {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    pub fn merge(&self, dom: Vec<Record>, network: Vec<NetworkRecord>) -> MergeOutput {
        let mut out = MergeOutput::default();
        let mut records: Vec<Record> = Vec::with_capacity(dom.len() + network.len());
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for record in dom {
            if by_id.contains_key(&record.record_id) {
                out.dom_duplicates_dropped += 1;
                continue;
            }
            by_id.insert(record.record_id.clone(), records.len());
            records.push(record);
        }
        let dom_len = records.len();
        let mut content_matched = vec![false; dom_len];

        for (i, net) in network.into_iter().enumerate() {
            let target = match net.fields.id.as_deref() {
                Some(id) => by_id.get(id).copied(),
                None => self.match_by_content(&records[..dom_len], &content_matched, &net.fields),
            };

            match target {
                Some(pos) => {
                    if net.fields.id.is_none() {
                        content_matched[pos] = true;
                        out.merged_by_content += 1;
                    } else if records[pos].source_channel != SourceChannel::Network {
                        out.merged_by_id += 1;
                    }
                    let upgraded = records[pos].source_channel != SourceChannel::Network;
                    self.overlay(&mut records[pos], &net.fields);
                    if upgraded {
                        records[pos].source_channel = SourceChannel::Merged;
                    }
                }
                None => {
                    let record = self.network_only(net, (dom_len + i) as u64);
                    by_id.insert(record.record_id.clone(), records.len());
                    records.push(record);
                    out.network_only += 1;
                }
            }
        }

        sort_records(&mut records);
        debug!(
            "merge: {} records ({} by id, {} by content, {} network-only, {} dom duplicates)",
            records.len(),
            out.merged_by_id,
            out.merged_by_content,
            out.network_only,
            out.dom_duplicates_dropped
        );
        out.records = records;
        out
    }

    /// Secondary match for network records without an id: same content and a
    /// timestamp within tolerance. Without a usable timestamp on either side,
    /// content alone is accepted only when it is unambiguous.
    fn match_by_content(&self, dom: &[Record], taken: &[bool], net: &RawFields) -> Option<usize> {
        let content = clip_content(net.content.as_deref()?, self.policy.max_content_chars);
        if content.is_empty() {
            return None;
        }
        let same_content: Vec<usize> = dom
            .iter()
            .enumerate()
            .filter(|(i, r)| !taken[*i] && r.content == content)
            .map(|(i, _)| i)
            .collect();

        if let Some(ts) = net.timestamp {
            let timed = same_content.iter().copied().find(|&i| {
                !dom[i].timestamp_synthesized
                    && (dom[i].timestamp - ts).abs() <= self.policy.timestamp_tolerance_ms
            });
            if timed.is_some() {
                return timed;
            }
            let untimed: Vec<usize> = same_content
                .into_iter()
                .filter(|&i| dom[i].timestamp_synthesized)
                .collect();
            return (untimed.len() == 1).then(|| untimed[0]);
        }
        (same_content.len() == 1).then(|| same_content[0])
    }

    /// Network fields that are present and non-empty override the record.
    fn overlay(&self, record: &mut Record, net: &RawFields) {
        if let Some(parent) = non_empty(&net.parent_id) {
            record.parent_id = Some(parent.to_string());
        }
        if let Some(author) = non_empty(&net.author_id) {
            record.author_id = author.to_string();
        }
        if let Some(name) = non_empty(&net.author_name) {
            record.author_name = name.to_string();
        }
        if let Some(ts) = net.timestamp {
            record.timestamp = ts;
            record.timestamp_synthesized = false;
        }
        if let Some(direction) = net.direction.filter(|d| *d != Direction::Unknown) {
            record.direction = direction;
        }
        if let Some(content) = non_empty(&net.content) {
            let content = clip_content(content, self.policy.max_content_chars);
            let take = match self.policy.content {
                ContentPriority::PreferNetwork => true,
                ContentPriority::PreferDom => record.content.is_empty(),
                ContentPriority::PreferLonger => {
                    content.chars().count() > record.content.chars().count()
                }
            };
            if take {
                record.content = content;
            }
        }
    }

    fn network_only(&self, net: NetworkRecord, sequence_index: u64) -> Record {
        let candidate = match net.kind {
            RecordKind::Message => RecordCandidate::Message(net.fields),
            RecordKind::Conversation => RecordCandidate::Conversation(net.fields),
        };
        normalize(
            candidate,
            &NormalizeContext {
                extracted_at: net.received_at,
                sequence_index,
                max_content_chars: self.policy.max_content_chars,
                channel: SourceChannel::Network,
                direction_hint: None,
                self_author_id: None,
            },
        )
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
