//! Convergence-driven scroll / extract / merge loop over a virtualized list.
//!
//! `Idle → Scrolling → Extracting → Comparing → {Continuing | Converged | Exhausted}`

use super::channel_merger::ChannelMerger;
use super::network::{NetworkChannel, NetworkDecoder};
use crate::core::error::HarvestResult;
use crate::core::sandbox::{CaptureRequest, PageDriver, ScrollEdge};
use crate::core::types::{
    sort_records, Direction, ExtractionAttempt, PaginationOutcome, PaginationState, Record,
    TEMP_ID_PREFIX,
};
use crate::extraction::record_extractor::RecordExtractor;
use rand::distr::{Distribution, Uniform};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PaginationPolicy {
    /// Selector of the virtualized scroll container.
    pub container: String,
    pub edge: ScrollEdge,
    /// Wait after each scroll for the list library to render new items.
    pub settle: Duration,
    /// Extra random wait in `[0, settle_jitter]` added to `settle`.
    pub settle_jitter: Duration,
    pub attempt_budget: u32,
    /// Consecutive no-growth cycles that count as convergence.
    pub no_growth_streak: u32,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            container: "[data-virtuoso-scroller], [role=\"log\"], main".to_string(),
            edge: ScrollEdge::Top,
            settle: Duration::from_millis(2000),
            settle_jitter: Duration::ZERO,
            attempt_budget: 5,
            no_growth_streak: 2,
        }
    }
}

/// `(parent_id, author_id, content, source timestamp)`. The timestamp is
/// `None` when it was synthesized locally.
type Fingerprint = (Option<String>, String, String, Option<i64>);

/// Cumulative, `record_id`-deduplicated set built across cycles.
#[derive(Debug, Default)]
pub struct CumulativeSet {
    by_id: HashMap<String, Record>,
    /// Ids per fingerprint, with the pass that first recorded each.
    fingerprints: HashMap<Fingerprint, Vec<(String, u32)>>,
    pass: u32,
    /// Entries already matched by an id-less sighting in the current pass.
    claimed: HashSet<String>,
}

impl CumulativeSet {
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Start folding the records of a new extraction pass.
    pub fn begin_pass(&mut self) {
        self.pass += 1;
        self.claimed.clear();
    }

    /// Fold one record in. Returns `true` when it added a new unique record.
    pub fn fold(&mut self, record: Record) -> bool {
        if let Some(existing) = self.by_id.get_mut(&record.record_id) {
            fold_into(existing, record);
            return false;
        }

        let fp = fingerprint(&record);
        if let Some(fp) = &fp {
            if record.has_synthesized_id() {
                if let Some(known_id) = self.earlier_sighting(fp) {
                    if let Some(existing) = self.by_id.get_mut(&known_id) {
                        fold_into(existing, record);
                        return false;
                    }
                }
            } else if let Some(temp_id) = self.placeholder_for(fp) {
                // A stable id showed up for something only seen id-less so far.
                if let Some(mut placeholder) = self.by_id.remove(&temp_id) {
                    let new_id = record.record_id.clone();
                    placeholder.record_id = new_id.clone();
                    fold_into(&mut placeholder, record);
                    if let Some(ids) = self.fingerprints.get_mut(fp) {
                        for (id, _) in ids.iter_mut().filter(|(id, _)| *id == temp_id) {
                            *id = new_id.clone();
                        }
                    }
                    self.claimed.insert(new_id.clone());
                    self.by_id.insert(new_id, placeholder);
                    return false;
                }
            }
        }

        if let Some(fp) = fp {
            self.fingerprints
                .entry(fp)
                .or_default()
                .push((record.record_id.clone(), self.pass));
        }
        self.claimed.insert(record.record_id.clone());
        self.by_id.insert(record.record_id.clone(), record);
        true
    }

    pub fn into_sorted(self) -> Vec<Record> {
        let mut records: Vec<Record> = self.by_id.into_values().collect();
        sort_records(&mut records);
        records
    }

    /// Entry an id-less sighting refers to: same fingerprint, recorded by an
    /// earlier pass, and not matched yet in this one.
    fn earlier_sighting(&mut self, fp: &Fingerprint) -> Option<String> {
        let found = self
            .fingerprints
            .get(fp)?
            .iter()
            .find(|(id, pass)| *pass < self.pass && !self.claimed.contains(id))
            .map(|(id, _)| id.clone())?;
        self.claimed.insert(found.clone());
        Some(found)
    }

    fn placeholder_for(&self, fp: &Fingerprint) -> Option<String> {
        self.fingerprints
            .get(fp)?
            .iter()
            .map(|(id, _)| id)
            .find(|id| id.starts_with(TEMP_ID_PREFIX) && !self.claimed.contains(*id))
            .cloned()
    }
}

fn fingerprint(record: &Record) -> Option<Fingerprint> {
    if record.content.is_empty() {
        return None;
    }
    Some((
        record.parent_id.clone(),
        record.author_id.clone(),
        record.content.clone(),
        (!record.timestamp_synthesized).then_some(record.timestamp),
    ))
}

/// Newer sightings fill gaps always, and override only when their channel
/// ranks at least as high as the stored one.
fn fold_into(existing: &mut Record, newer: Record) {
    let overrides = newer.source_channel >= existing.source_channel;
    let take = |have_is_empty: bool| overrides || have_is_empty;

    if newer.parent_id.is_some() && take(existing.parent_id.is_none()) {
        existing.parent_id = newer.parent_id;
    }
    if !newer.content.is_empty() && take(existing.content.is_empty()) {
        existing.content = newer.content;
    }
    if newer.author_id != crate::core::types::UNKNOWN_AUTHOR
        && take(existing.author_id == crate::core::types::UNKNOWN_AUTHOR)
    {
        existing.author_id = newer.author_id;
    }
    if newer.author_name != crate::core::types::UNKNOWN_AUTHOR
        && take(existing.author_name == crate::core::types::UNKNOWN_AUTHOR)
    {
        existing.author_name = newer.author_name;
    }
    if newer.direction != Direction::Unknown && take(existing.direction == Direction::Unknown) {
        existing.direction = newer.direction;
    }
    if !newer.timestamp_synthesized && take(existing.timestamp_synthesized) {
        existing.timestamp = newer.timestamp;
        existing.timestamp_synthesized = false;
    }
    existing.source_channel = existing.source_channel.max(newer.source_channel);
}

pub struct Paginator<'h> {
    policy: &'h PaginationPolicy,
    extractor: &'h RecordExtractor,
    merger: &'h ChannelMerger,
    decoder: &'h NetworkDecoder,
    capture: CaptureRequest,
}

impl<'h> Paginator<'h> {
    pub fn new(
        policy: &'h PaginationPolicy,
        extractor: &'h RecordExtractor,
        merger: &'h ChannelMerger,
        decoder: &'h NetworkDecoder,
    ) -> Self {
        let capture = extraction_request(&policy.container, extractor);
        Self {
            policy,
            extractor,
            merger,
            decoder,
            capture,
        }
    }

    pub async fn run(
        &self,
        driver: &dyn PageDriver,
        network: &dyn NetworkChannel,
    ) -> HarvestResult<PaginationOutcome> {
        let budget = self.policy.attempt_budget;
        let streak_needed = self.policy.no_growth_streak.max(1);

        let mut state = PaginationState::Idle;
        let mut cumulative = CumulativeSet::default();
        let mut attempts: Vec<ExtractionAttempt> = Vec::new();
        let mut previous_total = 0usize;
        let mut streak = 0u32;
        let mut attempt = 0u32;

        while attempt < budget {
            attempt += 1;

            state = transition(state, PaginationState::Scrolling, attempt);
            driver
                .scroll_to_edge(&self.policy.container, self.policy.edge)
                .await?;
            tokio::time::sleep(self.settle_delay()).await;

            state = transition(state, PaginationState::Extracting, attempt);
            let snapshot = driver.capture(&self.capture).await?;
            let extraction = self.extractor.extract_within(
                &snapshot,
                &self.policy.container,
                chrono::Utc::now().timestamp_millis(),
            );
            let candidates_matched = extraction.candidates_matched;
            if extraction.is_empty() {
                warn!(
                    "paginator attempt {}: no records ({} nodes matched `{}`)",
                    attempt, candidates_matched, self.extractor.options().class_fragment
                );
            }
            let batch = self.decoder.decode_all(&network.drain());
            let merged = self.merger.merge(extraction.records, batch.records);

            state = transition(state, PaginationState::Comparing, attempt);
            let records_observed = merged.records.len();
            cumulative.begin_pass();
            for record in merged.records {
                cumulative.fold(record);
            }
            let total = cumulative.len();
            let grew = total > previous_total;
            streak = if grew { 0 } else { streak + 1 };
            previous_total = total;

            info!(
                "paginator attempt {}/{}: observed {}, cumulative {}, grew {}",
                attempt, budget, records_observed, total, grew
            );
            attempts.push(ExtractionAttempt {
                attempt,
                candidates_matched,
                records_observed,
                cumulative_unique: total,
                grew,
                network_bodies: batch.bodies,
                network_decode_errors: batch.errors,
            });

            if streak >= streak_needed {
                state = transition(state, PaginationState::Converged, attempt);
                break;
            }
            if attempt >= budget {
                state = transition(state, PaginationState::Exhausted, attempt);
                break;
            }
            state = transition(state, PaginationState::Continuing, attempt);
        }

        if !state.is_terminal() {
            // Zero budget: nothing ran.
            state = PaginationState::Exhausted;
        }

        Ok(PaginationOutcome {
            records: cumulative.into_sorted(),
            state,
            attempts_used: attempt,
            attempts,
        })
    }

    fn settle_delay(&self) -> Duration {
        let jitter_ms = self.policy.settle_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.policy.settle;
        }
        let extra = {
            let mut rng = rand::rng();
            Uniform::new_inclusive(0u64, jitter_ms)
                .map(|dist| dist.sample(&mut rng))
                .unwrap_or(0)
        };
        self.policy.settle + Duration::from_millis(extra)
    }
}

/// Capture parameters for one extraction pass inside `container`.
pub fn extraction_request(container: &str, extractor: &RecordExtractor) -> CaptureRequest {
    let opts = extractor.options();
    CaptureRequest {
        anchors: vec![container.to_string()],
        class_fragment: opts.class_fragment.clone(),
        max_candidates: opts.max_nodes,
        scan_cap: 0,
        max_depth: opts.max_depth,
        keys: extractor.classifier().keys().keys_of_interest(),
        scope: Some(container.to_string()),
    }
}

fn transition(from: PaginationState, to: PaginationState, attempt: u32) -> PaginationState {
    debug!("paginator: {:?} -> {:?} (attempt {})", from, to, attempt);
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{RecordKind, SourceChannel, UNKNOWN_AUTHOR};

    fn rec(id: &str, content: &str, channel: SourceChannel) -> Record {
        Record {
            record_id: id.to_string(),
            parent_id: Some("t1".into()),
            kind: RecordKind::Message,
            direction: Direction::Unknown,
            content: content.to_string(),
            author_id: UNKNOWN_AUTHOR.to_string(),
            author_name: UNKNOWN_AUTHOR.to_string(),
            timestamp: 10,
            timestamp_synthesized: true,
            source_channel: channel,
            sequence_index: 0,
        }
    }

    #[test]
    fn test_fold_same_id_is_not_new() {
        let mut set = CumulativeSet::default();
        assert!(set.fold(rec("a", "x", SourceChannel::Dom)));
        let mut again = rec("a", "x", SourceChannel::Merged);
        again.author_id = "u1".into();
        assert!(!set.fold(again));
        let records = set.into_sorted();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].author_id, "u1");
        assert_eq!(records[0].source_channel, SourceChannel::Merged);
    }

    #[test]
    fn test_lower_rank_only_fills_gaps() {
        let mut set = CumulativeSet::default();
        let mut merged = rec("a", "network text", SourceChannel::Merged);
        merged.author_id = "u1".into();
        set.fold(merged);
        let mut dom = rec("a", "dom text", SourceChannel::Dom);
        dom.direction = Direction::Inbound;
        set.fold(dom);
        let r = &set.into_sorted()[0];
        assert_eq!(r.content, "network text");
        assert_eq!(r.direction, Direction::Inbound);
    }

    #[test]
    fn test_temp_ids_fold_by_fingerprint_and_upgrade() {
        let mut set = CumulativeSet::default();
        set.begin_pass();
        assert!(set.fold(rec("temp_1_0", "hello", SourceChannel::Dom)));
        set.begin_pass();
        assert!(!set.fold(rec("temp_2_4", "hello", SourceChannel::Dom)));
        set.begin_pass();
        assert!(!set.fold(rec("R9", "hello", SourceChannel::Dom)));
        assert!(set.fold(rec("temp_3_0", "", SourceChannel::Dom)));
        let ids: Vec<String> = set.into_sorted().into_iter().map(|r| r.record_id).collect();
        assert!(ids.contains(&"R9".to_string()));
        assert_eq!(ids.len(), 2);
    }

    fn sent(id: &str, content: &str, timestamp: i64) -> Record {
        let mut r = rec(id, content, SourceChannel::Dom);
        r.author_id = "u1".into();
        r.timestamp = timestamp;
        r.timestamp_synthesized = false;
        r
    }

    #[test]
    fn test_identical_text_at_different_times_stays_distinct() {
        let mut set = CumulativeSet::default();
        set.begin_pass();
        assert!(set.fold(sent("temp_100_0", "ok", 1_000)));
        assert!(set.fold(sent("temp_100_1", "ok", 61_000)));
        set.begin_pass();
        assert!(!set.fold(sent("temp_200_0", "ok", 1_000)));
        assert!(!set.fold(sent("temp_200_1", "ok", 61_000)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_repeated_row_within_one_pass_is_not_merged() {
        let mut set = CumulativeSet::default();
        set.begin_pass();
        assert!(set.fold(sent("temp_100_0", "ok", 1_000)));
        assert!(set.fold(sent("temp_100_1", "ok", 1_000)));
        set.begin_pass();
        assert!(!set.fold(sent("temp_200_0", "ok", 1_000)));
        assert!(!set.fold(sent("temp_200_1", "ok", 1_000)));
        assert!(set.fold(sent("temp_200_2", "ok", 1_000)));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_placeholder_upgrade_needs_matching_timestamp() {
        let mut set = CumulativeSet::default();
        set.begin_pass();
        assert!(set.fold(sent("R1", "ok", 1_000)));
        assert!(set.fold(sent("temp_100_0", "ok", 61_000)));
        set.begin_pass();
        assert!(set.fold(sent("R2", "ok", 120_000)));
        assert!(!set.fold(sent("R3", "ok", 61_000)));
        let ids: Vec<String> = set.into_sorted().into_iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec!["R1", "R3", "R2"]);
    }
}
