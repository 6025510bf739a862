mod common;

use common::{init_logger, message, rendered_rows, ScriptedDriver};
use serde_json::json;
use thread_harvest::extraction::snapshot::{PageSnapshot, StateSlot};
use thread_harvest::extraction::{RecordExtractor, StoreLocator, StoreStart};
use thread_harvest::{Direction, HarvestConfig, Harvester, SourceChannel};

#[test]
fn five_of_twelve_candidates_carry_a_record() {
    let mut b = PageSnapshot::builder();
    let root = b.node(None);
    let list = b.node(Some(root));

    let shaped: Vec<_> = (0..5)
        .map(|i| message(&format!("m{i}"), &format!("text {i}"), "u1", 1_700_000_000_000 + i))
        .collect();
    rendered_rows(&mut b, list, &shaped);

    // Record state exists, but further up than the walk reaches.
    for i in 0..4 {
        let far = b.node(Some(list));
        let record = message(&format!("far{i}"), "x", "u1", 1);
        b.slot(far, StateSlot::Props, json!({ "message": record }));
        let leaf = b.chain(Some(far), 25);
        b.element(Some("message-row"), leaf);
    }
    // Placeholder rows with no render node at all.
    for _ in 0..3 {
        b.element(Some("message-row message-row--skeleton"), None);
    }
    let snapshot = b.build();

    let extraction = RecordExtractor::default().extract(&snapshot, 1_700_000_100_000);
    assert_eq!(extraction.candidates_matched, 12);
    assert_eq!(extraction.records.len(), 5);
    assert_eq!(extraction.skipped_no_shape, 4);
    assert_eq!(extraction.skipped_unbound, 3);

    let ids: Vec<_> = extraction.records.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["m0", "m1", "m2", "m3", "m4"]);
    assert!(extraction
        .records
        .iter()
        .all(|r| r.source_channel == SourceChannel::Dom && !r.timestamp_synthesized));
}

#[test]
fn walk_depth_boundary_is_exclusive() {
    let mut b = PageSnapshot::builder();
    let near = b.node(None);
    b.slot(near, StateSlot::Props, json!({"message": message("near", "a", "u1", 5)}));
    let leaf = b.chain(Some(near), 19);
    b.element(Some("message"), leaf);

    let far = b.node(None);
    b.slot(far, StateSlot::Props, json!({"message": message("far", "b", "u1", 6)}));
    let leaf = b.chain(Some(far), 20);
    b.element(Some("message"), leaf);
    let snapshot = b.build();

    let extraction = RecordExtractor::default().extract(&snapshot, 0);
    assert_eq!(extraction.records.len(), 1);
    assert_eq!(extraction.records[0].record_id, "near");
}

#[test]
fn rows_without_ids_get_distinct_synthesized_ids() {
    let mut b = PageSnapshot::builder();
    let list = b.node(None);
    rendered_rows(
        &mut b,
        list,
        &[json!({"text": "first", "senderId": "u1"}), json!({"text": "second", "senderId": "u2"})],
    );
    let snapshot = b.build();

    let extraction = RecordExtractor::default().extract(&snapshot, 1_700_000_000_000);
    assert_eq!(extraction.records.len(), 2);
    assert!(extraction.records.iter().all(|r| r.has_synthesized_id()));
    assert_ne!(extraction.records[0].record_id, extraction.records[1].record_id);
    assert!(extraction.records.iter().all(|r| r.timestamp_synthesized));
}

#[test]
fn direction_falls_back_to_row_class() {
    let mut b = PageSnapshot::builder();
    let list = b.node(None);
    let row = b.node(Some(list));
    b.slot(row, StateSlot::Props, json!({"message": message("m1", "hi", "u1", 10)}));
    b.element(Some("message message--outgoing"), Some(row));
    let snapshot = b.build();

    let extraction = RecordExtractor::default().extract(&snapshot, 0);
    assert_eq!(extraction.records[0].direction, Direction::Outbound);
}

#[test]
fn store_found_from_root_when_anchors_fail() {
    let mut b = PageSnapshot::builder();
    let root = b.node(None);
    b.slot(root, StateSlot::State, json!({"chatStore": {"messages": []}}));
    let orphan = b.node(None);
    let el = b.element(Some("sidebar"), Some(orphan));
    b.anchor("#sidebar", Some(el));
    b.anchor("#missing", None);
    b.root(root);
    let snapshot = b.build();

    let anchors = vec!["#missing".to_string(), "#sidebar".to_string()];
    let store = StoreLocator::default()
        .locate(&snapshot, "chatStore", &anchors)
        .expect("store reachable from root");
    assert_eq!(store.start, StoreStart::Root);
    assert_eq!(store.slot, StateSlot::State);
}

#[test]
fn scan_fallback_picks_first_element_in_document_order() {
    let mut b = PageSnapshot::builder();
    let plain = b.node(None);
    b.element(None, Some(plain));
    for label in ["first", "second"] {
        let holder = b.node(None);
        b.slot(holder, StateSlot::Props, json!({"chatStore": {"label": label}}));
        b.element(None, Some(holder));
    }
    let snapshot = b.build();

    let locator = StoreLocator::default();
    for _ in 0..3 {
        let store = locator.locate(&snapshot, "chatStore", &[]).expect("scan hit");
        assert_eq!(store.start, StoreStart::Scan { position: 1 });
        assert_eq!(store.value["label"], "first");
    }
}

#[test]
fn missing_store_is_none() {
    let mut b = PageSnapshot::builder();
    let root = b.node(None);
    b.root(root);
    b.element(None, Some(root));
    let snapshot = b.build();
    assert!(StoreLocator::default().locate(&snapshot, "chatStore", &[]).is_none());
}

#[tokio::test]
async fn extract_once_requests_container_and_fragment() {
    init_logger();
    let driver = ScriptedDriver::new(vec![common::window(&common::messages(0, 3))]);
    let config = HarvestConfig::from_json(
        r##"{"extraction": {"container_selector": "#thread", "class_fragment": "message"}}"##,
    )
    .unwrap();
    let harvester = Harvester::new(config);

    let extraction = harvester.extract_once(&driver).await.unwrap();
    assert_eq!(extraction.records.len(), 3);

    let captures = driver.captures.lock().unwrap();
    assert_eq!(captures[0].anchors, vec!["#thread".to_string()]);
    assert_eq!(captures[0].class_fragment, "message");
    assert!(captures[0].keys.iter().any(|k| k == "message"));
}

#[tokio::test]
async fn sidebar_previews_outside_the_thread_are_not_records() {
    let mut b = PageSnapshot::builder();
    let root = b.node(None);
    b.root(root);
    let thread = b.element(Some("thread-pane"), None);
    b.anchor("#thread", Some(thread));

    let sidebar = b.node(Some(root));
    b.slot(sidebar, StateSlot::Props, json!({"message": message("last", "see you", "u3", 9)}));
    let leaf = b.node(Some(sidebar));
    b.element(Some("message-preview"), Some(leaf));

    let list = b.node(Some(root));
    let row = b.node(Some(list));
    b.slot(row, StateSlot::Props, json!({"message": message("m1", "hello", "u1", 10)}));
    b.element_in(Some("message-row"), Some(row), thread);
    let driver = ScriptedDriver::new(vec![b.build()]);

    let config = HarvestConfig::from_json(
        r##"{"extraction": {"container_selector": "#thread", "class_fragment": "message"}}"##,
    )
    .unwrap();
    let extraction = Harvester::new(config).extract_once(&driver).await.unwrap();
    let ids: Vec<_> = extraction.records.iter().map(|r| r.record_id.as_str()).collect();
    assert_eq!(ids, vec!["m1"]);

    let captures = driver.captures.lock().unwrap();
    assert_eq!(captures[0].scope.as_deref(), Some("#thread"));
}

#[test]
fn sandbox_failure_is_fatal() {
    let harvester = Harvester::new(HarvestConfig::default());
    let driver = ScriptedDriver::broken();
    let err = tokio_test::block_on(harvester.extract_once(&driver)).expect_err("sandbox refused");
    assert!(err.to_string().contains("sandbox"));
}
