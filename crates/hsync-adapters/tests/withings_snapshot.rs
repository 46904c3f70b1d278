use std::path::{Path, PathBuf};

use hsync_adapters::sources::WithingsNormalizer;
use hsync_adapters::{load_payload_fixture, normalize_payloads, NormalizeContext};
use hsync_core::UnifiedRecord;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn withings_fixture_matches_snapshot() {
    let root = workspace_root();
    let payloads = load_payload_fixture(root.join("fixtures/withings/sample/payloads.json")).expect("fixture loads");
    let (records, errors) = normalize_payloads(&WithingsNormalizer, &payloads, &NormalizeContext::default());

    let snapshot = std::fs::read_to_string(root.join("fixtures/withings/sample/snapshot.json")).expect("snapshot exists");
    let expected: Vec<UnifiedRecord> = serde_json::from_str(&snapshot).expect("snapshot parses");

    // totalcalories includes resting burn and is never read as active calories
    assert_eq!(payloads.len(), 3);
    assert_eq!(records, expected);
    assert!(errors.is_empty());
}
