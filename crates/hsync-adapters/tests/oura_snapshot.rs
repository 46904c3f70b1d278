use std::path::{Path, PathBuf};

use hsync_adapters::sources::OuraNormalizer;
use hsync_adapters::{load_payload_fixture, normalize_payloads, NormalizeContext};
use hsync_core::UnifiedRecord;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn oura_fixture_matches_snapshot() {
    let root = workspace_root();
    let payloads = load_payload_fixture(root.join("fixtures/oura/sample/payloads.json")).expect("fixture loads");
    let (records, errors) = normalize_payloads(&OuraNormalizer, &payloads, &NormalizeContext::default());

    let snapshot = std::fs::read_to_string(root.join("fixtures/oura/sample/snapshot.json")).expect("snapshot exists");
    let expected: Vec<UnifiedRecord> = serde_json::from_str(&snapshot).expect("snapshot parses");

    assert_eq!(records, expected);
    // the rate-limit page captured as a daily body
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].day.to_string(), "2025-01-02");
}
