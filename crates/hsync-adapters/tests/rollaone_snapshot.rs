use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use hsync_adapters::sources::{RollaOneNormalizer, RollaOnePlan};
use hsync_adapters::{normalize_payloads, BrowserSource, NormalizeContext, PageRequest, PageResponse, PayloadKind};
use hsync_core::{ReportingTz, UnifiedRecord};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn rollaone_dashboard_matches_snapshot() {
    let root = workspace_root();
    let html = std::fs::read_to_string(root.join("fixtures/rollaone/sample/day.html")).expect("fixture loads");
    let day = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
    let url = format!("https://app.rolla.app/dashboard/day/{day}");
    let page = PageResponse {
        status: 200,
        final_url: url.clone(),
        content_type: Some("text/html; charset=utf-8".into()),
        body: html,
        set_cookies: Vec::new(),
    };

    let plan = RollaOnePlan::new(None);
    assert!(!plan.is_login_page(&page));
    let payloads = plan.extract(day, &[(PageRequest::new("day", url), page)]).expect("page scrapes");
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0].kind, PayloadKind::Daily);

    let ctx = NormalizeContext::new(ReportingTz::parse("America/New_York").unwrap());
    let (records, errors) = normalize_payloads(&RollaOneNormalizer, &payloads, &ctx);

    let snapshot = std::fs::read_to_string(root.join("fixtures/rollaone/sample/snapshot.json")).expect("snapshot exists");
    let expected: Vec<UnifiedRecord> = serde_json::from_str(&snapshot).expect("snapshot parses");

    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(records, expected);
    assert_eq!(records[0].bedtime.unwrap().to_rfc3339(), "2025-01-01T23:05:00-05:00");
}
