//! Reconciling freshly normalized records with what the ledger already holds.
//!
//! Deciding is pure ([`decide`], [`plan_merge`]); writing goes through a
//! [`LedgerSink`] in one batch ([`apply_plan`]).

use std::collections::{BTreeMap, HashMap};

use hsync_core::{Fingerprint, RecordIdentity, UnifiedRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::ledger::LedgerSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    Insert,
    /// Same identity, different content: a vendor-side correction.
    Update,
    Skip,
}

/// Unchanged means an equal fingerprint over all 23 ledger columns.
pub fn decide(existing: Option<&Fingerprint>, new: &UnifiedRecord) -> MergeDecision {
    match existing {
        None => MergeDecision::Insert,
        Some(fp) if *fp == new.fingerprint() => MergeDecision::Skip,
        Some(_) => MergeDecision::Update,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "record", rename_all = "snake_case")]
pub enum LedgerOp {
    Insert(UnifiedRecord),
    Update(UnifiedRecord),
}

impl LedgerOp {
    pub fn record(&self) -> &UnifiedRecord {
        match self {
            LedgerOp::Insert(record) | LedgerOp::Update(record) => record,
        }
    }

    pub fn identity(&self) -> RecordIdentity {
        self.record().identity()
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, LedgerOp::Insert(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    /// Ordered by date, then source, then `source_record_id`.
    pub ops: Vec<LedgerOp>,
    pub skipped: usize,
    /// Records dropped because a later record in the same batch had the same identity.
    pub collapsed: usize,
}

impl MergePlan {
    pub fn inserts(&self) -> usize {
        self.ops.iter().filter(|op| op.is_insert()).count()
    }

    pub fn updates(&self) -> usize {
        self.ops.len() - self.inserts()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub fn plan_merge(existing: &HashMap<RecordIdentity, Fingerprint>, records: Vec<UnifiedRecord>) -> MergePlan {
    let total = records.len();
    let mut latest: BTreeMap<RecordIdentity, UnifiedRecord> = BTreeMap::new();
    for record in records {
        latest.insert(record.identity(), record);
    }
    let collapsed = total - latest.len();

    let mut plan = MergePlan {
        collapsed,
        ..MergePlan::default()
    };
    for (identity, record) in latest {
        match decide(existing.get(&identity), &record) {
            MergeDecision::Insert => plan.ops.push(LedgerOp::Insert(record)),
            MergeDecision::Update => plan.ops.push(LedgerOp::Update(record)),
            MergeDecision::Skip => plan.skipped += 1,
        }
    }
    plan
}

/// How a sink applies a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// All or nothing.
    Atomic,
    /// In plan order; a failure leaves a prefix written.
    RowAtATime,
}

/// The batch failed. `unwritten` are exactly the operations not applied;
/// re-applying them (or the whole plan) is safe.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("ledger write failed with {written} rows written and {} not written: {reason}", .unwritten.len())]
pub struct SinkWriteError {
    pub reason: String,
    pub written: usize,
    pub unwritten: Vec<LedgerOp>,
}

impl SinkWriteError {
    pub fn nothing_written(reason: impl Into<String>, ops: &[LedgerOp]) -> Self {
        Self {
            reason: reason.into(),
            written: 0,
            unwritten: ops.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

pub async fn apply_plan(sink: &dyn LedgerSink, plan: &MergePlan) -> Result<MergeCounts, SinkWriteError> {
    let counts = MergeCounts {
        inserted: plan.inserts(),
        updated: plan.updates(),
        skipped: plan.skipped,
    };
    if plan.is_empty() {
        info!(skipped = plan.skipped, "ledger already up to date");
        return Ok(counts);
    }

    match sink.apply_batch(&plan.ops).await {
        Ok(()) => {
            info!(inserted = counts.inserted, updated = counts.updated, skipped = counts.skipped, "ledger batch applied");
            Ok(counts)
        }
        Err(mut err) => {
            if sink.write_mode() == WriteMode::Atomic {
                err.written = 0;
                err.unwritten = plan.ops.clone();
            }
            warn!(written = err.written, unwritten = err.unwritten.len(), reason = %err.reason, "ledger batch failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use hsync_core::Source;

    fn record(day: u32, source: Source, id: &str, steps: i64) -> UnifiedRecord {
        UnifiedRecord {
            steps: Some(steps),
            ..UnifiedRecord::new(NaiveDate::from_ymd_opt(2025, 1, day).unwrap(), source, id)
        }
    }

    #[test]
    fn decision_follows_fingerprint_equality() {
        let r = record(1, Source::Oura, "a", 100);
        assert_eq!(decide(None, &r), MergeDecision::Insert);
        assert_eq!(decide(Some(&r.fingerprint()), &r), MergeDecision::Skip);
        assert_eq!(decide(Some(&record(1, Source::Oura, "a", 101).fingerprint()), &r), MergeDecision::Update);
    }

    #[test]
    fn plan_is_sorted_and_collapses_duplicates() {
        let existing = HashMap::from([
            (record(1, Source::Oura, "a", 100).identity(), record(1, Source::Oura, "a", 100).fingerprint()),
            (record(1, Source::Garmin, "g", 5).identity(), record(1, Source::Garmin, "g", 5).fingerprint()),
        ]);
        let plan = plan_merge(
            &existing,
            vec![
                record(2, Source::Oura, "b", 1),
                record(1, Source::Garmin, "g", 5),
                record(1, Source::Oura, "a", 90),
                record(1, Source::Oura, "a", 120),
            ],
        );

        assert_eq!(plan.collapsed, 1);
        assert_eq!(plan.skipped, 1);
        assert_eq!(plan.inserts(), 1);
        assert_eq!(plan.updates(), 1);
        let order: Vec<_> = plan.ops.iter().map(|op| op.record().source_record_id.as_str()).collect();
        assert_eq!(order, ["a", "b"]);
        // the later duplicate wins
        assert_eq!(plan.ops[0].record().steps, Some(120));
    }

    #[test]
    fn same_day_orders_by_source_then_id() {
        let plan = plan_merge(
            &HashMap::new(),
            vec![
                record(1, Source::RollaOne, "r", 1),
                record(1, Source::Oura, "z", 1),
                record(1, Source::Oura, "y", 1),
            ],
        );
        let order: Vec<_> = plan.ops.iter().map(|op| op.identity().to_string()).collect();
        assert_eq!(order, ["2025-01-01|oura|y", "2025-01-01|oura|z", "2025-01-01|rollaone|r"]);
    }

    #[test]
    fn ops_serialize_with_their_kind() {
        let json = serde_json::to_value(LedgerOp::Update(record(1, Source::Oura, "a", 1))).unwrap();
        assert_eq!(json["op"], "update");
        assert_eq!(json["record"]["source_record_id"], "a");
    }
}
