//! Storage usage monitoring and retention cleanup.
//!
//! Cleanup never touches a document's head, the head's ancestors inside the retained
//! depth, or the base version of a working copy. Every pruned version leaves a
//! [`VersionTombstone`] so the surviving chain still ends somewhere explicit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::RetentionPolicy;
use crate::error::{ApdResult, ErrorContext, Operation, StorageResultExt};
use crate::ids::VersionId;
use crate::local_db_model::{Document, Version, VersionTombstone, WorkingCopy};
use crate::local_db_state::{AppDbState, Index};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub usage_bytes: u64,
    pub threshold_bytes: u64,
}

impl QuotaReport {
    pub fn over_threshold(&self) -> bool {
        self.usage_bytes >= self.threshold_bytes
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub working_copies_removed: usize,
    pub versions_pruned: usize,
}

pub struct QuotaMonitor {
    store: Arc<AppDbState>,
    policy: RetentionPolicy,
}

impl QuotaMonitor {
    pub fn new(store: Arc<AppDbState>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn check(&self) -> ApdResult<QuotaReport> {
        let ctx = ErrorContext::new(Operation::QuotaCheck);
        let usage_bytes = self.store.usage_bytes().within(&ctx)?;
        Ok(QuotaReport {
            usage_bytes,
            threshold_bytes: self.policy.threshold_bytes,
        })
    }

    pub fn cleanup(&self) -> ApdResult<CleanupReport> {
        self.cleanup_at(Utc::now())
    }

    /// Removes prunable data in one transaction, judging ages against `now`.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> ApdResult<CleanupReport> {
        let ctx = ErrorContext::new(Operation::Cleanup);
        let cutoff = now - self.policy.working_copy_retention();
        let retained_depth = self.policy.retained_depth.max(1);

        let report = self.store.transact(&ctx, |txn| {
            let mut report = CleanupReport::default();

            let working_copies: Vec<WorkingCopy> = txn.all().within(&ctx)?;
            let mut bases: HashSet<VersionId> = HashSet::new();
            for working_copy in working_copies {
                let orphaned = !txn
                    .contains::<Document>(working_copy.document_id.as_str())
                    .within(&ctx)?;
                if orphaned
                    && !working_copy.has_uncommitted_changes
                    && working_copy.last_modified < cutoff
                {
                    txn.delete::<WorkingCopy>(working_copy.document_id.as_str())
                        .within(&ctx)?;
                    report.working_copies_removed += 1;
                } else {
                    bases.insert(working_copy.base_version_id);
                }
            }

            let documents: Vec<Document> = txn.all().within(&ctx)?;
            for document in documents {
                let ctx = ErrorContext::for_document(Operation::Cleanup, &document.id);
                let mut versions: Vec<Version> = txn
                    .query_by_index(Index::VersionsByDocument, document.id.as_str())
                    .within(&ctx)?;
                if versions.len() <= retained_depth {
                    continue;
                }

                let mut protected: HashSet<VersionId> = HashSet::new();
                let mut cursor = Some(document.current_version_id.clone());
                while let Some(version_id) = cursor.take() {
                    if protected.len() >= retained_depth {
                        break;
                    }
                    cursor = versions
                        .iter()
                        .find(|v| v.id == version_id)
                        .and_then(|v| v.parent_version_id.clone());
                    protected.insert(version_id);
                }

                versions.sort_by(|a, b| b.sequence.cmp(&a.sequence));
                for version in versions.into_iter().skip(retained_depth) {
                    if protected.contains(&version.id) || bases.contains(&version.id) {
                        continue;
                    }
                    txn.delete::<Version>(version.id.as_str()).within(&ctx)?;
                    txn.put(&VersionTombstone {
                        version_id: version.id,
                        document_id: version.document_id,
                        sequence: version.sequence,
                        pruned_at: now,
                    })
                    .within(&ctx)?;
                    report.versions_pruned += 1;
                }
            }
            Ok(report)
        })?;

        info!(
            "Cleanup removed {} working copy(ies) and pruned {} version(s)",
            report.working_copies_removed, report.versions_pruned
        );
        Ok(report)
    }

    /// Cleans up only when usage has reached the threshold.
    pub fn check_and_cleanup(&self) -> ApdResult<Option<CleanupReport>> {
        let report = self.check()?;
        if !report.over_threshold() {
            return Ok(None);
        }
        warn!(
            "Storage usage {} bytes reached the threshold of {} bytes",
            report.usage_bytes, report.threshold_bytes
        );
        self.cleanup().map(Some)
    }

    /// Runs [`QuotaMonitor::check_and_cleanup`] every `period` on the current runtime.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.check_and_cleanup() {
                    error!("Periodic quota check failed: {e}");
                }
            }
        })
    }
}
