//! NIP-09 削除リクエスト
//!
//! kind 5 イベントの `e` / `a` タグの対象を解決し、要求者が削除できるものに
//! 墓標を立てて永続化キューへ渡す。

use std::sync::Arc;

use nostr::{Event, EventId};
use thiserror::Error;
use tracing::debug;

use crate::domain::{DeletionTarget, DeletionTargetKind};
use crate::domain::deletion_target::has_deletion_tags;
use crate::infrastructure::event_store::DeleteReport;
use crate::infrastructure::task_pipeline::Job;
use crate::infrastructure::TaskPipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionResult {
    pub deleted: Vec<EventId>,
    /// 見つかったが削除できなかった対象の数 (他人の所有、または要求より新しい)
    pub rejected: usize,
    pub missing: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeletionError {
    #[error("missing required tags")]
    MissingTags,

    #[error("no events found for deletion")]
    NothingDeleted,
}

pub struct DeletionHandler {
    pipeline: Arc<TaskPipeline>,
}

impl DeletionHandler {
    pub fn new(pipeline: Arc<TaskPipeline>) -> Self {
        Self { pipeline }
    }

    /// `tenant_id` 内で `deletion_event` の対象に墓標を立てる
    ///
    /// 対象の指定がない場合と、指定した対象を一つも削除できなかった場合はエラー。
    /// 削除リクエスト自体はここでは保存しない
    pub fn process_deletion(
        &self,
        deletion_event: &Event,
        tenant_id: &str,
    ) -> Result<DeletionResult, DeletionError> {
        if !has_deletion_tags(deletion_event) {
            return Err(DeletionError::MissingTags);
        }

        let store = self.pipeline.store();
        let targets = DeletionTarget::parse_from_event(deletion_event);

        let mut ids = Vec::new();
        let mut report = DeleteReport::default();
        for target in &targets {
            match &target.target {
                DeletionTargetKind::EventId(id) => ids.push(*id),
                DeletionTargetKind::Address {
                    kind,
                    pubkey,
                    d_tag,
                } => {
                    let address_report = store.delete_address(
                        *kind,
                        pubkey,
                        d_tag,
                        &target.requester_pubkey,
                        target.request_created_at,
                        tenant_id,
                    );
                    merge(&mut report, address_report);
                }
            }
        }
        if !ids.is_empty() {
            let id_report = store.delete(&ids, &deletion_event.pubkey, tenant_id);
            merge(&mut report, id_report);
        }

        debug!(
            event_id = %deletion_event.id,
            targets = targets.len(),
            deleted = report.deleted.len(),
            rejected = report.rejected,
            missing = report.missing,
            "deletion request resolved"
        );

        if report.deleted.is_empty() {
            return Err(DeletionError::NothingDeleted);
        }

        self.pipeline.enqueue(Job::Delete {
            ids: report.deleted.clone(),
        });

        Ok(DeletionResult {
            deleted: report.deleted,
            rejected: report.rejected,
            missing: report.missing,
        })
    }
}

fn merge(into: &mut DeleteReport, other: DeleteReport) {
    into.deleted.extend(other.deleted);
    into.rejected += other.rejected;
    into.missing += other.missing;
}
