// NIP-09 の削除権限ルール

use nostr::PublicKey;

use super::event_kind::DELETION_KIND;

/// 対象イベントを削除できない理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionRejection {
    NotAuthor,
    ProtectedKind,
    NewerThanRequest,
}

pub struct DeletionValidator;

impl DeletionValidator {
    pub fn validate_pubkey_match(target_pubkey: &PublicKey, requester_pubkey: &PublicKey) -> bool {
        target_pubkey == requester_pubkey
    }

    /// 削除リクエスト自体は削除できない
    pub fn is_protected_kind(kind: u16) -> bool {
        kind == DELETION_KIND
    }

    pub fn is_within_deletion_window(event_created_at: u64, request_created_at: u64) -> bool {
        event_created_at <= request_created_at
    }

    /// `request_created_at` はアドレス指定の対象にだけ適用する。
    /// `e` の対象は特定のイベント1件を指す
    pub fn check(
        target_pubkey: &PublicKey,
        target_kind: u16,
        target_created_at: u64,
        requester_pubkey: &PublicKey,
        request_created_at: Option<u64>,
    ) -> Result<(), DeletionRejection> {
        if !Self::validate_pubkey_match(target_pubkey, requester_pubkey) {
            return Err(DeletionRejection::NotAuthor);
        }
        if Self::is_protected_kind(target_kind) {
            return Err(DeletionRejection::ProtectedKind);
        }
        if let Some(request_created_at) = request_created_at {
            if !Self::is_within_deletion_window(target_created_at, request_created_at) {
                return Err(DeletionRejection::NewerThanRequest);
            }
        }
        Ok(())
    }
}
