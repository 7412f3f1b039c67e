// kind 5 の削除リクエストから取り出した NIP-09 の削除対象

use nostr::{Event, EventId, PublicKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionTargetKind {
    /// `e` タグ
    EventId(EventId),

    /// `a` タグ (`kind:pubkey:d`)。リクエストの created_at までの全版が対象
    Address {
        kind: u16,
        pubkey: PublicKey,
        d_tag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionTarget {
    pub target: DeletionTargetKind,
    pub requester_pubkey: PublicKey,
    pub request_created_at: u64,
}

impl DeletionTarget {
    /// 不正な `e` / `a` の値と、別の作者を指す `a` タグは読み飛ばす
    pub fn parse_from_event(event: &Event) -> Vec<DeletionTarget> {
        let requester_pubkey = event.pubkey;
        let request_created_at = event.created_at.as_secs();

        event
            .tags
            .iter()
            .filter_map(|tag| {
                let target = match tag.as_slice() {
                    [name, value, ..] if name == "e" => {
                        DeletionTargetKind::EventId(EventId::from_hex(value).ok()?)
                    }
                    [name, value, ..] if name == "a" => {
                        Self::parse_address(value, &requester_pubkey)?
                    }
                    _ => return None,
                };
                Some(DeletionTarget {
                    target,
                    requester_pubkey,
                    request_created_at,
                })
            })
            .collect()
    }

    fn parse_address(value: &str, requester_pubkey: &PublicKey) -> Option<DeletionTargetKind> {
        // d タグ自体に ':' が含まれうる
        let mut parts = value.splitn(3, ':');
        let kind: u16 = parts.next()?.parse().ok()?;
        let pubkey = PublicKey::from_hex(parts.next()?).ok()?;
        let d_tag = parts.next()?.to_string();

        if &pubkey != requester_pubkey {
            return None;
        }

        Some(DeletionTargetKind::Address {
            kind,
            pubkey,
            d_tag,
        })
    }
}

/// kind 5 イベントが何か (`e` か `a` タグ) を指定しているか
pub fn has_deletion_tags(event: &Event) -> bool {
    event.tags.iter().any(|tag| {
        matches!(tag.as_slice().first().map(String::as_str), Some("e") | Some("a"))
    })
}
