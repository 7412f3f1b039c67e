// ペイロードのバイト列から切り離した二次索引

use std::collections::{BTreeMap, BTreeSet};

use nostr::{EventId, PublicKey};

use crate::domain::{IndexedFields, ReplaceableKey};

/// 受け入れたイベント1件の索引レコード
///
/// ペイロードが保留バッファにある間は `chunk_index` / `position` は `None`
#[derive(Debug, Clone, PartialEq)]
pub struct EventIndex {
    pub id: EventId,
    pub tenant_id: String,
    pub chunk_index: Option<usize>,
    pub position: Option<usize>,
    pub processed: bool,
    pub created_at: u64,
    pub kind: u16,
    pub pubkey: PublicKey,
    pub expiration: Option<u64>,
    pub replaceable_key: Option<ReplaceableKey>,
    pub tombstoned: bool,
}

impl EventIndex {
    pub fn fields(&self) -> IndexedFields {
        IndexedFields {
            id: self.id,
            pubkey: self.pubkey,
            kind: self.kind,
            created_at: self.created_at,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }

    /// フィルターのマッチング対象か
    pub fn is_live(&self, now: u64) -> bool {
        !self.tombstoned && !self.is_expired(now)
    }
}

/// テナントごとの created_at 順のID一覧
#[derive(Debug, Default)]
pub struct Timeline {
    by_time: BTreeMap<u64, BTreeSet<EventId>>,
    len: usize,
}

impl Timeline {
    pub fn insert(&mut self, created_at: u64, id: EventId) {
        if self.by_time.entry(created_at).or_default().insert(id) {
            self.len += 1;
        }
    }

    pub fn remove(&mut self, created_at: u64, id: &EventId) {
        if let Some(ids) = self.by_time.get_mut(&created_at) {
            if ids.remove(id) {
                self.len -= 1;
            }
            if ids.is_empty() {
                self.by_time.remove(&created_at);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `since <= created_at <= until` のIDを新しい順に返す
    ///
    /// 同じ秒のIDは昇順
    pub fn newest_first(&self, since: u64, until: u64) -> impl Iterator<Item = &EventId> + '_ {
        let range = if since <= until {
            Some(self.by_time.range(since..=until))
        } else {
            None
        };
        range
            .into_iter()
            .flat_map(|range| range.rev().flat_map(|(_, ids)| ids.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Timestamp};

    fn id_at(created_at: u64) -> EventId {
        EventBuilder::text_note("t")
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(&Keys::generate())
            .unwrap()
            .id
    }

    #[test]
    fn test_timeline_orders_newest_first() {
        let mut timeline = Timeline::default();
        let (a, b, c) = (id_at(100), id_at(300), id_at(200));
        timeline.insert(100, a);
        timeline.insert(300, b);
        timeline.insert(200, c);

        let ids: Vec<EventId> = timeline.newest_first(0, u64::MAX).copied().collect();
        assert_eq!(ids, vec![b, c, a]);
        assert_eq!(timeline.len(), 3);
    }

    #[test]
    fn test_timeline_range_is_inclusive() {
        let mut timeline = Timeline::default();
        let (a, b, c) = (id_at(100), id_at(200), id_at(300));
        timeline.insert(100, a);
        timeline.insert(200, b);
        timeline.insert(300, c);

        let ids: Vec<EventId> = timeline.newest_first(100, 200).copied().collect();
        assert_eq!(ids, vec![b, a]);
        assert_eq!(timeline.newest_first(301, 200).count(), 0);
    }

    #[test]
    fn test_timeline_remove() {
        let mut timeline = Timeline::default();
        let a = id_at(100);
        timeline.insert(100, a);
        timeline.insert(100, a);
        assert_eq!(timeline.len(), 1);
        timeline.remove(100, &a);
        assert!(timeline.is_empty());
        assert_eq!(timeline.newest_first(0, u64::MAX).count(), 0);
    }

    #[test]
    fn test_index_liveness() {
        let keys = Keys::generate();
        let mut entry = EventIndex {
            id: id_at(1),
            tenant_id: "t".to_string(),
            chunk_index: None,
            position: None,
            processed: false,
            created_at: 1,
            kind: 1,
            pubkey: keys.public_key(),
            expiration: Some(50),
            replaceable_key: None,
            tombstoned: false,
        };
        assert!(entry.is_live(49));
        assert!(!entry.is_live(50));
        entry.expiration = None;
        entry.tombstoned = true;
        assert!(!entry.is_live(0));
    }
}
