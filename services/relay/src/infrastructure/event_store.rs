//! 全テナントで共有するインメモリのイベントストア
//!
//! 受け入れたイベントは `pending` バッファと索引に同時に入るので、
//! キューのコンシューマーがチャンクへ書き込む前からフィルターにマッチする。
//! 削除、置き換え、有効期限切れは索引エントリに墓標を立て、
//! コンシューマーが適用するまでIDを `pending_delete` に置く。
//!
//! マップと集合はすべて1つの `RwLock` の内側にあり、`.await` をまたいで
//! ガードを保持しない。走査は読み取りロック中に候補を集め、
//! ロックを外してからペイロードをデコードする。

mod chunk;
mod index;

pub use chunk::{Chunk, ChunkError, TimeRange};
pub use index::{EventIndex, Timeline};

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use nostr::{Event, EventId, Filter, PublicKey, Timestamp};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::domain::event_validator::expiration_of;
use crate::domain::{DeletionValidator, EventKind, FilterEvaluator, ReplaceableKey};

/// チャンク容量のデフォルト値: 4 MiB
pub const DEFAULT_CHUNK_CAPACITY: usize = 4 * 1024 * 1024;

/// エフェメラルイベントの重複判定を保持する秒数
pub const EPHEMERAL_DEDUP_TTL: u64 = 10 * 60;

/// 1チャンクの created_at の幅のデフォルト値: 1日
pub const DEFAULT_CHUNK_TIME_WINDOW: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("payload of {size} bytes exceeds chunk capacity of {capacity} bytes")]
    PayloadTooLarge { size: usize, capacity: usize },

    #[error("chunk allocation failed: {0}")]
    Chunk(#[from] ChunkError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub chunk_capacity: usize,
    pub chunk_time_window: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            chunk_time_window: DEFAULT_CHUNK_TIME_WINDOW,
        }
    }
}

/// イベントと、それを受け入れたテナント
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEvent {
    pub event: Event,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneReason {
    Deleted,
    Replaced,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub tenant_id: String,
    pub reason: TombstoneReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// 索引に登録し `pending` に保持した
    Stored,
    /// 索引に登録し、同じ置き換え可能IDの古い版に墓標を立てた
    Replaced { superseded: EventId },
    /// 既知のID
    Duplicate,
    /// 保存済みの版より新しくない置き換え可能イベント。破棄した
    Stale { existing: EventId },
    /// エフェメラルなkind。索引には入れない
    Ephemeral,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// この呼び出しで墓標を立てたID
    pub deleted: Vec<EventId>,
    /// 見つかったが要求者には削除できない
    pub rejected: usize,
    /// 不明、削除済み、または別テナント
    pub missing: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub indexed: usize,
    pub pending: usize,
    pub pending_delete: usize,
    pub chunks: usize,
    pub used_bytes: usize,
    pub allocated_bytes: usize,
}

enum PayloadSource {
    Pending(Box<Event>),
    Stored { chunk: Arc<Chunk>, position: usize },
}

struct Candidate {
    id: EventId,
    source: PayloadSource,
}

#[derive(Default)]
struct StoreState {
    chunks: Vec<Arc<Chunk>>,
    index: HashMap<EventId, EventIndex>,
    timelines: HashMap<String, Timeline>,
    pending: HashMap<EventId, MetadataEvent>,
    pending_delete: HashMap<EventId, Tombstone>,
    ids: HashSet<EventId>,
    /// pubkey -> 索引に載っているイベント数
    pubkeys: HashMap<PublicKey, usize>,
    expirable: BTreeSet<(u64, EventId)>,
    replaceable: HashMap<ReplaceableKey, EventId>,
    ephemeral: RecentEphemeral,
}

/// 最近中継したエフェメラルイベントのID
///
/// エフェメラルイベントは索引に入らないので、再送の重複判定はここで行う。
/// `EPHEMERAL_DEDUP_TTL` 秒を過ぎたIDは古い順に捨てる。
#[derive(Default)]
struct RecentEphemeral {
    order: VecDeque<(u64, EventId)>,
    members: HashSet<EventId>,
}

impl RecentEphemeral {
    /// 初見なら記録して `true`、TTL内の再送なら `false`
    fn remember(&mut self, id: EventId, now: u64) -> bool {
        while let Some(&(seen_at, oldest)) = self.order.front() {
            if seen_at.saturating_add(EPHEMERAL_DEDUP_TTL) > now {
                break;
            }
            self.order.pop_front();
            self.members.remove(&oldest);
        }
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back((now, id));
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.members.len()
    }
}

pub struct EventStore {
    state: RwLock<StoreState>,
    config: StoreConfig,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl EventStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            config,
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================== プロトコル処理からの書き込み ====================

    /// 検証済みのイベントを `pending` と索引に入れる
    ///
    /// IDごとに実質一回だけ受け入れる。created_at が同じ場合は
    /// 保存済みの置き換え可能イベントを優先する
    pub fn insert(&self, event: &Event, tenant_id: &str) -> InsertOutcome {
        if !EventKind::of(event).should_store() {
            let now = Timestamp::now().as_secs();
            if self.write().ephemeral.remember(event.id, now) {
                return InsertOutcome::Ephemeral;
            }
            return InsertOutcome::Duplicate;
        }

        let mut state = self.write();
        if state.ids.contains(&event.id) {
            return InsertOutcome::Duplicate;
        }

        let created_at = event.created_at.as_secs();
        let replaceable_key = ReplaceableKey::for_event(event, tenant_id);

        let mut superseded = None;
        if let Some(key) = replaceable_key.as_ref() {
            let existing = state
                .replaceable
                .get(key)
                .and_then(|id| state.index.get(id))
                .filter(|entry| !entry.tombstoned);
            if let Some(existing) = existing {
                if existing.created_at >= created_at {
                    return InsertOutcome::Stale {
                        existing: existing.id,
                    };
                }
                superseded = Some(existing.id);
            }
        }

        if let Some(old) = superseded {
            state.tombstone(old, TombstoneReason::Replaced);
        }

        // 有効期限は検証済み。ここで不正なタグは「期限なし」として扱う
        let expiration = expiration_of(event).ok().flatten();

        state.ids.insert(event.id);
        *state.pubkeys.entry(event.pubkey).or_insert(0) += 1;
        state
            .timelines
            .entry(tenant_id.to_string())
            .or_default()
            .insert(created_at, event.id);
        if let Some(expiration) = expiration {
            state.expirable.insert((expiration, event.id));
        }
        if let Some(key) = replaceable_key.clone() {
            state.replaceable.insert(key, event.id);
        }
        state.index.insert(
            event.id,
            EventIndex {
                id: event.id,
                tenant_id: tenant_id.to_string(),
                chunk_index: None,
                position: None,
                processed: false,
                created_at,
                kind: event.kind.as_u16(),
                pubkey: event.pubkey,
                expiration,
                replaceable_key,
                tombstoned: false,
            },
        );
        state.pending.insert(
            event.id,
            MetadataEvent {
                event: event.clone(),
                tenant_id: tenant_id.to_string(),
            },
        );

        trace!(event_id = %event.id, tenant = tenant_id, "event buffered in pending");

        match superseded {
            Some(superseded) => InsertOutcome::Replaced { superseded },
            None => InsertOutcome::Stored,
        }
    }

    /// NIP-09 のID指定削除
    ///
    /// 削除できるのは作者だけで、kind 5 は削除できない。
    /// 削除したIDには墓標を立てて `pending_delete` へ移す
    pub fn delete(&self, ids: &[EventId], requester: &PublicKey, tenant_id: &str) -> DeleteReport {
        let mut state = self.write();
        let mut report = DeleteReport::default();

        for id in ids {
            let Some(entry) = state.index.get(id) else {
                report.missing += 1;
                continue;
            };
            if entry.tombstoned || entry.tenant_id != tenant_id {
                report.missing += 1;
                continue;
            }
            match DeletionValidator::check(&entry.pubkey, entry.kind, entry.created_at, requester, None) {
                Ok(()) => {
                    state.tombstone(*id, TombstoneReason::Deleted);
                    report.deleted.push(*id);
                }
                Err(reason) => {
                    debug!(event_id = %id, reason = ?reason, "deletion refused");
                    report.rejected += 1;
                }
            }
        }

        report
    }

    /// NIP-09 の置き換え可能/アドレス指定可能イベントの削除
    ///
    /// 対象は `until` 以前に作られた版に限る
    pub fn delete_address(
        &self,
        kind: u16,
        pubkey: &PublicKey,
        d_tag: &str,
        requester: &PublicKey,
        until: u64,
        tenant_id: &str,
    ) -> DeleteReport {
        let d_tag = match EventKind::classify(kind) {
            EventKind::Addressable => Some(d_tag.to_string()),
            EventKind::Replaceable => None,
            EventKind::Regular | EventKind::Ephemeral => {
                return DeleteReport {
                    missing: 1,
                    ..Default::default()
                };
            }
        };
        let key = ReplaceableKey {
            tenant_id: tenant_id.to_string(),
            pubkey: *pubkey,
            kind,
            d_tag,
        };

        let mut state = self.write();
        let mut report = DeleteReport::default();
        let entry = state
            .replaceable
            .get(&key)
            .and_then(|id| state.index.get(id))
            .filter(|entry| !entry.tombstoned);
        let Some(entry) = entry else {
            report.missing += 1;
            return report;
        };

        let id = entry.id;
        match DeletionValidator::check(&entry.pubkey, entry.kind, entry.created_at, requester, Some(until)) {
            Ok(()) => {
                state.tombstone(id, TombstoneReason::Deleted);
                report.deleted.push(id);
            }
            Err(reason) => {
                debug!(event_id = %id, reason = ?reason, "address deletion refused");
                report.rejected += 1;
            }
        }
        report
    }

    /// 有効期限が `now` 以前のイベントすべてに墓標を立て、そのIDを返す
    pub fn expire(&self, now: u64) -> Vec<EventId> {
        let mut state = self.write();
        let due: Vec<EventId> = state
            .expirable
            .iter()
            .take_while(|(expiration, _)| *expiration <= now)
            .map(|(_, id)| *id)
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            if state.index.get(&id).is_some_and(|entry| !entry.tombstoned) {
                state.tombstone(id, TombstoneReason::Expired);
                expired.push(id);
            }
        }
        expired
    }

    // ==================== キューのコンシューマーからの書き込み ====================

    /// 保留中のペイロードをアクティブチャンクへ移す
    ///
    /// 書き込むものがない (書き込み済み、または書き込み前に墓標が立った)
    /// 場合は `Ok(false)` を返す
    pub fn commit(&self, id: &EventId) -> Result<bool, StorageError> {
        let mut state = self.write();

        let tombstoned = match state.index.get(id) {
            Some(entry) => entry.tombstoned,
            None => true,
        };
        if tombstoned {
            return Ok(false);
        }
        let Some(meta) = state.pending.get(id) else {
            return Ok(false);
        };

        let created_at = meta.event.created_at.as_secs();
        let payload =
            serde_json::to_vec(&meta.event).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let (chunk_index, position) = state.append(&payload, created_at, &self.config)?;

        if let Some(entry) = state.index.get_mut(id) {
            entry.chunk_index = Some(chunk_index);
            entry.position = Some(position);
            entry.processed = true;
        }
        state.pending.remove(id);

        trace!(event_id = %id, chunk_index, position, "event committed to chunk");
        Ok(true)
    }

    /// 墓標の立ったIDを索引から外す
    ///
    /// IDは重複判定用の集合に残し、再送は重複として扱う
    pub fn apply_deletes(&self, ids: &[EventId]) -> usize {
        let mut state = self.write();
        let mut applied = 0;

        for id in ids {
            if state.pending_delete.remove(id).is_none() {
                continue;
            }
            state.pending.remove(id);
            if let Some(entry) = state.index.remove(id) {
                if let Some(timeline) = state.timelines.get_mut(&entry.tenant_id) {
                    timeline.remove(entry.created_at, id);
                }
                if let Some(expiration) = entry.expiration {
                    state.expirable.remove(&(expiration, *id));
                }
                if let Entry::Occupied(mut count) = state.pubkeys.entry(entry.pubkey) {
                    *count.get_mut() -= 1;
                    if *count.get() == 0 {
                        count.remove();
                    }
                }
                if let Some(key) = entry.replaceable_key {
                    if state.replaceable.get(&key) == Some(id) {
                        state.replaceable.remove(&key);
                    }
                }
            }
            applied += 1;
        }

        applied
    }

    // ==================== 読み取り ====================

    /// いずれかのフィルターにマッチする `tenant_id` のイベント (新しい順)
    ///
    /// フィルターごとに自身の `limit` (未指定なら `max_limit`、上限も `max_limit`)
    /// で件数を切り、和集合をIDで重複排除する
    pub fn match_filters(&self, filters: &[Filter], tenant_id: &str, max_limit: usize) -> Vec<Event> {
        let per_filter_limit =
            |filter: &Filter| filter.limit.map_or(max_limit, |limit| limit.min(max_limit));
        self.collect_matches(filters, tenant_id, per_filter_limit)
    }

    /// NIP-45 の件数。`limit` は無視する
    pub fn count_filters(&self, filters: &[Filter], tenant_id: &str) -> usize {
        self.collect_matches(filters, tenant_id, |_| usize::MAX).len()
    }

    fn collect_matches<F>(&self, filters: &[Filter], tenant_id: &str, limit_of: F) -> Vec<Event>
    where
        F: Fn(&Filter) -> usize,
    {
        let now = Timestamp::now().as_secs();

        let plans: Vec<(usize, Vec<Candidate>)> = {
            let state = self.read();
            filters
                .iter()
                .map(|filter| {
                    let limit = limit_of(filter);
                    (limit, state.candidates(filter, tenant_id, now, limit))
                })
                .collect()
        };

        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for ((limit, candidates), filter) in plans.into_iter().zip(filters) {
            let mut taken = 0;
            for candidate in candidates {
                if taken >= limit {
                    break;
                }
                let event = match candidate.source {
                    PayloadSource::Pending(event) => *event,
                    PayloadSource::Stored { chunk, position } => {
                        match chunk.read(position, |bytes| serde_json::from_slice::<Event>(bytes)) {
                            Some(Ok(event)) => event,
                            Some(Err(e)) => {
                                warn!(event_id = %candidate.id, error = %e, "corrupt payload in chunk");
                                continue;
                            }
                            None => continue,
                        }
                    }
                };
                if !FilterEvaluator::matches(&event, filter) {
                    continue;
                }
                taken += 1;
                if seen.insert(event.id) {
                    results.push(event);
                }
            }
        }

        results.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        results
    }

    /// `filters` の走査で訪れうる索引エントリ数
    pub fn estimate_cost(&self, filters: &[Filter], tenant_id: &str) -> usize {
        let state = self.read();
        let tenant_size = state.timelines.get(tenant_id).map_or(0, Timeline::len);
        filters
            .iter()
            .map(|filter| match filter.ids.as_ref() {
                Some(ids) if !ids.is_empty() => ids.len(),
                _ => tenant_size,
            })
            .sum()
    }

    /// どのフィルターも何にもマッチしえないなら true
    ///
    /// 各フィルターが未知のIDだけ、またはイベントのない作者だけを指定している場合
    pub fn can_discard_early(&self, filters: &[Filter]) -> bool {
        if filters.is_empty() {
            return false;
        }
        let state = self.read();
        filters.iter().all(|filter| {
            let unknown_ids = filter
                .ids
                .as_ref()
                .is_some_and(|ids| !ids.is_empty() && ids.iter().all(|id| !state.ids.contains(id)));
            let unknown_authors = filter.authors.as_ref().is_some_and(|authors| {
                !authors.is_empty() && authors.iter().all(|pk| !state.pubkeys.contains_key(pk))
            });
            unknown_ids || unknown_authors
        })
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.read().ids.contains(id)
    }

    /// IDで生きているイベントを `pending` かチャンクから取得
    pub fn get(&self, id: &EventId) -> Option<Event> {
        let state = self.read();
        let entry = state.index.get(id)?;
        if !entry.is_live(Timestamp::now().as_secs()) {
            return None;
        }
        if let Some(meta) = state.pending.get(id) {
            return Some(meta.event.clone());
        }
        let chunk = state.chunks.get(entry.chunk_index?)?;
        chunk
            .read(entry.position?, |bytes| serde_json::from_slice::<Event>(bytes))?
            .ok()
    }

    pub fn index_entry(&self, id: &EventId) -> Option<EventIndex> {
        self.read().index.get(id).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.read().pending.len()
    }

    pub fn pending_delete_len(&self) -> usize {
        self.read().pending_delete.len()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.read();
        StoreStats {
            indexed: state.index.len(),
            pending: state.pending.len(),
            pending_delete: state.pending_delete.len(),
            chunks: state.chunks.len(),
            used_bytes: state.chunks.iter().map(|c| c.used_bytes()).sum(),
            allocated_bytes: state.chunks.iter().map(|c| c.allocated_bytes()).sum(),
        }
    }

    /// イベント、チャンク、バッファをすべて破棄する
    pub fn clear(&self) {
        *self.write() = StoreState::default();
        debug!("event store cleared");
    }
}

impl StoreState {
    fn tombstone(&mut self, id: EventId, reason: TombstoneReason) {
        let Some(entry) = self.index.get_mut(&id) else {
            return;
        };
        entry.tombstoned = true;
        let tenant_id = entry.tenant_id.clone();
        if let Some(key) = entry.replaceable_key.as_ref() {
            if self.replaceable.get(key) == Some(&id) {
                self.replaceable.remove(key);
            }
        }
        self.pending_delete.insert(id, Tombstone { tenant_id, reason });
    }

    /// アクティブチャンクに追記する。容量か時間窓に収まらなければ
    /// 封印して新しいチャンクを開く。
    ///
    /// 追記は読み手と共有中の `Arc<Chunk>` にそのまま行う
    fn append(
        &mut self,
        payload: &[u8],
        created_at: u64,
        config: &StoreConfig,
    ) -> Result<(usize, usize), StorageError> {
        if payload.len() > config.chunk_capacity {
            return Err(StorageError::PayloadTooLarge {
                size: payload.len(),
                capacity: config.chunk_capacity,
            });
        }

        let rotate = match self.chunks.last() {
            Some(active) => !active.accepts(payload.len(), created_at, config.chunk_time_window),
            None => true,
        };
        if rotate {
            if let Some(active) = self.chunks.last() {
                if active.is_active() {
                    active.seal();
                    debug!(chunk_id = active.id(), "chunk sealed");
                }
            }
            let id = self.chunks.len();
            self.chunks.push(Arc::new(Chunk::new(id, config.chunk_capacity)));
        }

        let chunk_index = self.chunks.len() - 1;
        let position = self.chunks[chunk_index].append(payload, created_at)?;
        Ok((chunk_index, position))
    }

    fn candidate(&self, entry: &EventIndex) -> Option<Candidate> {
        let source = match self.pending.get(&entry.id) {
            Some(meta) => PayloadSource::Pending(Box::new(meta.event.clone())),
            None => PayloadSource::Stored {
                chunk: Arc::clone(self.chunks.get(entry.chunk_index?)?),
                position: entry.position?,
            },
        };
        Some(Candidate {
            id: entry.id,
            source,
        })
    }

    /// 1つのフィルターに対する事前選別済みの候補 (新しい順)
    ///
    /// タグや検索の条件がなければ事前選別で確定するので `limit` で切る
    fn candidates(&self, filter: &Filter, tenant_id: &str, now: u64, limit: usize) -> Vec<Candidate> {
        let needs_payload = !filter.generic_tags.is_empty() || filter.search.is_some();
        let cap = if needs_payload { usize::MAX } else { limit };
        let admissible = |entry: &&EventIndex| {
            entry.tenant_id == tenant_id
                && entry.is_live(now)
                && FilterEvaluator::prescreen(&entry.fields(), filter)
        };

        if let Some(ids) = filter.ids.as_ref().filter(|ids| !ids.is_empty()) {
            let mut entries: Vec<&EventIndex> = ids
                .iter()
                .filter_map(|id| self.index.get(id))
                .filter(admissible)
                .collect();
            entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            return entries
                .into_iter()
                .filter_map(|entry| self.candidate(entry))
                .take(cap)
                .collect();
        }

        let Some(timeline) = self.timelines.get(tenant_id) else {
            return Vec::new();
        };
        let since = filter.since.map_or(0, |t| t.as_secs());
        let until = filter.until.map_or(u64::MAX, |t| t.as_secs());
        timeline
            .newest_first(since, until)
            .filter_map(|id| self.index.get(id))
            .filter(admissible)
            .filter_map(|entry| self.candidate(entry))
            .take(cap)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Tag};

    const TENANT: &str = "relay.example.com";

    fn note(keys: &Keys, content: &str, created_at: u64) -> Event {
        EventBuilder::text_note(content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn event_of_kind(keys: &Keys, kind: u16, tags: Vec<Tag>, created_at: u64) -> Event {
        EventBuilder::new(Kind::from(kind), "payload")
            .tags(tags)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn all_notes() -> Vec<Filter> {
        vec![Filter::new().kind(Kind::TextNote)]
    }

    // ==================== insert テスト ====================

    #[test]
    fn test_insert_is_idempotent() {
        let store = EventStore::default();
        let event = note(&Keys::generate(), "hello", 1_000);

        assert_eq!(store.insert(&event, TENANT), InsertOutcome::Stored);
        assert_eq!(store.insert(&event, TENANT), InsertOutcome::Duplicate);
        assert_eq!(store.stats().indexed, 1);
        assert_eq!(store.pending_len(), 1);
    }

    #[test]
    fn test_pending_events_are_visible_before_commit() {
        let store = EventStore::default();
        let event = note(&Keys::generate(), "hello", 1_000);
        store.insert(&event, TENANT);

        let found = store.match_filters(&all_notes(), TENANT, 100);
        assert_eq!(found, vec![event]);
    }

    #[test]
    fn test_ephemeral_events_are_not_indexed() {
        let store = EventStore::default();
        let event = event_of_kind(&Keys::generate(), 20001, vec![], 1_000);

        assert_eq!(store.insert(&event, TENANT), InsertOutcome::Ephemeral);
        assert!(!store.contains(&event.id));
        let filters = vec![Filter::new().kind(Kind::from(20001))];
        assert!(store.match_filters(&filters, TENANT, 100).is_empty());
    }

    #[test]
    fn test_resent_ephemeral_event_is_a_duplicate() {
        let store = EventStore::default();
        let event = event_of_kind(&Keys::generate(), 20001, vec![], 1_000);

        assert_eq!(store.insert(&event, TENANT), InsertOutcome::Ephemeral);
        assert_eq!(store.insert(&event, TENANT), InsertOutcome::Duplicate);
        assert!(!store.contains(&event.id));
    }

    #[test]
    fn test_ephemeral_ids_are_forgotten_after_the_ttl() {
        let mut recent = RecentEphemeral::default();
        let keys = Keys::generate();
        let first = event_of_kind(&keys, 20001, vec![], 1_000).id;
        let second = event_of_kind(&keys, 20001, vec![], 1_001).id;

        assert!(recent.remember(first, 10_000));
        assert!(!recent.remember(first, 10_000 + EPHEMERAL_DEDUP_TTL - 1));
        assert!(recent.remember(second, 10_000 + EPHEMERAL_DEDUP_TTL - 1));

        // 期限切れの first は捨てられ、再び初見として扱われる
        assert!(recent.remember(first, 10_000 + EPHEMERAL_DEDUP_TTL));
        assert_eq!(recent.len(), 2);
        assert!(!recent.remember(second, 10_000 + EPHEMERAL_DEDUP_TTL));
    }

    #[test]
    fn test_replaceable_newer_supersedes_older() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let old = event_of_kind(&keys, 0, vec![], 100);
        let new = event_of_kind(&keys, 0, vec![], 200);

        assert_eq!(store.insert(&old, TENANT), InsertOutcome::Stored);
        assert_eq!(
            store.insert(&new, TENANT),
            InsertOutcome::Replaced { superseded: old.id }
        );

        let filters = vec![Filter::new().kind(Kind::Metadata).author(keys.public_key())];
        assert_eq!(store.match_filters(&filters, TENANT, 100), vec![new]);
        assert_eq!(store.pending_delete_len(), 1);
    }

    #[test]
    fn test_replaceable_older_arrival_is_stale() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let new = event_of_kind(&keys, 0, vec![], 200);
        let old = event_of_kind(&keys, 0, vec![], 100);

        store.insert(&new, TENANT);
        assert_eq!(
            store.insert(&old, TENANT),
            InsertOutcome::Stale { existing: new.id }
        );
        let filters = vec![Filter::new().kind(Kind::Metadata)];
        assert_eq!(store.match_filters(&filters, TENANT, 100), vec![new]);
    }

    #[test]
    fn test_replaceable_tie_keeps_existing() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let first = event_of_kind(&keys, 3, vec![], 100);
        let second = EventBuilder::new(Kind::from(3), "other contacts")
            .custom_created_at(Timestamp::from(100))
            .sign_with_keys(&keys)
            .unwrap();

        store.insert(&first, TENANT);
        assert_eq!(
            store.insert(&second, TENANT),
            InsertOutcome::Stale { existing: first.id }
        );
    }

    #[test]
    fn test_addressable_events_are_keyed_by_d_tag() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let a = event_of_kind(&keys, 30023, vec![Tag::parse(["d", "a"]).unwrap()], 100);
        let b = event_of_kind(&keys, 30023, vec![Tag::parse(["d", "b"]).unwrap()], 200);
        let a2 = event_of_kind(&keys, 30023, vec![Tag::parse(["d", "a"]).unwrap()], 300);

        assert_eq!(store.insert(&a, TENANT), InsertOutcome::Stored);
        assert_eq!(store.insert(&b, TENANT), InsertOutcome::Stored);
        assert_eq!(
            store.insert(&a2, TENANT),
            InsertOutcome::Replaced { superseded: a.id }
        );

        let filters = vec![Filter::new().kind(Kind::from(30023))];
        assert_eq!(store.match_filters(&filters, TENANT, 100), vec![a2, b]);
    }

    #[test]
    fn test_replaceable_identity_is_per_tenant() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let a = event_of_kind(&keys, 0, vec![], 100);
        let b = event_of_kind(&keys, 0, vec![], 200);

        store.insert(&a, "a.example.com");
        assert_eq!(store.insert(&b, "b.example.com"), InsertOutcome::Stored);
    }

    // ==================== マッチング テスト ====================

    #[test]
    fn test_match_filters_newest_first_with_limit() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let events: Vec<Event> = (1..=5).map(|i| note(&keys, "n", i * 100)).collect();
        for event in &events {
            store.insert(event, TENANT);
        }

        let filters = vec![Filter::new().kind(Kind::TextNote).limit(2)];
        let found = store.match_filters(&filters, TENANT, 100);
        assert_eq!(found, vec![events[4].clone(), events[3].clone()]);
    }

    #[test]
    fn test_match_filters_caps_at_max_limit() {
        let store = EventStore::default();
        let keys = Keys::generate();
        for i in 0..10 {
            store.insert(&note(&keys, "n", 1_000 + i), TENANT);
        }
        assert_eq!(store.match_filters(&all_notes(), TENANT, 3).len(), 3);

        let filters = vec![Filter::new().kind(Kind::TextNote).limit(50)];
        assert_eq!(store.match_filters(&filters, TENANT, 4).len(), 4);
    }

    #[test]
    fn test_match_filters_union_is_deduplicated() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let event = note(&keys, "n", 1_000);
        store.insert(&event, TENANT);

        let filters = vec![
            Filter::new().kind(Kind::TextNote),
            Filter::new().author(keys.public_key()),
        ];
        assert_eq!(store.match_filters(&filters, TENANT, 100), vec![event]);
    }

    #[test]
    fn test_match_filters_by_tag_reads_payload() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let target = note(&keys, "target", 100);
        let reply = event_of_kind(&keys, 1, vec![Tag::event(target.id)], 200);
        store.insert(&target, TENANT);
        store.insert(&reply, TENANT);
        store.commit(&target.id).unwrap();
        store.commit(&reply.id).unwrap();

        let filters = vec![Filter::new().event(target.id)];
        assert_eq!(store.match_filters(&filters, TENANT, 100), vec![reply]);
    }

    #[test]
    fn test_match_filters_is_tenant_scoped() {
        let store = EventStore::default();
        let event = note(&Keys::generate(), "n", 1_000);
        store.insert(&event, "a.example.com");

        assert_eq!(store.match_filters(&all_notes(), "a.example.com", 100).len(), 1);
        assert!(store.match_filters(&all_notes(), "b.example.com", 100).is_empty());

        let by_id = vec![Filter::new().id(event.id)];
        assert!(store.match_filters(&by_id, "b.example.com", 100).is_empty());
    }

    #[test]
    fn test_match_filters_skips_expired_events() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let expired_at = Timestamp::now().as_secs() - 10;
        let event = event_of_kind(
            &keys,
            1,
            vec![Tag::parse(["expiration", expired_at.to_string().as_str()]).unwrap()],
            1_000,
        );
        store.insert(&event, TENANT);
        assert!(store.match_filters(&all_notes(), TENANT, 100).is_empty());
    }

    #[test]
    fn test_count_filters_ignores_limit() {
        let store = EventStore::default();
        let keys = Keys::generate();
        for i in 0..5 {
            store.insert(&note(&keys, "n", 1_000 + i), TENANT);
        }
        let filters = vec![Filter::new().kind(Kind::TextNote).limit(1)];
        assert_eq!(store.count_filters(&filters, TENANT), 5);
    }

    // ==================== commit / チャンク テスト ====================

    #[test]
    fn test_commit_moves_payload_into_chunk() {
        let store = EventStore::default();
        let event = note(&Keys::generate(), "hello", 1_000);
        store.insert(&event, TENANT);

        assert_eq!(store.commit(&event.id), Ok(true));
        assert_eq!(store.commit(&event.id), Ok(false));

        let entry = store.index_entry(&event.id).unwrap();
        assert!(entry.processed);
        assert_eq!(entry.chunk_index, Some(0));
        assert_eq!(entry.position, Some(0));
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.get(&event.id), Some(event.clone()));
        assert_eq!(store.match_filters(&all_notes(), TENANT, 100), vec![event]);
    }

    #[test]
    fn test_chunk_rotates_when_full() {
        let store = EventStore::new(StoreConfig {
            chunk_capacity: 600,
            chunk_time_window: DEFAULT_CHUNK_TIME_WINDOW,
        });
        let keys = Keys::generate();
        let events: Vec<Event> = (0..4).map(|i| note(&keys, "rotate", 1_000 + i)).collect();
        for event in &events {
            store.insert(event, TENANT);
            store.commit(&event.id).unwrap();
        }

        let stats = store.stats();
        assert!(stats.chunks >= 2, "expected rotation, got {} chunks", stats.chunks);
        assert_eq!(store.match_filters(&all_notes(), TENANT, 100).len(), 4);
    }

    #[test]
    fn test_chunk_rotates_on_time_window() {
        let store = EventStore::new(StoreConfig {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            chunk_time_window: 60,
        });
        let keys = Keys::generate();
        let early = note(&keys, "early", 1_000);
        let late = note(&keys, "late", 2_000);
        for event in [&early, &late] {
            store.insert(event, TENANT);
            store.commit(&event.id).unwrap();
        }

        assert_eq!(store.stats().chunks, 2);
        assert_eq!(store.index_entry(&late.id).unwrap().chunk_index, Some(1));
    }

    #[test]
    fn test_interleaved_backdated_events_share_a_chunk() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let now = Timestamp::now().as_secs();
        let three_days = 3 * 24 * 60 * 60;
        for i in 0..50 {
            let created_at = if i % 2 == 0 { now - i } else { now - three_days - i };
            let event = note(&keys, "interleaved", created_at);
            store.insert(&event, TENANT);
            store.commit(&event.id).unwrap();
        }

        let stats = store.stats();
        assert!(stats.chunks <= 2, "got {} chunks", stats.chunks);
        assert!(
            stats.allocated_bytes <= 2 * stats.used_bytes,
            "allocated {} for {} used",
            stats.allocated_bytes,
            stats.used_bytes
        );
        assert_eq!(store.match_filters(&all_notes(), TENANT, 100).len(), 50);
    }

    #[test]
    fn test_commit_appends_in_place_while_a_reader_holds_the_chunk() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let first = note(&keys, "first", 1_000);
        let second = note(&keys, "second", 1_001);
        store.insert(&first, TENANT);
        store.commit(&first.id).unwrap();

        let held = Arc::clone(&store.read().chunks[0]);
        store.insert(&second, TENANT);
        store.commit(&second.id).unwrap();

        assert!(Arc::ptr_eq(&held, &store.read().chunks[0]));
        assert_eq!(held.len(), 2);
        let decoded = held.read(0, |bytes| serde_json::from_slice::<Event>(bytes).unwrap());
        assert_eq!(decoded, Some(first));
    }

    #[test]
    fn test_commit_rejects_oversized_payload() {
        let store = EventStore::new(StoreConfig {
            chunk_capacity: 64,
            chunk_time_window: DEFAULT_CHUNK_TIME_WINDOW,
        });
        let event = note(&Keys::generate(), "too big for the chunk", 1_000);
        store.insert(&event, TENANT);

        assert!(matches!(
            store.commit(&event.id),
            Err(StorageError::PayloadTooLarge { .. })
        ));
        // pending からはまだ読める
        assert_eq!(store.match_filters(&all_notes(), TENANT, 100).len(), 1);
    }

    // ==================== 削除 テスト ====================

    #[test]
    fn test_delete_by_author() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let event = note(&keys, "bye", 1_000);
        store.insert(&event, TENANT);

        let report = store.delete(&[event.id], &keys.public_key(), TENANT);
        assert_eq!(report.deleted, vec![event.id]);
        assert!(store.match_filters(&all_notes(), TENANT, 100).is_empty());
        assert_eq!(store.pending_delete_len(), 1);
    }

    #[test]
    fn test_delete_by_other_pubkey_is_rejected() {
        let store = EventStore::default();
        let author = Keys::generate();
        let event = note(&author, "keep", 1_000);
        store.insert(&event, TENANT);

        let report = store.delete(&[event.id], &Keys::generate().public_key(), TENANT);
        assert!(report.deleted.is_empty());
        assert_eq!(report.rejected, 1);
        assert_eq!(store.match_filters(&all_notes(), TENANT, 100), vec![event]);
    }

    #[test]
    fn test_delete_from_other_tenant_is_missing() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let event = note(&keys, "x", 1_000);
        store.insert(&event, "a.example.com");

        let report = store.delete(&[event.id], &keys.public_key(), "b.example.com");
        assert_eq!(report.missing, 1);
    }

    #[test]
    fn test_apply_deletes_removes_index_entry_and_keeps_dedup() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let event = note(&keys, "bye", 1_000);
        store.insert(&event, TENANT);
        store.commit(&event.id).unwrap();
        store.delete(&[event.id], &keys.public_key(), TENANT);

        assert_eq!(store.apply_deletes(&[event.id]), 1);
        assert_eq!(store.apply_deletes(&[event.id]), 0);
        assert!(store.index_entry(&event.id).is_none());
        assert_eq!(store.pending_delete_len(), 0);
        assert_eq!(store.insert(&event, TENANT), InsertOutcome::Duplicate);
    }

    #[test]
    fn test_commit_after_delete_is_skipped() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let event = note(&keys, "short lived", 1_000);
        store.insert(&event, TENANT);
        store.delete(&[event.id], &keys.public_key(), TENANT);

        assert_eq!(store.commit(&event.id), Ok(false));
        assert_eq!(store.stats().chunks, 0);
    }

    #[test]
    fn test_delete_address_respects_request_time() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let article = event_of_kind(&keys, 30023, vec![Tag::parse(["d", "post"]).unwrap()], 500);
        store.insert(&article, TENANT);

        let early = store.delete_address(30023, &keys.public_key(), "post", &keys.public_key(), 400, TENANT);
        assert_eq!(early.rejected, 1);

        let report = store.delete_address(30023, &keys.public_key(), "post", &keys.public_key(), 600, TENANT);
        assert_eq!(report.deleted, vec![article.id]);
    }

    // ==================== 有効期限 テスト ====================

    #[test]
    fn test_expire_tombstones_due_events() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let now = Timestamp::now().as_secs();
        let soon = event_of_kind(
            &keys,
            1,
            vec![Tag::parse(["expiration", (now + 5).to_string().as_str()]).unwrap()],
            now,
        );
        let later = event_of_kind(
            &keys,
            1,
            vec![Tag::parse(["expiration", (now + 5_000).to_string().as_str()]).unwrap()],
            now,
        );
        store.insert(&soon, TENANT);
        store.insert(&later, TENANT);

        assert_eq!(store.expire(now + 10), vec![soon.id]);
        assert!(store.expire(now + 10).is_empty());
        assert_eq!(store.apply_deletes(&[soon.id]), 1);
        assert!(store.index_entry(&later.id).is_some());
    }

    // ==================== 早期破棄 / コスト テスト ====================

    #[test]
    fn test_can_discard_early() {
        let store = EventStore::default();
        let known = Keys::generate();
        store.insert(&note(&known, "n", 1_000), TENANT);

        let unknown = vec![Filter::new().author(Keys::generate().public_key())];
        assert!(store.can_discard_early(&unknown));

        let mixed = vec![
            Filter::new().author(Keys::generate().public_key()),
            Filter::new().author(known.public_key()),
        ];
        assert!(!store.can_discard_early(&mixed));
        assert!(!store.can_discard_early(&all_notes()));
    }

    #[test]
    fn test_estimate_cost() {
        let store = EventStore::default();
        let keys = Keys::generate();
        let event = note(&keys, "n", 1_000);
        store.insert(&event, TENANT);
        store.insert(&note(&keys, "m", 1_001), TENANT);

        assert_eq!(store.estimate_cost(&all_notes(), TENANT), 2);
        assert_eq!(store.estimate_cost(&[Filter::new().id(event.id)], TENANT), 1);
        assert_eq!(store.estimate_cost(&all_notes(), "other"), 0);
    }

    #[test]
    fn test_clear() {
        let store = EventStore::default();
        store.insert(&note(&Keys::generate(), "n", 1_000), TENANT);
        store.clear();
        assert_eq!(store.stats(), StoreStats::default());
    }
}
