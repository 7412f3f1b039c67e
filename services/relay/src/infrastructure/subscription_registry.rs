/// インメモリのサブスクリプション登録簿
///
/// 接続ごとのフィルター集合を、その接続を受け入れたテナントの範囲で保持する。
/// リアルタイム配信とバックログ送信は、サブスクリプションごとの配信済みID
/// (上限あり) を共有し、同じIDを同じサブスクリプションへ二度送らない。
/// 上限を超えて押し出されたIDは再び配信されうる。エフェメラルイベントの
/// 再送はイベントストア側のTTL付き重複判定で弾く
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use nostr::{Event, EventId, Filter, Timestamp};
use tracing::debug;

use crate::domain::FilterEvaluator;

/// サブスクリプションごとに覚えておく配信済みIDの数
pub const DEFAULT_DELIVERED_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedSubscription {
    pub connection_id: String,
    pub subscription_id: String,
}

#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub connection_id: String,
    pub subscription_id: String,
    pub filters: Vec<Filter>,
    pub created_at: u64,
}

/// 古い順に押し出すID集合
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<EventId>,
    members: HashSet<EventId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// 既に含まれていれば false
    fn insert(&mut self, id: EventId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }
}

#[derive(Debug)]
struct Subscription {
    filters: Vec<Filter>,
    created_at: u64,
    delivered: RecentIds,
}

#[derive(Debug)]
struct ConnectionSubscriptions {
    tenant_id: String,
    subscriptions: HashMap<String, Subscription>,
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    connections: Mutex<HashMap<String, ConnectionSubscriptions>>,
    delivered_capacity: usize,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERED_CAPACITY)
    }
}

impl SubscriptionRegistry {
    pub fn new(delivered_capacity: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            delivered_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ConnectionSubscriptions>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// サブスクリプションを保存する。同じ接続の同じIDは置き換え、
    /// 置き換えた場合は true を返す
    pub fn register(
        &self,
        connection_id: &str,
        tenant_id: &str,
        subscription_id: &str,
        filters: Vec<Filter>,
    ) -> bool {
        let mut connections = self.lock();
        let entry = connections
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionSubscriptions {
                tenant_id: tenant_id.to_string(),
                subscriptions: HashMap::new(),
            });
        let replaced = entry
            .subscriptions
            .insert(
                subscription_id.to_string(),
                Subscription {
                    filters,
                    created_at: Timestamp::now().as_secs(),
                    delivered: RecentIds::new(self.delivered_capacity),
                },
            )
            .is_some();

        debug!(
            connection_id = connection_id,
            subscription_id = subscription_id,
            replaced,
            "subscription registered"
        );
        replaced
    }

    /// 冪等。サブスクリプションが存在したかを返す
    pub fn unregister(&self, connection_id: &str, subscription_id: &str) -> bool {
        let mut connections = self.lock();
        let Some(entry) = connections.get_mut(connection_id) else {
            return false;
        };
        let removed = entry.subscriptions.remove(subscription_id).is_some();
        if entry.subscriptions.is_empty() {
            connections.remove(connection_id);
        }
        removed
    }

    /// 接続のサブスクリプションをすべて削除し、その数を返す
    pub fn unregister_connection(&self, connection_id: &str) -> usize {
        self.lock()
            .remove(connection_id)
            .map_or(0, |entry| entry.subscriptions.len())
    }

    pub fn count(&self, connection_id: &str) -> usize {
        self.lock()
            .get(connection_id)
            .map_or(0, |entry| entry.subscriptions.len())
    }

    pub fn total(&self) -> usize {
        self.lock().values().map(|entry| entry.subscriptions.len()).sum()
    }

    pub fn contains(&self, connection_id: &str, subscription_id: &str) -> bool {
        self.lock()
            .get(connection_id)
            .is_some_and(|entry| entry.subscriptions.contains_key(subscription_id))
    }

    pub fn get(&self, connection_id: &str, subscription_id: &str) -> Option<SubscriptionInfo> {
        let connections = self.lock();
        let subscription = connections.get(connection_id)?.subscriptions.get(subscription_id)?;
        Some(SubscriptionInfo {
            connection_id: connection_id.to_string(),
            subscription_id: subscription_id.to_string(),
            filters: subscription.filters.clone(),
            created_at: subscription.created_at,
        })
    }

    /// `tenant_id` 内で `event` にマッチし、まだ受け取っていないサブスクリプション
    ///
    /// 返したサブスクリプションにはIDを配信済みとして記録する
    pub fn on_new_event(&self, event: &Event, tenant_id: &str) -> Vec<MatchedSubscription> {
        let mut connections = self.lock();
        let mut matched = Vec::new();

        for (connection_id, entry) in connections.iter_mut() {
            if entry.tenant_id != tenant_id {
                continue;
            }
            for (subscription_id, subscription) in entry.subscriptions.iter_mut() {
                if FilterEvaluator::matches_any(event, &subscription.filters)
                    && subscription.delivered.insert(event.id)
                {
                    matched.push(MatchedSubscription {
                        connection_id: connection_id.clone(),
                        subscription_id: subscription_id.clone(),
                    });
                }
            }
        }

        matched
    }

    /// バックログ送信の可否。サブスクリプションが開いていて `id` が未配信なら
    /// true を返し、配信済みとして記録する
    pub fn claim_delivery(&self, connection_id: &str, subscription_id: &str, id: EventId) -> bool {
        self.lock()
            .get_mut(connection_id)
            .and_then(|entry| entry.subscriptions.get_mut(subscription_id))
            .is_some_and(|subscription| subscription.delivered.insert(id))
    }
}
