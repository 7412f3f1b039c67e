//! 非同期タスクパイプライン
//!
//! 永続化キューと、重い処理用・軽い処理用の2つのワーカープールからなる。
//! 混雑を理由に仕事を断ることはなく、バックプレッシャーは呼び出し側が
//! キュー深さを見て判断する。

mod job;
mod queue;
mod worker_pool;

pub use job::{Job, JobOutput, WorkerError};
pub use queue::DurabilityQueue;
pub use worker_pool::WorkerPool;

use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, Filter, Timestamp};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::ValidationError;
use crate::infrastructure::event_store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub queue_concurrency: usize,
    pub heavy_workers: usize,
    pub light_workers: usize,
    /// 推定コストがこれ以下の走査は呼び出し元のタスクで実行する
    pub inline_scan_threshold: usize,
    /// 推定コストがこれを超える走査は重い処理用プールへ回す
    pub heavy_scan_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(2, |n| n.get());
        Self {
            queue_concurrency: 2,
            heavy_workers: (cpus / 2).max(1),
            light_workers: cpus.max(1),
            inline_scan_threshold: 256,
            heavy_scan_threshold: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanRoute {
    Inline,
    Light,
    Heavy,
}

pub struct TaskPipeline {
    store: Arc<EventStore>,
    queue: DurabilityQueue,
    heavy: WorkerPool,
    light: WorkerPool,
    config: PipelineConfig,
}

impl TaskPipeline {
    /// tokioランタイム内で呼ぶこと。キューのコンシューマーはすぐに動き始める
    pub fn new(store: Arc<EventStore>, config: PipelineConfig) -> Self {
        info!(
            queue_concurrency = config.queue_concurrency,
            heavy_workers = config.heavy_workers,
            light_workers = config.light_workers,
            "task pipeline started"
        );
        Self {
            queue: DurabilityQueue::new(config.queue_concurrency, Arc::clone(&store)),
            heavy: WorkerPool::new("heavy", config.heavy_workers, Arc::clone(&store)),
            light: WorkerPool::new("light", config.light_workers, Arc::clone(&store)),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn config(&self) -> PipelineConfig {
        self.config
    }

    /// 永続化ジョブを投げっぱなしで積む。キューが閉じていればキュー側でログを出す
    pub fn enqueue(&self, job: Job) {
        let _ = self.queue.enqueue(job);
    }

    pub fn route_for_cost(&self, cost: usize) -> ScanRoute {
        if cost <= self.config.inline_scan_threshold {
            ScanRoute::Inline
        } else if cost <= self.config.heavy_scan_threshold {
            ScanRoute::Light
        } else {
            ScanRoute::Heavy
        }
    }

    async fn dispatch(&self, job: Job, cost: usize) -> Result<JobOutput, WorkerError> {
        let route = self.route_for_cost(cost);
        debug!(job = job.name(), cost, route = ?route, "dispatching job");
        match route {
            ScanRoute::Inline => job.execute(&self.store),
            ScanRoute::Light => self.light.run(job).await,
            ScanRoute::Heavy => self.heavy.run(job).await,
        }
    }

    /// REQのバックログ走査 (新しい順)
    pub async fn scan(
        &self,
        filters: Vec<Filter>,
        tenant_id: &str,
        max_limit: usize,
    ) -> Result<Vec<Event>, WorkerError> {
        let cost = self.store.estimate_cost(&filters, tenant_id);
        let job = Job::ScanFilters {
            tenant_id: tenant_id.to_string(),
            filters,
            max_limit,
        };
        match self.dispatch(job, cost).await? {
            JobOutput::Events(events) => Ok(events),
            _ => Err(WorkerError::UnexpectedOutput),
        }
    }

    pub async fn count(&self, filters: Vec<Filter>, tenant_id: &str) -> Result<usize, WorkerError> {
        let cost = self.store.estimate_cost(&filters, tenant_id);
        let job = Job::CountFilters {
            tenant_id: tenant_id.to_string(),
            filters,
        };
        match self.dispatch(job, cost).await? {
            JobOutput::Count(count) => Ok(count),
            _ => Err(WorkerError::UnexpectedOutput),
        }
    }

    /// 軽い処理用プールでIDと署名を検証する
    ///
    /// 外側のエラーはプールの失敗、内側は検証結果
    pub async fn verify(&self, event: Event) -> Result<Result<(), ValidationError>, WorkerError> {
        let job = Job::VerifyEvent {
            event: Box::new(event),
        };
        match self.light.run(job).await? {
            JobOutput::Verified(verdict) => Ok(verdict),
            _ => Err(WorkerError::UnexpectedOutput),
        }
    }

    /// 期限切れイベントに墓標を立て、削除ジョブを積む。対象件数を返す
    pub fn reap_expired(&self, now: u64) -> usize {
        let ids = self.store.expire(now);
        let reaped = ids.len();
        if reaped > 0 {
            debug!(reaped, "expired events tombstoned");
            self.enqueue(Job::Delete { ids });
        }
        reaped
    }

    /// `interval` ごとに [`TaskPipeline::reap_expired`] を実行する
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pipeline.reap_expired(Timestamp::now().as_secs());
            }
        })
    }

    pub fn queue_length(&self) -> usize {
        self.queue.len()
    }

    pub fn heavy_tasks_length(&self) -> usize {
        self.heavy.depth()
    }

    pub fn light_tasks_length(&self) -> usize {
        self.light.depth()
    }

    /// 両プールのブロッキングスレッド数の合計
    pub fn worker_count(&self) -> usize {
        self.heavy.size() + self.light.size()
    }

    /// 両プールを閉じ、永続化キューを流しきる
    pub async fn shutdown(&self) {
        self.heavy.close();
        self.light.close();
        self.queue.shutdown().await;
        info!("task pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Kind, Tag};

    const TENANT: &str = "relay.example.com";

    fn pipeline(config: PipelineConfig) -> TaskPipeline {
        TaskPipeline::new(Arc::new(EventStore::default()), config)
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            queue_concurrency: 2,
            heavy_workers: 1,
            light_workers: 2,
            inline_scan_threshold: 1,
            heavy_scan_threshold: 3,
        }
    }

    #[tokio::test]
    async fn test_route_for_cost() {
        let pipeline = pipeline(small_config());
        assert_eq!(pipeline.route_for_cost(0), ScanRoute::Inline);
        assert_eq!(pipeline.route_for_cost(1), ScanRoute::Inline);
        assert_eq!(pipeline.route_for_cost(2), ScanRoute::Light);
        assert_eq!(pipeline.route_for_cost(3), ScanRoute::Light);
        assert_eq!(pipeline.route_for_cost(4), ScanRoute::Heavy);
    }

    #[tokio::test]
    async fn test_scan_and_count_across_routes() {
        let pipeline = pipeline(small_config());
        let keys = Keys::generate();
        for i in 0..5 {
            let event = EventBuilder::text_note(format!("n{i}"))
                .custom_created_at(Timestamp::from(1_000 + i))
                .sign_with_keys(&keys)
                .unwrap();
            pipeline.store().insert(&event, TENANT);
        }
        let filters = vec![Filter::new().kind(Kind::TextNote)];

        // 5件あるので重い処理用プールへ
        let events = pipeline.scan(filters.clone(), TENANT, 3).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(pipeline.count(filters, TENANT).await.unwrap(), 5);

        // 空のテナントはその場で実行
        let none = pipeline
            .scan(vec![Filter::new()], "other.example.com", 10)
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(pipeline.heavy_tasks_length(), 0);
        assert_eq!(pipeline.light_tasks_length(), 0);
    }

    #[tokio::test]
    async fn test_verify_on_light_pool() {
        let pipeline = pipeline(small_config());
        let event = EventBuilder::text_note("verify me")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        assert_eq!(pipeline.verify(event).await, Ok(Ok(())));
    }

    #[tokio::test]
    async fn test_verify_with_closed_light_pool() {
        let pipeline = pipeline(PipelineConfig {
            light_workers: 0,
            ..small_config()
        });
        let event = EventBuilder::text_note("nobody home")
            .sign_with_keys(&Keys::generate())
            .unwrap();
        assert_eq!(
            pipeline.verify(event).await,
            Err(WorkerError::PoolClosed("light"))
        );
    }

    #[tokio::test]
    async fn test_reap_expired_enqueues_delete() {
        let pipeline = pipeline(small_config());
        let now = Timestamp::now().as_secs();
        let event = EventBuilder::text_note("fleeting")
            .tags(vec![
                Tag::parse(["expiration", (now + 5).to_string().as_str()]).unwrap(),
            ])
            .custom_created_at(Timestamp::from(now))
            .sign_with_keys(&Keys::generate())
            .unwrap();
        pipeline.store().insert(&event, TENANT);

        assert_eq!(pipeline.reap_expired(now), 0);
        assert_eq!(pipeline.reap_expired(now + 5), 1);
        pipeline.shutdown().await;

        assert!(pipeline.store().index_entry(&event.id).is_none());
        assert_eq!(pipeline.queue_length(), 0);
    }

    #[tokio::test]
    async fn test_worker_count() {
        let pipeline = pipeline(small_config());
        assert_eq!(pipeline.worker_count(), 3);
    }
}
