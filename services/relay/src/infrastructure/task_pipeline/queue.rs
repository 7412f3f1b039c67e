// IDで振り分けるFIFOの永続化キュー

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use nostr::EventId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::job::{panic_message, Job, WorkerError};
use crate::infrastructure::event_store::EventStore;

/// ストアへの変更ジョブを投入順に適用するキュー
///
/// コンシューマーごとにチャネルを1本持ち、ジョブはIDのハッシュで振り分ける。
/// 同じIDに触れるジョブはすべて同じコンシューマーでFIFO順に実行される
pub struct DurabilityQueue {
    senders: Mutex<Vec<mpsc::UnboundedSender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    depth: Arc<AtomicUsize>,
    concurrency: usize,
}

impl DurabilityQueue {
    /// `concurrency` 個 (最低1個) のコンシューマーを起動する。tokioランタイム内で呼ぶこと
    pub fn new(concurrency: usize, store: Arc<EventStore>) -> Self {
        let concurrency = concurrency.max(1);
        let depth = Arc::new(AtomicUsize::new(0));
        let mut senders = Vec::with_capacity(concurrency);
        let mut handles = Vec::with_capacity(concurrency);

        for consumer in 0..concurrency {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            handles.push(tokio::spawn(consume(
                consumer,
                rx,
                Arc::clone(&store),
                Arc::clone(&depth),
            )));
        }

        Self {
            senders: Mutex::new(senders),
            handles: Mutex::new(handles),
            depth,
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 投入済みで未適用のジョブ数
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn route(&self, id: Option<&EventId>) -> usize {
        match id {
            Some(id) => {
                let mut hasher = DefaultHasher::new();
                id.hash(&mut hasher);
                (hasher.finish() % self.concurrency as u64) as usize
            }
            None => 0,
        }
    }

    /// ブロックしない。`Delete` と `Update` は id ごとに分割し、
    /// それぞれの id の担当コンシューマーへ送る
    pub fn enqueue(&self, job: Job) -> Result<(), WorkerError> {
        for job in self.partition(job) {
            self.submit(job)?;
        }
        Ok(())
    }

    /// ジョブを担当コンシューマー単位に分ける
    fn partition(&self, job: Job) -> Vec<Job> {
        if self.concurrency == 1 {
            return vec![job];
        }
        match job {
            Job::Delete { ids } if ids.len() > 1 => {
                let mut batches: Vec<Vec<EventId>> = vec![Vec::new(); self.concurrency];
                for id in ids {
                    batches[self.route(Some(&id))].push(id);
                }
                batches
                    .into_iter()
                    .filter(|ids| !ids.is_empty())
                    .map(|ids| Job::Delete { ids })
                    .collect()
            }
            // 置き換え前の削除は元の Store と同じコンシューマーで適用する
            Job::Update {
                superseded,
                replacement,
            } => vec![
                Job::Delete {
                    ids: vec![superseded],
                },
                Job::Store { id: replacement },
            ],
            job => vec![job],
        }
    }

    fn submit(&self, job: Job) -> Result<(), WorkerError> {
        let consumer = self.route(job.routing_id());
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = senders.get(consumer) else {
            error!(job = job.name(), "durability queue closed, rejecting job");
            return Err(WorkerError::QueueClosed);
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = sender.send(job) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            error!(job = e.0.name(), consumer, "durability consumer gone, rejecting job");
            return Err(WorkerError::QueueClosed);
        }
        Ok(())
    }

    /// 新規ジョブの受け付けを止め、コンシューマーがチャネルを流しきるまで待つ
    pub async fn shutdown(&self) {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "durability consumer ended abnormally");
            }
        }
    }
}

async fn consume(
    consumer: usize,
    mut rx: mpsc::UnboundedReceiver<Job>,
    store: Arc<EventStore>,
    depth: Arc<AtomicUsize>,
) {
    while let Some(job) = rx.recv().await {
        let job_name = job.name();
        let result = catch_unwind(AssertUnwindSafe(|| job.execute(&store)));
        depth.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(Ok(output)) => trace!(consumer, job = job_name, output = ?output, "durability job applied"),
            Ok(Err(e)) => error!(consumer, job = job_name, error = %e, "durability job failed"),
            Err(payload) => error!(
                consumer,
                job = job_name,
                panic = %panic_message(payload),
                "durability job panicked"
            ),
        }
    }
    debug!(consumer, "durability consumer stopped");
}
