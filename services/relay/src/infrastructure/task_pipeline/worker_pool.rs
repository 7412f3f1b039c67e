// tokioのブロッキングスレッド上で動くCPUバウンド処理用のワーカープール

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, trace};

use super::job::{panic_message, Job, JobOutput, WorkerError};
use crate::infrastructure::event_store::EventStore;

/// 投入からFutureの完了 (または破棄) までタスクを数える
struct DepthGuard(Arc<AtomicUsize>);

impl DepthGuard {
    fn new(depth: &Arc<AtomicUsize>) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(depth))
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 同時に実行するのは最大 `size` 件で、残りは許可を待つ
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
    depth: Arc<AtomicUsize>,
    store: Arc<EventStore>,
}

impl WorkerPool {
    /// サイズ0のプールは閉じた状態で始まる
    pub fn new(name: &'static str, size: usize, store: Arc<EventStore>) -> Self {
        let permits = Arc::new(Semaphore::new(size));
        if size == 0 {
            permits.close();
        }
        Self {
            name,
            size,
            permits,
            depth: Arc::new(AtomicUsize::new(0)),
            store,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 待機中と実行中のジョブ数
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// `job` をブロッキングスレッドで実行する
    ///
    /// パニックは [`WorkerError::Panicked`] として返る。返したFutureを破棄しても
    /// 実行中のジョブは最後まで動き、結果だけが捨てられる
    pub async fn run(&self, job: Job) -> Result<JobOutput, WorkerError> {
        let _depth = DepthGuard::new(&self.depth);
        let job_name = job.name();

        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(pool = self.name, job = job_name, "worker pool closed, rejecting job");
                return Err(WorkerError::PoolClosed(self.name));
            }
        };

        let store = Arc::clone(&self.store);
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job.execute(&store)
        });

        match handle.await {
            Ok(result) => {
                trace!(pool = self.name, job = job_name, ok = result.is_ok(), "job finished");
                result
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(pool = self.name, job = job_name, panic = %message, "job panicked");
                Err(WorkerError::Panicked(message))
            }
            Err(e) => {
                error!(pool = self.name, job = job_name, error = %e, "job cancelled");
                Err(WorkerError::Panicked(e.to_string()))
            }
        }
    }

    /// 新規ジョブを拒否する。実行中のジョブはそのまま完了させる
    pub fn close(&self) {
        self.permits.close();
    }
}
