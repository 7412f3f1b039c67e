/// `/status` で返す稼働状況
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::infrastructure::{ConnectionRegistry, TaskPipeline};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub websocket_connections: usize,
    /// イベントチャンクに確保済みのバイト数
    pub used_memory: usize,
    pub stored_bytes: usize,
    pub chunks: usize,
    pub indexed_events: usize,
    pub queue_length: usize,
    pub worker_count: usize,
    pub heavy_tasks_length: usize,
    pub light_tasks_length: usize,
    pub pending_events: usize,
    pub pending_deletes: usize,
    pub started_at: String,
    pub uptime_secs: i64,
}

pub struct StatusHandler {
    connections: ConnectionRegistry,
    pipeline: Arc<TaskPipeline>,
    started_at: DateTime<Utc>,
}

impl StatusHandler {
    pub fn new(connections: ConnectionRegistry, pipeline: Arc<TaskPipeline>) -> Self {
        Self {
            connections,
            pipeline,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> RelayStatus {
        let stats = self.pipeline.store().stats();
        RelayStatus {
            websocket_connections: self.connections.len(),
            used_memory: stats.allocated_bytes,
            stored_bytes: stats.used_bytes,
            chunks: stats.chunks,
            indexed_events: stats.indexed,
            queue_length: self.pipeline.queue_length(),
            worker_count: self.pipeline.worker_count(),
            heavy_tasks_length: self.pipeline.heavy_tasks_length(),
            light_tasks_length: self.pipeline.light_tasks_length(),
            pending_events: stats.pending,
            pending_deletes: stats.pending_delete,
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }
}
