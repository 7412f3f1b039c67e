/// エンジン設定
///
/// ゲートウェイ、タスクパイプライン、イベントストアのプロセス全体の設定値。
/// すべてデフォルト値を持ち、RELAY_* 環境変数で上書きできる。
/// `relay` バイナリではさらにCLI引数で上書きする
use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;

use super::event_store::{StoreConfig, DEFAULT_CHUNK_CAPACITY, DEFAULT_CHUNK_TIME_WINDOW};
use super::task_pipeline::PipelineConfig;
use crate::domain::limitation_config::parse_env;

pub const ENV_BIND: &str = "RELAY_BIND";
pub const ENV_HEARTBEAT_INTERVAL_SECS: &str = "RELAY_HEARTBEAT_INTERVAL_SECS";
pub const ENV_QUEUE_CONCURRENCY: &str = "RELAY_QUEUE_CONCURRENCY";
pub const ENV_HEAVY_WORKERS: &str = "RELAY_HEAVY_WORKERS";
pub const ENV_LIGHT_WORKERS: &str = "RELAY_LIGHT_WORKERS";
pub const ENV_INLINE_SCAN_THRESHOLD: &str = "RELAY_INLINE_SCAN_THRESHOLD";
pub const ENV_HEAVY_SCAN_THRESHOLD: &str = "RELAY_HEAVY_SCAN_THRESHOLD";
pub const ENV_REQ_TIMEOUT_MS: &str = "RELAY_REQ_TIMEOUT_MS";
pub const ENV_AUTH_TIMEOUT_MS: &str = "RELAY_AUTH_TIMEOUT_MS";
pub const ENV_CHUNK_CAPACITY: &str = "RELAY_CHUNK_CAPACITY";
pub const ENV_CHUNK_TIME_WINDOW_SECS: &str = "RELAY_CHUNK_TIME_WINDOW_SECS";
pub const ENV_REAPER_INTERVAL_SECS: &str = "RELAY_REAPER_INTERVAL_SECS";
pub const ENV_MAX_QUEUE_LENGTH: &str = "RELAY_MAX_QUEUE_LENGTH";
pub const ENV_STATUS_TOKEN: &str = "RELAY_STATUS_TOKEN";

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REQ_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_AUTH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub bind: SocketAddr,
    pub heartbeat_interval: Duration,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    /// REQのバックログ走査の上限時間。超えたらEOSEだけを返す
    pub req_timeout: Duration,
    pub auth_timeout: Duration,
    pub reaper_interval: Duration,
    /// 永続化キューがこの深さを超えたら受信フレームを拒否する
    pub max_queue_length: usize,
    /// `/status` のBearerトークン。未設定なら認証なし
    pub status_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            pipeline: PipelineConfig::default(),
            store: StoreConfig::default(),
            req_timeout: Duration::from_millis(DEFAULT_REQ_TIMEOUT_MS),
            auth_timeout: Duration::from_millis(DEFAULT_AUTH_TIMEOUT_MS),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            max_queue_length: DEFAULT_MAX_QUEUE_LENGTH,
            status_token: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let pipeline_defaults = defaults.pipeline;

        let config = Self {
            bind: parse_env(ENV_BIND, defaults.bind),
            heartbeat_interval: Duration::from_secs(parse_env(
                ENV_HEARTBEAT_INTERVAL_SECS,
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )),
            pipeline: PipelineConfig {
                queue_concurrency: parse_env(ENV_QUEUE_CONCURRENCY, pipeline_defaults.queue_concurrency),
                heavy_workers: parse_env(ENV_HEAVY_WORKERS, pipeline_defaults.heavy_workers),
                light_workers: parse_env(ENV_LIGHT_WORKERS, pipeline_defaults.light_workers),
                inline_scan_threshold: parse_env(
                    ENV_INLINE_SCAN_THRESHOLD,
                    pipeline_defaults.inline_scan_threshold,
                ),
                heavy_scan_threshold: parse_env(
                    ENV_HEAVY_SCAN_THRESHOLD,
                    pipeline_defaults.heavy_scan_threshold,
                ),
            },
            store: StoreConfig {
                chunk_capacity: parse_env(ENV_CHUNK_CAPACITY, DEFAULT_CHUNK_CAPACITY),
                chunk_time_window: parse_env(ENV_CHUNK_TIME_WINDOW_SECS, DEFAULT_CHUNK_TIME_WINDOW),
            },
            req_timeout: Duration::from_millis(parse_env(ENV_REQ_TIMEOUT_MS, DEFAULT_REQ_TIMEOUT_MS)),
            auth_timeout: Duration::from_millis(parse_env(ENV_AUTH_TIMEOUT_MS, DEFAULT_AUTH_TIMEOUT_MS)),
            reaper_interval: Duration::from_secs(parse_env(
                ENV_REAPER_INTERVAL_SECS,
                DEFAULT_REAPER_INTERVAL_SECS,
            )),
            max_queue_length: parse_env(ENV_MAX_QUEUE_LENGTH, DEFAULT_MAX_QUEUE_LENGTH),
            status_token: std::env::var(ENV_STATUS_TOKEN).ok().filter(|t| !t.trim().is_empty()),
        };

        info!(
            bind = %config.bind,
            heartbeat_interval_secs = config.heartbeat_interval.as_secs(),
            queue_concurrency = config.pipeline.queue_concurrency,
            heavy_workers = config.pipeline.heavy_workers,
            light_workers = config.pipeline.light_workers,
            chunk_capacity = config.store.chunk_capacity,
            max_queue_length = config.max_queue_length,
            status_token = config.status_token.is_some(),
            "EngineConfig loaded"
        );

        config
    }
}
