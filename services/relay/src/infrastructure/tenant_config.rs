/// テナントの解決
///
/// テナントはクライアントが接続したホスト名。テナントごとに制限値と
/// NIP-11 の項目を持ち、リレー機能を無効にすることもできる
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use super::relay_info_config::{parse_comma_separated, RelayInfoConfig};
use crate::domain::LimitationConfig;

pub const ENV_TENANTS: &str = "RELAY_TENANTS";
pub const ENV_TENANTS_FILE: &str = "RELAY_TENANTS_FILE";

#[derive(Debug, Error)]
pub enum TenantConfigError {
    #[error("failed to read tenants file {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid tenants file: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub limitation: Arc<LimitationConfig>,
    pub info: Arc<RelayInfoConfig>,
    pub relay_enabled: bool,
}

#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// このリレーが担当しないホストなら `None`
    async fn resolve(&self, host: &str) -> Option<Tenant>;
}

/// テナント定義ファイルの1エントリ
///
/// `limitation` にはプロセス全体の値と異なるキーだけを書く
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TenantEntry {
    relay_enabled: Option<bool>,
    limitation: Option<Value>,
    info: Option<RelayInfoConfig>,
}

/// 設定から作るテナント一覧
///
/// ホスト一覧が空なら、どのホストもデフォルトの制限値を持つ独立したテナントになる。
/// 空でなければ一覧 (とテナント定義ファイル) にあるホストだけを担当する
#[derive(Debug, Clone)]
pub struct StaticTenantResolver {
    allowed_hosts: Option<HashSet<String>>,
    default_limitation: Arc<LimitationConfig>,
    default_info: Arc<RelayInfoConfig>,
    tenants: HashMap<String, Tenant>,
}

impl StaticTenantResolver {
    pub fn new(
        hosts: Vec<String>,
        default_limitation: LimitationConfig,
        default_info: RelayInfoConfig,
    ) -> Self {
        let allowed_hosts = if hosts.is_empty() {
            None
        } else {
            Some(hosts.iter().map(|h| normalize_host(h)).collect())
        };
        Self {
            allowed_hosts,
            default_limitation: Arc::new(default_limitation),
            default_info: Arc::new(default_info),
            tenants: HashMap::new(),
        }
    }

    /// `RELAY_TENANTS` (カンマ区切りのホスト) と任意の `RELAY_TENANTS_FILE` から読む
    pub fn from_env(
        default_limitation: LimitationConfig,
        default_info: RelayInfoConfig,
    ) -> Result<Self, TenantConfigError> {
        let hosts = std::env::var(ENV_TENANTS)
            .map(|v| parse_comma_separated(&v))
            .unwrap_or_default();
        let mut resolver = Self::new(hosts, default_limitation, default_info);

        if let Ok(path) = std::env::var(ENV_TENANTS_FILE) {
            if !path.trim().is_empty() {
                resolver = resolver.with_tenants_file(Path::new(path.trim()))?;
            }
        }

        info!(
            hosts = resolver.allowed_hosts.as_ref().map_or(0, HashSet::len),
            overrides = resolver.tenants.len(),
            "tenant configuration loaded"
        );
        Ok(resolver)
    }

    pub fn with_tenants_file(self, path: &Path) -> Result<Self, TenantConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| TenantConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.with_tenants_json(&raw)
    }

    /// ホスト名をキーとするJSONオブジェクト
    pub fn with_tenants_json(mut self, raw: &str) -> Result<Self, TenantConfigError> {
        let entries: HashMap<String, TenantEntry> =
            serde_json::from_str(raw).map_err(|e| TenantConfigError::Parse(e.to_string()))?;

        for (host, entry) in entries {
            let host = normalize_host(&host);
            let limitation = match entry.limitation {
                Some(overrides) => Arc::new(merge_limitation(&self.default_limitation, overrides)?),
                None => Arc::clone(&self.default_limitation),
            };
            let info = match entry.info {
                Some(overrides) => Arc::new(self.default_info.merged_with(&overrides)),
                None => Arc::clone(&self.default_info),
            };
            self.tenants.insert(
                host.clone(),
                Tenant {
                    id: host,
                    limitation,
                    info,
                    relay_enabled: entry.relay_enabled.unwrap_or(true),
                },
            );
        }
        Ok(self)
    }

    fn default_tenant(&self, host: String) -> Tenant {
        Tenant {
            id: host,
            limitation: Arc::clone(&self.default_limitation),
            info: Arc::clone(&self.default_info),
            relay_enabled: true,
        }
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn resolve(&self, host: &str) -> Option<Tenant> {
        let host = normalize_host(host);
        if host.is_empty() {
            return None;
        }
        if let Some(tenant) = self.tenants.get(&host) {
            return Some(tenant.clone());
        }
        match self.allowed_hosts.as_ref() {
            Some(hosts) if !hosts.contains(&host) => {
                warn!(host = %host, "unknown tenant host");
                None
            }
            _ => Some(self.default_tenant(host)),
        }
    }
}

fn merge_limitation(
    base: &LimitationConfig,
    overrides: Value,
) -> Result<LimitationConfig, TenantConfigError> {
    let mut merged =
        serde_json::to_value(base).map_err(|e| TenantConfigError::Parse(e.to_string()))?;
    match (merged.as_object_mut(), overrides) {
        (Some(target), Value::Object(overrides)) => {
            for (key, value) in overrides {
                target.insert(key, value);
            }
        }
        _ => {
            return Err(TenantConfigError::Parse(
                "limitation must be a JSON object".to_string(),
            ));
        }
    }
    serde_json::from_value(merged).map_err(|e| TenantConfigError::Parse(e.to_string()))
}

/// ポートを除いて小文字にしたホスト名。角括弧付きのIPv6リテラルは括弧を残す
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => host[..=end].to_string(),
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name.to_string()
        }
        _ => host,
    }
}
