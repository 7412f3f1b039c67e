/// 受け入れ前のプラグインフック
///
/// 起動時に一度だけ登録し、イベントを受け入れる前に登録順に実行する。
/// 最初に拒否したフックの判定を採用する
use std::collections::HashSet;

use nostr::{Event, PublicKey};
use tracing::{debug, warn};

use super::relay_info_config::parse_comma_separated;
use crate::domain::PolicyError;

pub const ENV_ALLOWED_PUBKEYS: &str = "RELAY_ALLOWED_PUBKEYS";
pub const ENV_BLOCKED_KINDS: &str = "RELAY_BLOCKED_KINDS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Accept,
    Deny(String),
}

pub trait PreAcceptHook: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, event: &Event, tenant_id: &str) -> HookDecision;
}

#[derive(Default)]
pub struct PluginChain {
    hooks: Vec<Box<dyn PreAcceptHook>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// `RELAY_ALLOWED_PUBKEYS` と `RELAY_BLOCKED_KINDS` で有効になる組み込みフック
    pub fn from_env() -> Self {
        let mut chain = Self::new();

        let allowed = std::env::var(ENV_ALLOWED_PUBKEYS)
            .map(|v| parse_comma_separated(&v))
            .unwrap_or_default();
        if !allowed.is_empty() {
            chain.register(Box::new(AllowedPubkeysHook::from_hex(&allowed)));
        }

        let blocked = std::env::var(ENV_BLOCKED_KINDS)
            .map(|v| parse_comma_separated(&v))
            .unwrap_or_default();
        if !blocked.is_empty() {
            let kinds = blocked
                .iter()
                .filter_map(|k| match k.parse::<u16>() {
                    Ok(kind) => Some(kind),
                    Err(_) => {
                        warn!(value = %k, "ignoring invalid blocked kind");
                        None
                    }
                })
                .collect();
            chain.register(Box::new(BlockedKindsHook::new(kinds)));
        }

        chain
    }

    pub fn register(&mut self, hook: Box<dyn PreAcceptHook>) {
        debug!(plugin = hook.name(), "pre-accept hook registered");
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn evaluate(&self, event: &Event, tenant_id: &str) -> Result<(), PolicyError> {
        for hook in &self.hooks {
            if let HookDecision::Deny(reason) = hook.check(event, tenant_id) {
                debug!(plugin = hook.name(), event_id = %event.id, reason = %reason, "event denied by plugin");
                return Err(PolicyError::PluginDenied {
                    plugin: hook.name().to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

/// 一覧にある作者だけが投稿できる
pub struct AllowedPubkeysHook {
    allowed: HashSet<PublicKey>,
}

impl AllowedPubkeysHook {
    pub fn new(allowed: HashSet<PublicKey>) -> Self {
        Self { allowed }
    }

    /// 不正な16進の値はログに出して読み飛ばす
    pub fn from_hex(values: &[String]) -> Self {
        let allowed = values
            .iter()
            .filter_map(|v| match PublicKey::from_hex(v) {
                Ok(pk) => Some(pk),
                Err(_) => {
                    warn!(value = %v, "ignoring invalid allowed pubkey");
                    None
                }
            })
            .collect();
        Self { allowed }
    }
}

impl PreAcceptHook for AllowedPubkeysHook {
    fn name(&self) -> &str {
        "allowed_pubkeys"
    }

    fn check(&self, event: &Event, _tenant_id: &str) -> HookDecision {
        if self.allowed.contains(&event.pubkey) {
            HookDecision::Accept
        } else {
            HookDecision::Deny("author not in allow list".to_string())
        }
    }
}

/// 一覧にあるkindを拒否する
pub struct BlockedKindsHook {
    kinds: HashSet<u16>,
}

impl BlockedKindsHook {
    pub fn new(kinds: HashSet<u16>) -> Self {
        Self { kinds }
    }
}

impl PreAcceptHook for BlockedKindsHook {
    fn name(&self) -> &str {
        "blocked_kinds"
    }

    fn check(&self, event: &Event, _tenant_id: &str) -> HookDecision {
        if self.kinds.contains(&event.kind.as_u16()) {
            HookDecision::Deny(format!("kind {} is blocked", event.kind.as_u16()))
        } else {
            HookDecision::Accept
        }
    }
}
