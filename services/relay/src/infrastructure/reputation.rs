/// IPとpubkeyのレピュテーション
///
/// WebSocketアップグレード前、受信フレームごと、イベントの作者ごとに参照する
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use nostr::{PublicKey, Timestamp};
use tracing::{info, warn};

use super::relay_info_config::parse_comma_separated;
use crate::domain::limitation_config::parse_env;

pub const ENV_BANNED_IPS: &str = "RELAY_BANNED_IPS";
pub const ENV_BANNED_PUBKEYS: &str = "RELAY_BANNED_PUBKEYS";
pub const ENV_MAX_MESSAGES_PER_MINUTE: &str = "RELAY_MAX_MESSAGES_PER_MINUTE";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reputation {
    pub banned: bool,
    /// BAN時にクライアントへ示す理由
    pub comments: Vec<String>,
}

impl Reputation {
    pub fn allowed() -> Self {
        Self::default()
    }

    pub fn banned(comment: impl Into<String>) -> Self {
        Self {
            banned: true,
            comments: vec![comment.into()],
        }
    }
}

#[async_trait]
pub trait ReputationService: Send + Sync {
    /// アップグレード前の受け入れ判定
    async fn is_allowed(&self, ip: IpAddr, tenant_id: &str) -> Reputation;

    /// フレームごとの判定。レート制限のカウントも進める
    async fn check_message(&self, ip: IpAddr) -> Reputation;

    async fn is_pubkey_banned(&self, pubkey: &PublicKey) -> bool;
}

/// 現在の1分間に送信してきたIPごとのメッセージ数
///
/// 分が変わると丸ごと捨てるので、保持するのはその分に見えたIPだけ
#[derive(Debug, Default)]
struct RateWindows {
    minute: u64,
    counts: HashMap<IpAddr, u32>,
}

/// 固定のBANリストと、IPごとの1分間の固定ウィンドウ
#[derive(Debug, Default)]
pub struct StaticReputation {
    banned_ips: HashSet<IpAddr>,
    banned_pubkeys: HashSet<PublicKey>,
    /// 0 ならレート制限なし
    max_messages_per_minute: u32,
    windows: Mutex<RateWindows>,
}

impl StaticReputation {
    pub fn new(
        banned_ips: HashSet<IpAddr>,
        banned_pubkeys: HashSet<PublicKey>,
        max_messages_per_minute: u32,
    ) -> Self {
        Self {
            banned_ips,
            banned_pubkeys,
            max_messages_per_minute,
            windows: Mutex::new(RateWindows::default()),
        }
    }

    /// パースできない値はログに出して読み飛ばす
    pub fn from_env() -> Self {
        let banned_ips = std::env::var(ENV_BANNED_IPS)
            .map(|v| parse_comma_separated(&v))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|ip| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(value = %ip, "ignoring invalid banned ip");
                    None
                }
            })
            .collect::<HashSet<_>>();
        let banned_pubkeys = std::env::var(ENV_BANNED_PUBKEYS)
            .map(|v| parse_comma_separated(&v))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|pk| match PublicKey::from_hex(&pk) {
                Ok(pk) => Some(pk),
                Err(_) => {
                    warn!(value = %pk, "ignoring invalid banned pubkey");
                    None
                }
            })
            .collect::<HashSet<_>>();
        let max_messages_per_minute = parse_env(ENV_MAX_MESSAGES_PER_MINUTE, 0u32);

        info!(
            banned_ips = banned_ips.len(),
            banned_pubkeys = banned_pubkeys.len(),
            max_messages_per_minute,
            "reputation lists loaded"
        );
        Self::new(banned_ips, banned_pubkeys, max_messages_per_minute)
    }

    fn over_limit(&self, ip: IpAddr, now: u64, count_message: bool) -> bool {
        if self.max_messages_per_minute == 0 {
            return false;
        }
        let minute = now / 60;
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        if windows.minute != minute {
            windows.minute = minute;
            windows.counts.clear();
        }
        let count = if count_message {
            let count = windows.counts.entry(ip).or_insert(0);
            *count = count.saturating_add(1);
            *count
        } else {
            windows.counts.get(&ip).copied().unwrap_or(0)
        };
        count > self.max_messages_per_minute
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counts
            .len()
    }

    pub(crate) fn check_message_at(&self, ip: IpAddr, now: u64) -> Reputation {
        if self.banned_ips.contains(&ip) {
            return Reputation::banned("ip is banned");
        }
        if self.over_limit(ip, now, true) {
            return Reputation::banned("rate limit exceeded");
        }
        Reputation::allowed()
    }

    pub(crate) fn is_allowed_at(&self, ip: IpAddr, now: u64) -> Reputation {
        if self.banned_ips.contains(&ip) {
            return Reputation::banned("ip is banned");
        }
        if self.over_limit(ip, now, false) {
            return Reputation::banned("rate limit exceeded");
        }
        Reputation::allowed()
    }
}

#[async_trait]
impl ReputationService for StaticReputation {
    async fn is_allowed(&self, ip: IpAddr, _tenant_id: &str) -> Reputation {
        self.is_allowed_at(ip, Timestamp::now().as_secs())
    }

    async fn check_message(&self, ip: IpAddr) -> Reputation {
        self.check_message_at(ip, Timestamp::now().as_secs())
    }

    async fn is_pubkey_banned(&self, pubkey: &PublicKey) -> bool {
        self.banned_pubkeys.contains(pubkey)
    }
}
