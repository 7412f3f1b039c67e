use thiserror::Error;

use super::relay_message::error_prefix;

/// 不正な入力ではなく、リレーのポリシーによる拒否
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("ip is banned")]
    BannedIp,

    #[error("slow down")]
    RateLimited,

    #[error("banned pubkey")]
    BannedPubkey,

    #[error("you must authenticate first")]
    AuthRequired,

    /// 作者以外が投稿した NIP-70 の保護イベント
    #[error("this event may only be published by its author")]
    ProtectedEvent,

    #[error("can't accept event")]
    PluginDenied { plugin: String, reason: String },
}

impl PolicyError {
    /// OK / CLOSED / NOTICE メッセージの機械可読なプレフィックス
    pub fn prefix(&self) -> &'static str {
        match self {
            PolicyError::BannedIp | PolicyError::BannedPubkey | PolicyError::PluginDenied { .. } => {
                error_prefix::BLOCKED
            }
            PolicyError::RateLimited => error_prefix::RATE_LIMITED,
            PolicyError::AuthRequired | PolicyError::ProtectedEvent => error_prefix::AUTH_REQUIRED,
        }
    }

    /// プレフィックス付きのクライアント向け文字列
    pub fn client_message(&self) -> String {
        format!("{} {}", self.prefix(), self)
    }
}
