// NIP-11 リレー情報ドキュメント

use serde::Serialize;

use super::limitation_config::LimitationConfig;

pub const SOFTWARE_URL: &str = "https://github.com/relay-engine/relay-engine";

/// 1 基本プロトコル, 9 削除, 11 リレー情報, 13 PoW, 40 有効期限,
/// 42 認証, 45 COUNT, 70 保護イベント
pub const SUPPORTED_NIPS: &[u32] = &[1, 9, 11, 13, 40, 42, 45, 70];

#[derive(Debug, Clone, Serialize)]
pub struct RelayInfoDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    pub supported_nips: Vec<u32>,

    pub software: String,

    pub version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    pub limitation: RelayLimitation,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub relay_countries: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub language_tags: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub posting_policy: Option<String>,
}

/// NIP-11 ドキュメントの `limitation` オブジェクト
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayLimitation {
    pub max_message_length: u32,
    pub max_subscriptions: u32,
    pub max_filters: u32,
    pub max_limit: u32,
    pub max_subid_length: u32,
    pub max_event_tags: u32,
    pub max_content_length: u32,
    pub min_pow_difficulty: u8,
    pub auth_required: bool,
    pub payment_required: bool,
    pub restricted_writes: bool,
    pub created_at_lower_limit: u64,
    pub created_at_upper_limit: u64,
}

impl From<&LimitationConfig> for RelayLimitation {
    fn from(config: &LimitationConfig) -> Self {
        Self {
            max_message_length: config.max_message_length,
            max_subscriptions: config.max_subscriptions,
            max_filters: config.max_filters,
            max_limit: config.max_limit,
            max_subid_length: config.max_subid_length,
            max_event_tags: config.max_event_tags,
            max_content_length: config.max_content_length,
            min_pow_difficulty: config.min_pow_difficulty,
            auth_required: config.auth_required,
            payment_required: false,
            restricted_writes: config.writes_need_auth(),
            created_at_lower_limit: config.created_at_lower_limit,
            created_at_upper_limit: config.created_at_upper_limit,
        }
    }
}

impl RelayInfoDocument {
    /// 制限値の設定から導ける項目だけを埋めたドキュメント
    pub fn with_limitation(limitation: &LimitationConfig) -> Self {
        Self {
            name: None,
            description: None,
            pubkey: None,
            contact: None,
            supported_nips: SUPPORTED_NIPS.to_vec(),
            software: SOFTWARE_URL.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            icon: None,
            banner: None,
            limitation: RelayLimitation::from(limitation),
            relay_countries: Vec::new(),
            language_tags: Vec::new(),
            posting_policy: None,
        }
    }
}
