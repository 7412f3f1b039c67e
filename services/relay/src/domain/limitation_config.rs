// NIP-11 で公開し、プロトコルハンドラーが適用する制限値
//
// 値は RELAY_* 環境変数から読み、未設定ならデフォルト値を使う。
// テナントは定義ファイルで一部だけを上書きできる (残りはserdeのデフォルト)

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use tracing::info;

// ===========================================
// デフォルト値
// ===========================================

pub const DEFAULT_MAX_MESSAGE_LENGTH: u32 = 131072;
pub const DEFAULT_MAX_SUBSCRIPTIONS: u32 = 20;
pub const DEFAULT_MAX_FILTERS: u32 = 10;
pub const DEFAULT_MAX_LIMIT: u32 = 5000;
pub const DEFAULT_MAX_EVENT_TAGS: u32 = 1000;
pub const DEFAULT_MAX_CONTENT_LENGTH: u32 = 65536;
pub const DEFAULT_MAX_SUBID_LENGTH: u32 = 64;
/// 1年
pub const DEFAULT_CREATED_AT_LOWER_LIMIT: u64 = 31536000;
/// 15分
pub const DEFAULT_CREATED_AT_UPPER_LIMIT: u64 = 900;
pub const DEFAULT_MIN_POW_DIFFICULTY: u8 = 0;

// ===========================================
// 環境変数名
// ===========================================

pub const ENV_MAX_MESSAGE_LENGTH: &str = "RELAY_MAX_MESSAGE_LENGTH";
pub const ENV_MAX_SUBSCRIPTIONS: &str = "RELAY_MAX_SUBSCRIPTIONS";
pub const ENV_MAX_FILTERS: &str = "RELAY_MAX_FILTERS";
pub const ENV_MAX_LIMIT: &str = "RELAY_MAX_LIMIT";
pub const ENV_MAX_EVENT_TAGS: &str = "RELAY_MAX_EVENT_TAGS";
pub const ENV_MAX_CONTENT_LENGTH: &str = "RELAY_MAX_CONTENT_LENGTH";
pub const ENV_MAX_SUBID_LENGTH: &str = "RELAY_MAX_SUBID_LENGTH";
pub const ENV_CREATED_AT_LOWER_LIMIT: &str = "RELAY_CREATED_AT_LOWER_LIMIT";
pub const ENV_CREATED_AT_UPPER_LIMIT: &str = "RELAY_CREATED_AT_UPPER_LIMIT";
pub const ENV_MIN_POW_DIFFICULTY: &str = "RELAY_MIN_POW_DIFFICULTY";
pub const ENV_AUTH_REQUIRED: &str = "RELAY_AUTH_REQUIRED";
pub const ENV_RESTRICTED_WRITES: &str = "RELAY_RESTRICTED_WRITES";

// ===========================================
// LimitationConfig
// ===========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitationConfig {
    /// 受信WebSocketフレームの最大バイト数
    pub max_message_length: u32,

    /// 接続ごとのサブスクリプション数の上限
    pub max_subscriptions: u32,

    /// REQ / COUNT ごとのフィルター数の上限
    pub max_filters: u32,

    /// フィルターの `limit` の上限兼デフォルト値
    pub max_limit: u32,

    pub max_event_tags: u32,

    /// 文字数で数える
    pub max_content_length: u32,

    pub max_subid_length: u32,

    /// created_at が過去方向に許される秒数 (0 で無効)
    pub created_at_lower_limit: u64,

    /// created_at が未来方向に許される秒数
    pub created_at_upper_limit: u64,

    /// NIP-13: イベントIDの先頭ゼロビット数の最小値
    pub min_pow_difficulty: u8,

    /// NIP-42: 書き込みに認証が必要で、DMのkindは認証済みの読み手にだけ返す
    pub auth_required: bool,

    /// 書き込みに認証が必要
    pub restricted_writes: bool,
}

impl Default for LimitationConfig {
    fn default() -> Self {
        Self {
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            max_filters: DEFAULT_MAX_FILTERS,
            max_limit: DEFAULT_MAX_LIMIT,
            max_event_tags: DEFAULT_MAX_EVENT_TAGS,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            max_subid_length: DEFAULT_MAX_SUBID_LENGTH,
            created_at_lower_limit: DEFAULT_CREATED_AT_LOWER_LIMIT,
            created_at_upper_limit: DEFAULT_CREATED_AT_UPPER_LIMIT,
            min_pow_difficulty: DEFAULT_MIN_POW_DIFFICULTY,
            auth_required: false,
            restricted_writes: false,
        }
    }
}

impl LimitationConfig {
    /// 環境変数から読み込む。未設定やパースできない値はデフォルト値を使う
    pub fn from_env() -> Self {
        let config = Self {
            max_message_length: parse_env(ENV_MAX_MESSAGE_LENGTH, DEFAULT_MAX_MESSAGE_LENGTH),
            max_subscriptions: parse_env(ENV_MAX_SUBSCRIPTIONS, DEFAULT_MAX_SUBSCRIPTIONS),
            max_filters: parse_env(ENV_MAX_FILTERS, DEFAULT_MAX_FILTERS),
            max_limit: parse_env(ENV_MAX_LIMIT, DEFAULT_MAX_LIMIT),
            max_event_tags: parse_env(ENV_MAX_EVENT_TAGS, DEFAULT_MAX_EVENT_TAGS),
            max_content_length: parse_env(ENV_MAX_CONTENT_LENGTH, DEFAULT_MAX_CONTENT_LENGTH),
            max_subid_length: parse_env(ENV_MAX_SUBID_LENGTH, DEFAULT_MAX_SUBID_LENGTH),
            created_at_lower_limit: parse_env(
                ENV_CREATED_AT_LOWER_LIMIT,
                DEFAULT_CREATED_AT_LOWER_LIMIT,
            ),
            created_at_upper_limit: parse_env(
                ENV_CREATED_AT_UPPER_LIMIT,
                DEFAULT_CREATED_AT_UPPER_LIMIT,
            ),
            min_pow_difficulty: parse_env(ENV_MIN_POW_DIFFICULTY, DEFAULT_MIN_POW_DIFFICULTY),
            auth_required: parse_env_bool(ENV_AUTH_REQUIRED, false),
            restricted_writes: parse_env_bool(ENV_RESTRICTED_WRITES, false),
        };

        info!(
            max_message_length = config.max_message_length,
            max_subscriptions = config.max_subscriptions,
            max_filters = config.max_filters,
            max_limit = config.max_limit,
            max_event_tags = config.max_event_tags,
            max_content_length = config.max_content_length,
            max_subid_length = config.max_subid_length,
            created_at_lower_limit = config.created_at_lower_limit,
            created_at_upper_limit = config.created_at_upper_limit,
            min_pow_difficulty = config.min_pow_difficulty,
            auth_required = config.auth_required,
            restricted_writes = config.restricted_writes,
            "LimitationConfig loaded"
        );

        config
    }

    /// EVENT に認証済みの接続が必要か
    pub fn writes_need_auth(&self) -> bool {
        self.auth_required || self.restricted_writes
    }

    /// フィルターごとの実効 limit。要求値を `max_limit` で切り、未指定なら `max_limit`
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        let max = self.max_limit as usize;
        requested.map_or(max, |limit| limit.min(max))
    }
}

/// 環境変数をパースする。パースできなければログを出して `default` を返す
pub(crate) fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr + Display + Copy,
{
    match std::env::var(key) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) => {
                info!(key, value = %parsed, "Environment variable loaded");
                parsed
            }
            Err(_) => {
                info!(
                    key,
                    value = %value,
                    default = %default,
                    "Environment variable parse error, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// `true/false`、`1/0`、`yes/no` を受け付ける (大文字小文字は区別しない)
pub(crate) fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                info!(key, value = %value, default, "Environment variable parse error, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // #[serial] テストからのみ呼ぶ
    unsafe fn set_env(key: &str, value: &str) {
        unsafe { std::env::set_var(key, value) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    unsafe fn cleanup_limitation_env() {
        for key in [
            ENV_MAX_MESSAGE_LENGTH,
            ENV_MAX_SUBSCRIPTIONS,
            ENV_MAX_FILTERS,
            ENV_MAX_LIMIT,
            ENV_MAX_EVENT_TAGS,
            ENV_MAX_CONTENT_LENGTH,
            ENV_MAX_SUBID_LENGTH,
            ENV_CREATED_AT_LOWER_LIMIT,
            ENV_CREATED_AT_UPPER_LIMIT,
            ENV_MIN_POW_DIFFICULTY,
            ENV_AUTH_REQUIRED,
            ENV_RESTRICTED_WRITES,
        ] {
            unsafe { remove_env(key) };
        }
    }

    // ===========================================
    // デフォルト値テスト
    // ===========================================

    #[test]
    fn test_default_values() {
        let config = LimitationConfig::default();
        assert_eq!(config.max_message_length, 131072);
        assert_eq!(config.max_subscriptions, 20);
        assert_eq!(config.max_filters, 10);
        assert_eq!(config.max_limit, 5000);
        assert_eq!(config.max_event_tags, 1000);
        assert_eq!(config.max_content_length, 65536);
        assert_eq!(config.max_subid_length, 64);
        assert_eq!(config.created_at_lower_limit, 31536000);
        assert_eq!(config.created_at_upper_limit, 900);
        assert_eq!(config.min_pow_difficulty, 0);
        assert!(!config.auth_required);
        assert!(!config.restricted_writes);
    }

    #[test]
    fn test_effective_limit() {
        let config = LimitationConfig {
            max_limit: 100,
            ..Default::default()
        };
        assert_eq!(config.effective_limit(None), 100);
        assert_eq!(config.effective_limit(Some(10)), 10);
        assert_eq!(config.effective_limit(Some(1000)), 100);
        assert_eq!(config.effective_limit(Some(0)), 0);
    }

    #[test]
    fn test_writes_need_auth() {
        let mut config = LimitationConfig::default();
        assert!(!config.writes_need_auth());
        config.restricted_writes = true;
        assert!(config.writes_need_auth());
        config.restricted_writes = false;
        config.auth_required = true;
        assert!(config.writes_need_auth());
    }

    // ===========================================
    // デシリアライズ (テナントの上書き) テスト
    // ===========================================

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: LimitationConfig =
            serde_json::from_str(r#"{"min_pow_difficulty": 8, "auth_required": true}"#).unwrap();
        assert_eq!(config.min_pow_difficulty, 8);
        assert!(config.auth_required);
        assert_eq!(config.max_limit, DEFAULT_MAX_LIMIT);
    }

    // ===========================================
    // 環境変数読み込みテスト
    // ===========================================

    #[test]
    #[serial]
    fn test_from_env_uses_defaults_when_unset() {
        unsafe { cleanup_limitation_env() };
        assert_eq!(LimitationConfig::from_env(), LimitationConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_values() {
        unsafe {
            cleanup_limitation_env();
            set_env(ENV_MAX_LIMIT, "250");
            set_env(ENV_MAX_FILTERS, "3");
            set_env(ENV_MIN_POW_DIFFICULTY, "16");
            set_env(ENV_RESTRICTED_WRITES, "yes");
        }

        let config = LimitationConfig::from_env();
        assert_eq!(config.max_limit, 250);
        assert_eq!(config.max_filters, 3);
        assert_eq!(config.min_pow_difficulty, 16);
        assert!(config.restricted_writes);
        assert!(!config.auth_required);

        unsafe { cleanup_limitation_env() };
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_values_fall_back() {
        unsafe {
            cleanup_limitation_env();
            set_env(ENV_MAX_SUBSCRIPTIONS, "many");
            set_env(ENV_MIN_POW_DIFFICULTY, "300");
            set_env(ENV_AUTH_REQUIRED, "maybe");
        }

        let config = LimitationConfig::from_env();
        assert_eq!(config.max_subscriptions, DEFAULT_MAX_SUBSCRIPTIONS);
        assert_eq!(config.min_pow_difficulty, DEFAULT_MIN_POW_DIFFICULTY);
        assert!(!config.auth_required);

        unsafe { cleanup_limitation_env() };
    }
}
