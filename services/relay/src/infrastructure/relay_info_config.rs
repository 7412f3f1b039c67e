// NIP-11 リレー情報の設定
//
// 情報ドキュメントのうち運営者が指定する項目を環境変数から読み込む。
// テナントごとの制限値はリクエスト時に合成する

use serde::Deserialize;

use crate::domain::{LimitationConfig, RelayInfoDocument};

pub const ENV_NAME: &str = "RELAY_NAME";
pub const ENV_DESCRIPTION: &str = "RELAY_DESCRIPTION";
pub const ENV_PUBKEY: &str = "RELAY_PUBKEY";
pub const ENV_CONTACT: &str = "RELAY_CONTACT";
pub const ENV_ICON: &str = "RELAY_ICON";
pub const ENV_BANNER: &str = "RELAY_BANNER";
pub const ENV_POSTING_POLICY: &str = "RELAY_POSTING_POLICY";
pub const ENV_COUNTRIES: &str = "RELAY_COUNTRIES";
pub const ENV_LANGUAGE_TAGS: &str = "RELAY_LANGUAGE_TAGS";

/// 未設定の任意項目は `None` で、ドキュメントには含めない
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayInfoConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    /// 運営者のpubkey (64文字の16進)
    pub pubkey: Option<String>,
    pub contact: Option<String>,
    pub icon: Option<String>,
    pub banner: Option<String>,
    pub posting_policy: Option<String>,
    pub relay_countries: Vec<String>,
    pub language_tags: Vec<String>,
}

impl RelayInfoConfig {
    /// 空の環境変数は未設定扱い。不正な `RELAY_PUBKEY` は無視する
    pub fn from_env() -> Self {
        let get_optional_string =
            |key: &str| -> Option<String> { std::env::var(key).ok().filter(|s| !s.trim().is_empty()) };

        let pubkey = get_optional_string(ENV_PUBKEY).filter(|p| is_valid_pubkey(p));

        let relay_countries = std::env::var(ENV_COUNTRIES)
            .map(|v| parse_comma_separated(&v))
            .unwrap_or_default();
        let language_tags = std::env::var(ENV_LANGUAGE_TAGS)
            .map(|v| parse_comma_separated(&v))
            .unwrap_or_default();

        Self {
            name: get_optional_string(ENV_NAME),
            description: get_optional_string(ENV_DESCRIPTION),
            pubkey,
            contact: get_optional_string(ENV_CONTACT),
            icon: get_optional_string(ENV_ICON),
            banner: get_optional_string(ENV_BANNER),
            posting_policy: get_optional_string(ENV_POSTING_POLICY),
            relay_countries,
            language_tags,
        }
    }

    /// テナント側の値を項目単位で優先し、未設定の項目は `self` の値を使う
    pub fn merged_with(&self, overrides: &RelayInfoConfig) -> RelayInfoConfig {
        let pick = |over: &Option<String>, base: &Option<String>| over.clone().or_else(|| base.clone());
        let pick_list = |over: &Vec<String>, base: &Vec<String>| {
            if over.is_empty() { base.clone() } else { over.clone() }
        };
        RelayInfoConfig {
            name: pick(&overrides.name, &self.name),
            description: pick(&overrides.description, &self.description),
            pubkey: pick(&overrides.pubkey, &self.pubkey),
            contact: pick(&overrides.contact, &self.contact),
            icon: pick(&overrides.icon, &self.icon),
            banner: pick(&overrides.banner, &self.banner),
            posting_policy: pick(&overrides.posting_policy, &self.posting_policy),
            relay_countries: pick_list(&overrides.relay_countries, &self.relay_countries),
            language_tags: pick_list(&overrides.language_tags, &self.language_tags),
        }
    }

    pub fn document(&self, limitation: &LimitationConfig) -> RelayInfoDocument {
        let mut doc = RelayInfoDocument::with_limitation(limitation);
        doc.name = self.name.clone();
        doc.description = self.description.clone();
        doc.pubkey = self.pubkey.clone();
        doc.contact = self.contact.clone();
        doc.icon = self.icon.clone();
        doc.banner = self.banner.clone();
        doc.posting_policy = self.posting_policy.clone();
        doc.relay_countries = self.relay_countries.clone();
        doc.language_tags = self.language_tags.clone();
        doc
    }
}

/// 64文字の16進文字列か
pub fn is_valid_pubkey(pubkey: &str) -> bool {
    pubkey.len() == 64 && pubkey.chars().all(|c| c.is_ascii_hexdigit())
}

/// カンマで分割し、前後の空白を除いて空要素を捨てる
pub fn parse_comma_separated(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
