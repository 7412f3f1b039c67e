// NIP-42 クライアント認証の検証

use nostr::Event;
use thiserror::Error;
use url::Url;

use super::event_kind::AUTH_KIND;
use super::event_validator::{EventValidator, ValidationError};

/// AUTHイベントの created_at と現在時刻の差の上限
pub const AUTH_MAX_AGE_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("invalid AUTH event kind")]
    WrongKind,

    #[error("missing {0} tag")]
    MissingTag(&'static str),

    #[error("invalid challenge")]
    ChallengeMismatch,

    #[error("invalid relay tag")]
    RelayMismatch,

    #[error("AUTH event is too old or too far in the future")]
    Stale,

    #[error("{0}")]
    Invalid(#[from] ValidationError),

    /// 署名検証を時間内に実行できなかった
    #[error("could not verify AUTH event")]
    Unverified,
}

pub struct AuthValidator;

impl AuthValidator {
    /// 署名以外の検証 (kind、タグ、チャレンジ、リレーのホスト、経過時間)
    ///
    /// relay タグはクライアントが接続したホストを指すこと。
    /// スキーム、ポート、パスは比較しない
    pub fn check_claims(
        event: &Event,
        expected_challenge: &str,
        relay_host: &str,
        now: u64,
    ) -> Result<(), AuthError> {
        if event.kind.as_u16() != AUTH_KIND {
            return Err(AuthError::WrongKind);
        }

        let challenge = first_tag_value(event, "challenge").ok_or(AuthError::MissingTag("challenge"))?;
        let relay = first_tag_value(event, "relay").ok_or(AuthError::MissingTag("relay"))?;

        if challenge != expected_challenge {
            return Err(AuthError::ChallengeMismatch);
        }

        let host = Url::parse(relay)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
            .ok_or(AuthError::RelayMismatch)?;
        if host != relay_host.to_ascii_lowercase() {
            return Err(AuthError::RelayMismatch);
        }

        let created_at = event.created_at.as_secs();
        if created_at.abs_diff(now) > AUTH_MAX_AGE_SECS {
            return Err(AuthError::Stale);
        }

        Ok(())
    }

    /// 内容を検証してからIDと署名を検証する
    pub fn validate(
        event: &Event,
        expected_challenge: &str,
        relay_host: &str,
        now: u64,
    ) -> Result<(), AuthError> {
        Self::check_claims(event, expected_challenge, relay_host, now)?;
        EventValidator::verify(event)?;
        Ok(())
    }
}

fn first_tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event.tags.iter().find_map(|tag| match tag.as_slice() {
        [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
        _ => None,
    })
}
