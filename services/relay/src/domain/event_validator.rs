use nostr::Event;
use nostr::nips::nip13;
use serde_json::{Map, Value};
use thiserror::Error;

use super::limitation_config::LimitationConfig;

/// ストアに触れる前に受信イベントを拒否する理由
///
/// `Display` の文字列は `OK` メッセージのプレフィックスの後ろに付く
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("id must be 64 lowercase hex characters")]
    InvalidIdFormat,

    #[error("pubkey must be 64 lowercase hex characters")]
    InvalidPubkeyFormat,

    #[error("sig must be 128 lowercase hex characters")]
    InvalidSignatureFormat,

    #[error("kind must be 0-65535")]
    InvalidKindRange,

    #[error("tags must be an array of string arrays")]
    InvalidTagsFormat,

    #[error("content must be a string")]
    InvalidContentFormat,

    #[error("created_at must be a Unix timestamp")]
    InvalidTimestamp,

    #[error("event id does not match")]
    IdMismatch,

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("too many tags")]
    TooManyTags { count: usize, limit: u32 },

    #[error("event content too large")]
    ContentTooLong { length: usize, limit: u32 },

    #[error("created_at too old")]
    CreatedAtTooOld { created_at: u64, lower_bound: u64 },

    #[error("created_at too far in the future")]
    CreatedAtTooFarInFuture { created_at: u64, upper_bound: u64 },

    #[error("invalid expiration value")]
    InvalidExpiration,

    #[error("event has expired")]
    Expired { expiration: u64 },

    #[error("difficulty {difficulty} is less than {required}")]
    InsufficientPow { difficulty: u8, required: u8 },
}

pub struct EventValidator;

impl EventValidator {
    /// 生のJSONでフィールドの有無と形式を確認する
    ///
    /// エラーにはserdeの汎用メッセージではなく問題のフィールド名を出す
    pub fn validate_structure(event_json: &Value) -> Result<(), ValidationError> {
        let obj = event_json
            .as_object()
            .ok_or_else(|| ValidationError::ParseError("event must be an object".to_string()))?;

        let id = required(obj, "id")?;
        let pubkey = required(obj, "pubkey")?;
        let created_at = required(obj, "created_at")?;
        let kind = required(obj, "kind")?;
        let tags = required(obj, "tags")?;
        let content = required(obj, "content")?;
        let sig = required(obj, "sig")?;

        if !is_lower_hex(id, 64) {
            return Err(ValidationError::InvalidIdFormat);
        }
        if !is_lower_hex(pubkey, 64) {
            return Err(ValidationError::InvalidPubkeyFormat);
        }
        if !created_at.is_u64() {
            return Err(ValidationError::InvalidTimestamp);
        }
        match kind.as_u64() {
            Some(k) if k <= u16::MAX as u64 => {}
            _ => return Err(ValidationError::InvalidKindRange),
        }
        let tags_ok = tags.as_array().is_some_and(|arr| {
            arr.iter()
                .all(|tag| tag.as_array().is_some_and(|t| t.iter().all(Value::is_string)))
        });
        if !tags_ok {
            return Err(ValidationError::InvalidTagsFormat);
        }
        if !content.is_string() {
            return Err(ValidationError::InvalidContentFormat);
        }
        if !is_lower_hex(sig, 128) {
            return Err(ValidationError::InvalidSignatureFormat);
        }

        Ok(())
    }

    /// 構造を検証してからデシリアライズする
    ///
    /// IDハッシュと署名は検証しない。[`EventValidator::verify`] を参照
    pub fn parse(event_json: &Value) -> Result<Event, ValidationError> {
        Self::validate_structure(event_json)?;
        serde_json::from_value(event_json.clone())
            .map_err(|e| ValidationError::ParseError(e.to_string()))
    }

    pub fn verify_id(event: &Event) -> Result<(), ValidationError> {
        if event.verify_id() {
            Ok(())
        } else {
            Err(ValidationError::IdMismatch)
        }
    }

    pub fn verify_signature(event: &Event) -> Result<(), ValidationError> {
        event
            .verify()
            .map_err(|_| ValidationError::SignatureVerificationFailed)
    }

    /// IDハッシュとSchnorr署名の検証。CPUバウンドなのでワーカープールで呼ぶこと
    pub fn verify(event: &Event) -> Result<(), ValidationError> {
        Self::verify_id(event)?;
        Self::verify_signature(event)
    }

    pub fn validate_all(event_json: &Value) -> Result<Event, ValidationError> {
        let event = Self::parse(event_json)?;
        Self::verify(&event)?;
        Ok(event)
    }

    /// タグ数、content の長さ、created_at の許容範囲
    pub fn validate_limitation(
        event: &Event,
        config: &LimitationConfig,
        now: u64,
    ) -> Result<(), ValidationError> {
        let tag_count = event.tags.len();
        if tag_count > config.max_event_tags as usize {
            return Err(ValidationError::TooManyTags {
                count: tag_count,
                limit: config.max_event_tags,
            });
        }

        let length = event.content.chars().count();
        if length > config.max_content_length as usize {
            return Err(ValidationError::ContentTooLong {
                length,
                limit: config.max_content_length,
            });
        }

        let created_at = event.created_at.as_secs();
        let lower_bound = now.saturating_sub(config.created_at_lower_limit);
        if config.created_at_lower_limit > 0 && created_at < lower_bound {
            return Err(ValidationError::CreatedAtTooOld {
                created_at,
                lower_bound,
            });
        }
        let upper_bound = now.saturating_add(config.created_at_upper_limit);
        if created_at > upper_bound {
            return Err(ValidationError::CreatedAtTooFarInFuture {
                created_at,
                upper_bound,
            });
        }

        Ok(())
    }

    /// NIP-40: 不正な、または期限切れの `expiration` タグを拒否する
    pub fn validate_expiration(event: &Event, now: u64) -> Result<Option<u64>, ValidationError> {
        let expiration = expiration_of(event)?;
        match expiration {
            Some(expiration) if expiration <= now => Err(ValidationError::Expired { expiration }),
            other => Ok(other),
        }
    }

    /// NIP-13: IDの先頭ゼロビット数が `min_difficulty` 以上であること
    pub fn validate_pow(event: &Event, min_difficulty: u8) -> Result<(), ValidationError> {
        if min_difficulty == 0 {
            return Ok(());
        }
        let difficulty = nip13::get_leading_zero_bits(event.id.as_bytes());
        if difficulty < min_difficulty {
            return Err(ValidationError::InsufficientPow {
                difficulty,
                required: min_difficulty,
            });
        }
        Ok(())
    }
}

/// 最初の `expiration` タグの値
pub fn expiration_of(event: &Event) -> Result<Option<u64>, ValidationError> {
    for tag in event.tags.iter() {
        match tag.as_slice() {
            [name, value, ..] if name == "expiration" => {
                return value
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ValidationError::InvalidExpiration);
            }
            [name] if name == "expiration" => return Err(ValidationError::InvalidExpiration),
            _ => {}
        }
    }
    Ok(None)
}

fn required<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a Value, ValidationError> {
    obj.get(field)
        .ok_or_else(|| ValidationError::MissingField(field.to_string()))
}

fn is_lower_hex(value: &Value, expected_len: usize) -> bool {
    value.as_str().is_some_and(|s| {
        s.len() == expected_len && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    })
}
