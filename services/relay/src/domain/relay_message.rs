use nostr::Event;
use serde_json::json;

use super::event_validator::ValidationError;
use super::policy_error::PolicyError;

/// Machine-readable prefixes of OK/CLOSED/NOTICE messages (NIP-01, NIP-42)
pub mod error_prefix {
    pub const DUPLICATE: &str = "duplicate:";
    pub const POW: &str = "pow:";
    pub const BLOCKED: &str = "blocked:";
    pub const RATE_LIMITED: &str = "rate-limited:";
    pub const INVALID: &str = "invalid:";
    pub const RESTRICTED: &str = "restricted:";
    pub const AUTH_REQUIRED: &str = "auth-required:";
    pub const UNSUPPORTED: &str = "unsupported:";
    pub const ERROR: &str = "error:";
}

/// Relay to client messages
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },

    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },

    Eose {
        subscription_id: String,
    },

    Closed {
        subscription_id: String,
        message: String,
    },

    Notice {
        message: String,
    },

    /// NIP-42 challenge
    Auth {
        challenge: String,
    },

    /// NIP-45 count result
    Count {
        subscription_id: String,
        count: usize,
    },
}

impl RelayMessage {
    pub fn to_json(&self) -> String {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let event_json = serde_json::to_value(event).unwrap_or(json!(null));
                json!(["EVENT", subscription_id, event_json]).to_string()
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]).to_string(),
            RelayMessage::Eose { subscription_id } => json!(["EOSE", subscription_id]).to_string(),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]).to_string(),
            RelayMessage::Notice { message } => json!(["NOTICE", message]).to_string(),
            RelayMessage::Auth { challenge } => json!(["AUTH", challenge]).to_string(),
            RelayMessage::Count {
                subscription_id,
                count,
            } => json!(["COUNT", subscription_id, { "count": count }]).to_string(),
        }
    }

    pub fn event(subscription_id: &str, event: &Event) -> Self {
        RelayMessage::Event {
            subscription_id: subscription_id.to_string(),
            event: event.clone(),
        }
    }

    pub fn eose(subscription_id: &str) -> Self {
        RelayMessage::Eose {
            subscription_id: subscription_id.to_string(),
        }
    }

    pub fn auth_challenge(challenge: &str) -> Self {
        RelayMessage::Auth {
            challenge: challenge.to_string(),
        }
    }

    pub fn count(subscription_id: &str, count: usize) -> Self {
        RelayMessage::Count {
            subscription_id: subscription_id.to_string(),
            count,
        }
    }

    // ==================== OK ====================

    pub fn ok_success(event_id: &str) -> Self {
        Self::ok_accepted(event_id, "")
    }

    pub fn ok_accepted(event_id: &str, message: &str) -> Self {
        RelayMessage::Ok {
            event_id: event_id.to_string(),
            accepted: true,
            message: message.to_string(),
        }
    }

    pub fn ok_duplicate(event_id: &str) -> Self {
        Self::ok_accepted(
            event_id,
            &format!("{} already have this event", error_prefix::DUPLICATE),
        )
    }

    /// Replaceable event older than (or as old as) the stored one
    pub fn ok_stale_replaceable(event_id: &str) -> Self {
        Self::ok_accepted(
            event_id,
            &format!("{} have a newer version of this event", error_prefix::DUPLICATE),
        )
    }

    pub fn ok_ephemeral(event_id: &str) -> Self {
        Self::ok_accepted(event_id, "ephemeral: accepted but not stored")
    }

    pub fn ok_deleted(event_id: &str) -> Self {
        Self::ok_accepted(event_id, "deleted: events successfully deleted")
    }

    pub fn ok_error(event_id: &str, prefix: &str, message: &str) -> Self {
        RelayMessage::Ok {
            event_id: event_id.to_string(),
            accepted: false,
            message: format!("{} {}", prefix, message),
        }
    }

    /// Rejection for a failed validation step; PoW failures use the `pow:`
    /// prefix and limit violations use `blocked:`.
    pub fn ok_validation_error(event_id: &str, err: &ValidationError) -> Self {
        let prefix = match err {
            ValidationError::InsufficientPow { .. } => error_prefix::POW,
            ValidationError::TooManyTags { .. } | ValidationError::ContentTooLong { .. } => {
                error_prefix::BLOCKED
            }
            _ => error_prefix::INVALID,
        };
        Self::ok_error(event_id, prefix, &err.to_string())
    }

    pub fn ok_auth_required(event_id: &str) -> Self {
        Self::ok_error(
            event_id,
            error_prefix::AUTH_REQUIRED,
            "you must authenticate first",
        )
    }

    pub fn ok_policy_error(event_id: &str, err: &PolicyError) -> Self {
        Self::ok_error(event_id, err.prefix(), &err.to_string())
    }

    pub fn ok_blocked(event_id: &str, message: &str) -> Self {
        Self::ok_error(event_id, error_prefix::BLOCKED, message)
    }

    pub fn ok_storage_error(event_id: &str) -> Self {
        Self::ok_error(event_id, error_prefix::ERROR, "failed to store event")
    }

    // ==================== CLOSED ====================

    /// Reply to CLOSE
    pub fn closed(subscription_id: &str) -> Self {
        RelayMessage::Closed {
            subscription_id: subscription_id.to_string(),
            message: String::new(),
        }
    }

    pub fn closed_with(subscription_id: &str, prefix: &str, message: &str) -> Self {
        RelayMessage::Closed {
            subscription_id: subscription_id.to_string(),
            message: format!("{} {}", prefix, message),
        }
    }

    pub fn closed_invalid(subscription_id: &str, message: &str) -> Self {
        Self::closed_with(subscription_id, error_prefix::INVALID, message)
    }

    pub fn closed_unsupported(subscription_id: &str, message: &str) -> Self {
        Self::closed_with(subscription_id, error_prefix::UNSUPPORTED, message)
    }

    pub fn closed_error(subscription_id: &str, message: &str) -> Self {
        Self::closed_with(subscription_id, error_prefix::ERROR, message)
    }

    // ==================== NOTICE ====================

    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice {
            message: message.into(),
        }
    }

    pub fn notice_error(message: &str) -> Self {
        Self::notice(format!("{} {}", error_prefix::ERROR, message))
    }
}
