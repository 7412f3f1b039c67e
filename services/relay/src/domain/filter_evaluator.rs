use nostr::filter::MatchEventOptions;
use nostr::{Alphabet, Event, EventId, Filter, PublicKey, SingleLetterTag};
use thiserror::Error;

/// Minimum length of a `search` term; shorter terms are ignored.
pub const MIN_SEARCH_LENGTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterValidationError {
    #[error("invalid #{tag} tag value format: {value}")]
    InvalidTagValueFormat { tag: String, value: String },

    #[error("since is after until")]
    InvertedTimeRange,
}

/// Indexed fields of a stored event, enough to reject most candidates
/// without decoding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedFields {
    pub id: EventId,
    pub pubkey: PublicKey,
    pub kind: u16,
    pub created_at: u64,
}

/// Filter matching for NIP-01 REQ/COUNT and live fan-out.
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Full match: every provided constraint must hold. Tags match when at
    /// least one requested value is present among the event's tags of the
    /// same name; since and until are both inclusive.
    pub fn matches(event: &Event, filter: &Filter) -> bool {
        filter.match_event(event, MatchEventOptions::default()) && Self::search_matches(event, filter)
    }

    /// Empty filter list matches all events
    pub fn matches_any(event: &Event, filters: &[Filter]) -> bool {
        if filters.is_empty() {
            return true;
        }
        filters.iter().any(|filter| Self::matches(event, filter))
    }

    /// Cheap check on indexed fields only. A `false` is final; a `true`
    /// still needs [`FilterEvaluator::matches`] for tags and search.
    pub fn prescreen(fields: &IndexedFields, filter: &Filter) -> bool {
        if let Some(ids) = filter.ids.as_ref() {
            if !ids.is_empty() && !ids.contains(&fields.id) {
                return false;
            }
        }
        if let Some(authors) = filter.authors.as_ref() {
            if !authors.is_empty() && !authors.contains(&fields.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = filter.kinds.as_ref() {
            if !kinds.is_empty() && !kinds.iter().any(|k| k.as_u16() == fields.kind) {
                return false;
            }
        }
        if let Some(since) = filter.since {
            if fields.created_at < since.as_secs() {
                return false;
            }
        }
        if let Some(until) = filter.until {
            if fields.created_at > until.as_secs() {
                return false;
            }
        }
        true
    }

    /// Case-insensitive substring match on content for terms of at least
    /// [`MIN_SEARCH_LENGTH`] characters.
    pub fn search_matches(event: &Event, filter: &Filter) -> bool {
        match filter.search.as_deref().map(str::trim) {
            Some(term) if term.chars().count() >= MIN_SEARCH_LENGTH => event
                .content
                .to_lowercase()
                .contains(&term.to_lowercase()),
            _ => true,
        }
    }

    /// Whether the filter explicitly asks for any of `kinds`.
    pub fn requests_any_kind(filter: &Filter, kinds: &[u16]) -> bool {
        filter
            .kinds
            .as_ref()
            .is_some_and(|requested| requested.iter().any(|k| kinds.contains(&k.as_u16())))
    }

    pub fn validate_filter(filter: &Filter) -> Result<(), FilterValidationError> {
        if let (Some(since), Some(until)) = (filter.since, filter.until) {
            if since > until {
                return Err(FilterValidationError::InvertedTimeRange);
            }
        }

        for (letter, name) in [(Alphabet::E, "e"), (Alphabet::P, "p")] {
            let Some(values) = filter.generic_tags.get(&SingleLetterTag::lowercase(letter)) else {
                continue;
            };
            for value in values.iter() {
                if value.len() == 64 && !Self::is_valid_hex(value) {
                    return Err(FilterValidationError::InvalidTagValueFormat {
                        tag: name.to_string(),
                        value: value.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    fn is_valid_hex(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    }
}
