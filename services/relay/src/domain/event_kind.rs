use nostr::{Event, PublicKey};

/// Kind of a NIP-09 deletion request
pub const DELETION_KIND: u16 = 5;

/// Kind of a NIP-42 client authentication event
pub const AUTH_KIND: u16 = 22242;

/// Direct-message kinds only served to authenticated readers when auth is required
pub const PRIVATE_MESSAGE_KINDS: [u16; 3] = [4, 14, 1059];

/// Storage category of an event kind (NIP-01)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Stored as-is
    Regular,

    /// Only the latest per pubkey+kind is kept
    /// kind 0, 3, 10000-19999
    Replaceable,

    /// Relayed live, never stored
    /// kind 20000-29999
    Ephemeral,

    /// Only the latest per pubkey+kind+d tag is kept
    /// kind 30000-39999
    Addressable,
}

impl EventKind {
    pub fn classify(kind: u16) -> Self {
        match kind {
            n if (20000..30000).contains(&n) => EventKind::Ephemeral,
            n if (30000..40000).contains(&n) => EventKind::Addressable,
            0 | 3 => EventKind::Replaceable,
            n if (10000..20000).contains(&n) => EventKind::Replaceable,
            _ => EventKind::Regular,
        }
    }

    pub fn of(event: &Event) -> Self {
        Self::classify(event.kind.as_u16())
    }

    pub fn should_store(&self) -> bool {
        !matches!(self, EventKind::Ephemeral)
    }

    pub fn is_replaceable(&self) -> bool {
        matches!(self, EventKind::Replaceable | EventKind::Addressable)
    }
}

/// Identity under which replaceable events supersede each other.
///
/// `d_tag` is `Some` only for addressable kinds; a missing `d` tag is
/// treated as the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplaceableKey {
    pub tenant_id: String,
    pub pubkey: PublicKey,
    pub kind: u16,
    pub d_tag: Option<String>,
}

impl ReplaceableKey {
    /// Returns `None` for regular and ephemeral events.
    pub fn for_event(event: &Event, tenant_id: &str) -> Option<Self> {
        let kind = event.kind.as_u16();
        let d_tag = match EventKind::classify(kind) {
            EventKind::Replaceable => None,
            EventKind::Addressable => Some(d_tag_value(event).unwrap_or_default()),
            EventKind::Regular | EventKind::Ephemeral => return None,
        };
        Some(Self {
            tenant_id: tenant_id.to_string(),
            pubkey: event.pubkey,
            kind,
            d_tag,
        })
    }
}

/// First `d` tag value of an event
pub fn d_tag_value(event: &Event) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        match values {
            [name, value, ..] if name == "d" => Some(value.clone()),
            [name] if name == "d" => Some(String::new()),
            _ => None,
        }
    })
}

/// Whether the event carries the NIP-70 `["-"]` protected marker
pub fn is_protected_event(event: &Event) -> bool {
    event
        .tags
        .iter()
        .any(|tag| tag.as_slice().first().map(String::as_str) == Some("-"))
}
