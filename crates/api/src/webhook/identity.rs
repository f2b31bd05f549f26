//! Sender identity extraction
//!
//! Maps a classified provider event onto the canonical
//! `(channel, external_id, display_name)` tuple used to key customers.

use relaydesk_shared::Channel;

use super::payload::{MessageData, ProviderEvent};

/// JID domains whose user part is a phone number
const PHONE_DOMAINS: &[&str] = &["s.whatsapp.net", "c.us"];

/// Canonical sender identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub channel: Channel,
    /// E.164 phone number, e.g. `+5511999998888`
    pub external_id: String,
    pub display_name: Option<String>,
}

/// Which payload field produced the identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    LinkedNumber,
    Metadata,
    RemotePeer,
}

/// Terminal extraction failures; retrying the same payload cannot succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("no parseable sender identity in payload")]
    MissingIdentity,
    #[error("event {0:?} carries no customer message")]
    UnsupportedEvent(String),
}

impl ExtractionError {
    /// Short machine-readable reason reported back to the provider.
    pub fn reason(&self) -> &'static str {
        match self {
            ExtractionError::MissingIdentity => "missing_identity",
            ExtractionError::UnsupportedEvent(_) => "unsupported_event",
        }
    }
}

/// Pure extractor; holds only normalization settings
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    default_country_code: String,
}

impl IdentityExtractor {
    /// `default_country_code` is prefixed to bare national numbers (digits only, e.g. `"55"`).
    pub fn new(default_country_code: impl Into<String>) -> Self {
        let code: String = default_country_code.into();
        Self {
            default_country_code: code.chars().filter(char::is_ascii_digit).collect(),
        }
    }

    /// Extract the sender of a message event.
    pub fn extract(&self, event: &ProviderEvent) -> Result<Identity, ExtractionError> {
        match event {
            ProviderEvent::MessageUpsert(upsert) => self
                .extract_from_message(&upsert.data)
                .map(|(identity, _)| identity),
            other => Err(ExtractionError::UnsupportedEvent(other.name().to_string())),
        }
    }

    /// Try the known identity fields in priority order.
    pub fn extract_from_message(
        &self,
        data: &MessageData,
    ) -> Result<(Identity, IdentitySource), ExtractionError> {
        let candidates = [
            (IdentitySource::LinkedNumber, data.key.sender_pn.as_deref()),
            (IdentitySource::LinkedNumber, data.key.remote_jid_alt.as_deref()),
            (
                IdentitySource::Metadata,
                data.metadata.as_ref().and_then(|m| m.phone.as_deref()),
            ),
            (IdentitySource::RemotePeer, data.key.remote_jid.as_deref()),
        ];

        let (source, external_id) = candidates
            .into_iter()
            .find_map(|(source, raw)| Some((source, self.normalize(raw?)?)))
            .ok_or(ExtractionError::MissingIdentity)?;

        let display_name = data
            .push_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok((
            Identity {
                channel: Channel::Whatsapp,
                external_id,
                display_name,
            },
            source,
        ))
    }

    /// Normalize a JID or phone string into `+<digits>`.
    ///
    /// Returns `None` for group, broadcast and linked-device identifiers and
    /// for anything that is not a plausible phone number.
    pub fn normalize(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        let (user, domain) = match raw.split_once('@') {
            Some((user, domain)) => (user, Some(domain)),
            None => (raw, None),
        };
        if let Some(domain) = domain {
            if !PHONE_DOMAINS.contains(&domain) {
                return None;
            }
        }

        // "5511999998888:12" addresses a specific device of the number.
        let user = user.split(':').next()?.trim();
        if user.is_empty()
            || !user
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' ' | '.'))
        {
            return None;
        }

        let has_plus = user.starts_with('+');
        let mut digits: String = user.chars().filter(char::is_ascii_digit).collect();
        if !has_plus {
            if let Some(rest) = digits.strip_prefix("00") {
                digits = rest.to_string();
            } else if domain.is_none() && (10..=11).contains(&digits.len()) {
                // JIDs are always international; bare national numbers are not.
                digits = format!("{}{}", self.default_country_code, digits);
            }
        }

        if !(8..=15).contains(&digits.len()) {
            return None;
        }
        Some(format!("+{digits}"))
    }
}
