//! Identifier redaction for log output.
//!
//! Addresses are never logged verbatim. Each separator-delimited segment of
//! the username keeps at most `min(reveal, len - 1)` leading characters
//! followed by `...`; the domain is treated as one segment with its own
//! reveal count. Empty segments stay empty.

use crate::models::Medium;

/// How much of an address survives redaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionPolicy {
    pub username_reveal_characters: usize,
    pub domain_reveal_characters: usize,
    /// Splits the username into independently redacted segments.
    pub username_separator: Option<String>,
}

impl Default for RedactionPolicy {
    fn default() -> Self {
        Self {
            username_reveal_characters: 3,
            domain_reveal_characters: 3,
            username_separator: None,
        }
    }
}

impl RedactionPolicy {
    /// Redact an address of any medium for logging.
    pub fn redact(&self, medium: Medium, address: &str) -> String {
        match medium {
            Medium::Email => self.redact_email(address),
            Medium::Msisdn => redact_segment(address, self.username_reveal_characters),
        }
    }

    pub fn redact_email(&self, email: &str) -> String {
        let Some((username, domain)) = email.rsplit_once('@') else {
            return redact_segment(email, self.username_reveal_characters);
        };

        let username = match self.username_separator.as_deref() {
            Some(sep) if !sep.is_empty() => username
                .split(sep)
                .map(|segment| redact_segment(segment, self.username_reveal_characters))
                .collect::<Vec<_>>()
                .join(sep),
            _ => redact_segment(username, self.username_reveal_characters),
        };

        format!(
            "{username}@{}",
            redact_segment(domain, self.domain_reveal_characters)
        )
    }
}

fn redact_segment(segment: &str, reveal: usize) -> String {
    let len = segment.chars().count();
    if len == 0 {
        return String::new();
    }
    let shown: String = segment.chars().take(reveal.min(len - 1)).collect();
    format!("{shown}...")
}
