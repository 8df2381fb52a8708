//! Identifier validation and canonicalization.
//!
//! Every address entering the core goes through [`canonicalize_address`] so
//! that `(medium, address)` keys compare byte-for-byte.

use std::sync::LazyLock;

use regex::Regex;

use crate::{error::SigilError, models::Medium};

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));

// E.164 allows at most 15 digits; anything under 8 is not a routable number.
static MSISDN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[1-9][0-9]{7,14}$").expect("static regex"));

static ACCOUNT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@[^:\s]+:[A-Za-z0-9.\-\[\]:]+$").expect("static regex"));

/// Canonical form of an address for the given medium.
///
/// Emails are trimmed and lower-cased. Phone numbers are stripped of
/// formatting characters and returned as `+<digits>`.
pub fn canonicalize_address(medium: Medium, raw: &str) -> Result<String, SigilError> {
    match medium {
        Medium::Email => {
            let email = raw.trim().to_lowercase();
            if !EMAIL_RE.is_match(&email) {
                return Err(SigilError::invalid_identifier("malformed email address"));
            }
            Ok(email)
        }
        Medium::Msisdn => {
            let digits: String = raw
                .trim()
                .trim_start_matches('+')
                .chars()
                .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
                .collect();
            if !MSISDN_RE.is_match(&digits) {
                return Err(SigilError::invalid_identifier("malformed phone number"));
            }
            Ok(format!("+{digits}"))
        }
    }
}

/// Validate an account identifier of the form `@localpart:server.name`.
pub fn validate_account_id(account_id: &str) -> Result<(), SigilError> {
    if !ACCOUNT_ID_RE.is_match(account_id) {
        return Err(SigilError::invalid_identifier(format!(
            "malformed account id '{account_id}'"
        )));
    }
    Ok(())
}

/// The homeserver part of an account identifier (`@alice:example.org` → `example.org`).
pub fn server_name_of(account_id: &str) -> Result<&str, SigilError> {
    validate_account_id(account_id)?;
    account_id
        .split_once(':')
        .map(|(_, server)| server)
        .ok_or_else(|| SigilError::invalid_identifier("account id has no server part"))
}
