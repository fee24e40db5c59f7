//! Derives a caller's email-like identifier from verified claims.
//!
//! Identity platforms disagree on where a human-readable identifier lives,
//! so candidates are tried in a fixed order and the first non-empty one
//! wins. Tokens without any fall back to the address stored for `sub`.

use serde_json::{Map, Value};

use super::VerifiedClaims;
use crate::directory::{DirectoryError, UserDirectory};

type Claims = Map<String, Value>;

/// Pure function from a claim set to a candidate identifier.
pub type CandidateExtractor = fn(&Claims) -> Option<String>;

/// Email-bearing claims in priority order.
pub const EMAIL_CANDIDATES: [(&str, CandidateExtractor); 6] = [
    ("preferred_username", preferred_username),
    ("email", email),
    ("emails", first_of_emails),
    ("upn", upn),
    ("unique_name", unique_name),
    ("nameid", nameid),
];

fn normalize(value: &str) -> Option<String> {
    let value = value.trim().to_lowercase();
    (!value.is_empty()).then_some(value)
}

fn string_claim(claims: &Claims, key: &str) -> Option<String> {
    claims.get(key).and_then(Value::as_str).and_then(normalize)
}

fn preferred_username(claims: &Claims) -> Option<String> {
    string_claim(claims, "preferred_username")
}

fn email(claims: &Claims) -> Option<String> {
    string_claim(claims, "email")
}

fn upn(claims: &Claims) -> Option<String> {
    string_claim(claims, "upn")
}

fn unique_name(claims: &Claims) -> Option<String> {
    string_claim(claims, "unique_name")
}

fn nameid(claims: &Claims) -> Option<String> {
    string_claim(claims, "nameid")
}

fn first_of_emails(claims: &Claims) -> Option<String> {
    claims
        .get("emails")
        .and_then(Value::as_array)
        .and_then(|emails| emails.first())
        .and_then(Value::as_str)
        .and_then(normalize)
}

/// First populated email-bearing claim, trimmed and lower-cased.
pub fn email_from_claims(claims: &Claims) -> Option<String> {
    EMAIL_CANDIDATES
        .iter()
        .find_map(|(_, extract)| extract(claims))
}

/// Resolve the caller's email: token claims first, then the stored address
/// for the token's subject. `None` means the identity is unknown.
pub async fn resolve_email(
    verified: &VerifiedClaims,
    directory: &UserDirectory,
) -> Result<Option<String>, DirectoryError> {
    if let Some(email) = email_from_claims(&verified.claims) {
        return Ok(Some(email));
    }

    let Some(subject) = verified.subject() else {
        return Ok(None);
    };

    let stored = directory.email_for_subject(subject).await?;
    Ok(stored.as_deref().and_then(normalize))
}

/// Human-readable name: `name`, else `given_name family_name`, else the
/// local part of the resolved email.
pub fn display_name_from_claims(claims: &Claims, email: &str) -> Option<String> {
    let trimmed = |key: &str| {
        claims
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    if let Some(name) = trimmed("name") {
        return Some(name.to_string());
    }

    let parts: Vec<&str> = [trimmed("given_name"), trimmed("family_name")]
        .into_iter()
        .flatten()
        .collect();
    if !parts.is_empty() {
        return Some(parts.join(" "));
    }

    email
        .split('@')
        .next()
        .map(str::trim)
        .filter(|local| !local.is_empty())
        .map(String::from)
}
