//! Distinguished-name helpers.
//!
//! Only the subset of RFC 4514 the control plane needs: splitting into RDNs
//! (honouring backslash escapes and double-quoted values), normalizing for
//! comparison, and walking up the hierarchy.

use crate::ConfigError;

/// Split a DN into its RDN components without normalizing them.
///
/// Commas inside a double-quoted value or preceded by a backslash do not
/// separate components.
pub fn split_rdns(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (idx, ch) in dn.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&dn[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < dn.len() || !parts.is_empty() {
        parts.push(&dn[start..]);
    }
    parts
}

/// Remove one level of surrounding double quotes, if present.
pub fn unquote(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed)
}

/// Normalize a DN for storage and comparison.
///
/// Attribute types are lowercased, whitespace around `=` and `,` is dropped,
/// and the whole DN may be wrapped in quotes (`"dc=example,dc=com"` is the
/// same suffix as `dc=example,dc=com`). The empty DN is valid.
pub fn normalize_dn(dn: &str) -> Result<String, ConfigError> {
    let dn = unquote(dn);
    if dn.is_empty() {
        return Ok(String::new());
    }

    let mut out = Vec::new();
    for rdn in split_rdns(dn) {
        let Some((attr, value)) = rdn.split_once('=') else {
            return Err(ConfigError::InvalidDn(dn.to_owned()));
        };
        let attr = attr.trim();
        let value = value.trim();
        if attr.is_empty() || value.is_empty() {
            return Err(ConfigError::InvalidDn(dn.to_owned()));
        }
        out.push(format!("{}={value}", attr.to_ascii_lowercase()));
    }
    Ok(out.join(","))
}

/// Case-insensitive comparison of two already-normalized DNs.
pub fn dn_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// True when `suffix` is `candidate` itself or one of its trailing RDN runs.
///
/// `ou=people,dc=example,dc=com` ends with `dc=example,dc=com`;
/// `adc=example,dc=com` does not.
pub fn ends_with_dn(candidate: &str, suffix: &str) -> bool {
    if suffix.is_empty() {
        return true;
    }
    let candidate = candidate.to_ascii_lowercase();
    let suffix = suffix.to_ascii_lowercase();
    if candidate == suffix {
        return true;
    }
    candidate
        .strip_suffix(&suffix)
        .is_some_and(|head| head.ends_with(','))
}

/// The DN one level up, or `None` for a single-RDN or empty DN.
pub fn parent_dn(dn: &str) -> Option<String> {
    let rdns = split_rdns(dn);
    if rdns.len() < 2 {
        return None;
    }
    Some(rdns[1..].join(","))
}

/// Advance past the leftmost RDN. Returns `None` once the DN is exhausted.
pub fn strip_leftmost_rdn(dn: &str) -> Option<&str> {
    let first = split_rdns(dn).into_iter().next()?;
    let rest = dn.get(first.len() + 1..)?;
    if rest.trim().is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// The value of the leftmost RDN, unquoted (`cn=userRoot,...` → `userRoot`).
pub fn leftmost_value(dn: &str) -> Option<&str> {
    let first = split_rdns(dn).into_iter().next()?;
    first.split_once('=').map(|(_, v)| unquote(v))
}
