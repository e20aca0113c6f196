//! Just enough LDIF for the reference backend: content records only, no
//! change records, and no base64-encoded DNs.

use crate::BackendError;
use dirsrv_config::ends_with_dn;
use dirsrv_config::normalize_dn;

/// Column at which exported lines are folded.
pub const WRAP_COLUMN: usize = 78;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdifRecord {
    pub dn: String,
    /// Unfolded `attr: value` lines, excluding the `dn:` line.
    pub lines: Vec<String>,
}

impl LdifRecord {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            lines: Vec::new(),
        }
    }

    pub fn push(&mut self, attr: &str, value: &str) {
        self.lines.push(format!("{attr}: {value}"));
    }

    /// Values of `attr` (case-insensitive), as written after the colon.
    pub fn values<'a>(&'a self, attr: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines.iter().filter_map(move |line| {
            let (name, rest) = line.split_once(':')?;
            name.eq_ignore_ascii_case(attr)
                .then(|| rest.strip_prefix(' ').unwrap_or(rest))
        })
    }

    pub fn has_attr(&self, attr: &str) -> bool {
        self.values(attr).next().is_some()
    }

    /// Normalized DN, falling back to the stored form if it does not parse.
    pub fn normalized_dn(&self) -> String {
        normalize_dn(&self.dn).unwrap_or_else(|_| self.dn.clone())
    }

    /// Render as LDIF, keeping only the lines `keep` accepts.
    pub fn render_filtered(&self, wrap: bool, keep: impl Fn(&str) -> bool) -> String {
        let mut out = String::new();
        push_line(&mut out, &format!("dn: {}", self.dn), wrap);
        for line in &self.lines {
            let attr = line.split_once(':').map_or(line.as_str(), |(a, _)| a);
            if keep(attr) {
                push_line(&mut out, line, wrap);
            }
        }
        out.push('\n');
        out
    }

    pub fn render(&self, wrap: bool) -> String {
        self.render_filtered(wrap, |_| true)
    }
}

fn push_line(out: &mut String, line: &str, wrap: bool) {
    if !wrap || line.chars().count() <= WRAP_COLUMN {
        out.push_str(line);
        out.push('\n');
        return;
    }
    let chars: Vec<char> = line.chars().collect();
    let (first, mut rest) = chars.split_at(WRAP_COLUMN);
    out.extend(first);
    out.push('\n');
    while !rest.is_empty() {
        let take = rest.len().min(WRAP_COLUMN - 1);
        let (chunk, tail) = rest.split_at(take);
        out.push(' ');
        out.extend(chunk);
        out.push('\n');
        rest = tail;
    }
}

/// Parse LDIF content records. A leading `version:` line is skipped.
pub fn parse(input: &str) -> Result<Vec<LdifRecord>, BackendError> {
    let mut paragraphs: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for raw in input.lines() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        if let Some(cont) = line.strip_prefix(' ') {
            if let Some(last) = current.last_mut() {
                last.push_str(cont);
                continue;
            }
        }
        current.push(line.to_owned());
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    if let Some(first) = paragraphs.first_mut() {
        if first[0].to_ascii_lowercase().starts_with("version:") {
            first.remove(0);
            if first.is_empty() {
                paragraphs.remove(0);
            }
        }
    }

    paragraphs
        .into_iter()
        .enumerate()
        .map(|(idx, lines)| to_record(idx + 1, lines))
        .collect()
}

fn to_record(record: usize, mut lines: Vec<String>) -> Result<LdifRecord, BackendError> {
    let first = lines.remove(0);
    if let Some(dn) = first.strip_prefix("dn::") {
        return Err(BackendError::InvalidLdif {
            record,
            reason: format!("base64-encoded DN '{}' is not supported", dn.trim()),
        });
    }
    let Some(dn) = first.strip_prefix("dn:") else {
        return Err(BackendError::InvalidLdif {
            record,
            reason: format!("expected 'dn:' but found '{first}'"),
        });
    };
    Ok(LdifRecord {
        dn: dn.trim().to_owned(),
        lines,
    })
}

/// Whether `dn` falls under one of `include` (or `include` is empty) and
/// under none of `exclude`. Suffixes are expected normalized.
pub fn in_scope(dn: &str, include: &[String], exclude: &[String]) -> bool {
    let dn = normalize_dn(dn).unwrap_or_else(|_| dn.to_owned());
    let included = include.is_empty() || include.iter().any(|s| ends_with_dn(&dn, s));
    included && !exclude.iter().any(|s| ends_with_dn(&dn, s))
}
