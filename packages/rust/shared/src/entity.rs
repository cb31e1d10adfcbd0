//! Entities: one unit of bulk work (a website paired with a company name).
//!
//! Entities are parsed from the compact form `"<identifier> (<displayName>)"`.
//! When the display name is missing it is derived from the identifier.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BulkResearchError, Result};

/// `identifier (Display Name)`, display name optional.
static ENCODED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<id>.+?)\s*\((?P<name>[^()]*)\)\s*$").expect("valid regex")
});

/// A research target. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    identifier: String,
    display_name: String,
}

impl Entity {
    /// Build an entity, deriving the display name when none (or a blank one) is given.
    pub fn new(identifier: impl Into<String>, display_name: Option<&str>) -> Result<Self> {
        let identifier = identifier.into().trim().to_string();
        if identifier.is_empty() {
            return Err(BulkResearchError::validation("entity identifier is empty"));
        }

        let display_name = match display_name.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => derive_display_name(&identifier),
        };

        Ok(Self {
            identifier,
            display_name,
        })
    }

    /// Parse the compact `"<identifier> (<displayName>)"` encoding.
    pub fn parse(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        match ENCODED_RE.captures(encoded) {
            Some(caps) => Self::new(&caps["id"], Some(&caps["name"])),
            None => Self::new(encoded, None),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Re-encode in the compact form.
    pub fn encode(&self) -> String {
        format!("{} ({})", self.identifier, self.display_name)
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.display_name, self.identifier)
    }
}

/// Derive a company name from a website identifier.
///
/// Strips the protocol and `www.`, keeps the first host label, title-cases
/// it (first letter upper, rest lower) and turns `-`/`_` into spaces:
/// `https://www.Acme-Corp.io/path` → `Acme corp`.
pub fn derive_display_name(identifier: &str) -> String {
    let mut rest = identifier.trim();

    if let Some(idx) = rest.find("://") {
        rest = &rest[idx + 3..];
    }
    if rest.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("www.")) {
        rest = &rest[4..];
    }

    let host = rest
        .split(['/', '?', '#', ':'])
        .next()
        .unwrap_or_default();
    let label = host.split('.').next().unwrap_or_default();

    let mut chars = label.chars();
    let titled: String = match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    };

    let name = titled
        .replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    if name.is_empty() {
        identifier.trim().to_string()
    } else {
        name
    }
}

/// Parse an entity list: one entity per line, blank lines and `#` comments ignored.
pub fn parse_entity_list(text: &str) -> Result<Vec<Entity>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .map(|(n, line)| {
            Entity::parse(line).map_err(|e| {
                BulkResearchError::validation(format!("line {}: {e}", n + 1))
            })
        })
        .collect()
}
