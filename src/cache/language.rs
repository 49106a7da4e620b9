//! Language Tags
//!
//! A request language is normalized into the forms the cache and the
//! geocoder need:
//!
//! | form      | `es`              | `pt_br`                          |
//! |-----------|-------------------|----------------------------------|
//! | `param`   | `es,en`           | `pt-BR,pt,en`                    |
//! | `header`  | `es,en;q=0.9`     | `pt-BR,pt;q=0.9,en;q=0.8`        |
//! | `primary` | `es`              | `pt`                             |
//! | `simple`  | `es`              | `pt-br`                          |
//! | `request` | `es`              | `pt-BR`                          |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted tag
const MAX_TAG_LEN: usize = 35;

/// Rejected language input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid language tag: {0:?}")]
pub struct InvalidLanguage(pub String);

/// Normalized language preference of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageTag {
    param: String,
    header: String,
    primary: String,
    simple: String,
    request: String,
}

impl LanguageTag {
    /// Parse a client tag, falling back to `default` when none is given.
    ///
    /// `_` is accepted as subtag separator. Anything outside
    /// `[A-Za-z0-9-]{1,35}` is rejected.
    pub fn parse(raw: Option<&str>, default: &str) -> Result<Self, InvalidLanguage> {
        let tag = match raw.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => {
                let normalized = raw.replace('_', "-");
                if !is_valid_tag(&normalized) {
                    return Err(InvalidLanguage(raw.to_string()));
                }
                normalized
            }
            None => default.replace('_', "-"),
        };
        Ok(Self::from_tag(&tag))
    }

    fn from_tag(tag: &str) -> Self {
        let canonical = canonicalize(tag);
        let (base, region) = match canonical.split_once('-') {
            Some((base, region)) if !region.is_empty() => (base, Some(region)),
            Some((base, _)) => (base, None),
            None => (canonical.as_str(), None),
        };
        let base = if base.is_empty() { "en" } else { base };

        let (header, param) = match region {
            Some(region) => (
                format!("{base}-{region},{base};q=0.9,en;q=0.8"),
                format!("{base}-{region},{base},en"),
            ),
            None if base.eq_ignore_ascii_case("en") => ("en".to_string(), "en".to_string()),
            None => (format!("{base},en;q=0.9"), format!("{base},en")),
        };

        let first = first_token(&param).to_string();
        Self {
            primary: primary_of(&param),
            simple: first.to_lowercase(),
            request: canonicalize(&first),
            header,
            param,
        }
    }

    /// Full parameter form stored with entries (`es,en`)
    pub fn param(&self) -> &str {
        &self.param
    }

    /// `Accept-Language` header sent upstream
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Lowercase primary subtag (`pt`)
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Lowercase first token (`pt-br`), the exact-match key
    pub fn simple(&self) -> &str {
        &self.simple
    }

    /// Canonical first token sent as `accept-language` query value
    pub fn request(&self) -> &str {
        &self.request
    }
}

fn is_valid_tag(tag: &str) -> bool {
    (1..=MAX_TAG_LEN).contains(&tag.len())
        && tag.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn first_token(param: &str) -> &str {
    param.split(',').next().unwrap_or_default().trim()
}

/// Canonical BCP-47 casing: language lowercase, script Title, region UPPER.
pub fn canonicalize(tag: &str) -> String {
    tag.split('-')
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(i, part)| {
            let alpha = part.bytes().all(|b| b.is_ascii_alphabetic());
            let digits = part.bytes().all(|b| b.is_ascii_digit());
            match (i, part.len()) {
                (0, _) => part.to_ascii_lowercase(),
                (_, 4) if alpha => {
                    let mut s = part.to_ascii_lowercase();
                    s[..1].make_ascii_uppercase();
                    s
                }
                (_, 2) if alpha => part.to_ascii_uppercase(),
                (_, 3) if digits => part.to_string(),
                _ => part.to_ascii_lowercase(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Lowercase primary subtag of a parameter form (`pt-BR,pt,en` -> `pt`)
pub fn primary_of(param: &str) -> String {
    let first = first_token(param);
    let first = if first.is_empty() { "en" } else { first };
    first.split('-').next().unwrap_or(first).to_lowercase()
}

/// Lowercase first token of a parameter form (`pt-BR,pt,en` -> `pt-br`)
pub fn simple_of(param: &str) -> String {
    match first_token(param) {
        "" => "en".to_string(),
        first => first.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_language() {
        let tag = LanguageTag::parse(Some("es"), "en").unwrap();
        assert_eq!(tag.param(), "es,en");
        assert_eq!(tag.header(), "es,en;q=0.9");
        assert_eq!(tag.primary(), "es");
        assert_eq!(tag.simple(), "es");
        assert_eq!(tag.request(), "es");
    }

    #[test]
    fn test_regional_language() {
        let tag = LanguageTag::parse(Some("pt_br"), "en").unwrap();
        assert_eq!(tag.param(), "pt-BR,pt,en");
        assert_eq!(tag.header(), "pt-BR,pt;q=0.9,en;q=0.8");
        assert_eq!(tag.primary(), "pt");
        assert_eq!(tag.simple(), "pt-br");
        assert_eq!(tag.request(), "pt-BR");
    }

    #[test]
    fn test_english_is_not_doubled() {
        let tag = LanguageTag::parse(Some("EN"), "es").unwrap();
        assert_eq!(tag.param(), "en");
        assert_eq!(tag.header(), "en");
    }

    #[test]
    fn test_default_when_missing() {
        let tag = LanguageTag::parse(None, "fr").unwrap();
        assert_eq!(tag.param(), "fr,en");
        let tag = LanguageTag::parse(Some("   "), "fr").unwrap();
        assert_eq!(tag.primary(), "fr");
    }

    #[test]
    fn test_invalid_tags_rejected() {
        assert!(LanguageTag::parse(Some("es;DROP"), "en").is_err());
        assert!(LanguageTag::parse(Some("ä"), "en").is_err());
        assert!(LanguageTag::parse(Some(&"a".repeat(36)), "en").is_err());
        assert!(LanguageTag::parse(Some(&"a".repeat(35)), "en").is_ok());
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("ZH-hant-tw"), "zh-Hant-TW");
        assert_eq!(canonicalize("es-419"), "es-419");
        assert_eq!(canonicalize("sr--latn"), "sr-Latn");
        assert_eq!(canonicalize("de-CH-1996"), "de-CH-1996");
        assert_eq!(canonicalize("en-X-Private"), "en-x-private");
    }

    #[test]
    fn test_derived_forms() {
        assert_eq!(primary_of("zh-Hant-TW,zh,en"), "zh");
        assert_eq!(primary_of(""), "en");
        assert_eq!(simple_of("zh-Hant-TW,zh,en"), "zh-hant-tw");
        assert_eq!(simple_of(""), "en");
    }

    #[test]
    fn test_script_region_header() {
        let tag = LanguageTag::parse(Some("zh-hant-tw"), "en").unwrap();
        assert_eq!(tag.param(), "zh-Hant-TW,zh,en");
        assert_eq!(tag.header(), "zh-Hant-TW,zh;q=0.9,en;q=0.8");
    }
}
