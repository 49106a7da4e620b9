//! Cache Entry
//!
//! One resolved address for a quantized location in a given language. The
//! content of an entry never changes after creation; only its hotness
//! timestamp (tracked separately) moves.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::language::{primary_of, simple_of, LanguageTag};
use super::quantize::{hot_key, GridCell};

/// A cached reverse-geocoding result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Quantized latitude
    pub lat: f64,
    /// Quantized longitude
    pub lon: f64,
    /// Opaque address payload
    pub address: serde_json::Value,
    /// Creation time
    #[serde(rename = "ts")]
    pub created_at: DateTime<Utc>,
    /// Parameter form of the language (`es,en`)
    #[serde(default)]
    pub lang: String,
    /// `Accept-Language` header used for the fetch
    #[serde(rename = "lang_hdr", default)]
    pub lang_header: String,
    /// Lowercase primary subtag, derived from `lang` when missing on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_primary: Option<String>,
    /// Lowercase first token, derived from `lang` when missing on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang_simple: Option<String>,
}

impl CacheEntry {
    /// Create an entry for a fresh upstream result
    pub fn new(
        lat: f64,
        lon: f64,
        address: serde_json::Value,
        language: &LanguageTag,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            lat,
            lon,
            address,
            created_at,
            lang: language.param().to_string(),
            lang_header: language.header().to_string(),
            lang_primary: Some(language.primary().to_string()),
            lang_simple: Some(language.simple().to_string()),
        }
    }

    /// Grid cell of the entry
    pub fn cell(&self) -> GridCell {
        GridCell::of(self.lat, self.lon)
    }

    /// Key of the entry in the hotness map
    pub fn hot_key(&self) -> String {
        hot_key(self.lat, self.lon)
    }

    /// Exact-match language key
    pub fn simple(&self) -> Cow<'_, str> {
        match &self.lang_simple {
            Some(s) => Cow::Borrowed(s),
            None => Cow::Owned(simple_of(&self.lang)),
        }
    }

    /// Primary-subtag language key
    pub fn primary(&self) -> Option<&str> {
        self.lang_primary.as_deref()
    }

    /// Fill derived language fields of entries written by older versions.
    ///
    /// Returns true when the entry changed.
    pub fn migrate(&mut self) -> bool {
        let mut changed = false;
        if self.lang_primary.is_none() {
            self.lang_primary = Some(primary_of(&self.lang));
            changed = true;
        }
        if self.lang_simple.is_none() {
            self.lang_simple = Some(simple_of(&self.lang));
            changed = true;
        }
        changed
    }
}
