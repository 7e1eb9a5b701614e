//! Localization tables embedded in the console's `HMILang*.js` scripts.
//!
//! The scripts declare blocks such as
//!
//! ```text
//! var languages1 = {
//!   "2. 512": ["Vypnuto*Zapalování*Provoz", "Off*Ignition*Running"],
//!   "5. 17": ["Teplota kotle", "Boiler temperature"],
//! };
//! ```
//!
//! Each array position is a language slot; that index is used everywhere a
//! localized string is resolved.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)var\s+languages(\d)\s*=\s*\{(.*?)\};").expect("valid regex"));

static KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)"([^"]+)"\s*:\s*\[(.*?)\]\s*,?\s*$"#).expect("valid regex")
});

/// Key → localized strings, indexed by language slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalizationTable {
    entries: HashMap<String, Vec<String>>,
}

impl LocalizationTable {
    /// Parse every `languagesN` block in `source`.
    ///
    /// A key seen in more than one block keeps the last definition.
    pub fn parse(source: &str) -> Self {
        let mut entries = HashMap::new();
        for block in BLOCK_RE.captures_iter(source) {
            for entry in KEY_RE.captures_iter(&block[2]) {
                entries.insert(entry[1].to_string(), tokenize_strings(&entry[2]));
            }
        }
        Self { entries }
    }

    /// All strings for `key`.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// The string for `key` at `lang_index`, trimmed.
    pub fn resolve(&self, key: &str, lang_index: usize) -> Option<&str> {
        self.get(key)?.get(lang_index).map(|s| s.trim())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collect the double-quoted strings of one array body.
///
/// A backslash keeps the next character literally, so escaped quotes and
/// commas stay inside the current string. An unterminated trailing string is
/// dropped.
fn tokenize_strings(array_body: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for ch in array_body.chars() {
        if !in_quotes {
            if ch == '"' {
                in_quotes = true;
                current.clear();
            }
            continue;
        }

        if escaped {
            current.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == '"' {
            items.push(std::mem::take(&mut current));
            in_quotes = false;
        } else {
            current.push(ch);
        }
    }

    items
}
