//! Page model extraction for the console's `HMInnnnn.cgi` pages.
//!
//! The pages are hand-written HTML with custom attributes on value spans:
//!
//! ```text
//! <div id="d12">
//!   <td id="l12"><span lg="5. 17">Teplota kotle</span></td>
//!   <span id="o075" it="v" mi="val:0x2302 0x4E25516C 0x100">71.5</span>
//!   <span id="u075" class="u">°C</span>
//! </div>
//! ```
//!
//! `it` is the input kind (`v` numeric, `e` enumeration), `mi` the write
//! identifier, `e` an inline `*`-separated option list and `lg` a key into the
//! [`LocalizationTable`]. Firmware variants differ, so extraction runs a list
//! of [`ExtractionStrategy`] implementations in priority order and keeps the
//! first non-empty result.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::language::LocalizationTable;

static ROW_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<div\s+id=['"]d(\d+)['"]>(.*?)</div>"#).expect("valid regex")
});

static LABEL_CELL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<td[^>]*id=['"]l(\d+)['"][^>]*>(.*?)</td>"#).expect("valid regex")
});

/// Opening `<span ...>` tag; quoted attribute values may contain `>`.
static SPAN_OPEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<span\b((?:[^>"']|"[^"]*"|'[^']*')*)>"#).expect("valid regex")
});

const SPAN_CLOSE: &str = "</span>";

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid regex")
});

static OBJECT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^o\d+$").expect("valid regex"));

static READ_FN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"function\s+GFR\(\)[^{]*\{[^"]*\("([A-Za-z]*\d+Read\.cgi)"\)\s*;\s*\}"#)
        .expect("valid regex")
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Object id of the page title span.
const TITLE_SPAN_ID: &str = "o002";

/// Class marking unit spans.
const UNIT_CLASS: &str = "u";

/// Sequence number of entries that were not read from a row block.
pub const UNORDERED: i64 = -1;

/// Input kind of a value span (`it` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// `it="v"`
    Numeric,
    /// `it="e"`
    Enumeration,
    /// Missing or unrecognized marker; never writable.
    Unknown,
}

impl InputKind {
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker.map(str::trim) {
            Some("v") => Self::Numeric,
            Some("e") => Self::Enumeration,
            _ => Self::Unknown,
        }
    }

    /// Device marker, as published in entity attributes.
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            Self::Numeric => Some("v"),
            Self::Enumeration => Some("e"),
            Self::Unknown => None,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// One point defined on a page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryDefinition {
    /// Row block number, or [`UNORDERED`].
    pub sequence: i64,
    pub object_id: String,
    pub label: String,
    pub kind: InputKind,
    /// Opaque token required to write this point.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Enumeration labels; the position is the device value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Parsed page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageModel {
    pub page: String,
    pub title: String,
    /// Relative path of the telemetry stream for this page.
    pub read_endpoint: String,
    pub entries: Vec<EntryDefinition>,
    /// Name of the strategy that produced `entries`, if any did.
    pub strategy: Option<&'static str>,
}

/// Inputs shared by all strategies.
pub struct ParseContext<'a> {
    pub table: &'a LocalizationTable,
    pub lang_index: usize,
}

/// Result of one extraction attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Entries(Vec<EntryDefinition>),
    /// Nothing recognizable for this strategy; try the next one.
    Empty,
}

impl Extraction {
    fn from_entries(entries: Vec<EntryDefinition>) -> Self {
        if entries.is_empty() {
            Self::Empty
        } else {
            Self::Entries(entries)
        }
    }
}

/// A way of finding entry definitions in a page.
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, html: &str, ctx: &ParseContext<'_>) -> Extraction;
}

/// Row-block layout: one `<div id="dN">` per point with label cell, value
/// span and unit span.
///
/// Only the first `v`/`e` value span of a block is used; later ones are
/// ignored.
pub struct StructuredStrategy;

impl ExtractionStrategy for StructuredStrategy {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn extract(&self, html: &str, ctx: &ParseContext<'_>) -> Extraction {
        let mut entries = Vec::new();

        for block in ROW_BLOCK_RE.captures_iter(html) {
            let sequence = block[1].parse().unwrap_or(UNORDERED);
            let body = &block[2];

            let Some(value) = spans(body).find(Span::is_value_span) else {
                continue;
            };

            let label = label_cell(body, ctx);
            let unit = spans(body)
                .find(|s| s.has_class(UNIT_CLASS))
                .and_then(|s| non_empty(strip_markup(s.inner)));

            entries.push(value.to_entry(sequence, label, unit, ctx));
        }

        Extraction::from_entries(entries)
    }
}

/// Alternate layout without row blocks: every value span in the document,
/// units matched by the numeric suffix of `class="u"` span ids. Labels and
/// ordering are lost.
pub struct FlatScanStrategy;

impl ExtractionStrategy for FlatScanStrategy {
    fn name(&self) -> &'static str {
        "flat-scan"
    }

    fn extract(&self, html: &str, ctx: &ParseContext<'_>) -> Extraction {
        let mut units: HashMap<&str, String> = HashMap::new();
        for span in spans(html).filter(|s| s.has_class(UNIT_CLASS)) {
            let Some(suffix) = span.attr("id").and_then(trailing_digits) else {
                continue;
            };
            if let Some(text) = non_empty(strip_markup(span.inner)) {
                units.entry(suffix).or_insert(text);
            }
        }

        let entries = spans(html)
            .filter(Span::is_value_span)
            .map(|span| {
                let unit = span
                    .object_id()
                    .and_then(trailing_digits)
                    .and_then(|suffix| units.get(suffix).cloned());
                span.to_entry(UNORDERED, String::new(), unit, ctx)
            })
            .collect();

        Extraction::from_entries(entries)
    }
}

/// Runs the extraction strategies in priority order.
pub struct PageParser {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    lang_index: usize,
}

impl Default for PageParser {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PageParser {
    /// Parser with the structured strategy followed by the flat-scan fallback.
    pub fn new(lang_index: usize) -> Self {
        Self::with_strategies(
            vec![Box::new(StructuredStrategy), Box::new(FlatScanStrategy)],
            lang_index,
        )
    }

    pub fn with_strategies(
        strategies: Vec<Box<dyn ExtractionStrategy>>,
        lang_index: usize,
    ) -> Self {
        Self {
            strategies,
            lang_index,
        }
    }

    pub fn lang_index(&self) -> usize {
        self.lang_index
    }

    /// Build the model for `page` from its markup.
    pub fn parse(&self, page: &str, html: &str, table: &LocalizationTable) -> PageModel {
        let ctx = ParseContext {
            table,
            lang_index: self.lang_index,
        };

        let mut entries = Vec::new();
        let mut strategy = None;
        for candidate in &self.strategies {
            match candidate.extract(html, &ctx) {
                Extraction::Entries(found) => {
                    entries = found;
                    strategy = Some(candidate.name());
                    break;
                }
                Extraction::Empty => {
                    tracing::debug!(
                        category = "parse",
                        page,
                        strategy = candidate.name(),
                        "Strategy found no entries"
                    );
                }
            }
        }

        PageModel {
            page: page.to_string(),
            title: page_title(html, &ctx),
            read_endpoint: read_endpoint_for(page, html),
            entries: dedupe_object_ids(page, entries),
            strategy,
        }
    }
}

/// Telemetry endpoint for `page`: the literal named in the page's `GFR()`
/// function, else the page name with `.cgi` replaced by `Read.cgi`.
pub fn read_endpoint_for(page: &str, html: &str) -> String {
    if let Some(caps) = READ_FN_RE.captures(html) {
        return caps[1].to_string();
    }
    match page.strip_suffix(".cgi") {
        Some(stem) => format!("{}Read.cgi", stem),
        None => format!("{}Read.cgi", page),
    }
}

/// Split an enumeration definition on `*`, trimming and dropping empty parts.
///
/// There is no escape syntax, so an option containing `*` is split as well.
pub fn split_options(definition: &str) -> Vec<String> {
    definition
        .split('*')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Remove tags and collapse whitespace.
pub fn strip_markup(html: &str) -> String {
    let text = TAG_RE.replace_all(html, " ");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

fn page_title(html: &str, ctx: &ParseContext<'_>) -> String {
    spans(html)
        .find(|s| s.attr("id") == Some(TITLE_SPAN_ID))
        .and_then(|s| s.attr("lg"))
        .and_then(|key| ctx.table.resolve(key, ctx.lang_index))
        .unwrap_or_default()
        .to_string()
}

fn label_cell(block: &str, ctx: &ParseContext<'_>) -> String {
    let Some(cell) = LABEL_CELL_RE.captures(block) else {
        return String::new();
    };
    let cell_html = cell.get(2).map_or("", |m| m.as_str());

    let localized = spans(cell_html)
        .find_map(|s| s.attr("lg"))
        .and_then(|key| ctx.table.resolve(key, ctx.lang_index))
        .filter(|text| !text.is_empty());

    match localized {
        Some(text) => text.to_string(),
        None => strip_markup(cell_html),
    }
}

fn dedupe_object_ids(page: &str, entries: Vec<EntryDefinition>) -> Vec<EntryDefinition> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| {
            let first = seen.insert(entry.object_id.clone());
            if !first {
                tracing::debug!(category = "parse", page, object_id = %entry.object_id, "Ignoring duplicate object id");
            }
            first
        })
        .collect()
}

fn trailing_digits(id: &str) -> Option<&str> {
    let start = id
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    Some(&id[start..])
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// A `<span>` element with its parsed attributes.
struct Span<'a> {
    attrs: HashMap<&'a str, &'a str>,
    inner: &'a str,
}

/// Every opening tag is a span of its own, so value spans nested inside
/// wrapper spans are still found. The inner text runs to the next closing
/// tag.
fn spans(html: &str) -> impl Iterator<Item = Span<'_>> {
    SPAN_OPEN_RE.captures_iter(html).map(move |caps| {
        let attr_text = caps.get(1).map_or("", |m| m.as_str());
        let rest = caps.get(0).map_or("", |m| &html[m.end()..]);
        let inner = rest.find(SPAN_CLOSE).map_or(rest, |end| &rest[..end]);
        let attrs = ATTR_RE
            .captures_iter(attr_text)
            .filter_map(|attr| {
                let name = attr.get(1)?.as_str();
                let value = attr.get(2).or_else(|| attr.get(3))?.as_str();
                Some((name, value))
            })
            .collect();
        Span { attrs, inner }
    })
}

impl<'a> Span<'a> {
    /// Non-empty attribute value.
    fn attr(&self, name: &str) -> Option<&'a str> {
        self.attrs.get(name).copied().filter(|v| !v.is_empty())
    }

    fn object_id(&self) -> Option<&'a str> {
        self.attr("id").filter(|id| OBJECT_ID_RE.is_match(id))
    }

    fn kind(&self) -> InputKind {
        InputKind::from_marker(self.attr("it"))
    }

    fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    fn is_value_span(&self) -> bool {
        self.object_id().is_some() && self.kind().is_recognized()
    }

    fn options(&self, kind: InputKind, ctx: &ParseContext<'_>) -> Option<Vec<String>> {
        let options = if let Some(inline) = self.attr("e") {
            split_options(&inline.replace(['\r', '\n'], " "))
        } else if kind == InputKind::Enumeration {
            let key = self.attr("lg")?;
            split_options(ctx.table.resolve(key, ctx.lang_index)?)
        } else {
            return None;
        };
        if options.is_empty() {
            None
        } else {
            Some(options)
        }
    }

    fn to_entry(
        &self,
        sequence: i64,
        label: String,
        unit: Option<String>,
        ctx: &ParseContext<'_>,
    ) -> EntryDefinition {
        let kind = self.kind();
        EntryDefinition {
            sequence,
            object_id: self.object_id().unwrap_or_default().to_string(),
            label,
            kind,
            write_id: self.attr("mi").map(str::to_string),
            unit,
            options: self.options(kind, ctx),
        }
    }
}
