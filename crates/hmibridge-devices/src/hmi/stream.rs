//! Decoder for the `HMInnnnnRead.cgi` telemetry stream.
//!
//! The stream is a run of records `<oid>,<marker>,<value>|`, optionally
//! separated by whitespace or newlines. Some firmware also breaks the line
//! after the marker comma:
//!
//! ```text
//! o044,v,  55|o075,v,71.5|
//! o038,e,
//! 2|
//! ```

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static RECORD_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(o\d+),(\w),\s*").expect("valid regex"));

static OBJECT_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(o\d+),").expect("valid regex"));

/// Value terminator.
const TERMINATOR: char = '|';

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueSample {
    pub object_id: String,
    pub type_marker: char,
    /// Trimmed text between the header and the terminator.
    pub raw: String,
}

/// Object id → sample. Later records for the same id replace earlier ones.
pub type Samples = BTreeMap<String, ValueSample>;

/// Decode every complete record in `stream`.
///
/// A trailing record without a terminator is incomplete and dropped. Text
/// that does not look like a record is skipped.
pub fn decode_values(stream: &str) -> Samples {
    let mut samples = BTreeMap::new();
    let mut cursor = 0;

    while let Some(header) = RECORD_HEADER_RE.captures_at(stream, cursor) {
        let whole = header.get(0).map_or(cursor..cursor, |m| m.range());
        let rest = &stream[whole.end..];

        let Some(len) = rest.find(TERMINATOR) else {
            break;
        };

        let object_id = header[1].to_string();
        let type_marker = header[2].chars().next().unwrap_or_default();
        samples.insert(
            object_id.clone(),
            ValueSample {
                object_id,
                type_marker,
                raw: rest[..len].trim().to_string(),
            },
        );
        cursor = whole.end + len + TERMINATOR.len_utf8();
    }

    samples
}

/// Object ids mentioned anywhere in `stream`, regardless of record shape.
pub fn decode_ids(stream: &str) -> BTreeSet<String> {
    OBJECT_ID_RE
        .captures_iter(stream)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Decode the bytes of a telemetry response.
///
/// Older firmware serves Windows-1250 text; anything that is not valid UTF-8
/// is decoded lossily, which is enough because ids, markers and numbers are
/// ASCII.
pub fn decode_body(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_values() {
        let samples = decode_values("o044,v,  55|o075,v,71.5|\no038,e,2|");
        assert_eq!(samples.len(), 3);
        assert_eq!(samples["o044"].raw, "55");
        assert_eq!(samples["o044"].type_marker, 'v');
        assert_eq!(samples["o075"].raw, "71.5");
        assert_eq!(samples["o038"].type_marker, 'e');
        assert_eq!(samples["o038"].raw, "2");
    }

    #[test]
    fn test_newline_after_marker() {
        let stream = "o001,v,\n12.5|o002,e,\n1|";

        let samples = decode_values(stream);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples["o001"].type_marker, 'v');
        assert_eq!(samples["o001"].raw, "12.5");
        assert_eq!(samples["o002"].type_marker, 'e');
        assert_eq!(samples["o002"].raw, "1");

        let ids: Vec<String> = decode_ids(stream).into_iter().collect();
        assert_eq!(ids, vec!["o001", "o002"]);
    }

    #[test]
    fn test_truncated_trailing_record() {
        let samples = decode_values("o044,v,55|o075,v,71");
        assert_eq!(samples.len(), 1);
        assert!(samples.contains_key("o044"));
        assert!(!samples.contains_key("o075"));
    }

    #[test]
    fn test_empty_value() {
        let samples = decode_values("o100,v,|o101,v, 3 |");
        assert_eq!(samples["o100"].raw, "");
        assert_eq!(samples["o101"].raw, "3");
    }

    #[test]
    fn test_garbage_between_records() {
        let samples = decode_values("junk o010,v,1| more junk o011,e,0|");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples["o011"].raw, "0");
    }

    #[test]
    fn test_non_record_text() {
        assert!(decode_values("<html>Unauthorized</html>").is_empty());
        assert!(decode_values("").is_empty());
    }

    #[test]
    fn test_later_record_replaces_earlier() {
        let samples = decode_values("o044,v,1|o044,v,2|");
        assert_eq!(samples["o044"].raw, "2");
    }

    #[test]
    fn test_decode_ids() {
        let ids = decode_ids("o044,v,55|o075,v,71\n");
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("o044"));
        assert!(ids.contains("o075"));
    }

    #[test]
    fn test_decode_body_lossy() {
        let text = decode_body(b"o001,v,\xE8|");
        assert_eq!(decode_values(&text)["o001"].raw, "\u{FFFD}");
    }
}
