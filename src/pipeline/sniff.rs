//! Format detection from a bounded byte prefix.
//!
//! Classification looks at the first [`DETECTION_LINES`] lines of the first
//! `window` bytes and nothing else, which makes it a pure function of that
//! window: any two inputs sharing the same leading `window` bytes classify the
//! same way, however much more data follows.
//!
//! Bytes are decoded as Latin-1, so every byte maps to exactly one `char` and
//! decoding cannot fail on binary pixel data that follows a short label.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default detection window in bytes.
pub const DETECTION_WINDOW: usize = 10_000;

/// Lines of the window that are scanned for markers.
pub const DETECTION_LINES: usize = 20;

const PDS3_MARKERS: &[&str] = &["PDS_VERSION_ID", "PDS3"];
const PDS4_MARKERS: &[&str] = &["PDS4", "<?xml", "pds:"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum FormatClassification {
    Pds3,
    Pds4,
    Unknown,
    /// Classification could not run; carries a diagnostic.
    Error(String),
}

impl FormatClassification {
    /// True for formats the conversion gateway can decode.
    pub fn is_supported(&self) -> bool {
        matches!(self, FormatClassification::Pds3 | FormatClassification::Pds4)
    }

    /// Short label, e.g. for an `X-PDS-Version`-style response header.
    pub fn label(&self) -> &str {
        match self {
            FormatClassification::Pds3 => "PDS3",
            FormatClassification::Pds4 => "PDS4",
            FormatClassification::Unknown => "Unknown",
            FormatClassification::Error(_) => "Error",
        }
    }
}

impl fmt::Display for FormatClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatClassification::Error(detail) => write!(f, "detection error: {detail}"),
            other => f.write_str(other.label()),
        }
    }
}

/// Classify using the default 10 000-byte window.
pub fn classify(prefix: &[u8]) -> FormatClassification {
    classify_window(prefix, DETECTION_WINDOW)
}

/// Classify using at most `window` leading bytes of `prefix`.
///
/// PDS3 markers win over PDS4 markers when both appear.
pub fn classify_window(prefix: &[u8], window: usize) -> FormatClassification {
    let bytes = &prefix[..prefix.len().min(window)];
    if bytes.is_empty() {
        return FormatClassification::Error("empty detection window".into());
    }

    let text: String = bytes.iter().map(|&b| char::from(b)).collect();
    let header = text
        .split('\n')
        .take(DETECTION_LINES)
        .collect::<Vec<_>>()
        .join("\n");

    if PDS3_MARKERS.iter().any(|m| header.contains(m)) {
        FormatClassification::Pds3
    } else if PDS4_MARKERS.iter().any(|m| header.contains(m)) {
        FormatClassification::Pds4
    } else {
        FormatClassification::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pds3_label() {
        let label = b"PDS_VERSION_ID = PDS3\r\nRECORD_TYPE = FIXED_LENGTH\r\n";
        assert_eq!(classify(label), FormatClassification::Pds3);
    }

    #[test]
    fn pds4_xml_label() {
        let label = br#"<?xml version="1.0" encoding="UTF-8"?>
<Product_Observational xmlns="http://pds.nasa.gov/pds4/pds/v1">"#;
        assert_eq!(classify(label), FormatClassification::Pds4);
    }

    #[test]
    fn pds3_wins_when_both_present() {
        let label = b"<?xml version=\"1.0\"?>\nPDS_VERSION_ID = PDS3\n";
        assert_eq!(classify(label), FormatClassification::Pds3);
    }

    #[test]
    fn plain_jpeg_is_unknown() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F'];
        assert_eq!(classify(&jpeg), FormatClassification::Unknown);
    }

    #[test]
    fn empty_prefix_is_error() {
        assert!(matches!(classify(b""), FormatClassification::Error(_)));
        assert!(!classify(b"").is_supported());
    }

    #[test]
    fn invalid_utf8_never_fails() {
        let mut bytes = vec![0xC3, 0x28, 0xFF, 0xFE];
        bytes.extend_from_slice(b"\nPDS_VERSION_ID = PDS3\n");
        assert_eq!(classify(&bytes), FormatClassification::Pds3);
    }

    #[test]
    fn marker_past_line_twenty_is_ignored() {
        let mut text = "x\n".repeat(DETECTION_LINES);
        text.push_str("PDS_VERSION_ID = PDS3\n");
        assert_eq!(classify(text.as_bytes()), FormatClassification::Unknown);
    }

    #[test]
    fn marker_past_window_is_ignored() {
        let mut bytes = vec![b' '; 64];
        bytes.extend_from_slice(b"PDS3");
        assert_eq!(classify_window(&bytes, 64), FormatClassification::Unknown);
        assert_eq!(classify_window(&bytes, 68), FormatClassification::Pds3);
    }

    #[test]
    fn superset_of_full_window_classifies_identically() {
        let mut base = b"PDS_VERSION_ID = PDS3\n".to_vec();
        base.resize(DETECTION_WINDOW, b'\0');
        let first = classify(&base);

        for tail in [&b"<?xml"[..], &b"garbage"[..], &[0u8; 4096][..]] {
            let mut longer = base.clone();
            longer.extend_from_slice(tail);
            assert_eq!(classify(&longer), first);
        }

        let mut unknown = vec![b'.'; DETECTION_WINDOW];
        let before = classify(&unknown);
        unknown.extend_from_slice(b"PDS3");
        assert_eq!(classify(&unknown), before);
    }
}
