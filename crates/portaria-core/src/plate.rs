//! License plate extraction from OCR output.
//!
//! Accepts the two layouts in circulation: the legacy `LLLDDDD` plate and the
//! Mercosul `LLLDLDD` plate. OCR regularly injects or drops stray characters
//! next to the plate, so candidates are searched line by line with a sliding
//! 7-character window before falling back to the whole text.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::OcrResult;

pub const PLATE_LEN: usize = 7;

/// Which of the two accepted layouts a plate follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateFormat {
    /// `ABC1234`
    Legacy,
    /// `ABC1D23`
    Mercosul,
}

/// A validated plate: 7 upper-case alphanumerics in one of the two layouts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlateCode(String);

impl PlateCode {
    /// Parse an exact plate. Separators and case are tolerated (`abc-1234`),
    /// extra characters are not.
    pub fn parse(raw: &str) -> Option<PlateCode> {
        let cleaned = clean(raw);
        classify(cleaned.as_bytes()).map(|_| PlateCode(cleaned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn format(&self) -> PlateFormat {
        // Constructed only through `classify`, so this always matches.
        classify(self.0.as_bytes()).unwrap_or(PlateFormat::Legacy)
    }
}

impl fmt::Display for PlateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PlateCode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PlateCode::parse(&value).ok_or_else(|| format!("invalid plate: {value:?}"))
    }
}

impl From<PlateCode> for String {
    fn from(plate: PlateCode) -> String {
        plate.0
    }
}

/// Extract the first valid plate from raw (possibly multi-line) OCR text.
pub fn normalize(raw: &str) -> Option<PlateCode> {
    let lines: Vec<&str> = raw.lines().collect();
    search(&lines, raw)
}

/// Extract the first valid plate from a structured OCR result, trying the
/// engine's own line segmentation before the flat text.
pub fn normalize_ocr(ocr: &OcrResult) -> Option<PlateCode> {
    if ocr.lines.is_empty() {
        return normalize(&ocr.text);
    }
    let lines: Vec<&str> = ocr.lines.iter().map(|l| l.text.as_str()).collect();
    search(&lines, &ocr.text)
}

fn search(lines: &[&str], full_text: &str) -> Option<PlateCode> {
    lines
        .iter()
        .find_map(|line| first_window(&clean(line)))
        .or_else(|| first_window(&clean(full_text)))
}

/// Upper-case and drop everything outside `[A-Z0-9]`.
fn clean(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

/// Leftmost 7-character window of an already-cleaned string that validates.
fn first_window(cleaned: &str) -> Option<PlateCode> {
    if cleaned.len() < PLATE_LEN {
        return None;
    }
    cleaned
        .as_bytes()
        .windows(PLATE_LEN)
        .find(|w| classify(w).is_some())
        // Cleaned input is pure ASCII, so any byte window is valid UTF-8.
        .map(|w| PlateCode(String::from_utf8_lossy(w).into_owned()))
}

fn classify(candidate: &[u8]) -> Option<PlateFormat> {
    if candidate.len() != PLATE_LEN {
        return None;
    }
    let prefix_ok = candidate[..3].iter().all(u8::is_ascii_uppercase) && candidate[3].is_ascii_digit();
    if !prefix_ok {
        return None;
    }
    if candidate[4..].iter().all(u8::is_ascii_digit) {
        Some(PlateFormat::Legacy)
    } else if candidate[4].is_ascii_uppercase() && candidate[5..].iter().all(u8::is_ascii_digit) {
        Some(PlateFormat::Mercosul)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OcrLine;

    #[test]
    fn test_accepts_both_layouts() {
        assert_eq!(PlateCode::parse("ABC1234").unwrap().format(), PlateFormat::Legacy);
        assert_eq!(PlateCode::parse("ABC1D23").unwrap().format(), PlateFormat::Mercosul);
    }

    #[test]
    fn test_noisy_single_line() {
        assert_eq!(normalize(" ABC-1D23 !!").unwrap().as_str(), "ABC1D23");
    }

    #[test]
    fn test_lowercase_is_normalized() {
        assert_eq!(normalize("abc 1234").unwrap().as_str(), "ABC1234");
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(normalize("ABC123").is_none());
        assert!(PlateCode::parse("ABC12345").is_none());
    }

    #[test]
    fn test_rejects_wrong_pattern() {
        assert!(normalize("AB12345").is_none());
        assert!(normalize("ABCD123").is_none());
        assert!(normalize("ABC12D3").is_none());
        assert!(normalize("1234ABC").is_none());
    }

    #[test]
    fn test_sliding_window_skips_stray_prefix() {
        // OCR picked up a border glyph before the plate.
        assert_eq!(normalize("IABC1D23").unwrap().as_str(), "ABC1D23");
    }

    #[test]
    fn test_sliding_window_takes_leftmost_match() {
        assert_eq!(normalize("XYZ9999ABC1234").unwrap().as_str(), "XYZ9999");
    }

    #[test]
    fn test_multiline_picks_plate_line() {
        let raw = "BRASIL\nMERCOSUL\nRIO1A23\n";
        assert_eq!(normalize(raw).unwrap().as_str(), "RIO1A23");
    }

    #[test]
    fn test_falls_back_to_concatenated_text() {
        // Plate split across two OCR lines.
        let raw = "ABC1\nD23";
        assert_eq!(normalize(raw).unwrap().as_str(), "ABC1D23");
    }

    #[test]
    fn test_structured_ocr_prefers_lines() {
        let ocr = OcrResult {
            text: "garbage XYZ1234".into(),
            lines: vec![
                OcrLine { text: "garbage".into(), bbox: None },
                OcrLine { text: "QWE-4R56".into(), bbox: None },
            ],
            confidence: Some(0.8),
        };
        assert_eq!(normalize_ocr(&ocr).unwrap().as_str(), "QWE4R56");
    }

    #[test]
    fn test_structured_ocr_without_lines_uses_text() {
        let ocr = OcrResult { text: "ABC 1234".into(), lines: vec![], confidence: None };
        assert_eq!(normalize_ocr(&ocr).unwrap().as_str(), "ABC1234");
    }

    #[test]
    fn test_nothing_validates() {
        assert!(normalize("").is_none());
        assert!(normalize("NO PLATE HERE").is_none());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in [" ABC-1D23 !!", "xABC1234y", "line\nDEF5G67", "ab\nc1234"] {
            let once = normalize(raw).unwrap();
            let twice = normalize(once.as_str()).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn test_serde_rejects_invalid_plate() {
        assert!(serde_json::from_str::<PlateCode>("\"ABC1234\"").is_ok());
        assert!(serde_json::from_str::<PlateCode>("\"NOPE\"").is_err());
    }
}
