/*!
 * Text normalization for raw idiom and meaning strings.
 *
 * Spreadsheet exports of the idiom tables carry byte-order marks, stray
 * zero-width characters, no-break spaces and ragged whitespace. Every text
 * that enters the corpus or an inference request goes through `normalize`.
 */

/// Characters dropped outright
fn is_artifact(c: char) -> bool {
    matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{2060}' | '\u{FFFD}')
        || (c.is_control() && !c.is_whitespace())
}

/// Normalize a raw string
///
/// Removes encoding artifacts, collapses whitespace runs to a single space
/// and trims both edges. ZWJ/ZWNJ are kept since they change the rendering of
/// Devanagari and Telugu conjuncts. The function is idempotent.
pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !is_artifact(*c))
        .map(|c| if c == '\u{00A0}' || c == '\u{202F}' { ' ' } else { c })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize raw bytes; invalid UTF-8 yields an empty string
pub fn normalize_bytes(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => normalize(text),
        Err(_) => String::new(),
    }
}

/// Normalize an optional field; a missing field yields an empty string
pub fn normalize_field(raw: Option<&str>) -> String {
    raw.map(normalize).unwrap_or_default()
}
