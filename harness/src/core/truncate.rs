//! Byte-bounded output truncation.
//!
//! Always truncate before redacting: redaction cost scales with input size and
//! the discarded tail should never be scanned.

/// Default cap for a single stream of command output (50 KiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 50 * 1024;

/// Cut `text` at exactly `max_bytes` and append a marker if anything was dropped.
///
/// The cut is byte-exact; a multi-byte character split at the boundary is
/// replaced with U+FFFD rather than rejected.
pub fn truncate(text: &str, max_bytes: usize) -> String {
    truncate_bytes(text.as_bytes(), max_bytes)
}

/// Byte-slice variant of [`truncate`] for raw process output.
pub fn truncate_bytes(bytes: &[u8], max_bytes: usize) -> String {
    if bytes.len() <= max_bytes {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut out = String::from_utf8_lossy(&bytes[..max_bytes]).into_owned();
    out.push_str(&truncation_marker(bytes.len() - max_bytes));
    out
}

/// Marker appended after truncated output.
pub fn truncation_marker(dropped_bytes: usize) -> String {
    format!("\n[truncated {dropped_bytes} bytes]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_unchanged() {
        assert_eq!(truncate("hello", 5), "hello");
        assert_eq!(truncate("", 0), "");
    }

    #[test]
    fn long_text_is_cut_with_marker() {
        assert_eq!(truncate("hello world", 5), "hello\n[truncated 6 bytes]");
    }

    #[test]
    fn cut_is_byte_exact_inside_multibyte_chars() {
        // "é" is two bytes; cutting after the first yields a replacement char.
        let out = truncate("aé", 2);
        assert!(out.starts_with('a'));
        assert!(out.ends_with("[truncated 1 bytes]"));
        assert!(out.contains('\u{FFFD}'));
    }
}
