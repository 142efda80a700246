//! Text excerpting and UTF-8 helpers
//!
//! Utilities for creating bounded, model- and wire-safe previews of text
//! that may be arbitrarily long (tool observations, retrieved passages).

/// UTF-8 safe byte slicing - finds valid char boundaries.
/// Returns (slice, actual_start, actual_end) where boundaries are adjusted to valid UTF-8.
pub fn safe_utf8_slice(text: &str, start: usize, limit: usize) -> (String, usize, usize) {
    let bytes = text.as_bytes();
    let len = bytes.len();

    if start >= len {
        return (String::new(), len, len);
    }

    let mut actual_start = start.min(len);
    while actual_start < len && !text.is_char_boundary(actual_start) {
        actual_start += 1;
    }

    let mut actual_end = (actual_start + limit).min(len);
    while actual_end > actual_start && !text.is_char_boundary(actual_end) {
        actual_end -= 1;
    }

    let content = text[actual_start..actual_end].to_string();
    (content, actual_start, actual_end)
}

/// Truncate `text` to at most `limit` chars, appending an ellipsis marker when
/// truncation occurred. Used for tool observations (spec default limit: 10 000 chars).
pub fn truncate_with_ellipsis(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let head: String = text.chars().take(limit).collect();
    format!("{head}… [truncated {} more characters]", total - limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_utf8_slice_basic() {
        let text = "hello world";
        let (slice, start, end) = safe_utf8_slice(text, 0, 5);
        assert_eq!(slice, "hello");
        assert_eq!(start, 0);
        assert_eq!(end, 5);
    }

    #[test]
    fn test_safe_utf8_slice_mid_char() {
        let text = "héllo";
        let (slice, start, _) = safe_utf8_slice(text, 2, 10);
        assert!(text.is_char_boundary(start));
        assert!(!slice.contains('é'));
    }

    #[test]
    fn test_safe_utf8_slice_past_end() {
        let text = "short";
        let (slice, start, end) = safe_utf8_slice(text, 100, 50);
        assert_eq!(slice, "");
        assert_eq!(start, 5);
        assert_eq!(end, 5);
    }

    #[test]
    fn test_truncate_short_unchanged() {
        let short = "short content";
        assert_eq!(truncate_with_ellipsis(short, 10_000), short);
    }

    #[test]
    fn test_truncate_long_adds_marker() {
        let long = "a".repeat(20_000);
        let out = truncate_with_ellipsis(&long, 10_000);
        assert!(out.contains("truncated"));
        assert!(out.starts_with(&"a".repeat(10_000)));
    }
}
