//! Character-boundary-safe string operations shared by the executor's
//! output truncation (spec §4.D step 7) and the router's outbound
//! chunking (spec §4.E).

const TRUNCATION_SUFFIX: &str = " ... (truncated)";

/// Largest byte index <= `idx` that lies on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Truncate `s` to at most `max_chars` characters, never splitting a
/// multi-byte code point, appending [`TRUNCATION_SUFFIX`] when truncation
/// actually happened.
pub fn truncate_output(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }

    // Walk by char to find the byte offset of the max_chars-th character.
    let byte_idx = s
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let safe_idx = floor_char_boundary(s, byte_idx);

    let mut out = s[..safe_idx].to_string();
    out.push_str(TRUNCATION_SUFFIX);
    out
}

/// Replace empty output with a placeholder, matching spec §4.D step 7.
pub fn placeholder_if_empty(s: &str) -> String {
    if s.trim().is_empty() {
        "(no content)".to_string()
    } else {
        s.to_string()
    }
}

/// Split `text` into chunks no longer than `soft_cap` characters, splitting
/// at the latest newline within the first half of the budget when one
/// exists, otherwise hard-cutting at the budget. Every split point falls on
/// a character boundary (spec §4.E).
pub fn chunk_message(text: &str, soft_cap: usize) -> Vec<String> {
    if soft_cap == 0 || text.chars().count() <= soft_cap {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.chars().count() > soft_cap {
        let cap_byte_idx = remaining
            .char_indices()
            .nth(soft_cap)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let cap_byte_idx = floor_char_boundary(remaining, cap_byte_idx);

        let half_byte_idx = remaining
            .char_indices()
            .nth(soft_cap / 2)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let half_byte_idx = floor_char_boundary(remaining, half_byte_idx);

        let split_at = remaining[half_byte_idx..cap_byte_idx]
            .rfind('\n')
            .map(|rel| half_byte_idx + rel)
            .unwrap_or(cap_byte_idx);

        let split_at = floor_char_boundary(remaining, split_at.max(1));

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start_matches('\n');
    }

    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_noop_under_limit() {
        assert_eq!(truncate_output("hello", 10), "hello");
    }

    #[test]
    fn truncate_appends_suffix_when_cut() {
        let s = "a".repeat(20);
        let out = truncate_output(&s, 5);
        assert!(out.starts_with("aaaaa"));
        assert!(out.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn truncate_never_splits_multibyte_chars() {
        let s = "中".repeat(10_000) + "😀".repeat(10).as_str();
        for n in [0usize, 1, 2, 3, 4000, 9999, 10_000, 10_005] {
            let out = truncate_output(&s, n);
            assert!(std::str::from_utf8(out.as_bytes()).is_ok());
        }
    }

    #[test]
    fn truncate_mixed_chinese_and_emoji_stays_within_budget() {
        let mixed: String = "你好😀world你好😀"
            .chars()
            .cycle()
            .take(10_000)
            .collect();
        let out = truncate_output(&mixed, 4000);
        assert!(out.chars().count() <= 4000 + TRUNCATION_SUFFIX.chars().count());
        assert!(out.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn truncate_zero_max_chars() {
        let out = truncate_output("hello", 0);
        assert_eq!(out, TRUNCATION_SUFFIX);
    }

    #[test]
    fn placeholder_for_empty_output() {
        assert_eq!(placeholder_if_empty(""), "(no content)");
        assert_eq!(placeholder_if_empty("   "), "(no content)");
        assert_eq!(placeholder_if_empty("hi"), "hi");
    }

    #[test]
    fn chunk_noop_under_cap() {
        let chunks = chunk_message("short", 100);
        assert_eq!(chunks, vec!["short".to_string()]);
    }

    #[test]
    fn chunk_splits_at_newline_in_first_half() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(40));
        let chunks = chunk_message(&text, 30);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.chars().count() <= 30);
        }
    }

    #[test]
    fn chunk_hard_cuts_without_newline() {
        let text = "x".repeat(100);
        let chunks = chunk_message(&text, 30);
        assert!(chunks.iter().all(|c| c.chars().count() <= 30));
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn chunk_every_split_on_char_boundary() {
        let text = "中".repeat(5000);
        let chunks = chunk_message(&text, 37);
        for c in &chunks {
            assert!(std::str::from_utf8(c.as_bytes()).is_ok());
        }
        assert_eq!(chunks.concat(), text);
    }
}
