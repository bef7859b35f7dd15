//! Text helpers shared by the store, the compactor and the runner

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref FILE_REF_REGEX: Regex =
        Regex::new(r"[\w./]+\.(?:py|js|ts|jsx|tsx|php|html|css|sql|json|yaml|yml|md)\b").unwrap();
    static ref CODE_FENCE_REGEX: Regex = Regex::new(r"(?m)^```[a-zA-Z]*\s*$").unwrap();
}

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

pub struct TextUtils;

impl TextUtils {
    /// Check if text contains pattern (case-insensitive)
    pub fn contains_ignore_case(text: &str, pattern: &str) -> bool {
        if pattern.len() > text.len() {
            return false;
        }
        text.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Coarse token estimate: one token per four characters.
    pub fn estimate_tokens(text: &str) -> usize {
        text.chars().count() / CHARS_PER_TOKEN
    }

    /// First `max_chars` characters, never splitting a code point.
    pub fn take_chars(text: &str, max_chars: usize) -> &str {
        match text.char_indices().nth(max_chars) {
            Some((idx, _)) => &text[..idx],
            None => text,
        }
    }

    /// Last `max_chars` characters, never splitting a code point.
    pub fn take_last_chars(text: &str, max_chars: usize) -> &str {
        if max_chars == 0 {
            return "";
        }
        match text.char_indices().rev().nth(max_chars - 1) {
            Some((idx, _)) => &text[idx..],
            None => text,
        }
    }

    /// Truncate text to max characters with ellipsis if needed
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result = String::with_capacity(max_chars);
            result.push_str(Self::take_chars(text, max_chars - 3));
            result.push_str("...");
            Cow::Owned(result)
        }
    }

    /// Keep the head and tail of an oversized message with a marker naming the
    /// number of estimated tokens dropped between them.
    pub fn truncate_middle(text: &str, max_tokens: usize) -> Cow<'_, str> {
        let tokens = Self::estimate_tokens(text);
        if tokens <= max_tokens {
            return Cow::Borrowed(text);
        }
        let char_limit = max_tokens * CHARS_PER_TOKEN;
        let keep = char_limit * 2 / 5;
        Cow::Owned(format!(
            "{}\n\n[... truncated {} tokens ...]\n\n{}",
            Self::take_chars(text, keep),
            tokens - max_tokens,
            Self::take_last_chars(text, keep),
        ))
    }

    /// Remove markdown code fences wrapping a model reply.
    pub fn strip_code_fences(text: &str) -> Cow<'_, str> {
        let trimmed = text.trim();
        if trimmed.starts_with("```") {
            Cow::Owned(CODE_FENCE_REGEX.replace_all(trimmed, "").trim().to_string())
        } else {
            Cow::Borrowed(trimmed)
        }
    }

    /// Source-file paths mentioned in free text, in order of first appearance.
    pub fn file_references(text: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for m in FILE_REF_REGEX.find_iter(text) {
            let path = m.as_str().to_string();
            if !seen.contains(&path) {
                seen.push(path);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_counts_chars() {
        assert_eq!(TextUtils::estimate_tokens(""), 0);
        assert_eq!(TextUtils::estimate_tokens("abcdefgh"), 2);
        assert_eq!(TextUtils::estimate_tokens("ééééééééé"), 2);
    }

    #[test]
    fn test_truncate_middle_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(400), "b".repeat(400));
        let out = TextUtils::truncate_middle(&text, 100);
        assert!(out.starts_with(&"a".repeat(160)));
        assert!(out.ends_with(&"b".repeat(160)));
        assert!(out.contains("[... truncated 100 tokens ...]"));
    }

    #[test]
    fn test_truncate_middle_leaves_small_text() {
        assert!(matches!(TextUtils::truncate_middle("short", 10), Cow::Borrowed("short")));
    }

    #[test]
    fn test_take_last_chars_is_char_safe() {
        assert_eq!(TextUtils::take_last_chars("héllo", 4), "éllo");
        assert_eq!(TextUtils::take_last_chars("hi", 5), "hi");
        assert_eq!(TextUtils::take_last_chars("hi", 0), "");
    }

    #[test]
    fn test_strip_code_fences() {
        let raw = "```json\n{\"a\": 1}\n```";
        assert_eq!(TextUtils::strip_code_fences(raw), "{\"a\": 1}");
        assert_eq!(TextUtils::strip_code_fences(" {} "), "{}");
    }

    #[test]
    fn test_file_references_dedupes() {
        let refs = TextUtils::file_references("edited src/app.ts and src/app.ts then config.yaml");
        assert_eq!(refs, vec!["src/app.ts".to_string(), "config.yaml".to_string()]);
    }

    #[test]
    fn test_contains_ignore_case() {
        assert!(TextUtils::contains_ignore_case("all good, task completed.", "TASK COMPLETED"));
        assert!(!TextUtils::contains_ignore_case("task", "TASK COMPLETED"));
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(TextUtils::truncate_with_ellipsis("abcdef", 5), "ab...");
        assert_eq!(TextUtils::truncate_with_ellipsis("abc", 5), "abc");
    }
}
