/// Rough token estimate for arbitrary text (4 chars per token).
pub fn estimate_text_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate for a JSON value, measured on its compact serialization.
pub fn estimate_json_tokens(value: &serde_json::Value) -> u64 {
    estimate_text_tokens(&value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn json_uses_compact_form() {
        let v = serde_json::json!({"a": 1});
        // {"a":1} is 7 chars
        assert_eq!(estimate_json_tokens(&v), 2);
    }
}
