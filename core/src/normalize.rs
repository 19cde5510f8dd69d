/// Strip null bytes and control characters, keeping `\n`, `\r` and `\t`.
/// Collapsible whitespace is preserved as-is; an empty result is valid.
pub fn clean_text(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c == '\n' || *c == '\r' || *c == '\t' || !c.is_control())
        .collect()
}

/// Whitespace-delimited token count, the `tokens` figure stored per chunk.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_null_bytes_and_control_characters() {
        let input = "hello\0world\x07!\x1b[0m";
        assert_eq!(clean_text(input), "helloworld![0m");
    }

    #[test]
    fn keeps_newlines_tabs_and_carriage_returns() {
        let input = "line one\n\tline two\r\n";
        assert_eq!(clean_text(input), input);
    }

    #[test]
    fn empty_output_is_valid() {
        assert_eq!(clean_text("\0\x01\x02"), "");
    }

    #[test]
    fn token_count_splits_on_whitespace() {
        assert_eq!(token_count("a b\tc\nd"), 4);
        assert_eq!(token_count("   "), 0);
    }
}
