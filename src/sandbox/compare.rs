/// Compares program output with expected output.
///
/// Both sides are normalized the same way: CRLF becomes LF, whitespace
/// around the whole text is dropped, and trailing whitespace is dropped from
/// every line. The normalized texts must then be identical.
pub fn compare_output(expected: &str, actual: &str) -> bool {
    normalize_output(expected) == normalize_output(actual)
}

pub fn normalize_output(s: &str) -> String {
    s.replace("\r\n", "\n")
        .trim()
        .split('\n')
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_endings_and_trailing_spaces_are_ignored() {
        assert!(compare_output("3\n", "3\r\n"));
        assert!(compare_output("3\n", "3   \n"));
        assert!(compare_output("1 2\n3 4\n", "1 2\t\r\n3 4"));
        assert!(compare_output("\n\nanswer\n\n", "answer"));
    }

    #[test]
    fn test_content_differences_are_detected() {
        assert!(!compare_output("3\n4\n", "3\n"));
        assert!(!compare_output("1 2", "1  2"));
        assert!(!compare_output("a\n\nb", "a\nb"));
        assert!(!compare_output("  indented", "indented x"));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for s in ["3\r\n", "  x  \n y \r\n\n", "", "a\n\n\nb  "] {
            let once = normalize_output(s);
            assert_eq!(normalize_output(&once), once);
        }
    }
}
