//! Activation-key parsing and validation.

use std::sync::LazyLock;

use regex::Regex;

/// Shape of a possibly valid activation key: 3 to 5 dash-separated groups
/// of 4-5 uppercase alphanumerics.
static KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Z]{4,5}-[0-9A-Z]{4,5}-[0-9A-Z]{4,5}(?:-[0-9A-Z]{4,5}(?:-[0-9A-Z]{4,5})?)?$")
        .expect("static key regex")
});

/// Whether a string looks like an activation key. The platform has the
/// final word; this only filters out obvious garbage.
pub fn is_possibly_valid_key(key: &str) -> bool {
    KEY_RE.is_match(key)
}

/// Split a pasted blob of keys into candidates.
///
/// Commas count as separators just like newlines; surrounding whitespace is
/// trimmed and empty segments dropped. Invalid-looking candidates are kept
/// so the caller can report them per key.
pub fn split_keys(input: &str) -> Vec<String> {
    input
        .replace(',', "\n")
        .lines()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_three_to_five_groups() {
        assert!(is_possibly_valid_key("AAAAA-BBBBB-CCCCC"));
        assert!(is_possibly_valid_key("AAAA-BBBB-CCCC-DDDD"));
        assert!(is_possibly_valid_key("AAAAA-BBBBB-CCCCC-DDDDD-EEEEE"));
        assert!(is_possibly_valid_key("2B3C4-D5E6F-7G8H9"));
    }

    #[test]
    fn rejects_too_few_groups() {
        assert!(!is_possibly_valid_key("AAAAA"));
        assert!(!is_possibly_valid_key("AAAAA-BBBBB"));
    }

    #[test]
    fn rejects_bad_group_sizes_and_case() {
        assert!(!is_possibly_valid_key("AAA-BBBBB-CCCCC"));
        assert!(!is_possibly_valid_key("AAAAAA-BBBBB-CCCCC"));
        assert!(!is_possibly_valid_key("aaaaa-bbbbb-ccccc"));
        assert!(!is_possibly_valid_key("AAAAA-BBBBB-CCCCC-"));
        assert!(!is_possibly_valid_key(""));
    }

    #[test]
    fn split_handles_commas_newlines_and_whitespace() {
        let input = "AAAAA-BBBBB-CCCCC, DDDDD-EEEEE-FFFFF\n  GGGGG-HHHHH-JJJJJ \n\n";
        let keys = split_keys(input);
        assert_eq!(
            keys,
            vec![
                "AAAAA-BBBBB-CCCCC",
                "DDDDD-EEEEE-FFFFF",
                "GGGGG-HHHHH-JJJJJ"
            ]
        );
    }

    #[test]
    fn split_keeps_invalid_candidates_for_per_key_reporting() {
        let keys = split_keys("not-a-key, AAAAA-BBBBB-CCCCC");
        assert_eq!(keys.len(), 2);
        assert!(!is_possibly_valid_key(&keys[0]));
        assert!(is_possibly_valid_key(&keys[1]));
    }
}
