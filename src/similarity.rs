//! Text similarity for near-duplicate error detection.
//!
//! Messages are normalized (case, whitespace, volatile numbers and hex ids)
//! and compared with the gestalt pattern-matching ratio: twice the number of
//! matching characters divided by the combined length, where matches are found
//! by recursively taking the longest common block.

use regex::Regex;
use std::sync::LazyLock;

// Compile regexes once using LazyLock
static HEX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").unwrap());

static NUMBER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

static WHITESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Upper bound on compared characters per message.
const MAX_COMPARED_CHARS: usize = 2_000;

/// Normalize an error message for comparison.
pub fn normalize(message: &str) -> String {
    let lowered = message.trim().to_lowercase();
    let no_hex = HEX_REGEX.replace_all(&lowered, "0x#");
    let no_numbers = NUMBER_REGEX.replace_all(&no_hex, "#");
    WHITESPACE_REGEX
        .replace_all(&no_numbers, " ")
        .chars()
        .take(MAX_COMPARED_CHARS)
        .collect()
}

/// Similarity ratio in [0, 1] between two normalized messages.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = normalize(a).chars().collect();
    let b: Vec<char> = normalize(b).chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matches = matching_chars(&a, &b);
    (2 * matches) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut stack = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = stack.pop() {
        let (i, j, size) = longest_block(a, b, alo, ahi, blo, bhi);
        if size == 0 {
            continue;
        }
        matched += size;
        if alo < i && blo < j {
            stack.push((alo, i, blo, j));
        }
        if i + size < ahi && j + size < bhi {
            stack.push((i + size, ahi, j + size, bhi));
        }
    }
    matched
}

/// Longest common contiguous block within the given windows.
///
/// Ties resolve to the earliest block in `a`, then in `b`, so results are
/// deterministic.
fn longest_block(
    a: &[char],
    b: &[char],
    alo: usize,
    ahi: usize,
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let width = bhi - blo;
    let mut prev = vec![0usize; width + 1];
    let mut curr = vec![0usize; width + 1];
    let (mut best_i, mut best_j, mut best) = (alo, blo, 0);

    for i in alo..ahi {
        for j in blo..bhi {
            let k = j - blo + 1;
            curr[k] = if a[i] == b[j] { prev[k - 1] + 1 } else { 0 };
            if curr[k] > best {
                best = curr[k];
                best_i = i + 1 - best;
                best_j = j + 1 - best;
            }
        }
        std::mem::swap(&mut prev, &mut curr);
        curr.iter_mut().for_each(|v| *v = 0);
    }
    (best_i, best_j, best)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_messages() {
        assert_eq!(ratio("type mismatch in foo", "type mismatch in foo"), 1.0);
    }

    #[test]
    fn test_completely_different() {
        assert_eq!(ratio("aaaa", "bbbb"), 0.0);
    }

    #[test]
    fn test_known_gestalt_ratio() {
        // "abcd" vs "bcde": longest block "bcd" (3), ratio = 6 / 8
        assert!((ratio("abcd", "bcde") - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_normalization_masks_line_numbers_and_addresses() {
        let a = "error[E0308]: mismatched types at src/lib.rs:42 (ptr 0xdeadbeef)";
        let b = "error[E0309]:   mismatched types at src/lib.rs:117 (ptr 0x1f2e)";
        assert_eq!(ratio(a, b), 1.0);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(ratio("Tests Failed", "tests failed"), 1.0);
    }

    #[test]
    fn test_both_empty_is_identical() {
        assert_eq!(ratio("", "   "), 1.0);
        assert_eq!(ratio("", "x"), 0.0);
    }

    #[test]
    fn test_ratio_is_symmetric_for_distinct_texts() {
        let a = "auditor rejected: missing tests for parser module";
        let b = "auditor rejected: missing docs for lexer module";
        let r = ratio(a, b);
        assert!(r > 0.5 && r < 1.0);
        assert!((r - ratio(b, a)).abs() < 0.1);
    }
}
