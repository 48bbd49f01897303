//! Anchor matching for update/delete blocks.
//!
//! Strategies are tried strictly in fidelity order; the first strategy
//! that produces any match decides the outcome. One match wins, two or
//! more is ambiguous (the caller fails the block rather than guess), and
//! a strategy with no matches falls through to the next.

use strsim::levenshtein;

/// Minimum average per-line similarity for the Levenshtein strategy.
const SIMILARITY_THRESHOLD: f64 = 0.9;

/// How a match was established, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchQuality {
    Exact,
    Trimmed,
    Similarity,
    TolerantGaps,
    HallucinatedPrefix,
}

/// A matched line range `[start, end)` in the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptableMatch {
    pub start: usize,
    pub end: usize,
    pub quality: MatchQuality,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Unique(AcceptableMatch),
    Ambiguous(Vec<AcceptableMatch>),
    NotFound,
}

/// Bare closing delimiters that must never be fuzzed over at the head of
/// an anchor: a mismatch here means the model anchored on the wrong
/// scope's closer, and accepting it would splice into the wrong block.
fn is_closing_delimiter(line: &str) -> bool {
    matches!(line.trim(), "}" | ")" | "]" | "};" | ");" | "];" | "```")
}

/// Strip a trailing `//` or `#` comment for tolerant comparison.
fn strip_trailing_comment(line: &str) -> &str {
    let cut = line
        .find("//")
        .into_iter()
        .chain(line.find('#'))
        .min()
        .unwrap_or(line.len());
    line[..cut].trim_end()
}

/// Comparison key for the tolerant strategy: code lines lose their
/// trailing comment, full-line comments keep their text (they are content,
/// not decoration, when they exist on both sides).
fn tolerant_key(line: &str) -> String {
    let trimmed = line.trim();
    let stripped = strip_trailing_comment(trimmed).trim_end();
    if stripped.is_empty() {
        trimmed.to_string()
    } else {
        stripped.to_string()
    }
}

pub fn find_acceptable_match(old_lines: &[String], file_lines: &[String]) -> MatchOutcome {
    if old_lines.is_empty() {
        return MatchOutcome::NotFound;
    }

    let strategies: [fn(&[String], &[String]) -> Vec<AcceptableMatch>; 5] = [
        exact_matches,
        trimmed_matches,
        similarity_matches,
        tolerant_gap_matches,
        hallucinated_prefix_matches,
    ];

    for strategy in strategies {
        let mut matches = strategy(old_lines, file_lines);
        matches.dedup_by_key(|m| (m.start, m.end));
        match matches.len() {
            0 => continue,
            1 => return MatchOutcome::Unique(matches[0]),
            _ => return MatchOutcome::Ambiguous(matches),
        }
    }
    MatchOutcome::NotFound
}

fn windows(file_len: usize, window: usize) -> impl Iterator<Item = usize> {
    0..file_len.saturating_sub(window.saturating_sub(1)).min(file_len)
}

fn exact_matches(old_lines: &[String], file_lines: &[String]) -> Vec<AcceptableMatch> {
    let k = old_lines.len();
    if file_lines.len() < k {
        return Vec::new();
    }
    windows(file_lines.len(), k)
        .filter(|&i| (0..k).all(|j| file_lines[i + j] == old_lines[j]))
        .map(|i| AcceptableMatch {
            start: i,
            end: i + k,
            quality: MatchQuality::Exact,
        })
        .collect()
}

fn trimmed_matches(old_lines: &[String], file_lines: &[String]) -> Vec<AcceptableMatch> {
    let k = old_lines.len();
    if file_lines.len() < k {
        return Vec::new();
    }
    windows(file_lines.len(), k)
        .filter(|&i| (0..k).all(|j| file_lines[i + j].trim() == old_lines[j].trim()))
        .map(|i| AcceptableMatch {
            start: i,
            end: i + k,
            quality: MatchQuality::Trimmed,
        })
        .collect()
}

fn similarity_matches(old_lines: &[String], file_lines: &[String]) -> Vec<AcceptableMatch> {
    let k = old_lines.len();
    if file_lines.len() < k {
        return Vec::new();
    }
    windows(file_lines.len(), k)
        .filter(|&i| {
            let mut total = 0.0;
            let mut counted = 0usize;
            for j in 0..k {
                let a = file_lines[i + j].trim();
                let b = old_lines[j].trim();
                let max_len = a.chars().count().max(b.chars().count());
                if max_len == 0 {
                    continue;
                }
                let distance = levenshtein(a, b);
                total += 1.0 - distance as f64 / max_len as f64;
                counted += 1;
            }
            counted > 0 && total / counted as f64 >= SIMILARITY_THRESHOLD
        })
        .map(|i| AcceptableMatch {
            start: i,
            end: i + k,
            quality: MatchQuality::Similarity,
        })
        .collect()
}

/// Match ignoring extra/missing blank lines and trailing `//`/`#`
/// comments. Works over "significant" lines (non-blank after comment
/// stripping) and maps back to the covering file range.
fn tolerant_gap_matches(old_lines: &[String], file_lines: &[String]) -> Vec<AcceptableMatch> {
    let significant_old: Vec<String> = old_lines
        .iter()
        .map(|l| tolerant_key(l))
        .filter(|l| !l.is_empty())
        .collect();
    if significant_old.is_empty() {
        return Vec::new();
    }

    let significant_file: Vec<(usize, String)> = file_lines
        .iter()
        .enumerate()
        .map(|(i, l)| (i, tolerant_key(l)))
        .filter(|(_, l)| !l.is_empty())
        .collect();

    let k = significant_old.len();
    if significant_file.len() < k {
        return Vec::new();
    }

    (0..=significant_file.len() - k)
        .filter(|&i| (0..k).all(|j| significant_file[i + j].1 == significant_old[j]))
        .map(|i| AcceptableMatch {
            start: significant_file[i].0,
            end: significant_file[i + k - 1].0 + 1,
            quality: MatchQuality::TolerantGaps,
        })
        .collect()
}

/// Drop leading anchor lines the model hallucinated (comments that do not
/// exist in the file) and match the remainder. A mismatching bare closing
/// delimiter at the head is never dropped: that anchor is wrong, not
/// decorative.
fn hallucinated_prefix_matches(old_lines: &[String], file_lines: &[String]) -> Vec<AcceptableMatch> {
    let mut trimmed = old_lines;
    while let Some(head) = trimmed.first() {
        let head_trim = head.trim();
        let head_matches_somewhere = file_lines.iter().any(|l| l.trim() == head_trim);
        if head_matches_somewhere {
            break;
        }
        if is_closing_delimiter(head) {
            // Stray closing delimiter at the head: reject outright.
            return Vec::new();
        }
        let is_comment = head_trim.starts_with("//")
            || head_trim.starts_with('#')
            || head_trim.starts_with("/*")
            || head_trim.starts_with('*');
        if !is_comment {
            break;
        }
        trimmed = &trimmed[1..];
    }

    if trimmed.is_empty() || trimmed.len() == old_lines.len() {
        // Nothing was dropped; earlier strategies already covered this.
        return Vec::new();
    }

    trimmed_matches(trimmed, file_lines)
        .into_iter()
        .map(|m| AcceptableMatch {
            quality: MatchQuality::HallucinatedPrefix,
            ..m
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(src: &str) -> Vec<String> {
        src.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn exact_match_wins() {
        let file = lines("fn a() {}\nfn b() {}\nfn c() {}");
        let old = lines("fn b() {}");
        match find_acceptable_match(&old, &file) {
            MatchOutcome::Unique(m) => {
                assert_eq!((m.start, m.end), (1, 2));
                assert_eq!(m.quality, MatchQuality::Exact);
            }
            other => panic!("expected unique match, got {other:?}"),
        }
    }

    #[test]
    fn trimmed_match_survives_reindentation() {
        let file = lines("    if ready {\n        go();\n    }");
        let old = lines("if ready {\n    go();\n}");
        match find_acceptable_match(&old, &file) {
            MatchOutcome::Unique(m) => {
                assert_eq!((m.start, m.end), (0, 3));
                assert_eq!(m.quality, MatchQuality::Trimmed);
            }
            other => panic!("expected unique match, got {other:?}"),
        }
    }

    #[test]
    fn similarity_tolerates_small_drift() {
        let file = lines("let total = price * quantity;\nrecord(total);");
        let old = lines("let total = price * quantity;\nrecord(totals);");
        match find_acceptable_match(&old, &file) {
            MatchOutcome::Unique(m) => assert_eq!(m.quality, MatchQuality::Similarity),
            other => panic!("expected unique match, got {other:?}"),
        }
    }

    #[test]
    fn tolerant_ignores_blank_lines_and_trailing_comments() {
        let file = lines("start();\n\nmiddle(); // keep in sync\n\nfinish();");
        let old = lines("start();\nmiddle();\nfinish();");
        match find_acceptable_match(&old, &file) {
            MatchOutcome::Unique(m) => {
                assert_eq!((m.start, m.end), (0, 5));
                assert_eq!(m.quality, MatchQuality::TolerantGaps);
            }
            other => panic!("expected unique match, got {other:?}"),
        }
    }

    #[test]
    fn hallucinated_comment_prefix_is_dropped() {
        let file = lines("fn target() {\n    body();\n}");
        let old = lines("// helper the model invented\nfn target() {\n    body();\n}");
        match find_acceptable_match(&old, &file) {
            MatchOutcome::Unique(m) => {
                assert_eq!((m.start, m.end), (0, 3));
                assert_eq!(m.quality, MatchQuality::HallucinatedPrefix);
            }
            other => panic!("expected unique match, got {other:?}"),
        }
    }

    #[test]
    fn stray_closing_delimiter_head_is_rejected() {
        let file = lines("fn real() {\n    work();\n}");
        let old = lines(")\nfn real() {\n    work();\n}");
        assert_eq!(find_acceptable_match(&old, &file), MatchOutcome::NotFound);
    }

    #[test]
    fn two_identical_regions_are_ambiguous() {
        let file = lines("fn a() {\n    shared();\n}\nfn b() {\n    shared();\n}");
        let old = lines("    shared();");
        match find_acceptable_match(&old, &file) {
            MatchOutcome::Ambiguous(matches) => assert_eq!(matches.len(), 2),
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn missing_anchor_is_not_found() {
        let file = lines("fn a() {}");
        let old = lines("fn zz() {}");
        assert_eq!(find_acceptable_match(&old, &file), MatchOutcome::NotFound);
    }

    #[test]
    fn empty_anchor_is_not_found() {
        let file = lines("fn a() {}");
        assert_eq!(find_acceptable_match(&[], &file), MatchOutcome::NotFound);
    }

    #[test]
    fn exact_beats_trimmed_when_both_would_match() {
        // One exact occurrence and one differently indented occurrence: the
        // exact strategy sees a single match and wins before trimming runs.
        let file = lines("call();\n    call();");
        let old = lines("call();");
        match find_acceptable_match(&old, &file) {
            MatchOutcome::Unique(m) => {
                assert_eq!((m.start, m.end), (0, 1));
                assert_eq!(m.quality, MatchQuality::Exact);
            }
            other => panic!("expected unique exact match, got {other:?}"),
        }
    }
}
