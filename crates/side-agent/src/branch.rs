//! Branch naming for agent-created work branches.
//!
//! Names look like `side/add-retry-logic`: the fixed prefix plus a
//! kebab-case suffix of two to four words. Collisions get a numeric
//! suffix before falling back to words derived from the requirements.

use once_cell::sync::Lazy;
use regex::Regex;

pub const BRANCH_PREFIX: &str = "side/";
const MAX_LEN: usize = 80;
const MIN_WORDS: usize = 2;
const MAX_WORDS: usize = 4;
const MAX_COLLISION_SUFFIX: u32 = 9;

static SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap());

/// Validate a full branch name against the naming contract.
pub fn is_valid_branch_name(name: &str) -> bool {
    let Some(suffix) = name.strip_prefix(BRANCH_PREFIX) else {
        return false;
    };
    if name.len() > MAX_LEN {
        return false;
    }
    if !SUFFIX_RE.is_match(suffix) {
        return false;
    }
    let words = suffix.split('-').count();
    (MIN_WORDS..=MAX_WORDS).contains(&words)
}

/// Build a candidate name from free-form words: lowercased, stripped to
/// `[a-z0-9]`, clipped to the word window. `None` when fewer than two
/// usable words remain.
pub fn branch_name_from_words<I, S>(words: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let cleaned: Vec<String> = words
        .into_iter()
        .map(|w| {
            w.as_ref()
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(MAX_WORDS)
        .collect();
    if cleaned.len() < MIN_WORDS {
        return None;
    }

    let mut name = format!("{BRANCH_PREFIX}{}", cleaned.join("-"));
    // Clip whole words until the cap holds.
    let mut kept = cleaned.len();
    while name.len() > MAX_LEN && kept > MIN_WORDS {
        kept -= 1;
        name = format!("{BRANCH_PREFIX}{}", cleaned[..kept].join("-"));
    }
    is_valid_branch_name(&name).then_some(name)
}

/// Pick a free name: the candidate itself, then `-N` suffixes up to 9,
/// then a fallback candidate derived from the requirements.
pub fn resolve_branch_name<F>(
    candidate: &str,
    fallback_words: &[String],
    mut taken: F,
) -> Option<String>
where
    F: FnMut(&str) -> bool,
{
    if is_valid_branch_name(candidate) && !taken(candidate) {
        return Some(candidate.to_string());
    }
    for n in 1..=MAX_COLLISION_SUFFIX {
        let numbered = format!("{candidate}-{n}");
        if is_valid_branch_name(&numbered) && !taken(&numbered) {
            return Some(numbered);
        }
    }
    let fallback = branch_name_from_words(fallback_words)?;
    if !taken(&fallback) {
        return Some(fallback);
    }
    for n in 1..=MAX_COLLISION_SUFFIX {
        let numbered = format!("{fallback}-{n}");
        if is_valid_branch_name(&numbered) && !taken(&numbered) {
            return Some(numbered);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn validator_accepts_well_formed_names() {
        assert!(is_valid_branch_name("side/foo-bar"));
        assert!(is_valid_branch_name("side/add-retry-logic"));
        assert!(is_valid_branch_name("side/fix-io2-races-now"));
    }

    #[test]
    fn validator_rejects_malformed_names() {
        assert!(!is_valid_branch_name("side/-foo"));
        assert!(!is_valid_branch_name("side/foo-"));
        assert!(!is_valid_branch_name("side/foo--bar"));
        assert!(!is_valid_branch_name("side/FOO"));
        assert!(!is_valid_branch_name("side/one"));
        assert!(!is_valid_branch_name("side/a-b-c-d-e"));
        assert!(!is_valid_branch_name("other/foo-bar"));
        assert!(!is_valid_branch_name(&format!(
            "side/{}-tail",
            "x".repeat(90)
        )));
    }

    #[test]
    fn words_are_cleaned_and_clipped() {
        assert_eq!(
            branch_name_from_words(["Add", "Retry!", "Logic"]).as_deref(),
            Some("side/add-retry-logic")
        );
        assert_eq!(
            branch_name_from_words(["fix", "the", "flaky", "import", "pipeline"]).as_deref(),
            Some("side/fix-the-flaky-import")
        );
        assert_eq!(branch_name_from_words(["solo"]), None);
        assert_eq!(branch_name_from_words(["???", "!!!"]), None);
    }

    #[test]
    fn long_names_drop_words_to_fit() {
        let long = "w".repeat(35);
        let name = branch_name_from_words([long.as_str(), long.as_str(), "tail"]).unwrap();
        assert!(name.len() <= 80);
        assert!(is_valid_branch_name(&name));
    }

    #[test]
    fn collisions_take_numeric_suffixes() {
        let mut taken: HashSet<String> = HashSet::new();
        taken.insert("side/add-cache".into());
        taken.insert("side/add-cache-1".into());
        let resolved = resolve_branch_name("side/add-cache", &[], |name| taken.contains(name));
        assert_eq!(resolved.as_deref(), Some("side/add-cache-2"));
    }

    #[test]
    fn exhausted_suffixes_fall_back_to_requirement_words() {
        let mut taken: HashSet<String> = HashSet::new();
        taken.insert("side/add-cache".to_string());
        for n in 1..=9 {
            taken.insert(format!("side/add-cache-{n}"));
        }
        let fallback = vec!["speed".to_string(), "up".to_string(), "reads".to_string()];
        let resolved = resolve_branch_name("side/add-cache", &fallback, |name| taken.contains(name));
        assert_eq!(resolved.as_deref(), Some("side/speed-up-reads"));
    }
}
