//! Item-name identity: canonical keys, legacy surface variants, presentation names.

use std::collections::BTreeSet;

/// Suffixes whose plural takes `-es`. Anything else ending in `-es` (`cheeses`) only
/// loses the final `s`.
const ES_PLURAL_STEMS: [&str; 6] = ["sses", "shes", "ches", "xes", "zes", "oes"];

/// Endings that look plural but are not: `glass`, `hummus`, `tennis`.
const NON_PLURAL_S_ENDINGS: [&str; 3] = ["ss", "us", "is"];

/// Map a free-text item name to its canonical identity key.
///
/// Returns `None` when nothing in `[a-z0-9 ]` survives normalization; callers drop such items.
#[must_use]
pub fn canonicalize(raw: &str) -> Option<String> {
    let lowered = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let stripped = lowered
        .chars()
        .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == ' ')
        .collect::<String>();
    // Stripping punctuation can leave doubled or edge spaces behind.
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(singularize(&collapsed))
}

/// Single suffix pass over the last word; first matching rule wins.
fn singularize(key: &str) -> String {
    let (head, word) = match key.rfind(' ') {
        Some(index) => key.split_at(index + 1),
        None => ("", key),
    };

    let singular = if word.len() > 3 && word.ends_with("ies") {
        format!("{}y", &word[..word.len() - 3])
    } else if word.len() > 2 && ES_PLURAL_STEMS.iter().any(|stem| word.ends_with(stem)) {
        word[..word.len() - 2].to_string()
    } else if word.len() > 1
        && word.ends_with('s')
        && !NON_PLURAL_S_ENDINGS.iter().any(|ending| word.ends_with(ending))
    {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    };

    format!("{head}{singular}")
}

/// Surface forms a pre-canonicalization record may have been stored under.
///
/// Not an inverse of [`canonicalize`]; the variants are not necessarily canonical themselves.
#[must_use]
pub fn generate_variants(canonical_key: &str) -> BTreeSet<String> {
    let mut variants = BTreeSet::new();
    variants.insert(canonical_key.to_string());
    if let Some(stem) = canonical_key.strip_suffix('y') {
        variants.insert(format!("{stem}ies"));
    }
    variants.insert(format!("{canonical_key}s"));
    variants.insert(format!("{canonical_key}es"));
    variants
}

/// Title-cased, whitespace-collapsed presentation name.
#[must_use]
pub fn display_name(raw: &str) -> String {
    raw.split_whitespace().map(title_case_word).collect::<Vec<_>>().join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(raw: &str) -> String {
        canonicalize(raw).unwrap_or_else(|| panic!("`{raw}` should canonicalize"))
    }

    #[test]
    fn canonicalize_normalizes_case_whitespace_and_punctuation() {
        assert_eq!(key("  Green   Onions! "), "green onion");
        assert_eq!(key("Ben & Jerry's"), "ben jerry");
        assert_eq!(key("2% Milk"), "2 milk");
    }

    #[test]
    fn canonicalize_rejects_names_without_usable_characters() {
        assert_eq!(canonicalize("   "), None);
        assert_eq!(canonicalize("!!!"), None);
        assert_eq!(canonicalize("牛乳"), None);
    }

    #[test]
    fn singular_rules_apply_in_priority_order() {
        assert_eq!(key("berries"), "berry");
        assert_eq!(key("tomatoes"), "tomato");
        assert_eq!(key("peaches"), "peach");
        assert_eq!(key("apples"), "apple");
        assert_eq!(key("cheeses"), "cheese");
        assert_eq!(key("eggs"), "egg");
    }

    #[test]
    fn short_and_non_plural_words_are_left_alone() {
        assert_eq!(key("s"), "s");
        assert_eq!(key("glass"), "glass");
        assert_eq!(key("hummus"), "hummus");
        assert_eq!(key("kiwi"), "kiwi");
        assert_eq!(key("a s"), "a s");
    }

    #[test]
    fn variants_cover_legacy_plural_forms() {
        let variants = generate_variants("berry");
        assert!(variants.contains("berry"));
        assert!(variants.contains("berries"));
        assert!(variants.contains("berrys"));
        assert!(variants.contains("berryes"));

        let variants = generate_variants("apple");
        assert_eq!(variants.len(), 3);
        assert!(variants.contains("apples"));
    }

    #[test]
    fn display_name_title_cases_each_word() {
        assert_eq!(display_name("  green   ONIONS "), "Green Onions");
        assert_eq!(display_name("apples"), "Apples");
    }

    proptest! {
        #[test]
        fn canonicalize_is_idempotent(raw in "[ -~]{0,40}") {
            if let Some(once) = canonicalize(&raw) {
                prop_assert_eq!(canonicalize(&once), Some(once.clone()));
            }
        }

        #[test]
        fn canonicalize_is_idempotent_for_plural_shaped_words(
            stem in "[a-z]{1,8}",
            suffix in prop::sample::select(vec!["s", "es", "ies", "ss", "us", "shes", "oes", "sses"]),
        ) {
            let raw = format!("{stem}{suffix}");
            if let Some(once) = canonicalize(&raw) {
                prop_assert_eq!(canonicalize(&once), Some(once.clone()));
            }
        }
    }
}
