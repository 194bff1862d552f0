//! How closely an offer title matches what we searched for.

use super::query::model_number;
use std::collections::BTreeSet;

const MAX_SCORE: f64 = 1.5;
const MODEL_BONUS: f64 = 0.3;
const QUANTITY_BONUS: f64 = 0.2;
const PARTIAL_WEIGHT: f64 = 0.7;

const QUANTITY_UNITS: &[&str] = &["ml", "g", "kg", "oz", "cm", "mm", "pcs", "pc"];

/// Scores `candidate` against `reference` in `[0, 1.5]`.
///
/// Shared words count fully; a word of three or more characters that only
/// shows up inside the other title's squashed text counts 0.7. The total is
/// divided by the shorter word set. Shared model numbers add 0.3 each and
/// shared quantities such as `50ml` add 0.2 each.
///
/// Returns `None` when either side has no comparable words, which is the
/// usual case for titles written only in Japanese script.
pub fn title_similarity(reference: &str, candidate: &str) -> Option<f64> {
    let left = words(reference);
    let right = words(candidate);
    if left.is_empty() || right.is_empty() {
        return None;
    }

    let mut bonus = 0.0;
    let shared_models = models(reference).intersection(&models(candidate)).count();
    bonus += MODEL_BONUS * shared_models as f64;
    let shared_quantities = quantities(reference)
        .intersection(&quantities(candidate))
        .count();
    bonus += QUANTITY_BONUS * shared_quantities as f64;

    let common = left.intersection(&right).count();
    // words found only inside the other title's squashed text
    let partial_in = |set: &BTreeSet<String>, other: &BTreeSet<String>, squashed: &str| {
        set.iter()
            .filter(|w| {
                w.len() >= 3 && !other.contains(w.as_str()) && squashed.contains(w.as_str())
            })
            .count()
    };
    let partial = partial_in(&left, &right, &squash(candidate))
        + partial_in(&right, &left, &squash(reference));

    let matches = common as f64 + partial as f64 * PARTIAL_WEIGHT;
    let base = matches / left.len().min(right.len()) as f64;
    Some((base + bonus).min(MAX_SCORE))
}

/// Lowercase ASCII alphanumeric runs of at least two characters.
fn words(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() >= 2)
        .map(str::to_string)
        .collect()
}

fn squash(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

fn models(text: &str) -> BTreeSet<String> {
    text.split_whitespace().filter_map(model_number).collect()
}

/// `50ml`, `100 g`, `1.5kg`: a number directly followed by a unit, or by a
/// unit as the next token.
fn quantities(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ')')
        .filter(|t| !t.is_empty())
        .collect();
    let mut found = BTreeSet::new();
    for (idx, token) in tokens.iter().enumerate() {
        let digits = token
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .count();
        if digits == 0 || !token.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let (number, rest) = token.split_at(digits);
        let unit = if rest.is_empty() {
            tokens.get(idx + 1).copied().unwrap_or_default()
        } else {
            rest
        };
        if QUANTITY_UNITS.contains(&unit) {
            found.insert(format!("{number}{unit}"));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_model_numbers_score_high() {
        let score = title_similarity(
            "RX-78-2 1/100 Bandai MG Gundam",
            "BANDAI MG 1/100 RX-78-2 ガンダム Ver.3.0",
        )
        .expect("comparable");
        assert!(score >= 1.0, "{score}");
    }

    #[test]
    fn unrelated_titles_score_low() {
        let score = title_similarity("RX-78-2 1/100 Bandai MG Gundam", "USB charging cable 2m")
            .expect("comparable");
        assert!(score < 0.2, "{score}");
    }

    #[test]
    fn shared_quantities_add_a_bonus() {
        let same = title_similarity("Saso Eau de Parfum 50ml", "Saso parfum 50 ml")
            .expect("comparable");
        let other = title_similarity("Saso Eau de Parfum 50ml", "Saso parfum 100 ml")
            .expect("comparable");
        assert!(same > other, "{same} vs {other}");
        assert!(quantities("Saso 50 ml 1.5kg").contains("1.5kg"));
        assert!(quantities("Saso 50 ml").contains("50ml"));
    }

    #[test]
    fn partial_words_count_less_than_exact_ones() {
        let exact = title_similarity("makita cordless drill", "makita cordless drill")
            .expect("comparable");
        let partial =
            title_similarity("makita cordless drill", "makita drillset").expect("comparable");
        assert_eq!(exact, 1.0);
        assert!(partial > 0.0 && partial < exact, "{partial}");
    }

    #[test]
    fn titles_without_latin_words_are_not_comparable() {
        assert_eq!(title_similarity("Gundam", "ガンダム 限定"), None);
        assert_eq!(title_similarity("", "anything"), None);
    }

    #[test]
    fn score_is_capped() {
        let score = title_similarity(
            "RX-78-2 MG100 NV65HR2 50ml 100g",
            "RX-78-2 MG100 NV65HR2 50ml 100g",
        )
        .expect("comparable");
        assert_eq!(score, MAX_SCORE);
    }
}
