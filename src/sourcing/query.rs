//! Search-term derivation from a marketplace listing title.

const NOISE_WORDS: &[&str] = &[
    "new", "used", "rare", "vintage", "limited", "edition", "free", "shipping", "japan",
    "japanese", "authentic", "genuine", "original", "official", "sealed", "mint", "box", "with",
    "and", "the", "for", "from",
];

const MAX_TERMS: usize = 5;

/// Builds a short domestic search query: model numbers first (at most two),
/// then one scale notation, then the remaining meaningful words.
pub fn derive_query(title: &str) -> String {
    let title = strip_brackets(title);
    let tokens: Vec<&str> = title.split_whitespace().collect();

    let mut parts: Vec<String> = Vec::new();
    for model in tokens.iter().filter_map(|t| model_number(t)).take(2) {
        push_unique(&mut parts, model);
    }
    if let Some(scale) = tokens.iter().find_map(|t| scale_notation(t)) {
        push_unique(&mut parts, scale);
    }

    let words = tokens
        .iter()
        .map(|token| clean_word(token))
        .filter(|word| word.chars().count() >= 2)
        .filter(|word| !word.chars().all(|c| c.is_ascii_digit()))
        .filter(|word| !NOISE_WORDS.contains(&word.to_lowercase().as_str()))
        .take(MAX_TERMS);
    for word in words {
        push_unique(&mut parts, word);
    }

    parts.truncate(MAX_TERMS);
    parts.join(" ")
}

fn push_unique(parts: &mut Vec<String>, value: String) {
    if !parts.iter().any(|p| p.eq_ignore_ascii_case(&value)) {
        parts.push(value);
    }
}

/// Removes `[...]`, `(...)` and `【...】` segments, which usually carry
/// seller boilerplate rather than product identity.
fn strip_brackets(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut depth = 0usize;
    for c in title.chars() {
        match c {
            '[' | '(' | '【' => depth += 1,
            ']' | ')' | '】' => {
                depth = depth.saturating_sub(1);
                out.push(' ');
            }
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

fn clean_word(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// One to four letters, an optional hyphen, one to five digits and an
/// optional alphanumeric tail, e.g. `RX-78-2`, `MG100`, `NV65HR2`.
pub(super) fn model_number(token: &str) -> Option<String> {
    let word = clean_word(token);
    let chars: Vec<char> = word.chars().collect();
    let letters = chars.iter().take_while(|c| c.is_ascii_alphabetic()).count();
    if !(1..=4).contains(&letters) {
        return None;
    }
    let mut idx = letters;
    if chars.get(idx) == Some(&'-') {
        idx += 1;
    }
    let digits = chars[idx..].iter().take_while(|c| c.is_ascii_digit()).count();
    if !(1..=5).contains(&digits) {
        return None;
    }
    idx += digits;
    if chars.get(idx) == Some(&'-') {
        idx += 1;
    }
    let tail_ok = chars[idx..]
        .iter()
        .all(|c| c.is_ascii_alphanumeric() || *c == '-');
    tail_ok.then(|| word.to_uppercase())
}

/// `1/100`, `1:144` and similar kit scales.
fn scale_notation(token: &str) -> Option<String> {
    let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '/' && c != ':');
    let rest = token.strip_prefix("1/").or_else(|| token.strip_prefix("1:"))?;
    ((2..=4).contains(&rest.len()) && rest.chars().all(|c| c.is_ascii_digit()))
        .then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_numbers_and_scale_lead_the_query() {
        let query = derive_query("Bandai MG 1/100 RX-78-2 Gundam Ver 3.0 NEW Japan");
        assert_eq!(query, "RX-78-2 1/100 Bandai MG Gundam");
    }

    #[test]
    fn noise_and_brackets_are_dropped() {
        let query = derive_query("[Used] Makita Cordless Drill (Free Shipping) from Japan");
        assert_eq!(query, "Makita Cordless Drill");
    }

    #[test]
    fn query_is_capped_at_five_terms() {
        let query = derive_query("Alpha Beta Gamma Delta Epsilon Zeta Eta");
        assert_eq!(query.split_whitespace().count(), 5);
    }

    #[test]
    fn recognises_model_number_shapes() {
        assert_eq!(model_number("NV65HR2"), Some("NV65HR2".into()));
        assert_eq!(model_number("rx-78-2,"), Some("RX-78-2".into()));
        assert_eq!(model_number("Gundam"), None);
        assert_eq!(model_number("2024"), None);
        assert_eq!(scale_notation("1:144"), Some("1:144".into()));
        assert_eq!(scale_notation("1/1"), None);
    }
}
