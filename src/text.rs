//! Query and chunk text analysis: normalization, language detection, light stemming

use crate::types::Language;
use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;

const TURKISH_LETTERS: &[char] = &['ğ', 'Ğ', 'ş', 'Ş', 'ı', 'İ', 'ç', 'Ç', 'ö', 'Ö', 'ü', 'Ü'];

const TURKISH_STOPWORDS: &[&str] = &[
    "ve", "bir", "bu", "şu", "da", "de", "ile", "için", "ne", "kaç", "mi", "mı", "mu", "mü", "nasıl",
    "neden", "gibi", "olan", "hangi", "nedir", "ama", "çok", "daha", "her", "ki", "o",
];

const ENGLISH_STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "of", "what", "how", "is", "are", "was", "in", "on", "to", "does",
    "do", "why", "which", "where", "about", "that", "this", "it", "for", "with", "by", "from", "be",
];

const ENGLISH_SUFFIXES: &[(&str, &str)] = &[
    ("ational", "ate"),
    ("ization", "ize"),
    ("fulness", "ful"),
    ("ousness", "ous"),
    ("ingly", ""),
    ("ments", ""),
    ("ness", ""),
    ("ment", ""),
    ("edly", ""),
    ("ies", "y"),
    ("ing", ""),
    ("ed", ""),
    ("es", ""),
    ("ly", ""),
    ("s", ""),
];

// Longest first so "lerinden" is tried before "den"
const TURKISH_SUFFIXES: &[&str] = &[
    "lerinden", "larından", "lerinde", "larında", "lerini", "larını", "leri", "ları", "nden", "ndan",
    "nin", "nın", "nun", "nün", "den", "dan", "ten", "tan", "lar", "ler", "de", "da", "te", "ta",
    "yi", "yı", "yu", "yü", "ye", "ya", "in", "ın", "un", "ün", "si", "sı", "su", "sü",
];

const MIN_STEM_CHARS: usize = 3;

/// Guess the language of a short text
pub fn detect_language(text: &str) -> Language {
    let mut turkish = 0usize;
    let mut english = 0usize;

    for word in text.split_whitespace() {
        if word.chars().any(|c| TURKISH_LETTERS.contains(&c)) {
            turkish += 2;
        }
        let lowered = word.to_lowercase();
        let bare = lowered.trim_matches(|c: char| !c.is_alphanumeric());
        if TURKISH_STOPWORDS.contains(&bare) {
            turkish += 1;
        }
        if ENGLISH_STOPWORDS.contains(&bare) {
            english += 1;
        }
    }

    match (turkish, english) {
        (0, 0) => Language::Unknown,
        (t, e) if t > e => Language::Turkish,
        (t, e) if e > t => Language::English,
        _ => Language::Unknown,
    }
}

/// Lowercase with the Turkish dotted/dotless i rules when appropriate
fn lowercase_for(text: &str, language: Language) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match (c, language) {
            ('İ', _) => out.push('i'),
            ('I', Language::Turkish) => out.push('ı'),
            _ => out.extend(c.to_lowercase()),
        }
    }
    out
}

/// NFKC, language-aware lowercase, punctuation folded to spaces, whitespace collapsed
pub fn normalize_for(text: &str, language: Language) -> String {
    let composed: String = text.nfkc().collect();
    let lowered = lowercase_for(&composed, language);
    let folded: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize(text: &str) -> String {
    normalize_for(text, detect_language(text))
}

pub fn tokenize(normalized: &str) -> Vec<&str> {
    normalized.split_whitespace().collect()
}

pub fn is_stopword(token: &str, language: Language) -> bool {
    match language {
        Language::Turkish => TURKISH_STOPWORDS.contains(&token),
        Language::English => ENGLISH_STOPWORDS.contains(&token),
        Language::Unknown => TURKISH_STOPWORDS.contains(&token) || ENGLISH_STOPWORDS.contains(&token),
    }
}

fn strip_suffix_keeping_stem<'a>(token: &'a str, suffix: &str) -> Option<&'a str> {
    let stem = token.strip_suffix(suffix)?;
    (stem.chars().count() >= MIN_STEM_CHARS).then_some(stem)
}

/// Light suffix stripping; tokens in unknown languages pass through unchanged
pub fn stem(token: &str, language: Language) -> String {
    match language {
        Language::English => {
            for (suffix, replacement) in ENGLISH_SUFFIXES {
                if let Some(stem) = strip_suffix_keeping_stem(token, suffix) {
                    return format!("{}{}", stem, replacement);
                }
            }
            token.to_string()
        }
        Language::Turkish => {
            let mut current = token;
            // Two passes cover plural + case stacking ("kitaplarda")
            for _ in 0..2 {
                match TURKISH_SUFFIXES
                    .iter()
                    .find_map(|suffix| strip_suffix_keeping_stem(current, suffix))
                {
                    Some(stem) => current = stem,
                    None => break,
                }
            }
            current.to_string()
        }
        Language::Unknown => token.to_string(),
    }
}

/// Content stems of a normalized text, stopwords removed
pub fn lemma_set(normalized: &str, language: Language) -> BTreeSet<String> {
    tokenize(normalized)
        .into_iter()
        .filter(|t| !is_stopword(t, language))
        .map(|t| stem(t, language))
        .collect()
}

/// Stems of a corpus text under every supported language, so a query
/// lemma matches regardless of which language the chunk was written in
pub fn lemma_variants(text: &str) -> BTreeSet<String> {
    let language = detect_language(text);
    let normalized = normalize_for(text, language);
    let mut out = BTreeSet::new();
    for token in tokenize(&normalized) {
        if is_stopword(token, language) {
            continue;
        }
        for lang in [Language::English, Language::Turkish, Language::Unknown] {
            out.insert(stem(token, lang));
        }
    }
    out
}
