use once_cell::sync::Lazy;
use regex::Regex;
use whatlang::{Lang, Script};

/// URLs, `scene N` markers, `(Speaker)` tags and quotes carry no language
/// signal and skew short texts.
static STORY_MARKUP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?im)https?://\S+|www\.\S+|^\s*scene\s+\d+\s*$|\([^)]{1,40}\)|""#)
        .expect("valid story markup regex")
});

const MIN_LETTERS: usize = 2;

const LANGUAGE_CODES: &[(&str, Lang)] = &[
    ("en", Lang::Eng),
    ("ko", Lang::Kor),
    ("ja", Lang::Jpn),
    ("zh", Lang::Cmn),
    ("es", Lang::Spa),
    ("pt", Lang::Por),
    ("fr", Lang::Fra),
    ("de", Lang::Deu),
    ("it", Lang::Ita),
    ("ru", Lang::Rus),
    ("vi", Lang::Vie),
    ("th", Lang::Tha),
    ("id", Lang::Ind),
];

fn lang_from_code(code: &str) -> Option<Lang> {
    let primary = code.split(['-', '_']).next()?.trim().to_lowercase();
    LANGUAGE_CODES
        .iter()
        .find(|(known, _)| *known == primary)
        .map(|(_, lang)| *lang)
}

pub fn detect_language(text: &str) -> Option<Lang> {
    let cleaned = STORY_MARKUP_RE.replace_all(text, " ");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().filter(|ch| ch.is_alphabetic()).count() < MIN_LETTERS {
        return None;
    }

    let info = whatlang::detect(&cleaned)?;
    // Latin-script languages are easy to confuse on short input.
    let min_confidence = if info.script() == Script::Latin { 0.68 } else { 0.5 };
    (info.is_reliable() || info.confidence() >= min_confidence).then(|| info.lang())
}

/// Picks the language generated copy should be written in: an explicit
/// language code, then the first candidate text with a confident detection,
/// then `default_language`.
pub fn resolve_output_language(
    text_candidates: &[&str],
    language_code: Option<&str>,
    default_language: &str,
) -> String {
    language_code
        .and_then(lang_from_code)
        .or_else(|| text_candidates.iter().find_map(|text| detect_language(text)))
        .map(|lang| lang.eng_name().to_string())
        .unwrap_or_else(|| default_language.to_string())
}
