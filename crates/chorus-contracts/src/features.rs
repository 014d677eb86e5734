//! Lexical badges for a model response: script mix, code, lists, links and
//! vocabulary spread. Purely presentational; nothing here feeds grouping.

use std::collections::HashSet;
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const UNKNOWN_LANG: &str = "unknown";
const COMMON_WORDS_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Korean,
    Japanese,
    Chinese,
    Cyrillic,
    Latin,
    Other,
}

// Tie-break order for the dominant script.
const SCRIPTS: [Script; 6] = [
    Script::Korean,
    Script::Japanese,
    Script::Chinese,
    Script::Cyrillic,
    Script::Latin,
    Script::Other,
];

impl Script {
    fn name(self) -> &'static str {
        match self {
            Script::Korean => "korean",
            Script::Japanese => "japanese",
            Script::Chinese => "chinese",
            Script::Cyrillic => "cyrillic",
            Script::Latin => "latin",
            Script::Other => "other",
        }
    }

    fn classify(ch: char) -> Option<Self> {
        if !ch.is_alphabetic() {
            return None;
        }
        let script = match ch as u32 {
            0xAC00..=0xD7A3 | 0x1100..=0x11FF | 0x3130..=0x318F | 0xA960..=0xA97F => {
                Script::Korean
            }
            0x3040..=0x30FF | 0x31F0..=0x31FF => Script::Japanese,
            0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF => Script::Chinese,
            0x0400..=0x052F => Script::Cyrillic,
            0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F | 0x1E00..=0x1EFF => {
                Script::Latin
            }
            _ => Script::Other,
        };
        Some(script)
    }
}

/// Features of one response text, before ids are attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextFeatures {
    pub detected_lang: String,
    pub lang_ratios: IndexMap<String, f64>,
    pub has_code: bool,
    pub code_block_count: usize,
    pub list_item_count: usize,
    pub link_count: usize,
    pub length: usize,
    pub vocabulary_diversity: f64,
    pub sentence_count: usize,
    pub avg_sentence_length: f64,
    pub common_words: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFeatures {
    pub model_id: String,
    pub request_id: String,
    #[serde(flatten)]
    pub features: TextFeatures,
}

impl ResponseFeatures {
    pub fn for_response(model_id: &str, request_id: &str, text: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            request_id: request_id.to_string(),
            features: extract(text),
        }
    }
}

pub fn extract(text: &str) -> TextFeatures {
    let (detected_lang, lang_ratios) = script_ratios(text);
    let code_block_count = code_block_re().find_iter(text).count();
    let sentences = sentences(text);
    let sentence_count = sentences.len();
    let avg_sentence_length = if sentence_count == 0 {
        0.0
    } else {
        sentences
            .iter()
            .map(|sentence| sentence.chars().count())
            .sum::<usize>() as f64
            / sentence_count as f64
    };

    TextFeatures {
        detected_lang,
        lang_ratios,
        has_code: code_block_count > 0,
        code_block_count,
        list_item_count: list_item_re().find_iter(text).count(),
        link_count: link_count(text),
        length: text.chars().count(),
        vocabulary_diversity: vocabulary_diversity(text),
        sentence_count,
        avg_sentence_length,
        common_words: common_words(text),
    }
}

fn script_ratios(text: &str) -> (String, IndexMap<String, f64>) {
    let mut counts = [0usize; SCRIPTS.len()];
    for script in text.chars().filter_map(Script::classify) {
        if let Some(slot) = SCRIPTS.iter().position(|item| *item == script) {
            counts[slot] += 1;
        }
    }
    let total: usize = counts.iter().sum();
    let mut ratios = IndexMap::new();
    if total == 0 {
        return (UNKNOWN_LANG.to_string(), ratios);
    }

    let mut best: Option<(Script, usize)> = None;
    for (script, count) in SCRIPTS.iter().zip(counts) {
        if count == 0 {
            continue;
        }
        ratios.insert(script.name().to_string(), count as f64 / total as f64);
        if best.map(|(_, top)| count > top).unwrap_or(true) {
            best = Some((*script, count));
        }
    }
    let detected = best
        .map(|(script, _)| script.name().to_string())
        .unwrap_or_else(|| UNKNOWN_LANG.to_string());
    (detected, ratios)
}

fn link_count(text: &str) -> usize {
    let markdown = markdown_link_re().find_iter(text).count();
    if markdown > 0 {
        return markdown;
    }
    bare_url_re().find_iter(text).count()
}

fn vocabulary_diversity(text: &str) -> f64 {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&str> = tokens.iter().copied().collect();
    unique.len() as f64 / tokens.len() as f64
}

fn sentences(text: &str) -> Vec<&str> {
    sentence_split_re()
        .split(text)
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

fn common_words(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut counts: IndexMap<&str, usize> = IndexMap::new();
    for word in word_re().find_iter(&lowered) {
        *counts.entry(word.as_str()).or_insert(0) += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    // Stable sort keeps first-appearance order among equal counts.
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .into_iter()
        .take(COMMON_WORDS_LIMIT)
        .map(|(word, _)| word.to_string())
        .collect()
}

fn code_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("code block pattern"))
}

fn list_item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*(?:[-*+] |\d+\. )").expect("list item pattern"))
}

fn markdown_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]\n]*\]\([^)\n]*\)").expect("markdown link pattern"))
}

fn bare_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>()\[\]"']+"#).expect("url pattern"))
}

fn sentence_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+").expect("sentence pattern"))
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w+").expect("word pattern"))
}

#[cfg(test)]
mod tests {
    use super::{extract, ResponseFeatures, UNKNOWN_LANG};

    #[test]
    fn empty_text_has_neutral_features() {
        let features = extract("");
        assert_eq!(features.detected_lang, UNKNOWN_LANG);
        assert!(features.lang_ratios.is_empty());
        assert!(!features.has_code);
        assert_eq!(features.code_block_count, 0);
        assert_eq!(features.list_item_count, 0);
        assert_eq!(features.link_count, 0);
        assert_eq!(features.length, 0);
        assert_eq!(features.vocabulary_diversity, 0.0);
        assert_eq!(features.sentence_count, 0);
        assert!(features.common_words.is_empty());
    }

    #[test]
    fn extraction_is_idempotent() {
        let text = "안녕하세요. Rust is great!\n- one\n- two\n```rust\nfn main() {}\n```";
        assert_eq!(extract(text), extract(text));
    }

    #[test]
    fn detects_dominant_script() {
        let korean = extract("안녕하세요 반갑습니다 ok");
        assert_eq!(korean.detected_lang, "korean");
        assert!(korean.lang_ratios["korean"] > korean.lang_ratios["latin"]);

        let latin = extract("hello there 안녕");
        assert_eq!(latin.detected_lang, "latin");

        let digits_only = extract("12345 !!!");
        assert_eq!(digits_only.detected_lang, UNKNOWN_LANG);
    }

    #[test]
    fn ratios_sum_to_one() {
        let features = extract("abc 가나다 ДВГ");
        let total: f64 = features.lang_ratios.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(features.lang_ratios.len(), 3);
    }

    #[test]
    fn counts_fenced_code_blocks() {
        let text = "intro\n```py\nprint(1)\n```\nmiddle\n```\nx\n```\n```unterminated";
        let features = extract(text);
        assert!(features.has_code);
        assert_eq!(features.code_block_count, 2);
    }

    #[test]
    fn counts_bullets_and_numbered_items() {
        let text = "Steps:\n1. first\n2. second\n  - nested\n* star\n+ plus\nnot-a-list\n-also not";
        assert_eq!(extract(text).list_item_count, 5);
    }

    #[test]
    fn markdown_links_take_precedence_over_bare_urls() {
        let markdown = extract("see [docs](https://a.example) and https://b.example");
        assert_eq!(markdown.link_count, 1);

        let bare = extract("see https://a.example and http://b.example/path?q=1");
        assert_eq!(bare.link_count, 2);
    }

    #[test]
    fn vocabulary_diversity_is_unique_over_total_tokens() {
        let features = extract("a b a b");
        assert!((features.vocabulary_diversity - 0.5).abs() < 1e-9);
        assert_eq!(extract("one two three").vocabulary_diversity, 1.0);
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        assert_eq!(extract("한글").length, 2);
    }

    #[test]
    fn sentence_stats_and_common_words() {
        let features = extract("The cat sat. The dog ran! Did the cat run?");
        assert_eq!(features.sentence_count, 3);
        assert_eq!(features.common_words[0], "the");
        assert_eq!(features.common_words[1], "cat");
        assert!(features.avg_sentence_length > 0.0);
    }

    #[test]
    fn response_features_carry_ids() {
        let features = ResponseFeatures::for_response("gpt", "req-1", "hi");
        assert_eq!(features.model_id, "gpt");
        assert_eq!(features.request_id, "req-1");
        assert_eq!(features.features.length, 2);
    }
}
