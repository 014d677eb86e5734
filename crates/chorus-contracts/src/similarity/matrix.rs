use std::collections::HashMap;
use std::sync::OnceLock;

use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pairwise similarity scores between the responses of one turn.
///
/// Symmetric by convention only. Row and column order follow the order in
/// which ids were first seen, which is also the tie-break order for grouping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityMatrix {
    pub request_id: String,
    pub scores: IndexMap<String, IndexMap<String, f64>>,
}

impl SimilarityMatrix {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            scores: IndexMap::new(),
        }
    }

    /// Reads a backend `similarityMatrix` object. Scores may arrive as numbers
    /// or numeric strings; anything else is dropped and reads back as 0.
    pub fn from_value(request_id: impl Into<String>, value: &Value) -> Option<Self> {
        let rows = value.as_object()?;
        let mut matrix = Self::new(request_id);
        for (row_id, row) in rows {
            let entry = matrix.scores.entry(row_id.clone()).or_default();
            let Some(cols) = row.as_object() else {
                continue;
            };
            for (col_id, score) in cols {
                let parsed = match score {
                    Value::Number(number) => number.as_f64(),
                    Value::String(raw) => raw.trim().parse::<f64>().ok(),
                    _ => None,
                };
                if let Some(parsed) = parsed.filter(|value| value.is_finite()) {
                    entry.insert(col_id.clone(), parsed);
                }
            }
        }
        Some(matrix)
    }

    pub fn set(&mut self, a: &str, b: &str, score: f64) {
        self.scores
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string(), score);
    }

    /// Score from `a`'s row. Missing and NaN scores are 0.
    pub fn score(&self, a: &str, b: &str) -> f64 {
        self.scores
            .get(a)
            .and_then(|row| row.get(b))
            .copied()
            .filter(|value| !value.is_nan())
            .unwrap_or(0.0)
    }

    /// Every id in the matrix, rows first, then ids that only appear as columns.
    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: IndexSet<&str> = IndexSet::new();
        for (row_id, row) in &self.scores {
            ids.insert(row_id.as_str());
            for col_id in row.keys() {
                ids.insert(col_id.as_str());
            }
        }
        // Rows keep priority over columns seen earlier inside another row.
        let mut ordered: Vec<String> = self.scores.keys().cloned().collect();
        for id in ids {
            if !self.scores.contains_key(id) {
                ordered.push(id.to_string());
            }
        }
        ordered
    }

    pub fn len(&self) -> usize {
        self.model_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Builds the matrix locally from response texts with TF-IDF cosine
    /// similarity over word unigrams and bigrams.
    pub fn from_texts(request_id: impl Into<String>, responses: &IndexMap<String, String>) -> Self {
        let docs: Vec<Vec<String>> = responses
            .values()
            .map(|text| ngrams(&preprocess(text)))
            .collect();
        let vectors = tfidf_vectors(&docs);

        let mut matrix = Self::new(request_id);
        let ids: Vec<&String> = responses.keys().collect();
        for (i, a) in ids.iter().enumerate() {
            for (j, b) in ids.iter().enumerate() {
                let score = if i == j {
                    1.0
                } else {
                    cosine(&vectors[i], &vectors[j])
                };
                matrix.set(a, b, score);
            }
        }
        matrix
    }
}

fn preprocess(text: &str) -> String {
    static CODE: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();
    let code = CODE.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("code pattern"));
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag pattern"));
    let space = SPACE.get_or_init(|| Regex::new(r"\s+").expect("space pattern"));

    let lowered = text.to_lowercase();
    let without_code = code.replace_all(&lowered, " code_block ");
    let without_tags = tags.replace_all(&without_code, "");
    space.replace_all(&without_tags, " ").trim().to_string()
}

fn ngrams(text: &str) -> Vec<String> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let token = TOKEN.get_or_init(|| Regex::new(r"\b\w\w+\b").expect("token pattern"));
    let words: Vec<&str> = token.find_iter(text).map(|m| m.as_str()).collect();
    let mut terms: Vec<String> = words.iter().map(|word| word.to_string()).collect();
    terms.extend(words.windows(2).map(|pair| format!("{} {}", pair[0], pair[1])));
    terms
}

fn tfidf_vectors(docs: &[Vec<String>]) -> Vec<HashMap<String, f64>> {
    let n = docs.len() as f64;
    let mut df: HashMap<&str, usize> = HashMap::new();
    for doc in docs {
        let mut seen: IndexSet<&str> = IndexSet::new();
        for term in doc {
            if seen.insert(term.as_str()) {
                *df.entry(term.as_str()).or_insert(0) += 1;
            }
        }
    }

    docs.iter()
        .map(|doc| {
            let mut tf: HashMap<String, f64> = HashMap::new();
            for term in doc {
                *tf.entry(term.clone()).or_insert(0.0) += 1.0;
            }
            for (term, weight) in tf.iter_mut() {
                let doc_freq = df.get(term.as_str()).copied().unwrap_or(0) as f64;
                *weight *= ((1.0 + n) / (1.0 + doc_freq)).ln() + 1.0;
            }
            let norm = tf.values().map(|w| w * w).sum::<f64>().sqrt();
            if norm > 0.0 {
                for weight in tf.values_mut() {
                    *weight /= norm;
                }
            }
            tf
        })
        .collect()
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, weight)| large.get(term).map(|other| weight * other))
        .sum::<f64>()
        .clamp(0.0, 1.0)
}
