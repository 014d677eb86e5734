use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const PROS_KEYS: &[&str] = &["pros", "장점", "strengths"];
const CONS_KEYS: &[&str] = &["cons", "단점", "weaknesses"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelAssessment {
    pub pros: Vec<String>,
    pub cons: Vec<String>,
}

/// The analyzer model's verdict for one turn: which answer is best and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimalAnswer {
    pub key: String,
    pub request_id: String,
    pub bot_name: Option<String>,
    pub best_response: String,
    pub assessments: IndexMap<String, ModelAssessment>,
    pub reasoning: String,
    pub errors: Vec<String>,
    pub user_message: String,
    pub timestamp_ms: i64,
}

/// Reads the per-model `analysis` object. Each entry may carry pros/cons under
/// English or Korean keys, as a string or a list of strings.
pub fn parse_assessments(value: &Value) -> IndexMap<String, ModelAssessment> {
    let mut out = IndexMap::new();
    let Some(rows) = value.as_object() else {
        return out;
    };
    for (model, row) in rows {
        let assessment = match row {
            Value::Object(fields) => ModelAssessment {
                pros: collect_texts(PROS_KEYS.iter().filter_map(|key| fields.get(*key))),
                cons: collect_texts(CONS_KEYS.iter().filter_map(|key| fields.get(*key))),
            },
            Value::String(text) if !text.trim().is_empty() => ModelAssessment {
                pros: vec![text.trim().to_string()],
                cons: Vec::new(),
            },
            _ => continue,
        };
        out.insert(model.to_ascii_lowercase(), assessment);
    }
    out
}

/// Flattens the optional workflow `errors` field into display strings.
pub fn parse_errors(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(text)) => non_empty(text).into_iter().collect(),
        Some(Value::Array(rows)) => rows.iter().filter_map(value_text).collect(),
        Some(Value::Object(fields)) => fields
            .iter()
            .filter_map(|(key, row)| value_text(row).map(|text| format!("{key}: {text}")))
            .collect(),
        Some(other) => vec![other.to_string()],
    }
}

fn collect_texts<'a>(values: impl Iterator<Item = &'a Value>) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(rows) => out.extend(rows.iter().filter_map(value_text)),
            other => out.extend(value_text(other)),
        }
    }
    out
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => non_empty(text),
        other => Some(other.to_string()),
    }
}

fn non_empty(text: &str) -> Option<String> {
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_assessments, parse_errors};

    #[test]
    fn parses_korean_and_english_keys() {
        let value = json!({
            "GPT": {"장점": "빠름", "단점": "짧음"},
            "claude": {"pros": ["thorough", "clear"], "cons": []},
            "mixtral": "solid answer",
            "llama": 3
        });
        let parsed = parse_assessments(&value);
        assert_eq!(parsed["gpt"].pros, vec!["빠름"]);
        assert_eq!(parsed["gpt"].cons, vec!["짧음"]);
        assert_eq!(parsed["claude"].pros, vec!["thorough", "clear"]);
        assert!(parsed["claude"].cons.is_empty());
        assert_eq!(parsed["mixtral"].pros, vec!["solid answer"]);
        assert!(!parsed.contains_key("llama"));
    }

    #[test]
    fn non_object_analysis_is_empty() {
        assert!(parse_assessments(&json!("text")).is_empty());
    }

    #[test]
    fn errors_accept_several_shapes() {
        assert!(parse_errors(None).is_empty());
        assert_eq!(parse_errors(Some(&json!("boom"))), vec!["boom"]);
        assert_eq!(
            parse_errors(Some(&json!(["a", "", {"code": 1}]))),
            vec!["a".to_string(), "{\"code\":1}".to_string()]
        );
        assert_eq!(
            parse_errors(Some(&json!({"gpt": "timeout"}))),
            vec!["gpt: timeout"]
        );
    }
}
