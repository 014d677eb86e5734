use super::registry::ModelRegistry;

/// Analyzer used when nothing is selected.
pub const FALLBACK_ANALYZER: &str = "gpt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerSelection {
    pub model: String,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

/// Picks the model whose `/chat/{id}/` endpoint runs the comparison for a
/// turn. The backend fans out to the other selected models from there.
#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    pub fn select_analyzer(&self, preferred: Option<&str>, selected: &[String]) -> AnalyzerSelection {
        let requested = preferred
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        if let Some(preferred) = requested.as_deref() {
            if selected.iter().any(|id| id == preferred) {
                return AnalyzerSelection {
                    model: preferred.to_string(),
                    requested,
                    fallback_reason: None,
                };
            }
        }

        let fallback_reason = match requested.as_deref() {
            Some(preferred) => Some(format!(
                "Preferred model '{preferred}' is not selected; using the first selected model."
            )),
            None => Some("No preferred model; using the first selected model.".to_string()),
        };
        match selected.first() {
            Some(first) => AnalyzerSelection {
                model: first.clone(),
                requested,
                fallback_reason,
            },
            None => AnalyzerSelection {
                model: FALLBACK_ANALYZER.to_string(),
                requested,
                fallback_reason: Some(format!(
                    "No models selected; using '{FALLBACK_ANALYZER}'."
                )),
            },
        }
    }
}
