use indexmap::IndexMap;

/// Models compared when the user has not chosen any.
pub const DEFAULT_SELECTED_MODELS: &[&str] = &["gpt", "claude", "mixtral"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Chat backends the server knows how to reach, keyed by the id used in
/// `/chat/{id}/` and in stream `botId` fields.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.models.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    /// Ids in `selected` that cannot do `capability`; unknown ids included.
    pub fn lacking<'a>(&self, selected: &'a [String], capability: &str) -> Vec<&'a str> {
        selected
            .iter()
            .filter(|id| !self.get(id).is_some_and(|model| model.supports(capability)))
            .map(String::as_str)
            .collect()
    }

    /// Normalizes a user-supplied selection: lowercases ids, drops duplicates
    /// and rejects ids the registry does not know.
    pub fn validate_selection<S: AsRef<str>>(&self, ids: &[S]) -> anyhow::Result<Vec<String>> {
        let mut out: Vec<String> = Vec::new();
        let mut unknown: Vec<String> = Vec::new();
        for raw in ids {
            let id = raw.as_ref().trim().to_ascii_lowercase();
            if id.is_empty() || out.contains(&id) {
                continue;
            }
            if self.contains(&id) {
                out.push(id);
            } else {
                unknown.push(id);
            }
        }
        if !unknown.is_empty() {
            anyhow::bail!(
                "unknown model(s): {} (known: {})",
                unknown.join(", "),
                self.models.keys().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        if out.is_empty() {
            anyhow::bail!("select at least one model");
        }
        Ok(out)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |id: &str, display_name: &str, provider: &str, capabilities: &[&str]| {
        map.insert(
            id.to_string(),
            ModelSpec {
                id: id.to_string(),
                display_name: display_name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("gpt", "GPT", "openai", &["text", "vision", "analysis"]);
    insert("claude", "Claude", "anthropic", &["text", "vision", "analysis"]);
    insert("mixtral", "Mixtral", "mistral", &["text", "analysis"]);
    insert("gemini", "Gemini", "google", &["text", "vision"]);
    insert("llama", "Llama", "meta", &["text"]);
    insert("palm", "PaLM", "google", &["text"]);
    insert("allama", "Allama", "ollama", &["text"]);
    insert("deepseek", "DeepSeek", "deepseek", &["text"]);
    insert("bloom", "BLOOM", "huggingface", &["text"]);
    insert("labs", "Labs", "perplexity", &["text"]);

    map
}
