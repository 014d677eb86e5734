use std::path::PathBuf;

use anyhow::Context;

use crate::similarity::GroupingConfig;

pub const DEFAULT_API_BASE: &str = "http://localhost:8000";
pub const DEFAULT_LANGUAGE: &str = "ko";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base: String,
    pub language: String,
    pub session_path: PathBuf,
    pub grouping: GroupingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            session_path: default_session_path(None),
            grouping: GroupingConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `CHORUS_*` variables supplied by `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self {
            session_path: default_session_path(get("HOME")),
            ..Self::default()
        };
        if let Some(api_base) = get("CHORUS_API_BASE") {
            config.api_base = api_base;
        }
        if let Some(language) = get("CHORUS_LANGUAGE") {
            config.language = language;
        }
        if let Some(path) = get("CHORUS_SESSION_PATH") {
            config.session_path = PathBuf::from(path);
        }
        if let Some(raw) = get("CHORUS_SIMILARITY_THRESHOLD") {
            let threshold: f64 = raw
                .parse()
                .with_context(|| format!("CHORUS_SIMILARITY_THRESHOLD is not a number: {raw}"))?;
            config.grouping = GroupingConfig::new(threshold)?;
        }
        Ok(config)
    }

    /// Joins `path` onto the API base with exactly one slash between them.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn default_session_path(home: Option<String>) -> PathBuf {
    let base = home.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    base.join(".chorus").join("session.json")
}
