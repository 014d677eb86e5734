//! Process-wide user session.
//!
//! Loaded once at startup from a single JSON file and handed to whatever
//! needs credentials. `access_token` is the only place a token is stored and
//! [`Session::token`] the only way to read it.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selected_models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    path: PathBuf,
    data: SessionData,
}

impl Session {
    /// Reads the session file. A missing file is an anonymous session; an
    /// unreadable one is logged and treated the same way.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match read_session(&path) {
            Ok(Some(data)) => data,
            Ok(None) => SessionData::default(),
            Err(err) => {
                warn!(path = %path.display(), "ignoring unreadable session: {err:#}");
                SessionData::default()
            }
        };
        Self { path, data }
    }

    /// In-memory session that is never written to disk.
    pub fn ephemeral() -> Self {
        Self {
            path: PathBuf::new(),
            data: SessionData::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &SessionData {
        &self.data
    }

    pub fn token(&self) -> Option<&str> {
        self.data
            .access_token
            .as_deref()
            .filter(|value| !value.is_empty())
    }

    pub fn is_logged_in(&self) -> bool {
        self.token().is_some()
    }

    pub fn language(&self) -> Option<&str> {
        self.data.language.as_deref()
    }

    pub fn preferred_model(&self) -> Option<&str> {
        self.data.preferred_model.as_deref()
    }

    pub fn selected_models(&self) -> &[String] {
        &self.data.selected_models
    }

    pub fn login(&mut self, token: &str) -> anyhow::Result<()> {
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("access token is empty");
        }
        self.data.access_token = Some(token.to_string());
        self.save()
    }

    /// Drops the token and deletes the session file.
    pub fn logout(&mut self) -> anyhow::Result<()> {
        self.data = SessionData::default();
        if self.is_ephemeral() || !self.path.exists() {
            return Ok(());
        }
        std::fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove {}", self.path.display()))
    }

    pub fn set_language(&mut self, language: &str) -> anyhow::Result<()> {
        self.data.language = Some(language.to_string());
        self.save()
    }

    pub fn set_preferred_model(&mut self, model: &str) -> anyhow::Result<()> {
        self.data.preferred_model = Some(model.to_string());
        self.save()
    }

    pub fn set_selected_models(&mut self, models: &[String]) -> anyhow::Result<()> {
        self.data.selected_models = models.to_vec();
        self.save()
    }

    fn is_ephemeral(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    fn save(&self) -> anyhow::Result<()> {
        if self.is_ephemeral() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }
}

fn read_session(path: &Path) -> anyhow::Result<Option<SessionData>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let data = serde_json::from_str(&raw)
        .with_context(|| format!("invalid session file {}", path.display()))?;
    Ok(Some(data))
}
