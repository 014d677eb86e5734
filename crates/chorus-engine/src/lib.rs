use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chorus_contracts::config::ClientConfig;
use chorus_contracts::conversation::{ChatTurn, Conversation, TurnInsights};
use chorus_contracts::events::{TranscriptEvent, TranscriptWriter};
use chorus_contracts::ids::{generate_image_request_id, generate_request_id, generate_session_id};
use chorus_contracts::models::{ModelRegistry, ModelSelector, DEFAULT_SELECTED_MODELS};
use chorus_contracts::session::Session;
use chorus_contracts::similarity::GroupingConfig;
use chorus_contracts::stream::{AbortSignal, EventStream, RouteSummary, StreamRouter};
use indexmap::IndexMap;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Response body of a chat or image-analysis request: newline-delimited JSON.
pub type StreamBody = Box<dyn Read + Send>;

/// Error detail shown for models cut off by an aborted turn.
pub const CANCELLED: &str = "request cancelled";

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub message: String,
    pub selected_models: Vec<String>,
    pub language: String,
    pub request_id: String,
}

impl ChatRequest {
    pub fn payload(&self) -> Value {
        json!({
            "message": self.message,
            "compare": true,
            "selectedModels": self.selected_models,
            "language": self.language,
            "requestId": self.request_id,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Describe,
    Ocr,
    Objects,
    General,
}

impl AnalysisMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "describe" => AnalysisMode::Describe,
            "ocr" => AnalysisMode::Ocr,
            "objects" => AnalysisMode::Objects,
            _ => AnalysisMode::General,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisMode::Describe => "describe",
            AnalysisMode::Ocr => "ocr",
            AnalysisMode::Objects => "objects",
            AnalysisMode::General => "general",
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            AnalysisMode::Describe => {
                "Describe this image in detail, including every important element you can see."
            }
            AnalysisMode::Ocr => {
                "Extract all text from this image and keep the original layout as closely as possible."
            }
            AnalysisMode::Objects => {
                "List every recognizable object in this image with a short description of each."
            }
            AnalysisMode::General => "Analyze this image.",
        }
    }

    fn label(self) -> &'static str {
        match self {
            AnalysisMode::Describe => "image description",
            AnalysisMode::Ocr => "text extraction",
            AnalysisMode::Objects | AnalysisMode::General => "object recognition",
        }
    }

    /// Text echoed into each model's column for an image turn.
    pub fn user_message(self) -> String {
        format!("[Image uploaded] - {} request", self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnalysisRequest {
    pub image_path: PathBuf,
    pub mode: AnalysisMode,
    pub selected_models: Vec<String>,
    pub language: String,
    pub request_id: String,
}

impl ImageAnalysisRequest {
    /// Text fields of the multipart form; the image part is added separately.
    pub fn form_fields(&self) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            ("prompt", self.mode.prompt().to_string()),
            ("analysisMode", self.mode.as_str().to_string()),
            ("requestId", self.request_id.clone()),
            (
                "selectedModels",
                serde_json::to_string(&self.selected_models)?,
            ),
            ("language", self.language.clone()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingsUpdate {
    PreferredModel { model: String, language: String },
    SelectedModels { models: Vec<String>, language: String },
}

impl SettingsUpdate {
    pub fn payload(&self) -> Result<Value> {
        Ok(match self {
            SettingsUpdate::PreferredModel { model, language } => json!({
                "preferredModel": model,
                "language": language,
            }),
            // The settings endpoint stores the list as a JSON string.
            SettingsUpdate::SelectedModels { models, language } => json!({
                "preferredModels": serde_json::to_string(models)?,
                "language": language,
            }),
        })
    }
}

pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    fn open_chat(
        &self,
        analyzer: &str,
        request: &ChatRequest,
        token: Option<&str>,
    ) -> Result<StreamBody>;
    fn open_image_analysis(
        &self,
        request: &ImageAnalysisRequest,
        token: Option<&str>,
    ) -> Result<StreamBody>;
    fn save_settings(&self, update: &SettingsUpdate, token: &str) -> Result<()>;
}

pub struct HttpBackend {
    config: ClientConfig,
    http: HttpClient,
}

impl HttpBackend {
    pub fn new(config: ClientConfig) -> Result<Self> {
        // Streams stay open until every model has answered.
        let http = HttpClient::builder()
            .timeout(None)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { config, http })
    }

    fn authorize(
        request: reqwest::blocking::RequestBuilder,
        token: Option<&str>,
    ) -> reqwest::blocking::RequestBuilder {
        match token {
            Some(token) => request.header(AUTHORIZATION, format!("Token {token}")),
            None => request,
        }
    }
}

impl ChatBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn open_chat(
        &self,
        analyzer: &str,
        request: &ChatRequest,
        token: Option<&str>,
    ) -> Result<StreamBody> {
        let url = self.config.endpoint(&format!("chat/{analyzer}/"));
        debug!(%url, request_id = %request.request_id, "opening chat stream");
        let response = Self::authorize(self.http.post(&url), token)
            .json(&request.payload())
            .send()
            .with_context(|| format!("chat request failed ({url})"))?;
        Ok(Box::new(ensure_success("chat", response)?))
    }

    fn open_image_analysis(
        &self,
        request: &ImageAnalysisRequest,
        token: Option<&str>,
    ) -> Result<StreamBody> {
        let url = self.config.endpoint("analyze-image/");
        let mut form = MultipartForm::new().part("image", image_part(&request.image_path)?);
        for (key, value) in request.form_fields()? {
            form = form.text(key, value);
        }
        debug!(%url, request_id = %request.request_id, "opening image analysis stream");
        let response = Self::authorize(self.http.post(&url), token)
            .multipart(form)
            .send()
            .with_context(|| format!("image analysis request failed ({url})"))?;
        Ok(Box::new(ensure_success("image analysis", response)?))
    }

    fn save_settings(&self, update: &SettingsUpdate, token: &str) -> Result<()> {
        let url = self.config.endpoint("api/user/settings/");
        let response = Self::authorize(self.http.put(&url), Some(token))
            .json(&update.payload()?)
            .send()
            .with_context(|| format!("settings request failed ({url})"))?;
        ensure_success("settings", response)?;
        Ok(())
    }
}

fn ensure_success(label: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    bail!(
        "{label} request failed ({}): {}",
        status.as_u16(),
        truncate_text(&body, 512)
    );
}

fn image_part(path: &Path) -> Result<MultipartPart> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("image")
        .to_string();
    MultipartPart::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime_for_path(path))
        .context("invalid image mime type")
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub request_id: String,
    pub analyzer: String,
    pub fallback_reason: Option<String>,
    pub summary: RouteSummary,
    pub insights: TurnInsights,
    /// Selected models without image support, for image turns.
    pub vision_unsupported: Vec<String>,
}

/// One user's chat session: model selection, credentials and the shared
/// conversation every turn is routed into.
pub struct ChatSession {
    config: ClientConfig,
    backend: Arc<dyn ChatBackend>,
    session: Session,
    conversation: Conversation,
    selector: ModelSelector,
    selected_models: Vec<String>,
    language: String,
    transcript: Option<TranscriptWriter>,
    last_request_id: Option<String>,
}

impl ChatSession {
    pub fn new(config: ClientConfig, backend: Arc<dyn ChatBackend>, session: Session) -> Self {
        let selector = ModelSelector::new(Some(ModelRegistry::default()));
        let selected_models = selector
            .registry
            .validate_selection(session.selected_models())
            .or_else(|_| selector.registry.validate_selection(DEFAULT_SELECTED_MODELS))
            .unwrap_or_default();
        let language = session
            .language()
            .map(str::to_string)
            .unwrap_or_else(|| config.language.clone());
        Self {
            config,
            backend,
            session,
            conversation: Conversation::new(),
            selector,
            selected_models,
            language,
            transcript: None,
            last_request_id: None,
        }
    }

    /// Appends every turn and routed event to `path` as JSONL.
    pub fn with_transcript(mut self, path: impl Into<PathBuf>) -> Self {
        let writer = TranscriptWriter::new(path, generate_session_id());
        info!(path = %writer.path().display(), session_id = writer.session_id(), "writing transcript");
        self.transcript = Some(writer);
        self
    }

    pub fn conversation(&self) -> Conversation {
        self.conversation.clone()
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.selector.registry
    }

    pub fn selected_models(&self) -> &[String] {
        &self.selected_models
    }

    pub fn preferred_model(&self) -> Option<&str> {
        self.session.preferred_model()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn grouping(&self) -> GroupingConfig {
        self.config.grouping
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn last_request_id(&self) -> Option<&str> {
        self.last_request_id.as_deref()
    }

    pub fn send_message(&mut self, text: &str) -> Result<TurnReport> {
        self.send_message_with(text, AbortSignal::new())
    }

    /// Sends `text` and routes the reply stream until it ends or `signal` is
    /// aborted from another thread.
    pub fn send_message_with(&mut self, text: &str, signal: AbortSignal) -> Result<TurnReport> {
        let message = text.trim();
        if message.is_empty() {
            bail!("message is empty");
        }
        let request = ChatRequest {
            message: message.to_string(),
            selected_models: self.selected_models.clone(),
            language: self.language.clone(),
            request_id: generate_request_id(),
        };
        let turn = ChatTurn::new(&request.request_id, message);
        self.run_turn(turn, signal, |backend, analyzer, token| {
            backend.open_chat(analyzer, &request, token)
        })
    }

    pub fn analyze_image(&mut self, path: &Path, mode: AnalysisMode) -> Result<TurnReport> {
        self.analyze_image_with(path, mode, AbortSignal::new())
    }

    pub fn analyze_image_with(
        &mut self,
        path: &Path,
        mode: AnalysisMode,
        signal: AbortSignal,
    ) -> Result<TurnReport> {
        if !path.is_file() {
            bail!("image not found: {}", path.display());
        }
        let request = ImageAnalysisRequest {
            image_path: path.to_path_buf(),
            mode,
            selected_models: self.selected_models.clone(),
            language: self.language.clone(),
            request_id: generate_image_request_id(),
        };
        let turn = ChatTurn::new(&request.request_id, mode.user_message())
            .with_analysis_mode(mode.as_str());
        let request_id = turn.request_id.clone();
        let blind: Vec<String> = self
            .selector
            .registry
            .lacking(&self.selected_models, "vision")
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut report = self.run_turn(turn, signal, |backend, _analyzer, token| {
            backend.open_image_analysis(&request, token)
        })?;
        if !blind.is_empty() {
            let names = blind.join(", ");
            warn!(request_id = %request_id, models = %names, "selected models cannot read images");
            self.conversation
                .update(|state| state.add_note(&request_id, format!("no image support: {names}")));
            report.vision_unsupported = blind;
        }
        Ok(report)
    }

    fn run_turn(
        &mut self,
        turn: ChatTurn,
        signal: AbortSignal,
        open: impl FnOnce(&dyn ChatBackend, &str, Option<&str>) -> Result<StreamBody>,
    ) -> Result<TurnReport> {
        let request_id = turn.request_id.clone();
        let user_text = turn.user_text.clone();
        let models = self.selected_models.clone();
        self.conversation
            .update(|state| state.begin_turn(turn, &models))?;
        self.last_request_id = Some(request_id.clone());

        let selection = self
            .selector
            .select_analyzer(self.session.preferred_model(), &models);
        if let Some(reason) = &selection.fallback_reason {
            debug!(request_id = %request_id, "{reason}");
        }
        info!(
            request_id = %request_id,
            backend = self.backend.name(),
            analyzer = %selection.model,
            models = models.len(),
            "turn started"
        );
        self.emit(TranscriptEvent::TurnStarted {
            request_id: request_id.clone(),
            message: user_text.clone(),
            models: models.clone(),
            analyzer: selection.model.clone(),
        });

        let router = StreamRouter::new(
            self.conversation.clone(),
            &request_id,
            models.clone(),
            &user_text,
            self.config.grouping,
        )
        .with_transcript(self.transcript.clone());

        let summary = match open(self.backend.as_ref(), &selection.model, self.session.token()) {
            Ok(body) => router.run(EventStream::new(body, signal)),
            Err(err) => {
                router.fail_turn(&format!("{err:#}"));
                RouteSummary {
                    failed: true,
                    ..RouteSummary::default()
                }
            }
        };
        let unsettled = self
            .conversation
            .read(|state| !state.responding_models(&request_id).is_empty());
        if summary.aborted && unsettled {
            router.fail_turn(CANCELLED);
        }

        let grouping = self.config.grouping;
        let insights = self
            .conversation
            .update(|state| state.derive_turn_insights(&request_id, &models, grouping));
        self.emit(TranscriptEvent::TurnFinished {
            request_id: request_id.clone(),
            applied: summary.applied,
            discarded: summary.discarded,
            malformed: summary.malformed,
            failed: summary.failed,
            aborted: summary.aborted,
            grouped_locally: insights.grouped_locally,
        });

        Ok(TurnReport {
            request_id,
            analyzer: selection.model,
            fallback_reason: selection.fallback_reason,
            summary,
            insights,
            vision_unsupported: Vec::new(),
        })
    }

    pub fn set_selected_models<S: AsRef<str>>(&mut self, ids: &[S]) -> Result<()> {
        let models = self.selector.registry.validate_selection(ids)?;
        self.session.set_selected_models(&models)?;
        self.selected_models = models;
        self.push_settings(SettingsUpdate::SelectedModels {
            models: self.selected_models.clone(),
            language: self.language.clone(),
        });
        Ok(())
    }

    pub fn set_preferred_model(&mut self, id: &str) -> Result<()> {
        let id = id.trim().to_ascii_lowercase();
        if !self.selector.registry.contains(&id) {
            bail!("unknown model: {id}");
        }
        self.session.set_preferred_model(&id)?;
        self.push_settings(SettingsUpdate::PreferredModel {
            model: id,
            language: self.language.clone(),
        });
        Ok(())
    }

    pub fn set_language(&mut self, language: &str) -> Result<()> {
        let language = language.trim();
        if language.is_empty() {
            bail!("language is empty");
        }
        self.session.set_language(language)?;
        self.language = language.to_string();
        self.push_settings(SettingsUpdate::SelectedModels {
            models: self.selected_models.clone(),
            language: self.language.clone(),
        });
        Ok(())
    }

    /// Changes the grouping cutoff and regroups every turn that has a matrix.
    pub fn set_threshold(&mut self, threshold: f64) -> Result<()> {
        let grouping = GroupingConfig::new(threshold)?;
        self.config.grouping = grouping;
        self.conversation.update(|state| state.regroup(grouping));
        Ok(())
    }

    pub fn login(&mut self, token: &str) -> Result<()> {
        self.session.login(token)
    }

    pub fn logout(&mut self) -> Result<()> {
        self.session.logout()
    }

    /// Settings are saved server-side only for logged-in users; failures are
    /// logged and otherwise ignored.
    fn push_settings(&self, update: SettingsUpdate) {
        let Some(token) = self.session.token() else {
            debug!("not logged in, skipping settings save");
            return;
        };
        if let Err(err) = self.backend.save_settings(&update, token) {
            warn!("failed to save user settings: {err:#}");
        }
    }

    fn emit(&self, event: TranscriptEvent) {
        let Some(transcript) = &self.transcript else {
            return;
        };
        if let Err(err) = transcript.record(event) {
            warn!("transcript write failed: {err:#}");
        }
    }
}

/// Model id → reply text for a turn, in selection order.
pub fn turn_replies(session: &ChatSession, request_id: &str) -> IndexMap<String, String> {
    session
        .conversation
        .read(|state| state.replies(request_id, &session.selected_models))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::{self, Cursor, Read};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use chorus_contracts::config::ClientConfig;
    use chorus_contracts::conversation::ResponseKind;
    use chorus_contracts::events::{TranscriptEvent, TranscriptRecord};
    use chorus_contracts::session::Session;
    use chorus_contracts::stream::{error_text, AbortSignal};
    use serde_json::{json, Value};

    use super::{
        turn_replies, AnalysisMode, ChatBackend, ChatRequest, ChatSession, ImageAnalysisRequest,
        SettingsUpdate, StreamBody, CANCELLED,
    };

    #[derive(Default)]
    struct ScriptedBackend {
        bodies: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn with(bodies: Vec<Result<String, String>>) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(bodies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        fn record(&self, call: String) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }

        fn next_body(&self, request_id: &str) -> anyhow::Result<StreamBody> {
            let next = self
                .bodies
                .lock()
                .map_err(|_| anyhow!("script lock poisoned"))?
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()));
            match next {
                Ok(body) => Ok(Box::new(Cursor::new(
                    body.replace("{request_id}", request_id).into_bytes(),
                ))),
                Err(message) => Err(anyhow!(message)),
            }
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open_chat(
            &self,
            analyzer: &str,
            request: &ChatRequest,
            _token: Option<&str>,
        ) -> anyhow::Result<StreamBody> {
            self.record(format!("chat:{analyzer}:{}", request.message));
            self.next_body(&request.request_id)
        }

        fn open_image_analysis(
            &self,
            request: &ImageAnalysisRequest,
            _token: Option<&str>,
        ) -> anyhow::Result<StreamBody> {
            self.record(format!("image:{}", request.mode.as_str()));
            self.next_body(&request.request_id)
        }

        fn save_settings(&self, update: &SettingsUpdate, token: &str) -> anyhow::Result<()> {
            self.record(format!("settings:{token}:{}", update.payload()?));
            Ok(())
        }
    }

    /// Serves one line per read and aborts `signal` before handing out the
    /// second, as a Ctrl-C on another thread would.
    struct AbortsMidStream {
        lines: VecDeque<String>,
        served: usize,
        signal: AbortSignal,
    }

    impl Read for AbortsMidStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(line) = self.lines.pop_front() else {
                return Ok(0);
            };
            self.served += 1;
            if self.served == 2 {
                self.signal.abort();
            }
            let n = line.len().min(buf.len());
            buf[..n].copy_from_slice(&line.as_bytes()[..n]);
            Ok(n)
        }
    }

    struct AbortingBackend {
        signal: AbortSignal,
    }

    impl ChatBackend for AbortingBackend {
        fn name(&self) -> &str {
            "aborting"
        }

        fn open_chat(
            &self,
            _analyzer: &str,
            request: &ChatRequest,
            _token: Option<&str>,
        ) -> anyhow::Result<StreamBody> {
            let lines = [
                json!({"type": "bot_response", "botId": "gpt", "response": "first", "requestId": request.request_id}),
                json!({"type": "bot_response", "botId": "claude", "response": "never read", "requestId": request.request_id}),
            ];
            Ok(Box::new(AbortsMidStream {
                lines: lines.iter().map(|row| row.to_string() + "\n").collect(),
                served: 0,
                signal: self.signal.clone(),
            }))
        }

        fn open_image_analysis(
            &self,
            _request: &ImageAnalysisRequest,
            _token: Option<&str>,
        ) -> anyhow::Result<StreamBody> {
            Err(anyhow!("not scripted"))
        }

        fn save_settings(&self, _update: &SettingsUpdate, _token: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn lines(rows: &[Value]) -> String {
        rows.iter()
            .map(|row| row.to_string() + "\n")
            .collect::<String>()
    }

    fn session_for(backend: &Arc<ScriptedBackend>, threshold: f64) -> anyhow::Result<ChatSession> {
        let mut config = ClientConfig::default();
        config.grouping = chorus_contracts::similarity::GroupingConfig::new(threshold)?;
        Ok(ChatSession::new(
            config,
            backend.clone(),
            Session::ephemeral(),
        ))
    }

    fn full_turn_body() -> String {
        lines(&[
            json!({"type": "bot_response", "botId": "gpt", "response": "Rust uses ownership.", "requestId": "{request_id}"}),
            json!({"type": "bot_response", "botId": "claude", "response": "Ownership is how Rust manages memory.", "requestId": "{request_id}"}),
            json!({"type": "bot_error", "botId": "mixtral", "error": "model overloaded", "requestId": "{request_id}"}),
            json!({"type": "similarity_analysis", "userMessage": "what is rust", "result": {"similarityMatrix": {
                "gpt": {"claude": 0.95, "mixtral": 0.2},
                "claude": {"gpt": 0.95, "mixtral": 0.15},
                "mixtral": {"gpt": 0.2, "claude": 0.15}
            }}}),
            json!({"type": "analysis", "preferredModel": "claude", "best_response": "Ownership.", "analysis": {"gpt": {"pros": "short"}}, "reasoning": "clearest", "requestId": "{request_id}", "userMessage": "what is rust"}),
        ])
    }

    #[test]
    fn send_message_routes_a_full_turn() -> anyhow::Result<()> {
        let backend = ScriptedBackend::with(vec![Ok(full_turn_body())]);
        let mut session = session_for(&backend, 0.7)?;
        let report = session.send_message("  what is rust ")?;

        assert!(report.request_id.starts_with("req-"));
        assert_eq!(report.analyzer, "gpt");
        assert_eq!(report.summary.applied, 5);
        assert!(!report.summary.failed);
        assert_eq!(backend.calls(), vec!["chat:gpt:what is rust"]);

        let conversation = session.conversation();
        conversation.read(|state| {
            let groups = state.groups(&report.request_id).cloned().unwrap_or_default();
            assert_eq!(groups.main_group, vec!["gpt", "claude"]);
            assert_eq!(groups.outliers, vec!["mixtral"]);
            assert!(state.analysis_for_turn(&report.request_id).is_some());
            assert!(state.responding_models(&report.request_id).is_empty());
            let mixtral = state.messages_for_turn("mixtral", &report.request_id);
            assert_eq!(mixtral[1].kind, ResponseKind::Error);
            assert_eq!(mixtral[1].text, error_text("model overloaded"));
        });
        assert_eq!(report.insights.features_added, 2);
        assert!(!report.insights.grouped_locally);
        assert_eq!(turn_replies(&session, &report.request_id).len(), 2);
        Ok(())
    }

    #[test]
    fn transport_failure_marks_every_model() -> anyhow::Result<()> {
        let backend = ScriptedBackend::with(vec![Err("connection refused".to_string())]);
        let mut session = session_for(&backend, 0.7)?;
        let report = session.send_message("hello")?;
        assert!(report.summary.failed);

        session.conversation().read(|state| {
            for model in ["gpt", "claude", "mixtral"] {
                let messages = state.messages_for_turn(model, &report.request_id);
                assert_eq!(messages.len(), 2, "{model}");
                assert_eq!(messages[1].text, error_text("connection refused"));
            }
            assert!(state.responding_models(&report.request_id).is_empty());
        });
        Ok(())
    }

    #[test]
    fn aborting_mid_stream_stops_reading_and_fails_the_turn() -> anyhow::Result<()> {
        let signal = AbortSignal::new();
        let backend = Arc::new(AbortingBackend {
            signal: signal.clone(),
        });
        let mut session = ChatSession::new(ClientConfig::default(), backend, Session::ephemeral());
        let report = session.send_message_with("hello", signal)?;

        assert!(report.summary.aborted);
        assert_eq!(report.summary.applied, 1);
        session.conversation().read(|state| {
            assert!(state.responding_models(&report.request_id).is_empty());
            let gpt = state.messages_for_turn("gpt", &report.request_id);
            assert_eq!(gpt[1].text, "first");
            let claude = state.messages_for_turn("claude", &report.request_id);
            assert!(claude.iter().all(|m| m.text != "never read"));
            assert_eq!(claude.last().map(|m| m.text.clone()), Some(error_text(CANCELLED)));
        });
        Ok(())
    }

    #[test]
    fn events_for_other_turns_are_dropped() -> anyhow::Result<()> {
        let body = lines(&[
            json!({"type": "bot_response", "botId": "gpt", "response": "stale", "requestId": "req-0-old"}),
            json!({"type": "bot_response", "botId": "gpt", "response": "fresh", "requestId": "{request_id}"}),
        ]);
        let backend = ScriptedBackend::with(vec![Ok(body)]);
        let mut session = session_for(&backend, 0.7)?;
        let report = session.send_message("hello")?;
        assert_eq!(report.summary.discarded, 1);
        assert_eq!(report.summary.applied, 1);
        assert!(session
            .conversation()
            .read(|state| state.messages("gpt").iter().all(|m| m.text != "stale")));
        Ok(())
    }

    #[test]
    fn similarity_is_computed_locally_when_backend_sends_none() -> anyhow::Result<()> {
        let body = lines(&[
            json!({"type": "bot_response", "botId": "gpt", "response": "The borrow checker enforces ownership rules."}),
            json!({"type": "bot_response", "botId": "claude", "response": "The borrow checker enforces ownership rules at compile time."}),
            json!({"type": "bot_response", "botId": "mixtral", "response": "Paris is the capital of France."}),
        ]);
        let backend = ScriptedBackend::with(vec![Ok(body)]);
        let mut session = session_for(&backend, 0.5)?;
        let report = session.send_message("borrow checker?")?;
        assert!(report.insights.grouped_locally);
        assert_eq!(report.insights.features_added, 3);

        let groups = session
            .conversation()
            .read(|state| state.groups(&report.request_id).cloned())
            .unwrap_or_default();
        assert_eq!(groups.main_group, vec!["gpt", "claude"]);
        assert_eq!(groups.outliers, vec!["mixtral"]);
        Ok(())
    }

    #[test]
    fn threshold_change_regroups_existing_turns() -> anyhow::Result<()> {
        let backend = ScriptedBackend::with(vec![Ok(full_turn_body())]);
        let mut session = session_for(&backend, 0.7)?;
        let report = session.send_message("what is rust")?;

        session.set_threshold(0.1)?;
        let groups = session
            .conversation()
            .read(|state| state.groups(&report.request_id).cloned())
            .unwrap_or_default();
        assert_eq!(groups.main_group, vec!["gpt", "claude", "mixtral"]);
        assert!(session.set_threshold(3.0).is_err());
        assert_eq!(session.grouping().threshold, 0.1);
        Ok(())
    }

    #[test]
    fn preferred_model_is_used_as_analyzer_when_selected() -> anyhow::Result<()> {
        let backend = ScriptedBackend::with(vec![Ok(String::new()), Ok(String::new())]);
        let mut session = session_for(&backend, 0.7)?;
        session.set_preferred_model("Claude")?;
        let first = session.send_message("one")?;
        assert_eq!(first.analyzer, "claude");

        session.set_selected_models(&["gemini", "llama"])?;
        let second = session.send_message("two")?;
        assert_eq!(second.analyzer, "gemini");
        assert!(second.fallback_reason.is_some());
        assert!(session.set_selected_models(&["nope"]).is_err());
        Ok(())
    }

    #[test]
    fn settings_are_pushed_only_when_logged_in() -> anyhow::Result<()> {
        let backend = ScriptedBackend::with(Vec::new());
        let mut session = session_for(&backend, 0.7)?;
        session.set_selected_models(&["gpt"])?;
        assert!(backend.calls().is_empty());

        session.login("tok-1")?;
        session.set_selected_models(&["gpt", "claude"])?;
        session.set_preferred_model("gpt")?;
        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("settings:tok-1:"));
        assert!(calls[0].contains(r#"\"gpt\",\"claude\""#));
        assert!(calls[1].contains("\"preferredModel\":\"gpt\""));

        session.logout()?;
        session.set_language("en")?;
        assert_eq!(backend.calls().len(), 2);
        assert_eq!(session.language(), "en");
        Ok(())
    }

    #[test]
    fn image_turns_use_img_ids_and_mode() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image = temp.path().join("scan.png");
        std::fs::write(&image, [0x89, b'P', b'N', b'G'])?;

        let body = lines(&[json!({"type": "bot_response", "botId": "gpt", "response": "A receipt."})]);
        let backend = ScriptedBackend::with(vec![Ok(body)]);
        let mut session = session_for(&backend, 0.7)?;
        let report = session.analyze_image(&image, AnalysisMode::parse("OCR"))?;

        assert!(report.request_id.starts_with("img-"));
        assert_eq!(report.vision_unsupported, vec!["mixtral"]);
        let notes = session
            .conversation()
            .read(|state| state.notes(&report.request_id).to_vec());
        assert_eq!(notes, vec!["no image support: mixtral"]);
        assert_eq!(backend.calls(), vec!["image:ocr"]);
        let turn = session
            .conversation()
            .read(|state| state.turn(&report.request_id).cloned());
        assert_eq!(
            turn.and_then(|t| t.analysis_mode),
            Some("ocr".to_string())
        );
        assert!(session
            .analyze_image(Path::new("/definitely/missing.png"), AnalysisMode::Describe)
            .is_err());
        Ok(())
    }

    #[test]
    fn transcript_records_turns_and_events() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("transcript.jsonl");
        let backend = ScriptedBackend::with(vec![Ok(full_turn_body())]);
        let mut session = session_for(&backend, 0.7)?.with_transcript(&path);
        session.send_message("what is rust")?;

        let records: Vec<TranscriptRecord> = std::fs::read_to_string(&path)?
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert!(matches!(
            records.first().map(|r| &r.event),
            Some(TranscriptEvent::TurnStarted { analyzer, .. }) if analyzer == "gpt"
        ));
        assert!(matches!(
            records.last().map(|r| &r.event),
            Some(TranscriptEvent::TurnFinished { applied: 5, failed: false, .. })
        ));
        let routed = records
            .iter()
            .filter(|r| matches!(r.event, TranscriptEvent::Routed { .. }))
            .count();
        assert_eq!(routed, 5);
        assert!(records.iter().all(|r| r.session_id.starts_with("chat-")));
        Ok(())
    }

    #[test]
    fn request_payloads_match_backend_contract() -> anyhow::Result<()> {
        let request = ChatRequest {
            message: "hi".to_string(),
            selected_models: vec!["gpt".to_string(), "claude".to_string()],
            language: "ko".to_string(),
            request_id: "req-1-abc".to_string(),
        };
        assert_eq!(
            request.payload(),
            json!({
                "message": "hi",
                "compare": true,
                "selectedModels": ["gpt", "claude"],
                "language": "ko",
                "requestId": "req-1-abc"
            })
        );

        let image = ImageAnalysisRequest {
            image_path: "a.png".into(),
            mode: AnalysisMode::Objects,
            selected_models: vec!["gpt".to_string()],
            language: "en".to_string(),
            request_id: "img-1-abc".to_string(),
        };
        let fields = image.form_fields()?;
        assert!(fields.contains(&("analysisMode", "objects".to_string())));
        assert!(fields.contains(&("selectedModels", "[\"gpt\"]".to_string())));

        let update = SettingsUpdate::SelectedModels {
            models: vec!["gpt".to_string()],
            language: "ko".to_string(),
        };
        assert_eq!(
            update.payload()?,
            json!({"preferredModels": "[\"gpt\"]", "language": "ko"})
        );
        Ok(())
    }
}
