//! Session-scoped conversation state.
//!
//! Everything derived from a turn (replies, matrix, groups, features, the
//! optimal answer) is keyed by that turn's request id, so streams for
//! different turns can be routed interleaved without touching each other.

use std::sync::{Arc, Mutex, PoisonError};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::analysis::OptimalAnswer;
use crate::features::ResponseFeatures;
use crate::ids::{now_millis, CorrelatedMessage};
use crate::similarity::{compute_groups, GroupingConfig, SimilarityGroups, SimilarityMatrix};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub request_id: String,
    pub user_text: String,
    pub timestamp_ms: i64,
    /// Set for image turns (`describe`, `ocr`, `objects`, ...).
    pub analysis_mode: Option<String>,
}

impl ChatTurn {
    pub fn new(request_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_text: user_text.into(),
            timestamp_ms: now_millis(),
            analysis_mode: None,
        }
    }

    pub fn with_analysis_mode(mut self, mode: impl Into<String>) -> Self {
        self.analysis_mode = Some(mode.into());
        self
    }
}

impl CorrelatedMessage for ChatTurn {
    fn request_id(&self) -> Option<&str> {
        Some(self.request_id.as_str())
    }

    fn text(&self) -> &str {
        &self.user_text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    User,
    Reply,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    pub model_id: String,
    pub request_id: String,
    pub text: String,
    pub is_user: bool,
    pub timestamp_ms: i64,
    pub kind: ResponseKind,
}

impl ModelResponse {
    fn new(model_id: &str, request_id: &str, text: &str, kind: ResponseKind) -> Self {
        Self {
            model_id: model_id.to_string(),
            request_id: request_id.to_string(),
            text: text.to_string(),
            is_user: kind == ResponseKind::User,
            timestamp_ms: now_millis(),
            kind,
        }
    }

    pub fn user(model_id: &str, request_id: &str, text: &str) -> Self {
        Self::new(model_id, request_id, text, ResponseKind::User)
    }

    pub fn reply(model_id: &str, request_id: &str, text: &str) -> Self {
        Self::new(model_id, request_id, text, ResponseKind::Reply)
    }

    pub fn error(model_id: &str, request_id: &str, text: &str) -> Self {
        Self::new(model_id, request_id, text, ResponseKind::Error)
    }
}

impl CorrelatedMessage for ModelResponse {
    fn request_id(&self) -> Option<&str> {
        Some(self.request_id.as_str()).filter(|value| !value.is_empty())
    }

    fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: IndexMap<String, ChatTurn>,
    messages: IndexMap<String, Arc<Vec<ModelResponse>>>,
    responding: IndexMap<String, IndexSet<String>>,
    matrices: IndexMap<String, SimilarityMatrix>,
    groups: IndexMap<String, SimilarityGroups>,
    features: IndexMap<String, IndexMap<String, ResponseFeatures>>,
    analyses: IndexMap<String, OptimalAnswer>,
    analysis_by_turn: IndexMap<String, String>,
    notes: IndexMap<String, Vec<String>>,
}

impl ConversationState {
    /// Registers a turn, echoes the user text into every model's column and
    /// marks those models as responding.
    pub fn begin_turn(&mut self, turn: ChatTurn, models: &[String]) -> anyhow::Result<()> {
        if self.turns.contains_key(&turn.request_id) {
            anyhow::bail!("turn {} already exists", turn.request_id);
        }
        let request_id = turn.request_id.clone();
        for model in models {
            self.push_message(ModelResponse::user(model, &request_id, &turn.user_text));
        }
        self.responding
            .insert(request_id.clone(), models.iter().cloned().collect());
        self.turns.insert(request_id, turn);
        Ok(())
    }

    pub fn has_turn(&self, request_id: &str) -> bool {
        self.turns.contains_key(request_id)
    }

    pub fn turn(&self, request_id: &str) -> Option<&ChatTurn> {
        self.turns.get(request_id)
    }

    pub fn turns(&self) -> Vec<ChatTurn> {
        self.turns.values().cloned().collect()
    }

    /// Appends a response to its model's column. Responses for unknown turns
    /// are dropped and `false` is returned.
    pub fn append(&mut self, response: ModelResponse) -> bool {
        if !self.has_turn(&response.request_id) {
            return false;
        }
        self.push_message(response);
        true
    }

    fn push_message(&mut self, response: ModelResponse) {
        let column = self
            .messages
            .entry(response.model_id.clone())
            .or_insert_with(|| Arc::new(Vec::new()));
        // Copy-on-write: readers holding an earlier snapshot keep their view.
        Arc::make_mut(column).push(response);
    }

    pub fn finish_responding(&mut self, request_id: &str, model_id: &str) {
        if let Some(models) = self.responding.get_mut(request_id) {
            models.shift_remove(model_id);
        }
    }

    pub fn responding_models(&self, request_id: &str) -> Vec<String> {
        self.responding
            .get(request_id)
            .map(|models| models.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True while any turn still waits on this model.
    pub fn is_responding(&self, model_id: &str) -> bool {
        self.responding
            .values()
            .any(|models| models.contains(model_id))
    }

    pub fn messages(&self, model_id: &str) -> Arc<Vec<ModelResponse>> {
        self.messages.get(model_id).cloned().unwrap_or_default()
    }

    pub fn messages_for_turn(&self, model_id: &str, request_id: &str) -> Vec<ModelResponse> {
        self.messages(model_id)
            .iter()
            .filter(|message| message.request_id == request_id)
            .cloned()
            .collect()
    }

    /// First reply per model for the turn, in the order of `models`.
    pub fn replies(&self, request_id: &str, models: &[String]) -> IndexMap<String, String> {
        let mut out = IndexMap::new();
        for model in models {
            if let Some(reply) = self.messages(model).iter().find(|message| {
                message.kind == ResponseKind::Reply && message.request_id == request_id
            }) {
                out.insert(model.clone(), reply.text.clone());
            }
        }
        out
    }

    /// True once every model has a reply or an error for the turn.
    pub fn turn_settled(&self, request_id: &str, models: &[String]) -> bool {
        models.iter().all(|model| {
            self.messages(model)
                .iter()
                .any(|message| !message.is_user && message.request_id == request_id)
        })
    }

    pub fn record_similarity(
        &mut self,
        matrix: Option<SimilarityMatrix>,
        groups: SimilarityGroups,
    ) -> bool {
        if !self.has_turn(&groups.request_id) {
            return false;
        }
        if let Some(matrix) = matrix {
            self.matrices.insert(matrix.request_id.clone(), matrix);
        }
        self.groups.insert(groups.request_id.clone(), groups);
        true
    }

    pub fn matrix(&self, request_id: &str) -> Option<&SimilarityMatrix> {
        self.matrices.get(request_id)
    }

    pub fn groups(&self, request_id: &str) -> Option<&SimilarityGroups> {
        self.groups.get(request_id)
    }

    /// Recomputes every stored grouping from its matrix, e.g. after the
    /// threshold changed. Groups decoded without a matrix are left alone.
    pub fn regroup(&mut self, grouping: GroupingConfig) {
        for (request_id, matrix) in &self.matrices {
            self.groups.insert(
                request_id.clone(),
                compute_groups(matrix, grouping.threshold),
            );
        }
    }

    pub fn record_features(&mut self, features: ResponseFeatures) -> bool {
        if !self.has_turn(&features.request_id) {
            return false;
        }
        self.features
            .entry(features.request_id.clone())
            .or_default()
            .insert(features.model_id.clone(), features);
        true
    }

    pub fn features(&self, request_id: &str) -> Option<&IndexMap<String, ResponseFeatures>> {
        self.features.get(request_id)
    }

    pub fn has_analysis_key(&self, key: &str) -> bool {
        self.analyses.contains_key(key)
    }

    pub fn record_analysis(&mut self, answer: OptimalAnswer) -> bool {
        if !self.has_turn(&answer.request_id) {
            return false;
        }
        self.analysis_by_turn
            .insert(answer.request_id.clone(), answer.key.clone());
        self.analyses.insert(answer.key.clone(), answer);
        true
    }

    pub fn analysis(&self, key: &str) -> Option<&OptimalAnswer> {
        self.analyses.get(key)
    }

    /// Latest optimal answer recorded for the turn.
    pub fn analysis_for_turn(&self, request_id: &str) -> Option<&OptimalAnswer> {
        self.analysis_by_turn
            .get(request_id)
            .and_then(|key| self.analyses.get(key))
    }

    pub fn add_note(&mut self, request_id: &str, note: impl Into<String>) -> bool {
        if !self.has_turn(request_id) {
            return false;
        }
        self.notes
            .entry(request_id.to_string())
            .or_default()
            .push(note.into());
        true
    }

    pub fn notes(&self, request_id: &str) -> &[String] {
        self.notes
            .get(request_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Fills in what the backend did not send once every model has answered:
    /// per-reply features, and a locally computed matrix and grouping when two
    /// or more models replied and no grouping exists yet.
    pub fn derive_turn_insights(
        &mut self,
        request_id: &str,
        models: &[String],
        grouping: GroupingConfig,
    ) -> TurnInsights {
        let mut insights = TurnInsights::default();
        if !self.has_turn(request_id) || !self.turn_settled(request_id, models) {
            return insights;
        }

        let replies = self.replies(request_id, models);
        for (model, text) in &replies {
            let known = self
                .features(request_id)
                .map(|rows| rows.contains_key(model))
                .unwrap_or(false);
            if !known {
                self.record_features(ResponseFeatures::for_response(model, request_id, text));
                insights.features_added += 1;
            }
        }

        if replies.len() >= 2 && self.groups(request_id).is_none() {
            let matrix = SimilarityMatrix::from_texts(request_id, &replies);
            let groups = compute_groups(&matrix, grouping.threshold);
            self.record_similarity(Some(matrix), groups);
            insights.grouped_locally = true;
        }
        insights
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TurnInsights {
    pub features_added: usize,
    pub grouped_locally: bool,
}

/// Shared handle to one conversation. Clones point at the same state.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    inner: Arc<Mutex<ConversationState>>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<T>(&self, apply: impl FnOnce(&mut ConversationState) -> T) -> T {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut state)
    }

    pub fn read<T>(&self, view: impl FnOnce(&ConversationState) -> T) -> T {
        let state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        view(&state)
    }

    pub fn snapshot(&self) -> ConversationState {
        self.read(ConversationState::clone)
    }
}
