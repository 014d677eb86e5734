use std::io::Read;

use tracing::{debug, info, warn};

use super::decoder::EventStream;
use super::events::{
    AnalysisPayload, BotErrorPayload, BotResponsePayload, SimilarityErrorPayload,
    SimilarityPayload, StreamEvent,
};
use crate::analysis::{parse_assessments, parse_errors, OptimalAnswer};
use crate::conversation::{Conversation, ConversationState, ModelResponse};
use crate::events::{TranscriptEvent, TranscriptWriter};
use crate::ids::{find_legacy_match, now_millis};
use crate::similarity::{compute_groups, decode_groups, GroupingConfig, SimilarityMatrix};

/// Text shown in a model's column when its answer failed.
pub fn error_text(detail: &str) -> String {
    format!("An error occurred: {detail}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    UnselectedModel,
    UnknownTurn,
    UnresolvedAnalysis,
    MissingResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Applied,
    Discarded(DiscardReason),
    Ignored,
}

impl RouteOutcome {
    pub fn label(self) -> &'static str {
        match self {
            RouteOutcome::Applied => "applied",
            RouteOutcome::Discarded(_) => "discarded",
            RouteOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteSummary {
    pub applied: usize,
    pub discarded: usize,
    pub ignored: usize,
    pub malformed: usize,
    pub aborted: bool,
    pub failed: bool,
}

impl RouteSummary {
    fn count(&mut self, outcome: RouteOutcome) {
        match outcome {
            RouteOutcome::Applied => self.applied += 1,
            RouteOutcome::Discarded(_) => self.discarded += 1,
            RouteOutcome::Ignored => self.ignored += 1,
        }
    }
}

/// Applies one turn's stream events to the shared conversation.
///
/// A router is scoped to the request id and model selection of the turn that
/// opened the stream; payload request ids take precedence where present.
#[derive(Debug, Clone)]
pub struct StreamRouter {
    conversation: Conversation,
    request_id: String,
    models: Vec<String>,
    user_text: String,
    grouping: GroupingConfig,
    transcript: Option<TranscriptWriter>,
}

impl StreamRouter {
    pub fn new(
        conversation: Conversation,
        request_id: impl Into<String>,
        models: Vec<String>,
        user_text: impl Into<String>,
        grouping: GroupingConfig,
    ) -> Self {
        Self {
            conversation,
            request_id: request_id.into(),
            models,
            user_text: user_text.into(),
            grouping,
            transcript: None,
        }
    }

    pub fn with_transcript(mut self, transcript: Option<TranscriptWriter>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Drains the stream. Malformed lines are skipped; a read error fails
    /// the turn for every model still waiting.
    pub fn run<R: Read>(&self, mut stream: EventStream<R>) -> RouteSummary {
        let mut summary = RouteSummary::default();
        for item in stream.by_ref() {
            match item {
                Ok(event) => summary.count(self.route(&event)),
                Err(err) if err.is_recoverable() => {
                    warn!(request_id = %self.request_id, "skipping stream line: {err}");
                    summary.malformed += 1;
                }
                Err(err) => {
                    self.fail_turn(&err.to_string());
                    summary.failed = true;
                    break;
                }
            }
        }
        summary.aborted = stream.was_aborted();
        info!(
            request_id = %self.request_id,
            applied = summary.applied,
            discarded = summary.discarded,
            malformed = summary.malformed,
            aborted = summary.aborted,
            "stream finished"
        );
        summary
    }

    pub fn route(&self, event: &StreamEvent) -> RouteOutcome {
        let outcome = match event {
            StreamEvent::BotResponse(payload) => self.bot_response(payload),
            StreamEvent::BotError(payload) => self.bot_error(payload),
            StreamEvent::SimilarityAnalysis(payload) => self.similarity(payload),
            StreamEvent::SimilarityError(payload) => self.similarity_error(payload),
            StreamEvent::Analysis(payload) => self.analysis(payload),
            StreamEvent::Error(payload) => {
                self.fail_turn(payload.detail());
                RouteOutcome::Applied
            }
            StreamEvent::Unknown => RouteOutcome::Ignored,
        };
        if let RouteOutcome::Discarded(reason) = outcome {
            debug!(request_id = %self.request_id, kind = event.kind(), ?reason, "event discarded");
        }
        self.record(event, outcome);
        outcome
    }

    /// Transport failure: every selected model gets the error for this turn,
    /// including models that already answered, and stops responding.
    pub fn fail_turn(&self, detail: &str) {
        warn!(request_id = %self.request_id, "turn failed: {detail}");
        let text = error_text(detail);
        self.conversation.update(|state| {
            for model in &self.models {
                state.append(ModelResponse::error(model, &self.request_id, &text));
                state.finish_responding(&self.request_id, model);
            }
        });
    }

    fn target<'a>(&'a self, payload_id: Option<&'a str>) -> &'a str {
        payload_id
            .filter(|value| !value.is_empty())
            .unwrap_or(self.request_id.as_str())
    }

    fn bot_response(&self, payload: &BotResponsePayload) -> RouteOutcome {
        if !self.is_selected(&payload.bot_id) {
            return RouteOutcome::Discarded(DiscardReason::UnselectedModel);
        }
        let request_id = self.target(payload.request_id.as_deref());
        let response = ModelResponse::reply(&payload.bot_id, request_id, &payload.response);
        self.append_and_finish(response)
    }

    fn bot_error(&self, payload: &BotErrorPayload) -> RouteOutcome {
        if !self.is_selected(&payload.bot_id) {
            return RouteOutcome::Discarded(DiscardReason::UnselectedModel);
        }
        let request_id = self.target(payload.request_id.as_deref());
        let text = error_text(&payload.error);
        self.append_and_finish(ModelResponse::error(&payload.bot_id, request_id, &text))
    }

    fn append_and_finish(&self, response: ModelResponse) -> RouteOutcome {
        self.conversation.update(|state| {
            let request_id = response.request_id.clone();
            let model_id = response.model_id.clone();
            if !state.append(response) {
                return RouteOutcome::Discarded(DiscardReason::UnknownTurn);
            }
            state.finish_responding(&request_id, &model_id);
            RouteOutcome::Applied
        })
    }

    fn similarity(&self, payload: &SimilarityPayload) -> RouteOutcome {
        let threshold = self.grouping.threshold;
        self.conversation.update(|state| {
            let request_id = self.known_or_scoped(state, payload.request_id.as_deref());
            if !state.has_turn(&request_id) {
                return RouteOutcome::Discarded(DiscardReason::UnknownTurn);
            }
            let matrix = payload
                .result
                .get("similarityMatrix")
                .and_then(|value| SimilarityMatrix::from_value(request_id.clone(), value));
            let groups = match &matrix {
                Some(matrix) if matrix.len() >= 2 => compute_groups(matrix, threshold),
                _ => match (decode_groups(&request_id, &payload.result), &matrix) {
                    (Some(groups), _) => groups,
                    (None, Some(matrix)) => compute_groups(matrix, threshold),
                    (None, None) => return RouteOutcome::Discarded(DiscardReason::MissingResult),
                },
            };
            state.record_similarity(matrix, groups);
            RouteOutcome::Applied
        })
    }

    fn similarity_error(&self, payload: &SimilarityErrorPayload) -> RouteOutcome {
        let detail = payload.error.as_deref().unwrap_or("similarity analysis failed");
        warn!(request_id = %self.request_id, "similarity analysis failed: {detail}");
        self.conversation.update(|state| {
            let request_id = self.known_or_scoped(state, payload.request_id.as_deref());
            if state.add_note(&request_id, format!("similarity: {detail}")) {
                RouteOutcome::Applied
            } else {
                RouteOutcome::Discarded(DiscardReason::UnknownTurn)
            }
        })
    }

    fn analysis(&self, payload: &AnalysisPayload) -> RouteOutcome {
        let lookup = self.target(payload.request_id.as_deref());
        let user_message = payload
            .user_message
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(self.user_text.as_str());

        self.conversation.update(|state| {
            let request_id = if state.has_turn(lookup) {
                lookup.to_string()
            } else {
                let turns = state.turns();
                match find_legacy_match(lookup, Some(user_message), &turns) {
                    Some(idx) => turns[idx].request_id.clone(),
                    None => return RouteOutcome::Discarded(DiscardReason::UnresolvedAnalysis),
                }
            };

            let timestamp_ms = now_millis();
            let key = unique_key(state, &format!("{user_message}_{timestamp_ms}"));
            let answer = OptimalAnswer {
                key,
                request_id,
                bot_name: payload.preferred_model.clone(),
                best_response: payload.best_response.clone(),
                assessments: parse_assessments(&payload.analysis),
                reasoning: payload.reasoning.clone(),
                errors: parse_errors(payload.errors.as_ref()),
                user_message: user_message.to_string(),
                timestamp_ms,
            };
            if state.record_analysis(answer) {
                RouteOutcome::Applied
            } else {
                RouteOutcome::Discarded(DiscardReason::UnknownTurn)
            }
        })
    }

    fn known_or_scoped(&self, state: &ConversationState, payload_id: Option<&str>) -> String {
        payload_id
            .filter(|id| state.has_turn(id))
            .unwrap_or(self.request_id.as_str())
            .to_string()
    }

    fn is_selected(&self, model_id: &str) -> bool {
        self.models.iter().any(|model| model == model_id)
    }

    fn record(&self, event: &StreamEvent, outcome: RouteOutcome) {
        let Some(transcript) = &self.transcript else {
            return;
        };
        let routed = TranscriptEvent::Routed {
            request_id: self.request_id.clone(),
            event: event.kind().to_string(),
            outcome: outcome.label().to_string(),
            payload: serde_json::to_value(event).ok(),
        };
        if let Err(err) = transcript.record(routed) {
            warn!("transcript write failed: {err:#}");
        }
    }
}

fn unique_key(state: &ConversationState, base: &str) -> String {
    if !state.has_analysis_key(base) {
        return base.to_string();
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !state.has_analysis_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}
