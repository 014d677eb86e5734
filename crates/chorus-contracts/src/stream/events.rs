use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of a chat stream, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    BotResponse(BotResponsePayload),
    BotError(BotErrorPayload),
    SimilarityAnalysis(SimilarityPayload),
    SimilarityError(SimilarityErrorPayload),
    Analysis(AnalysisPayload),
    /// Backend-level failure for the whole turn.
    Error(StreamFailurePayload),
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::BotResponse(_) => "bot_response",
            StreamEvent::BotError(_) => "bot_error",
            StreamEvent::SimilarityAnalysis(_) => "similarity_analysis",
            StreamEvent::SimilarityError(_) => "similarity_error",
            StreamEvent::Analysis(_) => "analysis",
            StreamEvent::Error(_) => "error",
            StreamEvent::Unknown => "unknown",
        }
    }

    /// Request id carried by the payload itself, if any.
    pub fn request_id(&self) -> Option<&str> {
        let value = match self {
            StreamEvent::BotResponse(payload) => payload.request_id.as_deref(),
            StreamEvent::BotError(payload) => payload.request_id.as_deref(),
            StreamEvent::SimilarityAnalysis(payload) => payload.request_id.as_deref(),
            StreamEvent::SimilarityError(payload) => payload.request_id.as_deref(),
            StreamEvent::Analysis(payload) => payload.request_id.as_deref(),
            StreamEvent::Error(_) | StreamEvent::Unknown => None,
        };
        value.filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotResponsePayload {
    #[serde(default)]
    pub bot_id: String,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotErrorPayload {
    #[serde(default)]
    pub bot_id: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityPayload {
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Carries `similarityMatrix` and/or one of the group shapes.
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityErrorPayload {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    #[serde(default)]
    pub preferred_model: Option<String>,
    #[serde(default, rename = "best_response")]
    pub best_response: String,
    #[serde(default)]
    pub analysis: Value,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub user_message: Option<String>,
    #[serde(default)]
    pub errors: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamFailurePayload {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StreamFailurePayload {
    pub fn detail(&self) -> &str {
        self.error
            .as_deref()
            .or(self.message.as_deref())
            .unwrap_or("stream failed")
    }
}

/// Decodes one stream line. Blank lines decode to `None`.
pub fn decode_line(line: &str) -> Result<Option<StreamEvent>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}
