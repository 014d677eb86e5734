//! Newline-delimited JSON chat streams: decoding and per-turn routing.

mod decoder;
mod error;
mod events;
mod router;

pub use decoder::{AbortSignal, EventStream, LineDecoder};
pub use error::StreamError;
pub use events::{
    decode_line, AnalysisPayload, BotErrorPayload, BotResponsePayload, SimilarityErrorPayload,
    SimilarityPayload, StreamEvent, StreamFailurePayload,
};
pub use router::{error_text, DiscardReason, RouteOutcome, RouteSummary, StreamRouter};
