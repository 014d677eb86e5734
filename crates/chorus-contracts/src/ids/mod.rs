//! Per-turn correlation ids.
//!
//! Every submitted message gets one request id. The id is threaded through
//! the backend call so that out-of-order, per-model stream events can be
//! re-associated with the turn that produced them.

pub mod legacy;

pub use legacy::{find_legacy_match, legacy_message_key, resolve_message_id, CorrelatedMessage};

use rand::Rng;
use uuid::Uuid;

const REQUEST_PREFIX: &str = "req";
const IMAGE_REQUEST_PREFIX: &str = "img";
const SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Mints `req-{unix_ms}-{suffix}` for a text turn.
///
/// Unique within a session with high probability; collisions only risk
/// cross-talk between turns submitted in the same millisecond.
pub fn generate_request_id() -> String {
    mint(REQUEST_PREFIX)
}

/// Same as [`generate_request_id`] with the `img-` prefix used for image turns.
pub fn generate_image_request_id() -> String {
    mint(IMAGE_REQUEST_PREFIX)
}

/// Identifies one chat session in transcripts.
pub fn generate_session_id() -> String {
    format!("chat-{}", Uuid::new_v4())
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn mint(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("{prefix}-{}-{suffix}", now_millis())
}
