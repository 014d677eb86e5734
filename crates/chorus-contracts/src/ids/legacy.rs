//! Adapter for payloads that predate request ids.
//!
//! Older backends keyed user messages by `"{text}-{index}"`. These keys change
//! whenever the text changes, so nothing outside this module should rely on
//! them. Delete once every backend sends `requestId`.

use tracing::warn;

pub trait CorrelatedMessage {
    fn request_id(&self) -> Option<&str>;
    fn text(&self) -> &str;
}

pub fn legacy_message_key(text: &str, index: usize) -> String {
    format!("{text}-{index}")
}

/// Returns the message's request id, or the unstable text+index key when the
/// message has none.
pub fn resolve_message_id<M: CorrelatedMessage>(message: &M, fallback_index: usize) -> String {
    match message.request_id().filter(|value| !value.is_empty()) {
        Some(request_id) => request_id.to_string(),
        None => legacy_message_key(message.text(), fallback_index),
    }
}

/// Finds the user message a legacy key refers to. Request ids are compared
/// first, then `"{text}-{index}"` keys. After that the newest message with
/// the same text wins; with no text to compare, the newest message does.
/// `messages` is oldest first.
pub fn find_legacy_match<M: CorrelatedMessage>(
    key: &str,
    user_text: Option<&str>,
    messages: &[M],
) -> Option<usize> {
    if let Some(idx) = messages
        .iter()
        .position(|message| message.request_id() == Some(key))
    {
        return Some(idx);
    }
    if let Some(idx) = messages
        .iter()
        .enumerate()
        .position(|(idx, message)| legacy_message_key(message.text(), idx) == key)
    {
        warn!(key, "matched message through legacy text+index key");
        return Some(idx);
    }
    let idx = match user_text.map(str::trim).filter(|value| !value.is_empty()) {
        Some(text) => messages
            .iter()
            .rposition(|message| message.text().trim() == text)?,
        None => messages.len().checked_sub(1)?,
    };
    warn!(key, "matched newest plausible message");
    Some(idx)
}

#[cfg(test)]
mod tests {
    use super::{find_legacy_match, legacy_message_key, resolve_message_id, CorrelatedMessage};

    struct Msg {
        request_id: Option<&'static str>,
        text: &'static str,
    }

    impl CorrelatedMessage for Msg {
        fn request_id(&self) -> Option<&str> {
            self.request_id
        }

        fn text(&self) -> &str {
            self.text
        }
    }

    #[test]
    fn resolve_prefers_request_id() {
        let msg = Msg {
            request_id: Some("req-1-abc"),
            text: "hello",
        };
        assert_eq!(resolve_message_id(&msg, 4), "req-1-abc");
    }

    #[test]
    fn resolve_falls_back_to_text_and_index() {
        let missing = Msg {
            request_id: None,
            text: "hello",
        };
        let blank = Msg {
            request_id: Some(""),
            text: "hello",
        };
        assert_eq!(resolve_message_id(&missing, 2), "hello-2");
        assert_eq!(resolve_message_id(&blank, 0), "hello-0");
    }

    #[test]
    fn legacy_key_changes_when_text_changes() {
        assert_ne!(legacy_message_key("hello", 0), legacy_message_key("hello!", 0));
    }

    #[test]
    fn find_match_by_id_then_key_then_text() {
        let messages = vec![
            Msg {
                request_id: None,
                text: "first",
            },
            Msg {
                request_id: Some("req-2"),
                text: "second",
            },
            Msg {
                request_id: None,
                text: "third",
            },
        ];
        assert_eq!(find_legacy_match("req-2", None, &messages), Some(1));
        assert_eq!(find_legacy_match("third-2", None, &messages), Some(2));
        assert_eq!(find_legacy_match("gone", Some(" first "), &messages), Some(0));
        assert_eq!(find_legacy_match("gone", Some("nothing"), &messages), None);
        assert_eq!(find_legacy_match("gone", None, &messages), Some(2));
        assert_eq!(find_legacy_match::<Msg>("gone", None, &[]), None);
    }

    #[test]
    fn repeated_text_matches_newest_message() {
        let messages = vec![
            Msg {
                request_id: Some("req-a"),
                text: "hi",
            },
            Msg {
                request_id: Some("req-b"),
                text: "hi",
            },
            Msg {
                request_id: Some("req-c"),
                text: "bye",
            },
        ];
        assert_eq!(find_legacy_match("legacy-1", Some("hi"), &messages), Some(1));
    }
}
