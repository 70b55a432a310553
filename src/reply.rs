//! Channel-neutral reply payloads.

use serde::Serialize;

/// One quick-reply option attached to a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuickReplyOption {
    /// Button label shown to the user.
    pub title: String,
    /// Opaque payload delivered back when the user presses the button.
    pub payload: String,
}

/// A reply produced by the resolution pipeline.
///
/// The channel adapter owns the translation into the platform's wire
/// format; the pipeline only decides what to say.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Plain text utterance.
    Text { text: String },
    /// A question with tappable yes/no style options.
    QuickReplies {
        text: String,
        options: Vec<QuickReplyOption>,
    },
    /// Structured attachment in the channel's template schema.
    Attachment { attachment: serde_json::Value },
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text { text: text.into() }
    }

    /// The spoken text of this reply, if it has one.
    pub fn speech(&self) -> Option<&str> {
        match self {
            Reply::Text { text } | Reply::QuickReplies { text, .. } => Some(text),
            Reply::Attachment { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_reply_exposes_speech() {
        let reply = Reply::text("Hello!");
        assert_eq!(reply.speech(), Some("Hello!"));
    }

    #[test]
    fn attachment_reply_has_no_speech() {
        let reply = Reply::Attachment {
            attachment: serde_json::json!({"type": "template"}),
        };
        assert_eq!(reply.speech(), None);
    }
}
