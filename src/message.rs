//! Normalized message representation and the request/response types that flow
//! through the check pipeline. Platform-specific updates are transformed into
//! `Message` at the edge of the event loop (see `listener.rs`); nothing below
//! this module knows about teloxide types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFlags {
    pub video: bool,
    pub video_note: bool,
    pub audio: bool,
    pub forward: bool,
    pub keyboard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderUser {
    pub id: i64,
    pub name: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: i32,
    pub sent_at: chrono::DateTime<chrono::Utc>,
    pub chat_id: i64,
    pub sender_user: Option<SenderUser>,
    pub sender_chat: Option<i64>,
    pub text: String,
    pub has_image: bool,
    pub flags: MessageFlags,
    pub entity_links: Vec<String>,
    pub reply_to: Option<i32>,
}

impl Message {
    /// Merges a caption into the message body the way the teacher's platform
    /// layer is expected to: caption-only becomes the text; both present are
    /// joined by a newline.
    pub fn merge_caption(text: Option<&str>, caption: Option<&str>) -> String {
        match (text, caption) {
            (Some(t), Some(c)) if !c.is_empty() => format!("{t}\n{c}"),
            (Some(t), _) => t.to_string(),
            (None, Some(c)) => c.to_string(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckRequestMeta {
    pub images: u32,
    pub links: u32,
    pub has_video: bool,
    pub has_forward: bool,
    pub has_keyboard: bool,
    pub message_id: i32,
}

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub text: String,
    pub user_id: String,
    pub user_name: String,
    pub meta: CheckRequestMeta,
    pub check_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckResponse {
    pub name: String,
    pub spam: bool,
    pub details: String,
    pub error: Option<String>,
    pub extra_delete_ids: Option<Vec<i32>>,
}

impl CheckResponse {
    pub fn ham(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spam: false,
            details: details.into(),
            error: None,
            extra_delete_ids: None,
        }
    }

    pub fn spam(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spam: true,
            details: details.into(),
            error: None,
            extra_delete_ids: None,
        }
    }

    pub fn errored(name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            name: name.into(),
            spam: false,
            details: String::new(),
            error: Some(err.to_string()),
            extra_delete_ids: None,
        }
    }
}

/// Collapse a pipeline's responses into a single verdict: spam iff any
/// response says so.
pub fn combined_verdict(responses: &[CheckResponse]) -> bool {
    responses.iter().any(|r| r.spam)
}
