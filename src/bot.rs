//! Pure message-to-response decision function. Nothing here talks to the
//! chat platform directly — the event loop applies whatever `Response` comes
//! back.

use std::{sync::Arc, time::Duration};

use sha2::{Digest, Sha256};

use crate::detector::Detector;
use crate::duplicate::DuplicateDetector;
use crate::message::{CheckRequest, CheckRequestMeta, CheckResponse, Message};

pub struct Response {
    pub text: String,
    pub send: bool,
    pub ban_interval: Option<Duration>,
    pub delete_reply_to: Option<i32>,
    pub user_id: String,
    pub user_name: String,
    pub extra_delete_ids: Vec<i32>,
    pub check_results: Vec<CheckResponse>,
}

impl Response {
    fn empty() -> Self {
        Self {
            text: String::new(),
            send: false,
            ban_interval: None,
            delete_reply_to: None,
            user_id: String::new(),
            user_name: String::new(),
            extra_delete_ids: Vec::new(),
            check_results: Vec::new(),
        }
    }
}

pub struct Bot {
    detector: Arc<Detector>,
    duplicate: Arc<DuplicateDetector>,
    ban_interval: Option<Duration>,
    dry_run: bool,
}

/// Counts distinct URLs, not raw occurrences — a message that repeats the
/// same link several times is not "more linky" than one that posts it once.
fn count_links(text: &str) -> u32 {
    text.split_whitespace()
        .filter(|tok| tok.starts_with("https://") || tok.starts_with("http://"))
        .collect::<std::collections::HashSet<_>>()
        .len() as u32
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

impl Bot {
    pub fn new(detector: Arc<Detector>, duplicate: Arc<DuplicateDetector>, ban_interval: Option<Duration>, dry_run: bool) -> Self {
        Self {
            detector,
            duplicate,
            ban_interval,
            dry_run,
        }
    }

    pub async fn on_message(&self, msg: &Message, check_only: bool) -> Response {
        let Some(sender) = &msg.sender_user else {
            return Response::empty();
        };
        if sender.id == 0 {
            return Response::empty();
        }
        let user_id = sender.id.to_string();

        let req = CheckRequest {
            text: msg.text.clone(),
            user_id: user_id.clone(),
            user_name: sender.name.clone(),
            meta: CheckRequestMeta {
                images: if msg.has_image { 1 } else { 0 },
                links: count_links(&msg.text),
                has_video: msg.flags.video || msg.flags.video_note,
                has_forward: msg.flags.forward,
                has_keyboard: msg.flags.keyboard,
                message_id: msg.id,
            },
            check_only,
        };

        let (mut spam, mut responses) = self.detector.check(&req).await;
        let mut extra_delete_ids = Vec::new();

        if self.duplicate.is_enabled() {
            let hash = sha256_hex(&msg.text);
            let dup = self.duplicate.check(&user_id, &hash, msg.id);
            if dup.spam {
                spam = true;
                extra_delete_ids = dup.extra_delete_ids;
                responses.push(CheckResponse::spam("duplicate", dup.details));
            }
        }

        if !spam {
            return Response {
                text: String::new(),
                send: false,
                ban_interval: None,
                delete_reply_to: None,
                user_id,
                user_name: sender.name.clone(),
                extra_delete_ids,
                check_results: responses,
            };
        }

        let prefix = if self.dry_run { "detected dry" } else { "detected" };
        let text = format!("{prefix}: spam from {} ({})", sender.display_name, user_id);

        Response {
            text,
            send: !check_only,
            ban_interval: self.ban_interval,
            delete_reply_to: Some(msg.id),
            user_id,
            user_name: sender.name.clone(),
            extra_delete_ids,
            check_results: responses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::message::{MessageFlags, SenderUser};
    use chrono::Utc;

    fn message(text: &str, user_id: i64, msg_id: i32) -> Message {
        Message {
            id: msg_id,
            sent_at: Utc::now(),
            chat_id: 100,
            sender_user: Some(SenderUser {
                id: user_id,
                name: "bob".to_string(),
                display_name: "Bob".to_string(),
            }),
            sender_chat: None,
            text: text.to_string(),
            has_image: false,
            flags: MessageFlags::default(),
            entity_links: Vec::new(),
            reply_to: None,
        }
    }

    #[test]
    fn count_links_deduplicates_repeated_urls() {
        assert_eq!(count_links("check http://a.com and http://a.com again"), 1);
        assert_eq!(count_links("http://a.com https://b.com"), 2);
        assert_eq!(count_links("no links here"), 0);
    }

    #[tokio::test]
    async fn system_message_is_ignored() {
        let cfg = Config::default();
        let detector = Arc::new(Detector::new(&cfg));
        let dup = Arc::new(DuplicateDetector::new(3, chrono::Duration::hours(1)));
        let bot = Bot::new(detector, dup, None, false);
        let mut msg = message("hi", 1, 1);
        msg.sender_user = Some(SenderUser { id: 0, name: String::new(), display_name: String::new() });
        let resp = bot.on_message(&msg, false).await;
        assert!(!resp.send);
        assert!(resp.text.is_empty());
    }

    #[tokio::test]
    async fn duplicate_trigger_requests_ban_and_extra_deletes() {
        let mut cfg = Config::default();
        cfg.first_message_only = false;
        let detector = Arc::new(Detector::new(&cfg));
        let dup = Arc::new(DuplicateDetector::new(2, chrono::Duration::hours(1)));
        let bot = Bot::new(detector, dup, None, false);

        let r1 = bot.on_message(&message("same text", 9, 1), false).await;
        assert!(!r1.send);
        let r2 = bot.on_message(&message("same text", 9, 2), false).await;
        assert!(r2.send);
        assert_eq!(r2.extra_delete_ids, vec![1]);
    }

    #[tokio::test]
    async fn dry_run_flags_but_marks_message_distinctly() {
        let mut cfg = Config::default();
        cfg.first_message_only = false;
        let detector = Arc::new(Detector::new(&cfg));
        detector.load_stop_words("free money\n", "").await;
        let dup = Arc::new(DuplicateDetector::new(3, chrono::Duration::hours(1)));
        let bot = Bot::new(detector, dup, None, true);
        let resp = bot.on_message(&message("free money now", 5, 1), false).await;
        assert!(resp.text.starts_with("detected dry"));
    }
}
