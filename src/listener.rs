//! Single-consumer event loop: routes every incoming, already-normalized
//! `Message` to either the admin command handler or the bot, applies the
//! resulting action through the platform adapter, and persists outcomes to
//! the locator and the detected-spam ledger.

use std::{collections::HashSet, sync::Arc, time::Duration};

use crate::admin::{generate_unban_url, parse_admin_command, AdminAction, ReportAction, ReportStore};
use crate::bot::Bot;
use crate::detector::Detector;
use crate::message::Message;
use crate::platform::PlatformApi;
use crate::storage::detected_spam::DetectedSpamLedger;
use crate::storage::locator::Locator;
use crate::storage::CancelFlag;

pub struct ListenerConfig {
    pub admin_chat_id: Option<i64>,
    pub superusers: HashSet<i64>,
    pub unban_secret: String,
    pub unban_base_url: String,
    pub report_threshold: u32,
    pub report_rate_limit: Duration,
}

pub struct Listener<P: PlatformApi> {
    bot: Bot,
    detector: Arc<Detector>,
    locator: Arc<Locator>,
    ledger: Arc<DetectedSpamLedger>,
    platform: Arc<P>,
    reports: ReportStore,
    cfg: ListenerConfig,
    cancel: CancelFlag,
}

impl<P: PlatformApi> Listener<P> {
    pub fn new(
        bot: Bot,
        detector: Arc<Detector>,
        locator: Arc<Locator>,
        ledger: Arc<DetectedSpamLedger>,
        platform: Arc<P>,
        cfg: ListenerConfig,
    ) -> Self {
        let reports = ReportStore::new(cfg.report_threshold, cfg.report_rate_limit);
        Self {
            bot,
            detector,
            locator,
            ledger,
            platform,
            reports,
            cfg,
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_token(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Processes one incoming message. `reply_to` is the message this one
    /// replies to (if any) — admin commands and `/report` both require one.
    pub async fn handle(&self, msg: &Message, reply_to: Option<&Message>, is_admin_chat: bool, is_superuser: bool) {
        if self.cancel.is_cancelled() {
            return;
        }

        if is_admin_chat && is_superuser {
            if let (Some(action), Some(target)) = (parse_admin_command(&msg.text), reply_to) {
                self.handle_admin_action(action, msg, target).await;
                return;
            }
        }

        if !is_superuser && reply_to.is_some() && msg.text.trim().eq_ignore_ascii_case("/report") {
            self.handle_report(msg, reply_to.unwrap()).await;
            return;
        }

        let response = self.bot.on_message(msg, false).await;

        if let Some(sender) = &msg.sender_user {
            if let Err(e) = self
                .locator
                .add_message(&msg.text, msg.chat_id, &sender.id.to_string(), &sender.name, msg.id)
                .await
            {
                log::warn!("failed to record locator entry: {e}");
            }
        }

        if !response.send {
            return;
        }

        self.apply_action(msg.chat_id, response.delete_reply_to, &response.extra_delete_ids, &response.user_id, response.ban_interval)
            .await;

        if let Err(e) = self
            .ledger
            .write(&msg.text, &response.user_id, &response.user_name, &response.check_results)
            .await
        {
            log::warn!("failed to write detected-spam ledger entry: {e}");
        }

        if let Some(admin_chat_id) = self.cfg.admin_chat_id {
            self.announce(admin_chat_id, &response.text).await;
        }
    }

    async fn handle_admin_action(&self, action: AdminAction, command_msg: &Message, target: &Message) {
        let Some(target_sender) = &target.sender_user else { return };
        let user_id_i64 = target_sender.id;
        let user_id = user_id_i64.to_string();

        match action {
            AdminAction::Spam => {
                if let Err(e) = self.detector.update_spam(&target.text).await {
                    log::warn!("failed to record spam sample: {e}");
                }
                let checks = vec![crate::message::CheckResponse::spam("admin", "marked spam by superuser")];
                if let Err(e) = self.ledger.write(&target.text, &user_id, &target_sender.name, &checks).await {
                    log::warn!("failed to write detected-spam ledger entry: {e}");
                }
                self.platform.delete_message(command_msg.chat_id, command_msg.id).await;
                self.platform.delete_message(target.chat_id, target.id).await;
                self.platform.ban_user(target.chat_id, user_id_i64, None).await;
            }
            AdminAction::Ban(duration) => {
                self.platform.delete_message(command_msg.chat_id, command_msg.id).await;
                self.platform.ban_user(target.chat_id, user_id_i64, duration).await;
            }
            AdminAction::Warn => {
                self.platform.delete_message(command_msg.chat_id, command_msg.id).await;
                self.platform.delete_message(target.chat_id, target.id).await;
                self.platform
                    .send_message(target.chat_id, &format!("@{} your message was removed", target_sender.name))
                    .await;
            }
        }
    }

    async fn handle_report(&self, command_msg: &Message, target: &Message) {
        let Some(reporter) = &command_msg.sender_user else { return };
        let Some(reported) = &target.sender_user else { return };
        if self.cfg.superusers.contains(&reporter.id) || self.cfg.superusers.contains(&reported.id) {
            return;
        }

        self.platform.delete_message(command_msg.chat_id, command_msg.id).await;

        match self.reports.report(command_msg.chat_id, target.id, &reporter.id.to_string()) {
            Ok(outcome) if outcome.threshold_reached => {
                let Some(admin_chat_id) = self.cfg.admin_chat_id else { return };
                let unban_url = generate_unban_url(&self.cfg.unban_base_url, &reported.id.to_string(), &self.cfg.unban_secret);
                let text = format!(
                    "report threshold reached ({} reports) for {} in chat {}. unban: {}",
                    outcome.count, reported.name, target.chat_id, unban_url
                );
                let buttons = report_buttons(&reported.id.to_string(), &reporter.id.to_string(), target.id);

                if let Some(existing_id) = self.reports.notification_message_id(command_msg.chat_id, target.id) {
                    self.platform.edit_report_notification(admin_chat_id, existing_id, &text, &buttons).await;
                } else if let Some(new_id) = self.platform.send_report_notification(admin_chat_id, &text, &buttons).await {
                    self.reports.set_notification_message_id(command_msg.chat_id, target.id, new_id);
                }
            }
            Ok(_) => {}
            Err(e) => log::debug!("report rejected: {e}"),
        }
    }

    /// Handles a press on one of the report notification's inline buttons.
    /// `notification_msg_id` and `callback_id` come straight off the
    /// incoming `CallbackQuery`; `data` is its encoded `ReportAction` token.
    pub async fn handle_report_callback(&self, notification_msg_id: i32, callback_id: &str, data: &str) {
        let Some(admin_chat_id) = self.cfg.admin_chat_id else { return };
        let Some((action, acted_user_id, target_msg_id)) = ReportAction::decode(data) else {
            self.platform.answer_callback_query(callback_id).await;
            return;
        };
        let Some((chat_id, _)) = self.reports.target_for_notification(notification_msg_id) else {
            self.platform.answer_callback_query(callback_id).await;
            return;
        };
        let acted_user_id_i64: i64 = acted_user_id.parse().unwrap_or_default();

        match action {
            ReportAction::ApproveBan => {
                self.platform.ban_user(chat_id, acted_user_id_i64, None).await;
                self.platform.delete_message(chat_id, target_msg_id).await;
                self.reports.resolve(chat_id, target_msg_id);
                self.platform
                    .edit_report_notification(admin_chat_id, notification_msg_id, "report resolved: user banned", &[])
                    .await;
            }
            ReportAction::Reject => {
                self.reports.resolve(chat_id, target_msg_id);
                self.platform
                    .edit_report_notification(admin_chat_id, notification_msg_id, "report dismissed", &[])
                    .await;
            }
            ReportAction::BanReporter => {
                let confirm_buttons = vec![
                    ("confirm ban reporter".to_string(), ReportAction::ConfirmBanReporter.encode(&acted_user_id, target_msg_id)),
                    ("cancel".to_string(), ReportAction::Cancel.encode(&acted_user_id, target_msg_id)),
                ];
                self.platform
                    .edit_report_notification(admin_chat_id, notification_msg_id, "ban the reporter for abuse?", &confirm_buttons)
                    .await;
            }
            ReportAction::ConfirmBanReporter => {
                self.platform.ban_user(chat_id, acted_user_id_i64, None).await;
                self.reports.resolve(chat_id, target_msg_id);
                self.platform
                    .edit_report_notification(admin_chat_id, notification_msg_id, "reporter banned", &[])
                    .await;
            }
            ReportAction::Cancel => {
                self.reports.resolve(chat_id, target_msg_id);
                self.platform
                    .edit_report_notification(admin_chat_id, notification_msg_id, "report cancelled", &[])
                    .await;
            }
        }

        self.platform.answer_callback_query(callback_id).await;
    }

    async fn apply_action(&self, chat_id: i64, delete_reply_to: Option<i32>, extra_delete_ids: &[i32], user_id: &str, ban_interval: Option<Duration>) {
        if let Some(msg_id) = delete_reply_to {
            self.platform.delete_message(chat_id, msg_id).await;
        }
        for id in extra_delete_ids {
            self.platform.delete_message(chat_id, *id).await;
        }
        if let Ok(uid) = user_id.parse::<i64>() {
            self.platform.ban_user(chat_id, uid, ban_interval).await;
        }
    }

    /// Sends the admin-chat announcement. Markdown/HTML/plain fallback is a
    /// platform-rendering concern; `PlatformApi::send_message` takes plain
    /// text here and the concrete teloxide adapter is responsible for any
    /// parse-mode fallback, matching the design note in DESIGN.md.
    async fn announce(&self, admin_chat_id: i64, text: &str) {
        self.platform.send_message(admin_chat_id, text).await;
    }
}

fn report_buttons(reported_user_id: &str, reporter_user_id: &str, msg_id: i32) -> Vec<(String, String)> {
    vec![
        ("ban".to_string(), ReportAction::ApproveBan.encode(reported_user_id, msg_id)),
        ("reject".to_string(), ReportAction::Reject.encode(reported_user_id, msg_id)),
        ("ban reporter".to_string(), ReportAction::BanReporter.encode(reporter_user_id, msg_id)),
        ("cancel".to_string(), ReportAction::Cancel.encode(reported_user_id, msg_id)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::duplicate::DuplicateDetector;
    use crate::message::{MessageFlags, SenderUser};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingPlatform {
        calls: StdMutex<Vec<String>>,
        next_notification_id: StdMutex<i32>,
    }

    #[async_trait]
    impl PlatformApi for RecordingPlatform {
        async fn send_message(&self, chat_id: i64, text: &str) {
            self.calls.lock().unwrap().push(format!("send:{chat_id}:{text}"));
        }
        async fn delete_message(&self, chat_id: i64, msg_id: i32) {
            self.calls.lock().unwrap().push(format!("delete:{chat_id}:{msg_id}"));
        }
        async fn ban_user(&self, chat_id: i64, user_id: i64, _until: Option<Duration>) {
            self.calls.lock().unwrap().push(format!("ban:{chat_id}:{user_id}"));
        }
        async fn restrict_user(&self, chat_id: i64, user_id: i64, _until: Option<Duration>) {
            self.calls.lock().unwrap().push(format!("restrict:{chat_id}:{user_id}"));
        }
        async fn unban_user(&self, chat_id: i64, user_id: i64) {
            self.calls.lock().unwrap().push(format!("unban:{chat_id}:{user_id}"));
        }
        async fn send_report_notification(&self, chat_id: i64, text: &str, buttons: &[(String, String)]) -> Option<i32> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("send_report:{chat_id}:{text}:{}", buttons.len()));
            let mut next = self.next_notification_id.lock().unwrap();
            *next += 1;
            Some(*next)
        }
        async fn edit_report_notification(&self, chat_id: i64, msg_id: i32, text: &str, buttons: &[(String, String)]) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("edit_report:{chat_id}:{msg_id}:{text}:{}", buttons.len()));
        }
        async fn answer_callback_query(&self, callback_id: &str) {
            self.calls.lock().unwrap().push(format!("answer:{callback_id}"));
        }
    }

    fn message(text: &str, user_id: i64, msg_id: i32, chat_id: i64) -> Message {
        Message {
            id: msg_id,
            sent_at: Utc::now(),
            chat_id,
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

    async fn make_listener(platform: Arc<RecordingPlatform>) -> Listener<RecordingPlatform> {
        let mut cfg = Config::default();
        cfg.first_message_only = false;
        let detector = Arc::new(Detector::new(&cfg));
        detector.load_stop_words("free money\n", "").await;
        let dup = Arc::new(DuplicateDetector::new(3, chrono::Duration::hours(1)));
        let bot = Bot::new(detector.clone(), dup, None, false);

        let engine = crate::storage::Engine::open("memory", "g1").await.unwrap();
        let locator = Arc::new(Locator::new(engine, chrono::Duration::hours(24), 100).await.unwrap());
        let engine2 = crate::storage::Engine::open("memory", "g1").await.unwrap();
        let ledger = Arc::new(DetectedSpamLedger::new(engine2).await.unwrap());

        Listener::new(
            bot,
            detector,
            locator,
            ledger,
            platform,
            ListenerConfig {
                admin_chat_id: Some(999),
                superusers: HashSet::new(),
                unban_secret: "s3cr3t".to_string(),
                unban_base_url: "https://bot.example".to_string(),
                report_threshold: 2,
                report_rate_limit: Duration::from_secs(300),
            },
        )
    }

    #[tokio::test]
    async fn spam_message_deletes_and_bans() {
        let platform = Arc::new(RecordingPlatform::default());
        let listener = make_listener(platform.clone()).await;
        let msg = message("free money free money", 7, 1, 10);
        listener.handle(&msg, None, false, false).await;
        let calls = platform.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("delete:10:1")));
        assert!(calls.iter().any(|c| c.starts_with("ban:10:7")));
        assert!(calls.iter().any(|c| c.starts_with("send:999:")));
    }

    #[tokio::test]
    async fn admin_spam_command_bans_replied_user() {
        let platform = Arc::new(RecordingPlatform::default());
        let listener = make_listener(platform.clone()).await;
        let target = message("buy this now", 42, 5, 999);
        let mut cmd = message("/spam", 1, 6, 999);
        cmd.sender_user = Some(SenderUser { id: 1, name: "admin".to_string(), display_name: "Admin".to_string() });

        let mut superusers = HashSet::new();
        superusers.insert(1);
        let listener = Listener::new(
            listener.bot,
            listener.detector,
            listener.locator,
            listener.ledger,
            platform.clone(),
            ListenerConfig {
                admin_chat_id: Some(999),
                superusers,
                unban_secret: "s3cr3t".to_string(),
                unban_base_url: "https://bot.example".to_string(),
                report_threshold: 2,
                report_rate_limit: Duration::from_secs(300),
            },
        );

        listener.handle(&cmd, Some(&target), true, true).await;
        let calls = platform.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("ban:999:42")));
        assert!(calls.iter().any(|c| c.starts_with("delete:999:5")));
    }

    #[tokio::test]
    async fn second_report_over_threshold_edits_instead_of_resending() {
        let platform = Arc::new(RecordingPlatform::default());
        let listener = make_listener(platform.clone()).await;
        let target = message("some message", 42, 5, 10);

        let mut reporter_a = message("/report", 1, 6, 10);
        reporter_a.sender_user = Some(SenderUser { id: 1, name: "a".to_string(), display_name: "A".to_string() });
        listener.handle(&reporter_a, Some(&target), false, false).await;

        let mut reporter_b = message("/report", 2, 7, 10);
        reporter_b.sender_user = Some(SenderUser { id: 2, name: "b".to_string(), display_name: "B".to_string() });
        listener.handle(&reporter_b, Some(&target), false, false).await;

        let calls = platform.calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| c.starts_with("send_report:")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with("edit_report:")).count(), 1);
    }

    #[tokio::test]
    async fn approve_ban_callback_bans_and_clears_notification() {
        let platform = Arc::new(RecordingPlatform::default());
        let listener = make_listener(platform.clone()).await;
        let target = message("some message", 42, 5, 10);

        let mut reporter_a = message("/report", 1, 6, 10);
        reporter_a.sender_user = Some(SenderUser { id: 1, name: "a".to_string(), display_name: "A".to_string() });
        listener.handle(&reporter_a, Some(&target), false, false).await;
        let mut reporter_b = message("/report", 2, 7, 10);
        reporter_b.sender_user = Some(SenderUser { id: 2, name: "b".to_string(), display_name: "B".to_string() });
        listener.handle(&reporter_b, Some(&target), false, false).await;

        let notification_id = listener.reports.notification_message_id(10, 5).unwrap();
        let token = ReportAction::ApproveBan.encode("42", 5);
        listener.handle_report_callback(notification_id, "cb1", &token).await;

        let calls = platform.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.starts_with("ban:10:42")));
        assert!(calls.iter().any(|c| c.starts_with("delete:10:5")));
        assert!(calls.iter().any(|c| c.starts_with("answer:cb1")));
        assert!(listener.reports.notification_message_id(10, 5).is_none());
    }
}
