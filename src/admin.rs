//! Superuser moderation commands (`/spam`, `/ban`, `/warn`), the user-facing
//! `/report` flow with its rate limiting and callback-token encoding, and the
//! unban signed-URL generator/verifier.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::AdminError;

#[derive(Debug, Clone, PartialEq)]
pub enum AdminAction {
    Spam,
    Ban(Option<Duration>),
    Warn,
}

/// Recognizes a superuser's reply command, case-insensitively, accepting a
/// couple of common aliases the way moderation bots typically do.
pub fn parse_admin_command(text: &str) -> Option<AdminAction> {
    let trimmed = text.trim();
    let mut parts = trimmed.split_whitespace();
    let cmd = parts.next()?.to_lowercase();
    match cmd.as_str() {
        "/spam" | "/ham_no_wait_spam" | "/markspam" => Some(AdminAction::Spam),
        "/ban" => {
            let duration = parts.next().and_then(parse_duration_arg);
            Some(AdminAction::Ban(duration))
        }
        "/warn" => Some(AdminAction::Warn),
        _ => None,
    }
}

fn parse_duration_arg(arg: &str) -> Option<Duration> {
    let (num, unit) = arg.split_at(arg.len().saturating_sub(1));
    let n: u64 = num.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        "d" => Some(Duration::from_secs(n * 86400)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct ReportEntry {
    pub chat_id: i64,
    pub msg_id: i32,
    pub reporter_user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Callback-token prefixes attached to inline admin-chat buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportAction {
    ApproveBan,
    Reject,
    BanReporter,
    ConfirmBanReporter,
    Cancel,
}

impl ReportAction {
    pub fn prefix(self) -> &'static str {
        match self {
            ReportAction::ApproveBan => "R+",
            ReportAction::Reject => "R-",
            ReportAction::BanReporter => "R?",
            ReportAction::ConfirmBanReporter => "R!",
            ReportAction::Cancel => "RX",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "R+" => Some(ReportAction::ApproveBan),
            "R-" => Some(ReportAction::Reject),
            "R?" => Some(ReportAction::BanReporter),
            "R!" => Some(ReportAction::ConfirmBanReporter),
            "RX" => Some(ReportAction::Cancel),
            _ => None,
        }
    }

    pub fn encode(self, user_id: &str, msg_id: i32) -> String {
        format!("{}{}:{}", self.prefix(), user_id, msg_id)
    }

    /// Parses `{2-char prefix}{userID}:{msgID}` back into its parts.
    pub fn decode(token: &str) -> Option<(Self, String, i32)> {
        if token.len() < 2 {
            return None;
        }
        let (prefix, rest) = token.split_at(2);
        let action = Self::from_prefix(prefix)?;
        let (user_id, msg_id) = rest.split_once(':')?;
        let msg_id: i32 = msg_id.parse().ok()?;
        Some((action, user_id.to_string(), msg_id))
    }
}

pub struct ReportOutcome {
    pub count: usize,
    pub threshold_reached: bool,
}

/// In-memory report tracking, restart-tolerant by design (same rationale as
/// the duplicate detector): a lost report count after a restart just means a
/// report has to be re-submitted.
pub struct ReportStore {
    reports: Mutex<HashMap<(i64, i32), Vec<ReportEntry>>>,
    last_report_by_user: Mutex<HashMap<String, DateTime<Utc>>>,
    /// admin-chat notification message id for a given (chat_id, msg_id)
    /// report target, so a later threshold-crossing report edits the
    /// existing notification instead of sending a new one.
    notifications: Mutex<HashMap<(i64, i32), i32>>,
    /// reverse lookup from a notification's message id back to the report
    /// target it belongs to, so an inline-button callback (which only knows
    /// the notification message it's attached to) can find its target.
    notification_targets: Mutex<HashMap<i32, (i64, i32)>>,
    threshold: usize,
    rate_limit: chrono::Duration,
}

impl ReportStore {
    pub fn new(threshold: u32, rate_limit: Duration) -> Self {
        Self {
            reports: Mutex::new(HashMap::new()),
            last_report_by_user: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
            notification_targets: Mutex::new(HashMap::new()),
            threshold: threshold as usize,
            rate_limit: chrono::Duration::from_std(rate_limit).unwrap_or_default(),
        }
    }

    /// Validated: reporter != superuser (caller's responsibility), reported
    /// != superuser (caller's responsibility), and a per-reporter rate limit
    /// enforced here.
    pub fn report(&self, chat_id: i64, msg_id: i32, reporter_user_id: &str) -> Result<ReportOutcome, AdminError> {
        let now = Utc::now();
        {
            let mut last = self.last_report_by_user.lock().expect("report rate-limit mutex poisoned");
            if let Some(prev) = last.get(reporter_user_id) {
                if now - *prev < self.rate_limit {
                    return Err(AdminError::RateLimited);
                }
            }
            last.insert(reporter_user_id.to_string(), now);
        }

        let mut reports = self.reports.lock().expect("report store mutex poisoned");
        let entries = reports.entry((chat_id, msg_id)).or_default();
        entries.push(ReportEntry {
            chat_id,
            msg_id,
            reporter_user_id: reporter_user_id.to_string(),
            timestamp: now,
        });
        let count = entries.len();
        Ok(ReportOutcome {
            count,
            threshold_reached: count >= self.threshold,
        })
    }

    /// The admin-chat notification message id already sent for this report
    /// target, if any.
    pub fn notification_message_id(&self, chat_id: i64, msg_id: i32) -> Option<i32> {
        self.notifications
            .lock()
            .expect("report notification mutex poisoned")
            .get(&(chat_id, msg_id))
            .copied()
    }

    /// Records that `notification_id` (in the admin chat) now represents the
    /// report against `(chat_id, msg_id)`.
    pub fn set_notification_message_id(&self, chat_id: i64, msg_id: i32, notification_id: i32) {
        self.notifications
            .lock()
            .expect("report notification mutex poisoned")
            .insert((chat_id, msg_id), notification_id);
        self.notification_targets
            .lock()
            .expect("report notification target mutex poisoned")
            .insert(notification_id, (chat_id, msg_id));
    }

    /// Resolves a notification message id (from a callback query) back to
    /// the `(chat_id, msg_id)` report target it was sent for.
    pub fn target_for_notification(&self, notification_id: i32) -> Option<(i64, i32)> {
        self.notification_targets
            .lock()
            .expect("report notification target mutex poisoned")
            .get(&notification_id)
            .copied()
    }

    /// Clears a resolved report: its entries and its notification mapping.
    /// Called once a callback action (ban, reject, cancel, ...) disposes of
    /// the report so stale button presses on the same message no longer
    /// resolve to a live target.
    pub fn resolve(&self, chat_id: i64, msg_id: i32) {
        self.reports.lock().expect("report store mutex poisoned").remove(&(chat_id, msg_id));
        if let Some(notification_id) = self
            .notifications
            .lock()
            .expect("report notification mutex poisoned")
            .remove(&(chat_id, msg_id))
        {
            self.notification_targets
                .lock()
                .expect("report notification target mutex poisoned")
                .remove(&notification_id);
        }
    }
}

/// Verifies `sha256_hex(user_id + "::" + secret)` in constant time, so an
/// attacker probing the unban endpoint can't learn anything from response
/// timing.
pub fn generate_unban_token(user_id: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"::");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn generate_unban_url(base_url: &str, user_id: &str, secret: &str) -> String {
    let token = generate_unban_token(user_id, secret);
    format!("{}/unban?user={}&token={}", base_url.trim_end_matches('/'), user_id, token)
}

pub fn verify_unban_token(user_id: &str, secret: &str, candidate: &str) -> bool {
    let expected = generate_unban_token(user_id, secret);
    constant_time_eq(expected.as_bytes(), candidate.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitive_commands_with_duration() {
        assert_eq!(parse_admin_command("/SPAM"), Some(AdminAction::Spam));
        assert_eq!(parse_admin_command("/ban 2h"), Some(AdminAction::Ban(Some(Duration::from_secs(7200)))));
        assert_eq!(parse_admin_command("/ban"), Some(AdminAction::Ban(None)));
        assert_eq!(parse_admin_command("/warn"), Some(AdminAction::Warn));
        assert_eq!(parse_admin_command("/notacommand"), None);
    }

    #[test]
    fn callback_token_roundtrip() {
        let token = ReportAction::ApproveBan.encode("42", 99);
        assert_eq!(token, "R+42:99");
        let (action, user_id, msg_id) = ReportAction::decode(&token).unwrap();
        assert_eq!(action, ReportAction::ApproveBan);
        assert_eq!(user_id, "42");
        assert_eq!(msg_id, 99);
    }

    #[test]
    fn report_store_enforces_rate_limit_and_threshold() {
        let store = ReportStore::new(2, Duration::from_secs(300));
        let r1 = store.report(1, 10, "reporter-a").unwrap();
        assert_eq!(r1.count, 1);
        assert!(!r1.threshold_reached);
        // same reporter again immediately: rate limited.
        assert!(store.report(1, 10, "reporter-a").is_err());
        let r2 = store.report(1, 10, "reporter-b").unwrap();
        assert_eq!(r2.count, 2);
        assert!(r2.threshold_reached);
    }

    #[test]
    fn notification_lookup_roundtrips_and_resolve_clears_it() {
        let store = ReportStore::new(1, Duration::from_secs(0));
        store.report(1, 10, "reporter-a").unwrap();
        assert!(store.notification_message_id(1, 10).is_none());
        store.set_notification_message_id(1, 10, 555);
        assert_eq!(store.notification_message_id(1, 10), Some(555));
        assert_eq!(store.target_for_notification(555), Some((1, 10)));
        store.resolve(1, 10);
        assert!(store.notification_message_id(1, 10).is_none());
        assert!(store.target_for_notification(555).is_none());
    }

    #[test]
    fn unban_token_verifies_and_rejects_tampering() {
        let url = generate_unban_url("https://bot.example", "42", "s3cr3t");
        assert!(url.contains("user=42"));
        let token = generate_unban_token("42", "s3cr3t");
        assert!(verify_unban_token("42", "s3cr3t", &token));
        assert!(!verify_unban_token("42", "s3cr3t", "deadbeef"));
        assert!(!verify_unban_token("43", "s3cr3t", &token));
    }
}
