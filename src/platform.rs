//! Executes moderation actions against the concrete chat platform. Ported and
//! generalized from the teacher's `action.rs`: same semaphore-capped
//! outstanding-request limit, same retry/backoff on `RetryAfter` and network
//! errors, same "already gone" treatment of a family of API errors.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use teloxide::{
    prelude::*,
    types::{ChatId, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UserId},
    ApiError, RequestError,
};
use tokio::{sync::Semaphore, time::sleep};

use crate::error::PlatformError;

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Opaque chat-platform transport. Kept as a trait so the event loop and
/// admin handler never depend on teloxide directly — only `TeloxideActions`
/// does.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str);
    async fn delete_message(&self, chat_id: i64, msg_id: i32);
    async fn ban_user(&self, chat_id: i64, user_id: i64, until: Option<Duration>);
    async fn restrict_user(&self, chat_id: i64, user_id: i64, until: Option<Duration>);
    async fn unban_user(&self, chat_id: i64, user_id: i64);

    /// Sends a message with an inline keyboard, one row of buttons, each
    /// `(label, callback_data)`. Returns the sent message's id so the caller
    /// can edit it later, or `None` if the send failed.
    async fn send_report_notification(&self, chat_id: i64, text: &str, buttons: &[(String, String)]) -> Option<i32>;

    /// Replaces the text and inline keyboard of a previously sent report
    /// notification. An empty `buttons` slice removes the keyboard.
    async fn edit_report_notification(&self, chat_id: i64, msg_id: i32, text: &str, buttons: &[(String, String)]);

    /// Acknowledges a callback query so the client stops showing its loading
    /// spinner on the pressed button.
    async fn answer_callback_query(&self, callback_id: &str);
}

#[derive(Clone)]
pub struct TeloxideActions {
    bot: Bot,
    max_retry: u32,
    outstanding_limit: Arc<Semaphore>,
}

impl TeloxideActions {
    pub fn new(bot: Bot, max_outstanding_requests: usize, max_retry: u32) -> Self {
        Self {
            bot,
            max_retry,
            outstanding_limit: Arc::new(Semaphore::new(max_outstanding_requests)),
        }
    }
}

#[async_trait]
impl PlatformApi for TeloxideActions {
    async fn send_message(&self, chat_id: i64, text: &str) {
        let permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        let bot = self.bot.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(err) = bot.send_message(ChatId(chat_id), text).send().await {
                warn!("[{chat_id}] failed to send message: {err}");
            }
            drop(permit);
        });
    }

    async fn delete_message(&self, chat_id: i64, msg_id: i32) {
        let permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        let bot = self.bot.clone();
        let max_retry = self.max_retry;
        tokio::spawn(async move {
            info!("[{chat_id}] deleting [{msg_id}]");
            if let Err(err) = do_delete_message(bot, ChatId(chat_id), MessageId(msg_id), max_retry).await {
                warn!("[{chat_id}] failed to delete [{msg_id}]: {err:?}");
            }
            drop(permit);
        });
    }

    async fn ban_user(&self, chat_id: i64, user_id: i64, until: Option<Duration>) {
        let permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        let bot = self.bot.clone();
        let max_retry = self.max_retry;
        tokio::spawn(async move {
            info!("[{chat_id}] banning [{user_id}]");
            if let Err(err) = do_ban_user(bot, ChatId(chat_id), UserId(user_id as u64), until, max_retry).await {
                warn!("[{chat_id}] failed to ban [{user_id}]: {err:?}");
            }
            drop(permit);
        });
    }

    async fn restrict_user(&self, chat_id: i64, user_id: i64, until: Option<Duration>) {
        let permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        let bot = self.bot.clone();
        tokio::spawn(async move {
            info!("[{chat_id}] restricting [{user_id}]");
            let mut req = bot.restrict_chat_member(ChatId(chat_id), UserId(user_id as u64), ChatPermissions::empty());
            if let Some(d) = until {
                req = req.until_date(chrono::Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
            }
            if let Err(err) = req.send().await {
                warn!("[{chat_id}] failed to restrict [{user_id}]: {err}");
            }
            drop(permit);
        });
    }

    async fn unban_user(&self, chat_id: i64, user_id: i64) {
        let permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        let bot = self.bot.clone();
        tokio::spawn(async move {
            info!("[{chat_id}] unbanning [{user_id}]");
            if let Err(err) = bot.unban_chat_member(ChatId(chat_id), UserId(user_id as u64)).send().await {
                warn!("[{chat_id}] failed to unban [{user_id}]: {err}");
            }
            drop(permit);
        });
    }

    async fn send_report_notification(&self, chat_id: i64, text: &str, buttons: &[(String, String)]) -> Option<i32> {
        let _permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        let keyboard = to_keyboard(buttons);
        let mut req = self.bot.send_message(ChatId(chat_id), text);
        if let Some(keyboard) = keyboard {
            req = req.reply_markup(keyboard);
        }
        match req.send().await {
            Ok(msg) => Some(msg.id.0),
            Err(err) => {
                warn!("[{chat_id}] failed to send report notification: {err}");
                None
            }
        }
    }

    async fn edit_report_notification(&self, chat_id: i64, msg_id: i32, text: &str, buttons: &[(String, String)]) {
        let _permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        let mut req = self.bot.edit_message_text(ChatId(chat_id), MessageId(msg_id), text);
        req = match to_keyboard(buttons) {
            Some(keyboard) => req.reply_markup(keyboard),
            None => req,
        };
        if let Err(err) = req.send().await {
            warn!("[{chat_id}] failed to edit report notification [{msg_id}]: {err}");
        }
    }

    async fn answer_callback_query(&self, callback_id: &str) {
        let _permit = self.outstanding_limit.clone().acquire_owned().await.expect("semaphore never closes");
        if let Err(err) = self.bot.answer_callback_query(callback_id).send().await {
            debug!("failed to answer callback query {callback_id}: {err}");
        }
    }
}

fn to_keyboard(buttons: &[(String, String)]) -> Option<InlineKeyboardMarkup> {
    if buttons.is_empty() {
        return None;
    }
    let row = buttons
        .iter()
        .map(|(label, data)| InlineKeyboardButton::callback(label.clone(), data.clone()))
        .collect::<Vec<_>>();
    Some(InlineKeyboardMarkup::new(vec![row]))
}

async fn do_delete_message(bot: Bot, mut chat_id: ChatId, msg_id: MessageId, max_retry: u32) -> Result<(), PlatformError> {
    let mut retry = 0u32;
    loop {
        match bot.delete_message(chat_id, msg_id).send().await {
            Ok(_) => break Ok(()),
            Err(RequestError::RetryAfter(secs)) if retry < max_retry => {
                warn!("retry-after received, retrying delete in {secs} secs");
                let delay = secs.try_into().map(Duration::from_secs).unwrap_or(RETRY_BASE_DELAY);
                sleep(delay).await;
            }
            Err(RequestError::Network(err)) if retry < max_retry => {
                warn!("delayed delete due to network error: {err}");
                sleep(RETRY_BASE_DELAY * 2u32.pow(retry)).await;
            }
            Err(RequestError::MigrateToChatId(new_chat_id)) if retry < max_retry => {
                chat_id = new_chat_id;
            }
            Err(RequestError::Api(ApiError::MessageToDeleteNotFound))
            | Err(RequestError::Api(ApiError::MessageIdInvalid)) => {
                debug!("message [{chat_id}:{msg_id}] is already gone");
                break Ok(());
            }
            Err(RequestError::Api(ApiError::MessageCantBeDeleted)) => {
                debug!("insufficient rights to delete in {chat_id}");
                break Ok(());
            }
            Err(RequestError::Api(ApiError::BotKicked)) | Err(RequestError::Api(ApiError::ChatNotFound)) => {
                debug!("bot no longer in {chat_id}");
                break Ok(());
            }
            Err(err) => break Err(PlatformError::Api(err.to_string())),
        }
        retry += 1;
    }
}

async fn do_ban_user(bot: Bot, mut chat_id: ChatId, user_id: UserId, until: Option<Duration>, max_retry: u32) -> Result<(), PlatformError> {
    let mut retry = 0u32;
    loop {
        let mut req = bot.ban_chat_member(chat_id, user_id);
        if let Some(d) = until {
            req = req.until_date(chrono::Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        }
        match req.send().await {
            Ok(_) => break Ok(()),
            Err(RequestError::RetryAfter(secs)) if retry < max_retry => {
                let delay = secs.try_into().map(Duration::from_secs).unwrap_or(RETRY_BASE_DELAY);
                sleep(delay).await;
            }
            Err(RequestError::Network(err)) if retry < max_retry => {
                warn!("delayed ban due to network error: {err}");
                sleep(RETRY_BASE_DELAY * 2u32.pow(retry)).await;
            }
            Err(RequestError::MigrateToChatId(new_chat_id)) if retry < max_retry => {
                chat_id = new_chat_id;
            }
            Err(RequestError::Api(ApiError::BotKicked)) | Err(RequestError::Api(ApiError::ChatNotFound)) => {
                debug!("bot no longer in {chat_id}");
                break Ok(());
            }
            Err(err) => break Err(PlatformError::Api(err.to_string())),
        }
        retry += 1;
    }
}

