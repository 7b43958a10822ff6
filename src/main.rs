use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use futures::StreamExt;
use groupguard::config::{read_token, state_directory, Cli, Config};
use groupguard::detector::Detector;
use groupguard::duplicate::DuplicateDetector;
use groupguard::storage::approved_users::ApprovedUsersStore;
use groupguard::storage::detected_spam::DetectedSpamLedger;
use groupguard::storage::locator::Locator;
use groupguard::storage::samples::{SampleOrigin, SampleType, SamplesStore, SamplesStoreUpdater};
use groupguard::storage::Engine;
use groupguard::{Bot as GgBot, Listener, ListenerConfig, TeloxideActions};
use log::{debug, info, warn};
use teloxide::{
    dispatching::update_listeners::{polling_default, AsUpdateStream},
    prelude::*,
    types::{MaybeInaccessibleMessage, MessageKind, UpdateKind},
    RequestError,
};
use tokio::signal;

const MAX_OUTSTANDING_REQUESTS: usize = 30;
const MAX_RETRY: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

fn resolve_dsn(cfg: &Config, state_dir: &std::path::Path) -> String {
    if cfg.dsn == "memory" || cfg.dsn.contains("://") || cfg.dsn.starts_with("sqlite:") {
        return cfg.dsn.clone();
    }
    let mut path: PathBuf = state_dir.to_path_buf();
    path.push(&cfg.dsn);
    path.to_string_lossy().into_owned()
}

fn normalize_message(msg: &teloxide::types::Message) -> groupguard::message::Message {
    use groupguard::message::{Message as GgMessage, MessageFlags, SenderUser};

    let sender_user = msg.from().map(|u| SenderUser {
        id: u.id.0 as i64,
        name: u.username.clone().unwrap_or_default(),
        display_name: u.full_name(),
    });

    let flags = MessageFlags {
        video: msg.video().is_some(),
        video_note: msg.video_note().is_some(),
        audio: msg.audio().is_some() || msg.voice().is_some(),
        forward: msg.forward_origin().is_some(),
        keyboard: msg.reply_markup().is_some(),
    };

    GgMessage {
        id: msg.id.0,
        sent_at: msg.date,
        chat_id: msg.chat.id.0,
        sender_user,
        sender_chat: msg.sender_chat().map(|c| c.id.0),
        text: GgMessage::merge_caption(msg.text(), msg.caption()),
        has_image: msg.photo().is_some(),
        flags,
        entity_links: Vec::new(),
        reply_to: msg.reply_to_message().map(|m| m.id.0),
    }
}

struct SimpleLlm {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[async_trait::async_trait]
impl groupguard::detector::LlmChecker for SimpleLlm {
    async fn check(&self, text: &str) -> Result<(bool, String), String> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            text: &'a str,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            spam: bool,
            reason: String,
        }
        let resp: Resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&Req { text })
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;
        Ok((resp.spam, resp.reason))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;
    let token = read_token()?;
    let state_dir = state_directory()?;
    let dsn = resolve_dsn(&cfg, &state_dir);

    let engine = Engine::open(&dsn, cfg.gid.clone()).await?;

    let samples = Arc::new(SamplesStore::new(engine.clone()).await?);
    let dictionary = Arc::new(groupguard::storage::dictionary::DictionaryStore::new(engine.clone()).await?);
    let approved_users = Arc::new(ApprovedUsersStore::new(engine.clone()).await?);
    let ledger = Arc::new(DetectedSpamLedger::new(engine.clone()).await?);
    let locator = Arc::new(
        Locator::new(
            engine.clone(),
            chrono::Duration::from_std(cfg.locator.ttl).unwrap_or_default(),
            cfg.locator.min_size as i64,
        )
        .await?,
    );

    match groupguard::import::import_directory(&state_dir, &samples, &dictionary).await {
        Ok(s) => info!("import: {} file(s) loaded, {} skipped", s.files_imported, s.files_skipped),
        Err(e) => warn!("import scan failed: {e}"),
    }

    let spam_rows = samples.read(SampleType::Spam, SampleOrigin::Any).await?;
    let ham_rows = samples.read(SampleType::Ham, SampleOrigin::Any).await?;
    let spam_messages: Vec<String> = spam_rows.into_iter().map(|r| r.message).collect();
    let ham_messages: Vec<String> = ham_rows.into_iter().map(|r| r.message).collect();

    let stop_phrases = dictionary
        .read(groupguard::storage::dictionary::DictionaryType::StopPhrase)
        .await?
        .into_iter()
        .map(|e| e.data)
        .collect::<Vec<_>>()
        .join("\n");
    let ignored_words = dictionary
        .read(groupguard::storage::dictionary::DictionaryType::IgnoredWord)
        .await?
        .into_iter()
        .map(|e| e.data)
        .collect::<Vec<_>>()
        .join("\n");

    let mut detector = Detector::new(&cfg);
    detector.load_stop_words(&stop_phrases, &ignored_words).await;
    let stats = detector.load_samples(&ignored_words, &spam_messages, &ham_messages).await;
    info!("loaded {} spam / {} ham samples", stats.spam_loaded, stats.ham_loaded);
    detector.with_sample_updater(Arc::new(SamplesStoreUpdater::new(samples.clone())));
    detector.with_user_storage(approved_users.clone()).await?;

    if cfg.open_ai.enabled {
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let llm = Arc::new(SimpleLlm {
                client: reqwest::Client::new(),
                endpoint: std::env::var("OPENAI_API_BASE").unwrap_or_else(|_| "https://api.openai.com/v1/moderations".into()),
                api_key,
            });
            detector.with_openai_checker(llm, cfg.open_ai.clone());
        } else {
            warn!("open_ai.enabled is set but OPENAI_API_KEY is missing; LLM checks disabled");
        }
    }

    let detector = Arc::new(detector);
    let duplicate = Arc::new(DuplicateDetector::new(
        cfg.duplicate.threshold,
        chrono::Duration::from_std(cfg.duplicate.window).unwrap_or_default(),
    ));
    let bot_logic = GgBot::new(detector.clone(), duplicate, cfg.ban_interval, cfg.dry_run);

    let tg_bot = Bot::new(token.trim());
    let platform = Arc::new(TeloxideActions::new(tg_bot.clone(), MAX_OUTSTANDING_REQUESTS, MAX_RETRY));

    let listener = Arc::new(Listener::new(
        bot_logic,
        detector,
        locator,
        ledger,
        platform,
        ListenerConfig {
            admin_chat_id: cfg.admin_chat_id,
            superusers: cfg.superusers.iter().copied().collect(),
            unban_secret: cfg.unban_secret.clone(),
            unban_base_url: cfg.unban_base_url.clone(),
            report_threshold: cfg.report_threshold,
            report_rate_limit: cfg.report_rate_limit,
        },
    ));

    let cancel = listener.cancel_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    let mut poll = polling_default(tg_bot).await;
    let mut stream = Box::pin(poll.as_stream());
    let mut retry_count = 0u32;
    info!("groupguard started (gid={})", cfg.gid);

    while let Some(update) = stream.next().await {
        debug!("update: {update:?}");
        let update = match update {
            Ok(update) => {
                retry_count = 0;
                update
            }
            Err(RequestError::Network(err)) if retry_count < MAX_RETRY => {
                warn!("network error polling updates: {err}");
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(retry_count)).await;
                retry_count += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if listener.cancel_token().is_cancelled() {
            break;
        }

        let msg = match update.kind {
            UpdateKind::Message(msg) => msg,
            UpdateKind::CallbackQuery(query) => {
                if let (Some(message), Some(data)) = (&query.message, &query.data) {
                    let notification_msg_id = match message {
                        MaybeInaccessibleMessage::Regular(m) => m.id.0,
                        MaybeInaccessibleMessage::Inaccessible(m) => m.message_id.0,
                    };
                    listener.handle_report_callback(notification_msg_id, &query.id, data).await;
                } else {
                    debug!("callback query missing message or data, ignoring");
                }
                continue;
            }
            _ => continue,
        };
        if !matches!(msg.kind, MessageKind::Common(_)) {
            continue;
        }

        let is_admin_chat = cfg.admin_chat_id == Some(msg.chat.id.0);
        let is_superuser = msg.from().is_some_and(|u| cfg.superusers.contains(&(u.id.0 as i64)));
        let reply = msg.reply_to_message().map(normalize_message);
        let normalized = normalize_message(&msg);

        listener.handle(&normalized, reply.as_ref(), is_admin_chat, is_superuser).await;
    }

    info!("groupguard shutting down");
    Ok(())
}
