//! Layered configuration: built-in defaults -> optional TOML file -> environment
//! variables -> CLI flags. Mirrors the teacher's systemd-friendly convention of
//! reading the bot token from `$CREDENTIALS_DIRECTORY/token` and keeping mutable
//! state under `$STATE_DIRECTORY`.

use std::{env, fs, path::PathBuf, time::Duration};

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug, Clone)]
#[command(name = "groupguard", about = "Group chat anti-spam moderator")]
pub struct Cli {
    /// Path to a TOML config file overriding the defaults below.
    #[arg(long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Storage DSN (sqlite file path, sqlite:/sqlite3: URL, memory://, postgres://, mysql DSN).
    #[arg(long, env = "DATABASE_URL")]
    pub dsn: Option<String>,

    /// Numeric id of the admin/log chat.
    #[arg(long, env = "ADMIN_CHAT_ID")]
    pub admin_chat_id: Option<i64>,

    /// Base URL of the external reputation ("CAS") service.
    #[arg(long, env = "CAS_API")]
    pub cas_api: Option<String>,

    /// Run in dry mode: detect but never apply platform actions.
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Group identifier tagging every persisted row for this deployment.
    #[arg(long, env = "GID")]
    pub gid: Option<String>,

    /// Comma-separated Telegram user ids allowed to issue admin commands.
    #[arg(long, env = "SUPERUSERS", value_delimiter = ',')]
    pub superusers: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub enabled: bool,
    /// true: LLM verdict wins only when some other check already flagged spam
    ///       (reduces false positives).
    /// false: LLM is consulted only when nothing else flagged spam
    ///       (reduces false negatives).
    pub veto_mode: bool,
    pub timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            veto_mode: false,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateConfig {
    pub threshold: u32,
    pub window: Duration,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorConfig {
    pub ttl: Duration,
    pub min_size: u64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 3600),
            min_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbnormalSpacingConfig {
    pub enabled: bool,
    pub short_word_ratio: f64,
    pub space_letter_ratio: f64,
}

impl Default for AbnormalSpacingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            short_word_ratio: 0.7,
            space_letter_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub dsn: String,
    pub admin_chat_id: Option<i64>,
    pub cas_api: Option<String>,
    pub open_ai: OpenAiConfig,
    pub first_messages_count: u32,
    pub first_message_only: bool,
    pub similarity_threshold: f64,
    pub min_spam_probability: f64,
    pub max_allowed_emoji: i32,
    pub multi_lang_words: u32,
    pub min_msg_len: usize,
    pub duplicate: DuplicateConfig,
    pub locator: LocatorConfig,
    pub abnormal_spacing: AbnormalSpacingConfig,
    pub ban_interval: Option<Duration>,
    pub dry_run: bool,
    pub report_threshold: u32,
    pub report_rate_limit: Duration,
    pub unban_secret: String,
    pub unban_base_url: String,
    pub http_timeout: Duration,
    pub gid: String,
    pub superusers: Vec<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dsn: "memory".into(),
            admin_chat_id: None,
            cas_api: None,
            open_ai: OpenAiConfig::default(),
            first_messages_count: 1,
            first_message_only: true,
            similarity_threshold: 0.5,
            min_spam_probability: 0.0,
            max_allowed_emoji: -1,
            multi_lang_words: 0,
            min_msg_len: 0,
            duplicate: DuplicateConfig::default(),
            locator: LocatorConfig::default(),
            abnormal_spacing: AbnormalSpacingConfig::default(),
            ban_interval: None,
            dry_run: false,
            report_threshold: 3,
            report_rate_limit: Duration::from_secs(300),
            unban_secret: String::new(),
            unban_base_url: String::new(),
            http_timeout: Duration::from_secs(5),
            gid: "default".into(),
            superusers: Vec::new(),
        }
    }
}

impl Config {
    /// Merge a TOML file (if present) over the defaults, then CLI/env overrides
    /// on top. CLI/env always wins, matching clap's own precedence model.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut cfg = match &cli.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
                toml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?
            }
            None => Config::default(),
        };
        if let Some(dsn) = &cli.dsn {
            cfg.dsn = dsn.clone();
        }
        if let Some(id) = cli.admin_chat_id {
            cfg.admin_chat_id = Some(id);
        }
        if let Some(cas) = &cli.cas_api {
            cfg.cas_api = Some(cas.clone());
        }
        if cli.dry_run {
            cfg.dry_run = true;
        }
        if let Some(gid) = &cli.gid {
            cfg.gid = gid.clone();
        }
        if !cli.superusers.is_empty() {
            cfg.superusers = cli.superusers.clone();
        }
        Ok(cfg)
    }
}

/// Reads the bot token the way the teacher does: from
/// `$CREDENTIALS_DIRECTORY/token` under systemd, falling back to `./token`.
pub fn read_token() -> anyhow::Result<String> {
    let mut token_path: PathBuf = env::var("CREDENTIALS_DIRECTORY")
        .unwrap_or_else(|_| "./".into())
        .into();
    token_path.push("token");
    let token = fs::read_to_string(&token_path)
        .map_err(|e| anyhow::anyhow!("failed to read token from {}: {e}", token_path.display()))?;
    Ok(token.trim().to_string())
}

/// Resolves the mutable-state directory the way the teacher does: systemd's
/// `$STATE_DIRECTORY`, falling back to the current directory.
pub fn state_directory() -> anyhow::Result<PathBuf> {
    let dir = env::var("STATE_DIRECTORY")
        .map(PathBuf::from)
        .or_else(|_| env::current_dir())
        .map_err(|e| anyhow::anyhow!("STATE_DIRECTORY not a valid path: {e}"))?;
    Ok(dir)
}
