//! Orchestrates the full check pipeline: normalization, per-check dispatch,
//! similarity, the naive-Bayes classifier, and the optional LLM veto. Also
//! owns approved-user accounting and (re)loading of samples/stop-words.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use unicode_segmentation::UnicodeSegmentation;

use crate::checks::{self, MetaCheck};
use crate::classifier::{self, Class, Classifier};
use crate::config::{AbnormalSpacingConfig, Config, OpenAiConfig};
use crate::error::{DetectorError, StorageError};
use crate::message::{CheckRequest, CheckResponse};
use crate::storage::approved_users::ApprovedUsersStore;

/// Thin adapter over the samples store, injected after construction to avoid
/// a cyclic dependency between the detector and the store that backs it.
#[async_trait]
pub trait SampleUpdater: Send + Sync {
    async fn add_spam(&self, text: &str) -> Result<(), StorageError>;
    async fn add_ham(&self, text: &str) -> Result<(), StorageError>;
}

/// Black-box LLM veto. Never itself decides the final verdict outside the
/// veto rules in `check`.
#[async_trait]
pub trait LlmChecker: Send + Sync {
    async fn check(&self, text: &str) -> Result<(bool, String), String>;
}

struct DetectorState {
    classifier: Classifier,
    tokenized_spam: Vec<HashMap<String, u32>>,
    excluded_tokens: HashSet<String>,
    stop_words: Vec<String>,
    approved_users: HashMap<String, u32>,
}

pub struct LoadStats {
    pub spam_loaded: u64,
    pub ham_loaded: u64,
}

pub struct Detector {
    state: RwLock<DetectorState>,
    similarity_threshold: f64,
    min_spam_probability: f64,
    max_allowed_emoji: i32,
    multi_lang_words: u32,
    min_msg_len: usize,
    first_messages_count: u32,
    first_message_only: bool,
    abnormal_spacing: AbnormalSpacingConfig,
    meta_checks: Vec<MetaCheck>,
    http: reqwest::Client,
    cas_api: Option<String>,
    http_timeout: Duration,
    sample_updater: Option<Arc<dyn SampleUpdater>>,
    user_storage: Option<Arc<ApprovedUsersStore>>,
    llm: Option<(Arc<dyn LlmChecker>, OpenAiConfig)>,
}

impl Detector {
    pub fn new(cfg: &Config) -> Self {
        Self {
            state: RwLock::new(DetectorState {
                classifier: Classifier::new(),
                tokenized_spam: Vec::new(),
                excluded_tokens: HashSet::new(),
                stop_words: Vec::new(),
                approved_users: HashMap::new(),
            }),
            similarity_threshold: cfg.similarity_threshold,
            min_spam_probability: cfg.min_spam_probability,
            max_allowed_emoji: cfg.max_allowed_emoji,
            multi_lang_words: cfg.multi_lang_words,
            min_msg_len: cfg.min_msg_len,
            first_messages_count: cfg.first_messages_count,
            first_message_only: cfg.first_message_only,
            abnormal_spacing: cfg.abnormal_spacing.clone(),
            meta_checks: Vec::new(),
            http: reqwest::Client::new(),
            cas_api: cfg.cas_api.clone(),
            http_timeout: cfg.http_timeout,
            sample_updater: None,
            user_storage: None,
            llm: None,
        }
    }

    pub fn with_sample_updater(&mut self, updater: Arc<dyn SampleUpdater>) {
        self.sample_updater = Some(updater);
    }

    pub fn with_meta_checks(&mut self, checks: Vec<MetaCheck>) {
        self.meta_checks = checks;
    }

    pub fn with_openai_checker(&mut self, client: Arc<dyn LlmChecker>, cfg: OpenAiConfig) {
        self.llm = Some((client, cfg));
    }

    /// Loads the approved-user set from storage. Every persisted row is
    /// reinstated at `first_messages_count + 1` — a deliberate simplification
    /// documented in the design notes: restarts never re-run the first-message
    /// gauntlet for a previously approved user.
    pub async fn with_user_storage(&mut self, store: Arc<ApprovedUsersStore>) -> Result<(), DetectorError> {
        let rows = store.read().await?;
        let mut state = self.state.write().await;
        for row in rows {
            state
                .approved_users
                .insert(row.user_id, self.first_messages_count + 1);
        }
        self.user_storage = Some(store);
        Ok(())
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.classifier.reset();
        state.tokenized_spam.clear();
        state.excluded_tokens.clear();
        state.stop_words.clear();
    }

    /// One line per stop-word/ignored-word; a line starting with `"` that also
    /// contains a comma is parsed as a CSV record and every field becomes its
    /// own entry (surrounding whitespace and quotes stripped).
    pub fn parse_word_list(input: &str) -> Vec<String> {
        let mut out = Vec::new();
        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('"') && line.contains(',') {
                for field in line.split(',') {
                    let cleaned = field.trim().trim_matches('"').trim();
                    if !cleaned.is_empty() {
                        out.push(cleaned.to_string());
                    }
                }
            } else {
                out.push(line.to_string());
            }
        }
        out
    }

    pub async fn load_stop_words(&self, stop_words_input: &str, ignored_words_input: &str) {
        let mut state = self.state.write().await;
        state.stop_words = Self::parse_word_list(stop_words_input)
            .into_iter()
            .map(|w| w.to_lowercase())
            .collect();
        state.excluded_tokens = Self::parse_word_list(ignored_words_input)
            .into_iter()
            .map(|w| w.to_lowercase())
            .collect();
    }

    /// Atomic reload: readers never observe a partial mix of old and new
    /// sample sets, because the whole rebuild happens under one write lock.
    pub async fn load_samples(&self, excluded_words_input: &str, spam_messages: &[String], ham_messages: &[String]) -> LoadStats {
        let mut state = self.state.write().await;
        state.classifier.reset();
        state.tokenized_spam.clear();
        state.excluded_tokens = Self::parse_word_list(excluded_words_input)
            .into_iter()
            .map(|w| w.to_lowercase())
            .collect();

        let mut documents = Vec::with_capacity(spam_messages.len() + ham_messages.len());
        for msg in spam_messages {
            let tokens = classifier::tokenize(msg, &state.excluded_tokens);
            state.tokenized_spam.push(tokens.clone());
            documents.push((Class::Spam, tokens));
        }
        for msg in ham_messages {
            let tokens = classifier::tokenize(msg, &state.excluded_tokens);
            documents.push((Class::Ham, tokens));
        }
        state.classifier.learn(&documents);

        LoadStats {
            spam_loaded: spam_messages.len() as u64,
            ham_loaded: ham_messages.len() as u64,
        }
    }

    /// Appends to the user-origin spam samples and incrementally teaches the
    /// classifier, without resetting previously loaded state.
    pub async fn update_spam(&self, text: &str) -> Result<(), DetectorError> {
        if let Some(updater) = &self.sample_updater {
            updater.add_spam(text).await?;
        }
        let mut state = self.state.write().await;
        let tokens = classifier::tokenize(text, &state.excluded_tokens);
        state.tokenized_spam.push(tokens.clone());
        state.classifier.learn_one(Class::Spam, &tokens);
        Ok(())
    }

    pub async fn update_ham(&self, text: &str) -> Result<(), DetectorError> {
        if let Some(updater) = &self.sample_updater {
            updater.add_ham(text).await?;
        }
        let mut state = self.state.write().await;
        let tokens = classifier::tokenize(text, &state.excluded_tokens);
        state.classifier.learn_one(Class::Ham, &tokens);
        Ok(())
    }

    pub async fn is_approved(&self, user_id: &str) -> bool {
        let state = self.state.read().await;
        state
            .approved_users
            .get(user_id)
            .is_some_and(|count| *count >= self.first_messages_count)
    }

    pub async fn add_approved_user(&self, user_id: &str, user_name: &str) -> Result<(), DetectorError> {
        {
            let mut state = self.state.write().await;
            state
                .approved_users
                .insert(user_id.to_string(), self.first_messages_count + 1);
        }
        if let Some(store) = &self.user_storage {
            store.write(user_id, user_name).await?;
        }
        Ok(())
    }

    pub async fn remove_approved_user(&self, user_id: &str) {
        let mut state = self.state.write().await;
        state.approved_users.remove(user_id);
    }

    /// Strips Unicode control/format characters (`Cc`/`Cf`) and the zero-width
    /// / invisible-formatting ranges used to evade substring checks.
    fn normalize(text: &str) -> String {
        text.chars()
            .filter(|c| {
                let cp = *c as u32;
                if (0x200B..=0x200F).contains(&cp) || (0x2060..=0x206F).contains(&cp) {
                    return false;
                }
                !c.is_control() && !matches!(cp, 0x00AD | 0xFEFF)
            })
            .collect()
    }

    pub async fn check(&self, req: &CheckRequest) -> (bool, Vec<CheckResponse>) {
        let cleaned = Self::normalize(&req.text);
        let mut responses = Vec::new();

        {
            let state = self.state.read().await;

            if self.first_message_only
                && state
                    .approved_users
                    .get(&req.user_id)
                    .is_some_and(|c| *c >= self.first_messages_count)
            {
                responses.push(CheckResponse::ham("pre-approved", "user already passed first-message checks"));
                return (false, responses);
            }

            if !state.stop_words.is_empty() {
                responses.push(checks::stop_word_check(&cleaned.to_lowercase(), &state.stop_words));
            }
            if self.max_allowed_emoji >= 0 {
                responses.push(checks::emoji_density_check(&cleaned, self.max_allowed_emoji));
            }
            responses.extend(checks::run_meta_checks(req, &self.meta_checks));
        }

        if let Some(cas_api) = &self.cas_api {
            responses.push(checks::external_reputation_check(&self.http, cas_api, &req.user_id, self.http_timeout).await);
        }

        if self.multi_lang_words > 0 {
            responses.push(checks::multi_lingual_check(&cleaned, self.multi_lang_words));
        }
        if self.abnormal_spacing.enabled {
            responses.push(checks::abnormal_spacing_check(
                &cleaned,
                self.abnormal_spacing.short_word_ratio,
                self.abnormal_spacing.space_letter_ratio,
            ));
        }

        let already_spam = responses.iter().any(|r| r.spam);

        if cleaned.graphemes(true).count() < self.min_msg_len {
            responses.push(CheckResponse::ham("length", "message shorter than configured minimum"));
            if !already_spam {
                return self.maybe_approve(req, false, responses).await;
            }
            return (true, responses);
        }

        let tokens;
        {
            let state = self.state.read().await;
            tokens = classifier::tokenize(&cleaned, &state.excluded_tokens);

            if self.similarity_threshold > 0.0 && !state.tokenized_spam.is_empty() {
                let max_sim = state
                    .tokenized_spam
                    .iter()
                    .map(|spam_tokens| cosine_similarity(&tokens, spam_tokens))
                    .fold(0.0_f64, f64::max);
                if max_sim >= self.similarity_threshold {
                    responses.push(CheckResponse::spam("similarity", format!("max cosine similarity {max_sim:.3}")));
                } else {
                    responses.push(CheckResponse::ham("similarity", format!("max cosine similarity {max_sim:.3}")));
                }
            }

            if state.classifier.has_both_classes() {
                if let Some((class, probability, certain)) = state.classifier.classify(&tokens) {
                    let is_spam = class == Class::Spam && certain && probability >= self.min_spam_probability;
                    let details = format!("p={probability:.3} certain={certain}");
                    responses.push(if is_spam {
                        CheckResponse::spam("classifier", details)
                    } else {
                        CheckResponse::ham("classifier", details)
                    });
                }
            }
        }

        let mut verdict = responses.iter().any(|r| r.spam);

        if let Some((llm, cfg)) = &self.llm {
            if self.first_message_only {
                let consult = (!verdict && !cfg.veto_mode) || (verdict && cfg.veto_mode);
                if consult {
                    match llm.check(&cleaned).await {
                        Ok((llm_spam, details)) => {
                            if cfg.veto_mode {
                                verdict = llm_spam;
                            } else if llm_spam {
                                verdict = true;
                            }
                            responses.push(if llm_spam {
                                CheckResponse::spam("llm", details)
                            } else {
                                CheckResponse::ham("llm", details)
                            });
                        }
                        Err(e) => {
                            // Errors keep a prior spam verdict but never manufacture one.
                            responses.push(CheckResponse::errored("llm", e));
                        }
                    }
                }
            }
        }

        self.maybe_approve(req, verdict, responses).await
    }

    async fn maybe_approve(&self, req: &CheckRequest, verdict: bool, responses: Vec<CheckResponse>) -> (bool, Vec<CheckResponse>) {
        if !verdict && self.first_message_only {
            let mut state = self.state.write().await;
            let count = state.approved_users.entry(req.user_id.clone()).or_insert(0);
            *count += 1;
            let should_persist = *count >= self.first_messages_count && !req.check_only;
            drop(state);
            if should_persist {
                if let Some(store) = &self.user_storage {
                    if let Err(e) = store.write(&req.user_id, &req.user_name).await {
                        log::warn!("failed to persist approved user {}: {e}", req.user_id);
                    }
                }
            }
        }
        (verdict, responses)
    }
}

fn cosine_similarity(a: &HashMap<String, u32>, b: &HashMap<String, u32>) -> f64 {
    let dot: f64 = a
        .iter()
        .map(|(k, v)| *v as f64 * *b.get(k).unwrap_or(&0) as f64)
        .sum();
    let norm_a: f64 = a.values().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.values().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CheckRequestMeta;

    fn req(text: &str, user_id: &str) -> CheckRequest {
        CheckRequest {
            text: text.to_string(),
            user_id: user_id.to_string(),
            user_name: "tester".to_string(),
            meta: CheckRequestMeta::default(),
            check_only: false,
        }
    }

    #[tokio::test]
    async fn stop_word_flags_spam() {
        let mut cfg = Config::default();
        cfg.min_msg_len = 0;
        let detector = Detector::new(&cfg);
        detector.load_stop_words("free money\n", "").await;
        let (spam, responses) = detector.check(&req("get your free money now", "1")).await;
        assert!(spam);
        assert!(responses.iter().any(|r| r.name == "stopword" && r.spam));
    }

    #[tokio::test]
    async fn pre_approved_user_bypasses_checks() {
        let mut cfg = Config::default();
        cfg.first_messages_count = 1;
        cfg.first_message_only = true;
        let detector = Detector::new(&cfg);
        detector.load_stop_words("free money\n", "").await;
        // first message: clean, gets the user approved.
        let (spam, _) = detector.check(&req("hello there", "42")).await;
        assert!(!spam);
        assert!(detector.is_approved("42").await);
        // second message would normally trip the stop-word check, but the
        // user is now pre-approved.
        let (spam, responses) = detector.check(&req("free money free money", "42")).await;
        assert!(!spam);
        assert!(responses.iter().any(|r| r.name == "pre-approved"));
    }

    #[tokio::test]
    async fn similarity_catches_near_duplicate_spam() {
        let mut cfg = Config::default();
        cfg.similarity_threshold = 0.5;
        cfg.first_message_only = false;
        let detector = Detector::new(&cfg);
        detector
            .load_samples("", &["buy cheap pills discount offer now".to_string()], &[])
            .await;
        let (spam, responses) = detector.check(&req("buy cheap pills discount offer today", "7")).await;
        assert!(spam);
        assert!(responses.iter().any(|r| r.name == "similarity" && r.spam));
    }

    #[tokio::test]
    async fn length_gate_short_circuits_without_prior_spam() {
        let mut cfg = Config::default();
        cfg.min_msg_len = 10;
        cfg.first_message_only = false;
        let detector = Detector::new(&cfg);
        let (spam, responses) = detector.check(&req("hi", "3")).await;
        assert!(!spam);
        assert!(responses.iter().any(|r| r.name == "length"));
    }
}
