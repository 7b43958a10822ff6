//! Individual spam heuristics run by the detector's check pipeline. Each
//! function is a pure predicate over a cleaned message (or an async call for
//! the external-reputation check) returning a single `CheckResponse`.

use std::time::Duration;

use unicode_segmentation::UnicodeSegmentation;

use crate::message::{CheckRequest, CheckResponse};

pub type MetaCheck = Box<dyn Fn(&CheckRequest) -> CheckResponse + Send + Sync>;

/// Case-insensitive substring match against every loaded stop-phrase.
pub fn stop_word_check(text: &str, phrases: &[String]) -> CheckResponse {
    let lower = text.to_lowercase();
    match phrases.iter().find(|p| !p.is_empty() && lower.contains(p.as_str())) {
        Some(hit) => CheckResponse::spam("stopword", format!("matched stop phrase \"{hit}\"")),
        None => CheckResponse::ham("stopword", "no stop phrase matched"),
    }
}

fn is_emoji_grapheme(g: &str) -> bool {
    g.chars().any(|c| {
        let cp = c as u32;
        matches!(cp,
            0x1F300..=0x1FAFF | 0x2600..=0x27BF | 0x2190..=0x21FF |
            0x2B00..=0x2BFF | 0xFE0F | 0x200D
        )
    })
}

pub fn emoji_density_check(text: &str, max_allowed: i32) -> CheckResponse {
    let count = text.graphemes(true).filter(|g| is_emoji_grapheme(g)).count() as i32;
    if count > max_allowed {
        CheckResponse::spam("emoji", format!("{count} emoji exceeds limit of {max_allowed}"))
    } else {
        CheckResponse::ham("emoji", format!("{count} emoji within limit"))
    }
}

pub fn run_meta_checks(req: &CheckRequest, checks: &[MetaCheck]) -> Vec<CheckResponse> {
    checks.iter().map(|check| check(req)).collect()
}

/// GET `{cas_api}/check?user_id={user_id}`. A transport failure or a
/// non-JSON body is recorded in `CheckResponse.error` and treated as ham —
/// per the propagation policy, external-call failures never themselves
/// produce a spam verdict.
pub async fn external_reputation_check(
    client: &reqwest::Client,
    cas_api: &str,
    user_id: &str,
    timeout: Duration,
) -> CheckResponse {
    #[derive(serde::Deserialize)]
    struct CasResponse {
        ok: bool,
        description: String,
    }

    let url = format!("{}/check?user_id={}", cas_api.trim_end_matches('/'), user_id);
    let result = client.get(&url).timeout(timeout).send().await;
    match result {
        Ok(resp) => match resp.json::<CasResponse>().await {
            Ok(body) if body.ok => CheckResponse::spam("cas", body.description),
            Ok(body) => CheckResponse::ham("cas", body.description),
            Err(e) => CheckResponse::errored("cas", e),
        },
        Err(e) => CheckResponse::errored("cas", e),
    }
}

/// Coarse Unicode-script classification good enough to spot script-mixing
/// obfuscation; not a full Unicode script database.
fn script_of(c: char) -> Option<&'static str> {
    let cp = c as u32;
    match cp {
        0x0041..=0x005A | 0x0061..=0x007A | 0x00C0..=0x024F => Some("latin"),
        0x0400..=0x04FF => Some("cyrillic"),
        0x0370..=0x03FF => Some("greek"),
        0x0590..=0x05FF => Some("hebrew"),
        0x0600..=0x06FF => Some("arabic"),
        0x4E00..=0x9FFF => Some("han"),
        0x3040..=0x309F | 0x30A0..=0x30FF => Some("kana"),
        0xAC00..=0xD7AF => Some("hangul"),
        _ => None,
    }
}

/// Counts words that mix two or more distinct scripts (skipping the letter
/// "i", whitespace, digits, and script-neutral punctuation), spam iff that
/// count meets `threshold`.
pub fn multi_lingual_check(text: &str, threshold: u32) -> CheckResponse {
    let mut mixed = 0u32;
    for word in text.split_whitespace() {
        if word.eq_ignore_ascii_case("i") {
            continue;
        }
        let mut scripts = std::collections::HashSet::new();
        for c in word.chars() {
            if c.is_ascii_digit() {
                continue;
            }
            if let Some(s) = script_of(c) {
                scripts.insert(s);
            }
        }
        if scripts.len() >= 2 {
            mixed += 1;
        }
    }
    if mixed >= threshold {
        CheckResponse::spam("multilang", format!("{mixed} words mix multiple scripts"))
    } else {
        CheckResponse::ham("multilang", format!("{mixed} words mix multiple scripts"))
    }
}

/// Ratio of short words (<=2 chars) to total words, and ratio of spaces to
/// letter characters — both catch "s p a c e d   o u t" obfuscation.
pub fn abnormal_spacing_check(text: &str, short_word_ratio_threshold: f64, space_letter_ratio_threshold: f64) -> CheckResponse {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return CheckResponse::ham("spacing", "no words");
    }
    let short = words.iter().filter(|w| w.chars().count() <= 2).count() as f64;
    let short_ratio = short / words.len() as f64;

    let letters = text.chars().filter(|c| c.is_alphabetic()).count() as f64;
    let spaces = text.chars().filter(|c| *c == ' ').count() as f64;
    let space_ratio = if letters > 0.0 { spaces / letters } else { 0.0 };

    if short_ratio > short_word_ratio_threshold || space_ratio > space_letter_ratio_threshold {
        CheckResponse::spam(
            "spacing",
            format!("short-word ratio {short_ratio:.2}, space/letter ratio {space_ratio:.2}"),
        )
    } else {
        CheckResponse::ham(
            "spacing",
            format!("short-word ratio {short_ratio:.2}, space/letter ratio {space_ratio:.2}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_word_matches_case_insensitively() {
        let phrases = vec!["free money".to_string()];
        let r = stop_word_check("Get your FREE MONEY today", &phrases);
        assert!(r.spam);
    }

    #[test]
    fn emoji_density_respects_limit() {
        let r = emoji_density_check("hello 🎉🎉🎉", 2);
        assert!(r.spam);
        let r = emoji_density_check("hello 🎉", 2);
        assert!(!r.spam);
    }

    #[test]
    fn multi_lingual_detects_mixed_script_words() {
        let r = multi_lingual_check("hello wоrld", 1); // 'о' is Cyrillic
        assert!(r.spam);
        let r = multi_lingual_check("hello world", 1);
        assert!(!r.spam);
    }

    #[test]
    fn abnormal_spacing_flags_spaced_out_text() {
        let r = abnormal_spacing_check("f r e e m o n e y", 0.5, 0.5);
        assert!(r.spam);
        let r = abnormal_spacing_check("this is a perfectly normal sentence", 0.5, 0.5);
        assert!(!r.spam);
    }

    #[tokio::test]
    async fn external_reputation_check_flags_a_listed_user_as_cas() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/check"))
            .and(query_param("user_id", "123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "description": "banned"
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let r = external_reputation_check(&client, &server.uri(), "123", Duration::from_secs(5)).await;
        assert!(r.spam);
        assert_eq!(r.name, "cas");
        assert_eq!(r.details, "banned");
    }

    #[tokio::test]
    async fn external_reputation_check_clears_an_unlisted_user() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false,
                "description": "not found"
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let r = external_reputation_check(&client, &server.uri(), "456", Duration::from_secs(5)).await;
        assert!(!r.spam);
        assert_eq!(r.name, "cas");
    }
}
