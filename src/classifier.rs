//! Multinomial naive-Bayes classifier and its shared tokenizer. Recomputed
//! wholesale on every `Detector::load_samples`; never persisted on its own.

use std::collections::HashMap;

use unicode_segmentation::UnicodeSegmentation;

const SURROUNDING_PUNCTUATION: &[char] = &['.', ',', '!', '?', '-', ':', ';', '(', ')', '#'];
const MIN_TOKEN_LEN: usize = 3;
/// Minimum log-likelihood gap between the winning class and the runner-up
/// for a classification to be reported as "certain".
const CERTAINTY_MARGIN: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Ham,
    Spam,
}

/// Splits on whitespace, lowercases, strips leading/trailing punctuation and
/// any trailing emoji grapheme, then drops short tokens and ignored words.
/// Shared verbatim between `learn` and `classify` so training and inference
/// never drift.
pub fn tokenize(text: &str, ignored_words: &std::collections::HashSet<String>) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for word in text.split_whitespace() {
        let lower = word.to_lowercase();
        let trimmed = lower.trim_matches(SURROUNDING_PUNCTUATION);
        let stripped = strip_trailing_emoji(trimmed);
        if stripped.is_empty() {
            continue;
        }
        if stripped.chars().count() < MIN_TOKEN_LEN {
            continue;
        }
        if ignored_words.contains(&stripped) {
            continue;
        }
        *counts.entry(stripped).or_insert(0u32) += 1;
    }
    counts
}

fn strip_trailing_emoji(s: &str) -> String {
    let graphemes: Vec<&str> = s.graphemes(true).collect();
    let mut end = graphemes.len();
    while end > 0 && is_emoji_grapheme(graphemes[end - 1]) {
        end -= 1;
    }
    graphemes[..end].concat()
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

#[derive(Debug, Default)]
struct ClassStats {
    doc_count: u64,
    token_counts: HashMap<String, u64>,
    total_tokens: u64,
}

#[derive(Debug, Default)]
pub struct Classifier {
    ham: ClassStats,
    spam: ClassStats,
    vocabulary: std::collections::HashSet<String>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn has_both_classes(&self) -> bool {
        self.ham.doc_count > 0 && self.spam.doc_count > 0
    }

    /// Incrementally learn one document: the document is a token->count map
    /// (as produced by `tokenize`) plus its label.
    pub fn learn_one(&mut self, class: Class, tokens: &HashMap<String, u32>) {
        let stats = match class {
            Class::Ham => &mut self.ham,
            Class::Spam => &mut self.spam,
        };
        stats.doc_count += 1;
        for (token, count) in tokens {
            *stats.token_counts.entry(token.clone()).or_insert(0) += *count as u64;
            stats.total_tokens += *count as u64;
            self.vocabulary.insert(token.clone());
        }
    }

    pub fn learn(&mut self, documents: &[(Class, HashMap<String, u32>)]) {
        for (class, tokens) in documents {
            self.learn_one(*class, tokens);
        }
    }

    /// Classifies a token->count map into (class, probability, certain).
    /// Uses additive (add-one / Laplace) smoothing over the joint
    /// vocabulary; "certain" requires the winning class's log-likelihood to
    /// beat the runner-up by at least `CERTAINTY_MARGIN`.
    pub fn classify(&self, tokens: &HashMap<String, u32>) -> Option<(Class, f64, bool)> {
        if !self.has_both_classes() {
            return None;
        }
        let total_docs = (self.ham.doc_count + self.spam.doc_count) as f64;
        let vocab_size = self.vocabulary.len().max(1) as f64;

        let ham_ll = self.log_likelihood(&self.ham, tokens, vocab_size)
            + (self.ham.doc_count as f64 / total_docs).ln();
        let spam_ll = self.log_likelihood(&self.spam, tokens, vocab_size)
            + (self.spam.doc_count as f64 / total_docs).ln();

        let (winner, winner_ll, loser_ll) = if spam_ll >= ham_ll {
            (Class::Spam, spam_ll, ham_ll)
        } else {
            (Class::Ham, ham_ll, spam_ll)
        };

        let gap = winner_ll - loser_ll;
        let certain = gap >= CERTAINTY_MARGIN;

        // Convert the two log-likelihoods back into a normalized probability
        // for the winning class via the standard log-sum-exp trick.
        let max_ll = winner_ll.max(loser_ll);
        let p_winner = (winner_ll - max_ll).exp();
        let p_loser = (loser_ll - max_ll).exp();
        let probability = p_winner / (p_winner + p_loser);

        Some((winner, probability, certain))
    }

    fn log_likelihood(&self, stats: &ClassStats, tokens: &HashMap<String, u32>, vocab_size: f64) -> f64 {
        let denom = stats.total_tokens as f64 + vocab_size;
        tokens
            .iter()
            .map(|(token, count)| {
                let tc = *stats.token_counts.get(token).unwrap_or(&0) as f64;
                let p = (tc + 1.0) / denom;
                p.ln() * (*count as f64)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> HashMap<String, u32> {
        tokenize(text, &Default::default())
    }

    #[test]
    fn tokenize_strips_punctuation_and_short_words() {
        let t = tokenize("Hi! Buy cheap meds now??", &Default::default());
        assert!(!t.contains_key("hi"));
        assert!(t.contains_key("buy"));
        assert!(t.contains_key("cheap"));
        assert!(t.contains_key("meds"));
        assert!(t.contains_key("now"));
    }

    #[test]
    fn tokenize_respects_ignored_words() {
        let mut ignored = std::collections::HashSet::new();
        ignored.insert("cheap".to_string());
        let t = tokenize("buy cheap meds", &ignored);
        assert!(!t.contains_key("cheap"));
        assert!(t.contains_key("buy"));
    }

    #[test]
    fn classifier_distinguishes_trained_classes() {
        let mut c = Classifier::new();
        c.learn_one(Class::Spam, &words("buy cheap pills now discount"));
        c.learn_one(Class::Spam, &words("cheap pills discount offer"));
        c.learn_one(Class::Ham, &words("meeting notes for tomorrow project"));
        c.learn_one(Class::Ham, &words("project status update weekly"));

        let (class, prob, certain) = c.classify(&words("cheap pills discount")).unwrap();
        assert_eq!(class, Class::Spam);
        assert!(prob > 0.5);
        assert!(certain);
    }

    #[test]
    fn classify_returns_none_without_both_classes() {
        let mut c = Classifier::new();
        c.learn_one(Class::Spam, &words("buy cheap pills"));
        assert!(c.classify(&words("buy cheap pills")).is_none());
    }
}
