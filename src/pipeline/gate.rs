//! Utterance gate: decides when a partial transcript becomes an
//! utterance worth translating.
//!
//! The gate is a per-participant state machine driven by three signals:
//! incoming partial/final text, its confidence, and elapsed real time.
//! Candidates are scored for completeness; high-scoring candidates fire
//! immediately, middling ones arm an adaptive single-shot timer, short
//! ones wait a fixed grace period, and everything else accumulates.
//!
//! ## State
//!
//! ```text
//! consider_partial / consider_final ──▸ Fire(utterance)   immediate paths
//!                                   ├─▸ Arm(duration)     caller (re)arms the timer
//!                                   ├─▸ Accumulate        keep the longest candidate
//!                                   └─▸ Drop              dedup hit
//! timer expiry ─▸ fire_pending() ─▸ Option<Utterance>
//! ```
//!
//! The caller owns the actual timer (a single tokio sleep per
//! participant); arrival of a new candidate always supersedes a previously
//! armed timer. The adaptive profile learns the speaker's sentence length
//! and pause cadence as utterances fire.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::GateConfig;
use crate::language::{Language, Morphology};

/// Two identical utterances inside this window are duplicates.
const DEDUP_WINDOW: Duration = Duration::from_secs(3);

/// Bounds on the adaptive sentence-length average (words).
const AVG_SENTENCE_MIN: f64 = 1.0;
const AVG_SENTENCE_MAX: f64 = 200.0;

/// EMA weights for adaptive learning.
const SENTENCE_LEN_WEIGHT: f64 = 0.15;
const PAUSE_WEIGHT: f64 = 0.2;

/// Bounded window sizes on the profile.
const CONFIDENCE_WINDOW: usize = 10;
const SCORE_WINDOW: usize = 20;

/// Lower bound for any adaptive timer.
const MIN_TIMER: Duration = Duration::from_millis(500);

// ── Utterance ─────────────────────────────────────────────────────

/// An immutable unit committed for translation. Utterances are the only
/// things that trigger MT + TTS.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    pub language: Language,
    pub confidence: f64,
    pub completion_score: f64,
    pub timestamp: Instant,
    pub participant_id: String,
}

/// Decision returned by [`UtteranceGate::consider_partial`] and
/// [`UtteranceGate::consider_final`].
#[derive(Debug)]
pub enum GateDecision {
    /// Translate now.
    Fire(Utterance),
    /// (Re)arm the participant's single-shot timer.
    Arm(Duration),
    /// Candidate retained; nothing to do yet.
    Accumulate,
    /// Dedup hit; discarded silently.
    Drop,
}

// ── Language rules ────────────────────────────────────────────────

/// Static per-language grammar and keyword data. Supplied to the gate at
/// construction; the gate itself never learns vocabulary.
#[derive(Debug, Clone)]
pub struct LanguageRules {
    pub language: Language,
    morphology: Morphology,
    interrogatives: Vec<&'static str>,
    verb_words: Vec<&'static str>,
    verb_suffixes: Vec<&'static str>,
    topic_starters: Vec<&'static str>,
    domain_terms: Vec<String>,
    urgency_terms: Vec<String>,
}

impl LanguageRules {
    /// Build the rules table for a language, merging configured extra
    /// domain/urgency keywords into the built-in defaults.
    pub fn for_language(language: Language, config: &GateConfig) -> Self {
        let (interrogatives, verb_words, verb_suffixes, topic_starters, domain, urgency): (
            Vec<&'static str>,
            Vec<&'static str>,
            Vec<&'static str>,
            Vec<&'static str>,
            Vec<&'static str>,
            Vec<&'static str>,
        ) = match language {
            Language::Tr => (
                vec![
                    "ne", "neden", "nasıl", "nerede", "kim", "hangi", "kaç", "mi", "mı", "mu",
                    "mü",
                ],
                vec![],
                vec![
                    "yor", "du", "dü", "dı", "di", "tı", "ti", "tu", "tü", "mış", "miş", "muş",
                    "müş", "acak", "ecek", "ar", "er", "ır", "ir", "ur", "ür", "dır", "dir",
                ],
                vec!["peki", "yani", "ama", "sonra", "önce", "şimdi"],
                vec!["ilaç", "reçete", "doz", "alerji", "belirti", "teşhis", "tedavi"],
                vec!["acil", "yardım", "imdat", "hemen", "ağrı"],
            ),
            _ => (
                vec![
                    "what", "where", "when", "why", "how", "who", "which", "is", "are", "do",
                    "does", "did", "can", "could", "will", "would", "should",
                ],
                vec![
                    "is", "are", "was", "were", "am", "be", "been", "have", "has", "had", "do",
                    "does", "did", "will", "would", "can", "could", "should", "need", "needs",
                    "want", "wants", "feel", "feels", "go", "goes", "went", "take", "takes",
                    "took", "get", "gets", "got", "hurt", "hurts", "know", "think", "see",
                ],
                vec![],
                vec!["so", "well", "okay", "now", "first", "also", "but", "then"],
                vec![
                    "medication", "prescription", "dosage", "allergy", "symptoms", "diagnosis",
                    "treatment", "appointment",
                ],
                vec!["help", "emergency", "urgent", "immediately", "pain", "hurts"],
            ),
        };

        let mut domain_terms: Vec<String> = domain.into_iter().map(str::to_string).collect();
        domain_terms.extend(config.domain_terms.iter().map(|s| s.to_lowercase()));
        let mut urgency_terms: Vec<String> = urgency.into_iter().map(str::to_string).collect();
        urgency_terms.extend(config.urgency_terms.iter().map(|s| s.to_lowercase()));

        Self {
            language,
            morphology: language.morphology(),
            interrogatives,
            verb_words,
            verb_suffixes,
            topic_starters,
            domain_terms,
            urgency_terms,
        }
    }

    fn has_domain_term(&self, words: &[&str]) -> bool {
        words
            .iter()
            .any(|w| self.domain_terms.iter().any(|t| t == w))
    }

    fn has_urgency_term(&self, words: &[&str]) -> bool {
        words
            .iter()
            .any(|w| self.urgency_terms.iter().any(|t| t == w))
    }

    fn starts_with_interrogative(&self, words: &[&str]) -> bool {
        words
            .first()
            .is_some_and(|w| self.interrogatives.contains(w))
    }

    fn starts_with_topic_marker(&self, words: &[&str]) -> bool {
        words
            .first()
            .is_some_and(|w| self.topic_starters.contains(w))
    }

    /// Language-aware subject+verb completeness heuristic. Agglutinative
    /// languages carry the predicate in verb suffixes on the final word;
    /// analytic ones need a recognizable verb word or -ing/-ed form.
    fn has_subject_verb(&self, words: &[&str]) -> bool {
        if words.len() < 2 {
            return false;
        }
        match self.morphology {
            Morphology::Agglutinative => words.last().is_some_and(|w| {
                self.verb_suffixes
                    .iter()
                    .any(|suffix| w.len() > suffix.len() && w.ends_with(suffix))
            }),
            _ => words.iter().any(|w| {
                self.verb_words.contains(w)
                    || (w.len() > 4 && (w.ends_with("ing") || w.ends_with("ed")))
            }),
        }
    }
}

// ── Conversation profile ──────────────────────────────────────────

/// Adaptive per-participant state mutated only by the gate.
#[derive(Debug, Clone)]
pub struct ConversationProfile {
    avg_sentence_words: f64,
    avg_pause_ms: f64,
    recent_confidence: VecDeque<f64>,
    recent_scores: VecDeque<f64>,
    total_utterances: u64,
    last_processed_norm: String,
    last_processed_at: Option<Instant>,
}

impl ConversationProfile {
    fn new(config: &GateConfig) -> Self {
        Self {
            avg_sentence_words: 8.0,
            avg_pause_ms: config.sentence_completion_threshold.as_millis() as f64,
            recent_confidence: VecDeque::with_capacity(CONFIDENCE_WINDOW),
            recent_scores: VecDeque::with_capacity(SCORE_WINDOW),
            total_utterances: 0,
            last_processed_norm: String::new(),
            last_processed_at: None,
        }
    }

    pub fn avg_sentence_words(&self) -> f64 {
        self.avg_sentence_words
    }

    pub fn avg_pause_ms(&self) -> f64 {
        self.avg_pause_ms
    }

    pub fn total_utterances(&self) -> u64 {
        self.total_utterances
    }

    fn record_fire(&mut self, word_count: usize, pause_ms: f64, confidence: f64, score: f64) {
        let wc = word_count as f64;
        self.avg_sentence_words += SENTENCE_LEN_WEIGHT * (wc - self.avg_sentence_words);
        self.avg_sentence_words = self
            .avg_sentence_words
            .clamp(AVG_SENTENCE_MIN, AVG_SENTENCE_MAX);
        self.avg_pause_ms += PAUSE_WEIGHT * (pause_ms - self.avg_pause_ms);
        if self.recent_confidence.len() == CONFIDENCE_WINDOW {
            self.recent_confidence.pop_front();
        }
        self.recent_confidence.push_back(confidence);
        if self.recent_scores.len() == SCORE_WINDOW {
            self.recent_scores.pop_front();
        }
        self.recent_scores.push_back(score);
        self.total_utterances += 1;
    }
}

// ── Gate ──────────────────────────────────────────────────────────

/// Pending candidate: the best transcript observed since the last fire.
#[derive(Debug, Clone)]
struct Pending {
    text: String,
    confidence: f64,
    started_at: Instant,
}

/// Per-participant utterance gate.
pub struct UtteranceGate {
    config: GateConfig,
    rules: LanguageRules,
    participant_id: String,
    /// Formal roles ("doctor") get a slightly longer adaptive timer.
    formal_role: bool,
    pending: Option<Pending>,
    profile: ConversationProfile,
}

impl UtteranceGate {
    pub fn new(config: GateConfig, language: Language, role: &str, participant_id: &str) -> Self {
        let rules = LanguageRules::for_language(language, &config);
        let profile = ConversationProfile::new(&config);
        Self {
            config,
            rules,
            participant_id: participant_id.to_string(),
            formal_role: role.eq_ignore_ascii_case("doctor"),
            pending: None,
            profile,
        }
    }

    pub fn profile(&self) -> &ConversationProfile {
        &self.profile
    }

    /// Feed a partial transcript. The returned decision tells the caller
    /// whether to translate now, arm the single-shot timer, or do
    /// nothing. Any previously armed timer is superseded by the new
    /// decision.
    pub fn consider_partial(&mut self, text: &str, confidence: f64) -> GateDecision {
        self.consider(text, confidence, false, None)
    }

    /// Feed a final transcript. Finals carry a confidence floor:
    /// providers mark boundary finals on VAD cues with low acoustic
    /// confidence, and the floor keeps those eligible for the
    /// final-transcript firing rule.
    pub fn consider_final(&mut self, text: &str, confidence: f64) -> GateDecision {
        self.consider(
            text,
            confidence,
            true,
            Some(self.config.min_confidence_threshold),
        )
    }

    fn consider(
        &mut self,
        text: &str,
        confidence: f64,
        is_final: bool,
        confidence_floor: Option<f64>,
    ) -> GateDecision {
        let confidence = confidence_floor.map_or(confidence, |floor| confidence.max(floor));
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return GateDecision::Accumulate;
        }

        // Dedup against the last fired utterance.
        let norm = normalize(trimmed);
        if self.is_duplicate(&norm) {
            return GateDecision::Drop;
        }

        // Keep the longest observed candidate; the new text supersedes
        // only if longer or nothing is pending.
        match &mut self.pending {
            Some(pending) => {
                if trimmed.len() > pending.text.len() {
                    pending.text = trimmed.to_string();
                }
                pending.confidence = confidence;
            }
            None => {
                self.pending = Some(Pending {
                    text: trimmed.to_string(),
                    confidence,
                    started_at: Instant::now(),
                });
            }
        }
        let candidate = self
            .pending
            .as_ref()
            .map(|p| p.text.clone())
            .unwrap_or_default();

        let lower = candidate.to_lowercase();
        let words = tokenize(&lower);
        let word_count = words.len();
        let score = self.completion_score(&candidate, &words, confidence);

        // Immediate firing paths.
        let is_question = candidate.contains('?') || self.rules.starts_with_interrogative(&words);
        let min_conf = self.config.min_confidence_threshold;
        let urgent = self.rules.has_urgency_term(&words);
        let domain = self.rules.has_domain_term(&words);
        let fire_now = urgent
            || (score >= 0.8 && confidence >= min_conf)
            || (is_question && score >= 0.6)
            || (is_final
                && word_count >= self.config.min_words_for_processing
                && confidence >= min_conf)
            || (domain && score >= 0.6);
        if fire_now {
            return GateDecision::Fire(self.fire(score));
        }

        if word_count == 0 {
            return GateDecision::Accumulate;
        }

        // Candidates below either length floor wait the fixed short-message
        // grace period for more words.
        if word_count < self.config.min_words_for_processing
            || candidate.chars().count() < self.config.min_characters_for_processing
        {
            return GateDecision::Arm(self.config.short_message_timeout);
        }

        // Substantial candidates with a plausible score wait an adaptive
        // pause scaled by the speaker's profile.
        if score >= 0.4 {
            return GateDecision::Arm(self.adaptive_timeout(score, domain));
        }

        GateDecision::Accumulate
    }

    /// Timer expiry: fire whatever is pending.
    pub fn fire_pending(&mut self) -> Option<Utterance> {
        let pending = self.pending.as_ref()?;
        if pending.text.is_empty() {
            return None;
        }
        let norm = normalize(&pending.text);
        if self.is_duplicate(&norm) {
            self.pending = None;
            return None;
        }
        let confidence = pending.confidence;
        let lower = pending.text.to_lowercase();
        let words = tokenize(&lower);
        let text = pending.text.clone();
        let score = self.completion_score(&text, &words, confidence);
        Some(self.fire(score))
    }

    // ── Scoring ───────────────────────────────────────────────────

    /// Completion score in [0,1]: a weighted sum of punctuation, grammar,
    /// length, confidence and keyword signals, capped at 1.
    fn completion_score(&self, text: &str, words: &[&str], confidence: f64) -> f64 {
        let mut score: f64 = 0.0;
        let word_count = words.len();
        let trimmed = text.trim_end();
        let ends_sentence = trimmed.ends_with(['.', '!', '?']);
        let is_question = text.contains('?') || self.rules.starts_with_interrogative(words);

        if ends_sentence {
            score += 0.35;
        }

        if is_question {
            score += match word_count {
                n if n >= 3 => 0.4,
                2 => 0.2,
                _ => 0.1,
            };
        } else if trimmed.ends_with('.') {
            // Declarative bonus.
            score += 0.3;
        }

        if text.contains('!') {
            score += 0.25;
        }

        if self.rules.has_subject_verb(words) {
            score += 0.25;
        }

        let avg = self.profile.avg_sentence_words;
        let complete_thought =
            word_count >= 3 && (ends_sentence || word_count as f64 >= 0.8 * avg);
        if complete_thought {
            score += 0.3;
        }

        if word_count >= self.config.min_words_for_processing {
            score += 0.15;
        }

        if confidence >= self.config.min_confidence_threshold {
            score += 0.1;
        }

        let ratio = word_count as f64 / avg.max(AVG_SENTENCE_MIN);
        if ratio >= 0.8 {
            score += 0.1;
        }
        if ratio >= 1.2 {
            score += 0.05;
        }

        if self.rules.has_domain_term(words) {
            score += 0.1;
        }
        if self.rules.has_urgency_term(words) {
            score += 0.15;
        }

        if self.rules.starts_with_topic_marker(words) {
            score += 0.1;
        }
        if self.extends_previous(text) {
            score -= 0.1;
        }

        score.clamp(0.0, 1.0)
    }

    /// Adaptive timer: a pause tier keyed by how complete the candidate
    /// looks (conversational pause for near-complete, sentence pause for
    /// middling, thought pause for weak), scaled by the speaker's learned
    /// cadence, the role, and domain terms.
    fn adaptive_timeout(&self, score: f64, has_domain_term: bool) -> Duration {
        let tier = if score >= 0.6 {
            self.config.conversational_pause_threshold
        } else if score <= 0.3 {
            self.config.thought_completion_threshold
        } else {
            self.config.sentence_completion_threshold
        };
        // The profile's pause average is seeded from the sentence tier;
        // the ratio carries what the gate has learned about this speaker.
        let seed = (self.config.sentence_completion_threshold.as_millis() as f64).max(1.0);
        let learned = self.profile.avg_pause_ms / seed;
        let mut ms = tier.as_millis() as f64 * learned;
        if self.formal_role {
            ms *= 1.1;
        }
        if has_domain_term {
            ms *= 1.2;
        }
        let max = self.config.emergency_timeout.as_millis() as f64;
        Duration::from_millis(ms.clamp(MIN_TIMER.as_millis() as f64, max) as u64)
    }

    // ── Internal helpers ──────────────────────────────────────────

    fn is_duplicate(&self, norm: &str) -> bool {
        !self.profile.last_processed_norm.is_empty()
            && self.profile.last_processed_norm == norm
            && self
                .profile
                .last_processed_at
                .is_some_and(|at| at.elapsed() < DEDUP_WINDOW)
    }

    /// Probable continuation: the candidate textually extends the last
    /// fired utterance.
    fn extends_previous(&self, text: &str) -> bool {
        let prev = &self.profile.last_processed_norm;
        if prev.is_empty() {
            return false;
        }
        let norm = normalize(text);
        norm.len() > prev.len() && norm.starts_with(prev.as_str())
    }

    fn fire(&mut self, score: f64) -> Utterance {
        let pending = self.pending.take().expect("fire with a pending candidate");
        let word_count = pending.text.split_whitespace().count();
        let pause_ms = pending.started_at.elapsed().as_millis() as f64;
        self.profile
            .record_fire(word_count, pause_ms, pending.confidence, score);
        self.profile.last_processed_norm = normalize(&pending.text);
        self.profile.last_processed_at = Some(Instant::now());

        Utterance {
            text: pending.text,
            language: self.rules.language,
            confidence: pending.confidence,
            completion_score: score,
            timestamp: Instant::now(),
            participant_id: self.participant_id.clone(),
        }
    }
}

/// Lower-cased words with surrounding punctuation stripped, for keyword
/// and grammar checks.
fn tokenize(lower: &str) -> Vec<&str> {
    lower
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Normalized form used for dedup and cache keys: trimmed, lower-cased,
/// trailing punctuation stripped.
pub fn normalize(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', '!', '?', ',', ';', ':', ' '])
        .to_lowercase()
}
