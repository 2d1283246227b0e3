//! Emotion analysis for voice synthesis parameters.
//!
//! Pure computation, no external service: the last few seconds of raw
//! PCM plus the transcript are fused into a per-utterance emotional
//! profile, which maps deterministically to a synthesis voice-settings
//! bundle. Any failure falls back to a neutral profile; emotion analysis
//! can never fail an utterance.

use serde::{Deserialize, Serialize};

use crate::language::{Language, Morphology};

/// Closed set of primary emotions the analyzer can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Sad,
    Angry,
    Surprised,
    Sarcastic,
    Excited,
    Calm,
    Urgent,
    Confident,
    Nervous,
}

impl Emotion {
    pub fn label(self) -> &'static str {
        match self {
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Surprised => "surprised",
            Self::Sarcastic => "sarcastic",
            Self::Excited => "excited",
            Self::Calm => "calm",
            Self::Urgent => "urgent",
            Self::Confident => "confident",
            Self::Nervous => "nervous",
        }
    }

    fn all() -> &'static [Emotion] {
        &[
            Self::Happy,
            Self::Sad,
            Self::Angry,
            Self::Surprised,
            Self::Sarcastic,
            Self::Excited,
            Self::Calm,
            Self::Urgent,
            Self::Confident,
            Self::Nervous,
        ]
    }
}

// ── Voice settings ────────────────────────────────────────────────

/// Synthesis voice parameters sent to the TTS provider. All scalar
/// fields are clamped to [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f64,
    pub similarity_boost: f64,
    pub style: f64,
    pub use_speaker_boost: bool,
}

impl VoiceSettings {
    pub fn clamped(stability: f64, similarity_boost: f64, style: f64, boost: bool) -> Self {
        Self {
            stability: stability.clamp(0.0, 1.0),
            similarity_boost: similarity_boost.clamp(0.0, 1.0),
            style: style.clamp(0.0, 1.0),
            use_speaker_boost: boost,
        }
    }

    /// Language-default bundle used when no emotional profile is
    /// available: agglutinative languages get a bit more stability,
    /// analytic ones a bit more style.
    pub fn language_default(language: Language) -> Self {
        match language.morphology() {
            Morphology::Agglutinative => Self::clamped(0.8, 0.75, 0.25, true),
            Morphology::Analytic => Self::clamped(0.7, 0.75, 0.4, true),
            Morphology::Fusional => Self::clamped(0.75, 0.75, 0.3, true),
        }
    }
}

// ── Profile ───────────────────────────────────────────────────────

/// Per-utterance emotional profile. Rebuilt for each utterance from the
/// rolling audio buffer and the transcript; never persisted.
#[derive(Debug, Clone)]
pub struct EmotionalProfile {
    pub primary: Emotion,
    /// Strength of the primary emotion in [0,1].
    pub intensity: f64,
    /// Analyzer confidence in [0,1].
    pub confidence: f64,
    /// Coarse delivery label ("animated", "subdued", "flat", "rising").
    pub tonality: &'static str,
    pub voice_settings: VoiceSettings,
    /// Cultural register hint, when detectable from the transcript.
    pub cultural_context: Option<&'static str>,
}

impl EmotionalProfile {
    /// Neutral fallback profile.
    pub fn neutral(language: Language) -> Self {
        Self {
            primary: Emotion::Calm,
            intensity: 0.3,
            confidence: 0.0,
            tonality: "flat",
            voice_settings: VoiceSettings::language_default(language),
            cultural_context: None,
        }
    }

    /// Cache bucket: emotion label plus quantized intensity. Two
    /// utterances in the same bucket synthesize identically.
    pub fn bucket(&self) -> String {
        let tier = if self.intensity >= 0.66 {
            "high"
        } else if self.intensity >= 0.33 {
            "mid"
        } else {
            "low"
        };
        format!("{}-{}", self.primary.label(), tier)
    }

    /// Compact summary attached to `live-translation` messages.
    pub fn summary(&self) -> EmotionSummary {
        EmotionSummary {
            primary: self.primary,
            intensity: self.intensity,
            tonality: self.tonality.to_string(),
        }
    }
}

/// Wire-facing emotion summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionSummary {
    pub primary: Emotion,
    pub intensity: f64,
    pub tonality: String,
}

// ── Audio features ────────────────────────────────────────────────

/// Coarse features extracted from 16 kHz mono PCM16LE.
#[derive(Debug, Clone, Copy)]
struct AudioFeatures {
    /// Rough dominant-frequency estimate from zero crossings (Hz).
    pitch_hz: f64,
    /// RMS energy normalized to [0,1].
    energy: f64,
    /// Zero crossings per sample.
    zero_crossing_rate: f64,
    /// Peak amplitude normalized to [0,1].
    envelope_peak: f64,
    /// Envelope bursts per second, a syllable-rate proxy.
    tempo: f64,
}

const SAMPLE_RATE: f64 = 16_000.0;

fn extract_features(pcm: &[u8]) -> Option<AudioFeatures> {
    if pcm.len() < 4 {
        return None;
    }
    let samples: Vec<f64> = pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f64 / i16::MAX as f64)
        .collect();
    let n = samples.len();

    let energy = (samples.iter().map(|s| s * s).sum::<f64>() / n as f64).sqrt();
    let envelope_peak = samples.iter().fold(0.0f64, |m, s| m.max(s.abs()));

    let mut crossings = 0usize;
    for pair in samples.windows(2) {
        if (pair[0] >= 0.0) != (pair[1] >= 0.0) {
            crossings += 1;
        }
    }
    let zero_crossing_rate = crossings as f64 / n as f64;
    // Each full cycle crosses zero twice.
    let pitch_hz = zero_crossing_rate * SAMPLE_RATE / 2.0;

    // Count bursts: 20 ms windows whose RMS exceeds twice the overall RMS.
    let window = (SAMPLE_RATE * 0.02) as usize;
    let mut bursts = 0usize;
    let mut in_burst = false;
    if window > 0 {
        for chunk in samples.chunks(window) {
            let rms =
                (chunk.iter().map(|s| s * s).sum::<f64>() / chunk.len() as f64).sqrt();
            let loud = rms > energy * 1.5 && rms > 0.01;
            if loud && !in_burst {
                bursts += 1;
            }
            in_burst = loud;
        }
    }
    let duration_s = n as f64 / SAMPLE_RATE;
    let tempo = if duration_s > 0.0 {
        bursts as f64 / duration_s
    } else {
        0.0
    };

    Some(AudioFeatures {
        pitch_hz,
        energy,
        zero_crossing_rate,
        envelope_peak,
        tempo,
    })
}

// ── Keyword tables ────────────────────────────────────────────────

struct SentimentLexicon {
    happy: &'static [&'static str],
    sad: &'static [&'static str],
    angry: &'static [&'static str],
    surprised: &'static [&'static str],
    excited: &'static [&'static str],
    urgent: &'static [&'static str],
    courteous: &'static [&'static str],
}

fn lexicon_for(language: Language) -> SentimentLexicon {
    match language {
        Language::Tr => SentimentLexicon {
            happy: &["mutlu", "harika", "güzel", "iyi", "teşekkür"],
            sad: &["üzgün", "kötü", "maalesef", "yazık"],
            angry: &["kızgın", "sinirli", "rezalet", "saçma"],
            surprised: &["gerçekten", "inanılmaz", "vay", "şaşırdım"],
            excited: &["heyecanlı", "müthiş", "süper", "hadi"],
            urgent: &["acil", "hemen", "yardım", "imdat"],
            courteous: &["lütfen", "efendim", "rica"],
        },
        _ => SentimentLexicon {
            happy: &["happy", "great", "wonderful", "good", "thanks", "glad"],
            sad: &["sad", "sorry", "unfortunately", "bad", "worse"],
            angry: &["angry", "furious", "ridiculous", "terrible", "unacceptable"],
            surprised: &["really", "wow", "unbelievable", "incredible", "seriously"],
            excited: &["amazing", "awesome", "fantastic", "excited", "yes"],
            urgent: &["help", "emergency", "urgent", "now", "immediately"],
            courteous: &["please", "sir", "madam", "kindly"],
        },
    }
}

// ── Analyzer ──────────────────────────────────────────────────────

/// Derive an emotional profile from the rolling audio buffer and the
/// original transcript. Deterministic and side-effect-free; returns the
/// neutral profile when the inputs are too thin to say anything.
pub fn analyze(pcm: &[u8], text: &str, language: Language) -> EmotionalProfile {
    let Some(features) = extract_features(pcm) else {
        return EmotionalProfile::neutral(language);
    };
    if text.trim().is_empty() {
        return EmotionalProfile::neutral(language);
    }

    let lex = lexicon_for(language);
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .collect();

    let hits = |list: &[&str]| -> f64 {
        words.iter().filter(|w| list.contains(*w)).count() as f64
    };

    let mut scores: std::collections::HashMap<Emotion, f64> = Emotion::all()
        .iter()
        .map(|e| (*e, 0.0))
        .collect();

    // Text signals.
    let exclamations = text.matches('!').count() as f64;
    let questions = text.matches('?').count() as f64;
    *scores.get_mut(&Emotion::Happy).unwrap() += hits(lex.happy) * 0.3;
    *scores.get_mut(&Emotion::Sad).unwrap() += hits(lex.sad) * 0.3;
    *scores.get_mut(&Emotion::Angry).unwrap() += hits(lex.angry) * 0.35;
    *scores.get_mut(&Emotion::Surprised).unwrap() += hits(lex.surprised) * 0.3 + questions * 0.1;
    *scores.get_mut(&Emotion::Excited).unwrap() += hits(lex.excited) * 0.3 + exclamations * 0.15;
    *scores.get_mut(&Emotion::Urgent).unwrap() += hits(lex.urgent) * 0.4 + exclamations * 0.1;
    let text_hits = hits(lex.happy)
        + hits(lex.sad)
        + hits(lex.angry)
        + hits(lex.surprised)
        + hits(lex.excited)
        + hits(lex.urgent);

    // Audio signals.
    if features.energy > 0.15 {
        *scores.get_mut(&Emotion::Excited).unwrap() += 0.25;
        *scores.get_mut(&Emotion::Angry).unwrap() += 0.15;
    } else if features.energy < 0.03 {
        *scores.get_mut(&Emotion::Calm).unwrap() += 0.25;
        *scores.get_mut(&Emotion::Sad).unwrap() += 0.1;
    } else {
        *scores.get_mut(&Emotion::Confident).unwrap() += 0.15;
    }
    if features.pitch_hz > 300.0 {
        *scores.get_mut(&Emotion::Surprised).unwrap() += 0.15;
        *scores.get_mut(&Emotion::Nervous).unwrap() += 0.1;
    } else if features.pitch_hz < 120.0 {
        *scores.get_mut(&Emotion::Calm).unwrap() += 0.15;
        *scores.get_mut(&Emotion::Confident).unwrap() += 0.1;
    }
    if features.tempo > 4.0 {
        *scores.get_mut(&Emotion::Urgent).unwrap() += 0.2;
        *scores.get_mut(&Emotion::Nervous).unwrap() += 0.1;
    } else if features.tempo < 1.0 {
        *scores.get_mut(&Emotion::Calm).unwrap() += 0.1;
    }

    // Mixed cue: positive words delivered flat reads as sarcasm.
    if hits(lex.happy) > 0.0 && features.energy < 0.02 && exclamations == 0.0 {
        *scores.get_mut(&Emotion::Sarcastic).unwrap() += 0.3;
    }

    // Argmax in declaration order so ties resolve the same way on every
    // call.
    let (primary, max_score) = Emotion::all()
        .iter()
        .map(|e| (*e, scores.get(e).copied().unwrap_or(0.0)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((Emotion::Calm, 0.0));

    if max_score <= 0.0 {
        return EmotionalProfile::neutral(language);
    }

    let intensity = max_score.clamp(0.0, 1.0);
    let audio_clarity = (features.envelope_peak * 2.0).clamp(0.0, 1.0);
    let text_intensity = (text_hits / words.len().max(1) as f64 * 4.0).clamp(0.0, 1.0);
    let confidence = ((audio_clarity + text_intensity + intensity) / 3.0).clamp(0.0, 1.0);

    let tonality = if features.energy > 0.15 {
        "animated"
    } else if features.pitch_hz > 300.0 {
        "rising"
    } else if features.energy < 0.03 {
        "subdued"
    } else {
        "flat"
    };

    let cultural_context = if hits(lex.courteous) > 0.0 {
        Some("courteous")
    } else {
        None
    };

    EmotionalProfile {
        primary,
        intensity,
        confidence,
        tonality,
        voice_settings: voice_settings_for(primary, intensity, language),
        cultural_context,
    }
}

/// Static (emotion, intensity) → voice-settings mapping. High-arousal
/// emotions trade stability for style; low-arousal ones do the opposite.
fn voice_settings_for(emotion: Emotion, intensity: f64, language: Language) -> VoiceSettings {
    let base = VoiceSettings::language_default(language);
    let (stability, style) = match emotion {
        Emotion::Excited | Emotion::Surprised => (0.35, 0.7),
        Emotion::Angry | Emotion::Urgent => (0.3, 0.6),
        Emotion::Happy => (0.5, 0.55),
        Emotion::Sad | Emotion::Nervous => (0.6, 0.35),
        Emotion::Sarcastic => (0.55, 0.5),
        Emotion::Calm | Emotion::Confident => (0.85, 0.2),
    };
    // Stronger emotion pulls further away from the language default.
    let blend = intensity.clamp(0.0, 1.0);
    VoiceSettings::clamped(
        base.stability + (stability - base.stability) * blend,
        base.similarity_boost,
        base.style + (style - base.style) * blend,
        true,
    )
}
