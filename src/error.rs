//! Error types for the voicebridge relay.

use thiserror::Error;

/// Result type alias for voicebridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the relay.
///
/// Every component returns `Result<T>`; recoverable errors never unwind
/// across component boundaries. The pipeline orchestrator is the single
/// place where these are turned into typed transport messages for the
/// speaker's client.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed join payload, unsupported language tag, missing voice id.
    #[error("validation error: {0}")]
    Validation(String),

    /// ASR stream or REST-fallback failure that could not be recovered
    /// internally (stream recreation and provider fallback happen first).
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Every configured ASR provider failed for this participant.
    #[error("transcription providers exhausted for language {language}")]
    ProvidersExhausted { language: String },

    /// Translation quota exhausted at the provider. Fatal for the
    /// utterance, surfaced to the speaker.
    #[error("translation quota exhausted: {0}")]
    TranslationQuota(String),

    /// Translation credentials rejected by the provider.
    #[error("translation auth rejected: {0}")]
    TranslationAuth(String),

    /// Other translation failure (network errors are retried once before
    /// this is produced).
    #[error("translation error: {0}")]
    Translation(String),

    /// Synthesis still rate-limited after the full retry budget.
    #[error("synthesis rate limited after {attempts} attempts")]
    SynthesisRateLimited { attempts: u32 },

    /// Other synthesis failure.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Client transport failure (send to a closed connection, framing).
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP error from a provider call.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error should stop the participant's ASR until
    /// reconnect rather than being retried internally.
    pub fn is_transcription_fatal(&self) -> bool {
        matches!(self, Self::ProvidersExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_detail() {
        let err = Error::Validation("missing voice id".into());
        assert!(err.to_string().contains("missing voice id"));
    }

    #[test]
    fn providers_exhausted_is_fatal() {
        let err = Error::ProvidersExhausted {
            language: "tr".into(),
        };
        assert!(err.is_transcription_fatal());
        assert!(!Error::Transcription("timeout".into()).is_transcription_fatal());
    }
}
