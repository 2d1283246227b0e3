//! REST recognizers: the chunked fallback and the batch provider.
//!
//! The chunked recognizer buffers submitted frames and issues a
//! synchronous recognize request every ~1.5–2 s of audio (shorter for
//! agglutinative languages, whose average word runs longer). It produces
//! finals only; there are no partials on this path. The batch recognizer
//! uploads a WAV-wrapped buffer as multipart form data and is selected
//! up-front for languages the streaming providers transcribe poorly.

use std::time::Instant;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::language::{Language, Morphology};
use crate::pipeline::audio::BYTES_PER_SECOND;

use super::Transcript;

/// Normalized recognize response; both REST providers answer with this
/// shape.
#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    text: String,
    #[serde(default)]
    confidence: f64,
}

/// Buffered audio before a chunked flush, by language class.
pub(super) fn flush_threshold_bytes(language: Language) -> usize {
    match language.morphology() {
        // Longer average word length: flush a little sooner so words are
        // not split across requests.
        Morphology::Agglutinative => BYTES_PER_SECOND * 3 / 2,
        _ => BYTES_PER_SECOND * 2,
    }
}

// ── Chunked fallback ──────────────────────────────────────────────

/// REST-chunked recognizer used when the streaming provider is
/// unavailable for a handle.
pub struct ChunkedRecognizer {
    http: reqwest::Client,
    url: String,
    api_key: String,
    language: Language,
    buffer: Vec<u8>,
    threshold: usize,
}

impl ChunkedRecognizer {
    pub fn new(http: reqwest::Client, url: &str, api_key: &str, language: Language) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key: api_key.to_string(),
            language,
            buffer: Vec::new(),
            threshold: flush_threshold_bytes(language),
        }
    }

    /// Append a frame; returns true once enough audio is buffered for a
    /// recognize request.
    pub fn push_frame(&mut self, pcm: &[u8]) -> bool {
        self.buffer.extend_from_slice(pcm);
        self.buffer.len() >= self.threshold
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Send the buffered audio as one synchronous recognize request.
    /// Emits a final transcript; clears the buffer even on failure so a
    /// bad chunk cannot wedge the handle.
    pub async fn flush(&mut self) -> Result<Option<Transcript>> {
        let audio = self.take_buffer();
        if audio.is_empty() {
            return Ok(None);
        }

        let response = self
            .http
            .post(&self.url)
            .query(&[("language", self.language.tag()), ("encoding", "linear16")])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/raw;rate=16000")
            .body(audio)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Transcription(format!(
                "chunked recognize failed: {}",
                response.status()
            )));
        }

        let parsed: RecognizeResponse = response.json().await?;
        if parsed.text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Transcript {
            text: parsed.text,
            confidence: parsed.confidence,
            language: self.language,
            is_final: true,
            timestamp: Instant::now(),
        }))
    }
}

// ── Batch provider ────────────────────────────────────────────────

/// Batch recognizer: multipart WAV upload.
pub struct BatchRecognizer {
    http: reqwest::Client,
    url: String,
    api_key: String,
    language: Language,
    buffer: Vec<u8>,
    threshold: usize,
}

impl BatchRecognizer {
    pub fn new(http: reqwest::Client, url: &str, api_key: &str, language: Language) -> Self {
        Self {
            http,
            url: url.to_string(),
            api_key: api_key.to_string(),
            language,
            buffer: Vec::new(),
            threshold: flush_threshold_bytes(language),
        }
    }

    pub fn push_frame(&mut self, pcm: &[u8]) -> bool {
        self.buffer.extend_from_slice(pcm);
        self.buffer.len() >= self.threshold
    }

    /// Upload the buffered audio as a WAV file.
    pub async fn flush(&mut self) -> Result<Option<Transcript>> {
        let audio = std::mem::take(&mut self.buffer);
        if audio.is_empty() {
            return Ok(None);
        }
        let wav = wrap_wav(&audio);

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| Error::Transcription(format!("multipart build failed: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("language", self.language.tag())
            .text("response_format", "json");

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Transcription(format!(
                "batch recognize failed: {}",
                response.status()
            )));
        }

        let parsed: RecognizeResponse = response.json().await?;
        if parsed.text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(Transcript {
            text: parsed.text,
            confidence: parsed.confidence,
            language: self.language,
            is_final: true,
            timestamp: Instant::now(),
        }))
    }
}

/// Wrap raw 16 kHz mono PCM16LE in a minimal WAV container.
fn wrap_wav(pcm: &[u8]) -> Vec<u8> {
    const SAMPLE_RATE: u32 = 16_000;
    const CHANNELS: u16 = 1;
    const BITS: u16 = 16;
    let byte_rate = SAMPLE_RATE * u32::from(CHANNELS) * u32::from(BITS) / 8;
    let block_align = CHANNELS * BITS / 8;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&CHANNELS.to_le_bytes());
    wav.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}
