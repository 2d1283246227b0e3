//! Machine-translation client.
//!
//! One synchronous operation with a hard timeout: translate an utterance
//! between the two session languages. Dosage, time-of-day and bare
//! numeric spans are wrapped in protect tokens before the request and
//! unwrapped after, so the provider cannot "translate" a 5 mg dose into
//! something else. Network-class failures are retried exactly once;
//! quota and auth failures are surfaced immediately.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::config::MtConfig;
use crate::error::{Error, Result};
use crate::language::Language;

/// Result of one translation call.
#[derive(Debug, Clone)]
pub struct Translation {
    pub translated_text: String,
    pub detected_language: Option<String>,
    pub confidence: f64,
}

/// How a provider response should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseClass {
    Ok,
    /// Quota exhausted: fatal for this utterance, surfaced.
    Quota,
    /// Credentials rejected: fatal, surfaced.
    Auth,
    /// Transient (network/5xx): retried once.
    Transient,
    /// Any other 4xx, including 429: surfaced without retry.
    Client,
}

fn classify_status(status: reqwest::StatusCode) -> ResponseClass {
    match status.as_u16() {
        200..=299 => ResponseClass::Ok,
        456 => ResponseClass::Quota,
        401 | 403 => ResponseClass::Auth,
        500..=599 => ResponseClass::Transient,
        _ => ResponseClass::Client,
    }
}

// ── Protected spans ───────────────────────────────────────────────

const PROTECT_OPEN: &str = "<keep>";
const PROTECT_CLOSE: &str = "</keep>";

fn protect_regexes() -> &'static [Regex; 3] {
    static REGEXES: OnceLock<[Regex; 3]> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            // Dosages: "5 mg", "2.5ml", "10 units".
            Regex::new(r"(?i)\b\d+(?:\.\d+)?\s?(?:mg|mcg|ml|g|units?)\b").expect("static regex"),
            // Times of day: "14:30", "2:30 pm".
            Regex::new(r"(?i)\b\d{1,2}:\d{2}(?:\s?(?:am|pm))?\b").expect("static regex"),
            // Bare numbers.
            Regex::new(r"\b\d+(?:\.\d+)?\b").expect("static regex"),
        ]
    })
}

/// Wrap every protected span in balanced tokens. Spans already inside a
/// token (a dosage's number, for example) are left alone.
fn protect_spans(text: &str) -> String {
    let mut out = text.to_string();
    for regex in protect_regexes() {
        let mut result = String::with_capacity(out.len());
        let mut last = 0;
        for m in regex.find_iter(&out) {
            let before = &out[..m.start()];
            // Already protected by an earlier, broader pattern.
            let open_count = before.matches(PROTECT_OPEN).count();
            let close_count = before.matches(PROTECT_CLOSE).count();
            if open_count > close_count {
                continue;
            }
            result.push_str(&out[last..m.start()]);
            result.push_str(PROTECT_OPEN);
            result.push_str(m.as_str());
            result.push_str(PROTECT_CLOSE);
            last = m.end();
        }
        result.push_str(&out[last..]);
        out = result;
    }
    out
}

/// Strip protect tokens after translation.
fn unprotect_spans(text: &str) -> String {
    text.replace(PROTECT_OPEN, "").replace(PROTECT_CLOSE, "")
}

// ── Provider response ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    translations: Vec<ProviderTranslation>,
}

#[derive(Debug, Deserialize)]
struct ProviderTranslation {
    text: String,
    #[serde(default)]
    detected_source_language: Option<String>,
}

// ── Client ────────────────────────────────────────────────────────

/// Translation client, shared across all sessions.
pub struct Translator {
    http: reqwest::Client,
    config: MtConfig,
}

impl Translator {
    pub fn new(config: MtConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Translate `text` from `source` to `target`. Never called on empty
    /// text; callers guard, and the guard here keeps the invariant typed.
    pub async fn translate(
        &self,
        text: &str,
        source: Language,
        target: Language,
    ) -> Result<Translation> {
        if text.trim().is_empty() {
            return Err(Error::Validation("translate called on empty text".into()));
        }

        let protected = protect_spans(text);
        let mut last_error: Option<Error> = None;

        // One retry, and only for network/5xx-class failures.
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            match self.request(&protected, source, target).await {
                Ok(translation) => return Ok(translation),
                Err((retryable, e)) => {
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Translation("translation failed".into())))
    }

    /// One provider request. The boolean in the error case says whether
    /// the failure is retryable (network or 5xx-class).
    async fn request(
        &self,
        protected_text: &str,
        source: Language,
        target: Language,
    ) -> std::result::Result<Translation, (bool, Error)> {
        let body = serde_json::json!({
            "text": [protected_text],
            "source_lang": source.tag().to_uppercase(),
            "target_lang": target.tag().to_uppercase(),
            "tag_handling": "xml",
            "ignore_tags": ["keep"],
        });

        let response = self
            .http
            .post(&self.config.base_url)
            .header(
                "Authorization",
                format!("DeepL-Auth-Key {}", self.config.api_key),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| (true, Error::Http(e)))?;

        let status = response.status();
        match classify_status(status) {
            ResponseClass::Ok => {}
            ResponseClass::Quota => {
                return Err((
                    false,
                    Error::TranslationQuota(format!("provider status {status}")),
                ))
            }
            ResponseClass::Auth => {
                return Err((
                    false,
                    Error::TranslationAuth(format!("provider status {status}")),
                ))
            }
            ResponseClass::Transient => {
                return Err((
                    true,
                    Error::Translation(format!("transient provider failure: {status}")),
                ))
            }
            ResponseClass::Client => {
                let detail = response.text().await.unwrap_or_default();
                return Err((
                    false,
                    Error::Translation(format!("provider rejected request ({status}): {detail}")),
                ));
            }
        }

        let parsed: ProviderResponse = response
            .json()
            .await
            .map_err(|e| (false, Error::Http(e)))?;
        let first = parsed.translations.into_iter().next().ok_or_else(|| {
            (
                false,
                Error::Translation("empty translation result".into()),
            )
        })?;

        let translated_text = unprotect_spans(&first.text);
        if translated_text.trim().is_empty() {
            return Err((
                false,
                Error::Translation("provider returned empty text".into()),
            ));
        }

        // The provider reports a detected source rather than a score;
        // agreement with the declared source is the confidence signal.
        let detected = first.detected_source_language.map(|l| l.to_lowercase());
        let confidence = match &detected {
            Some(lang) if lang == source.tag() => 0.95,
            Some(_) => 0.7,
            None => 0.85,
        };

        Ok(Translation {
            translated_text,
            detected_language: detected,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dosage_spans_are_protected() {
        let out = protect_spans("take 5 mg twice a day");
        assert_eq!(out, "take <keep>5 mg</keep> twice a day");
    }

    #[test]
    fn times_and_numbers_are_protected() {
        let out = protect_spans("come at 14:30 with 2 forms");
        assert!(out.contains("<keep>14:30</keep>"));
        assert!(out.contains("<keep>2</keep>"));
    }

    #[test]
    fn nested_spans_are_not_double_wrapped() {
        // The dosage regex runs before the bare-number regex; the number
        // inside "5 mg" must not get a second token pair.
        let out = protect_spans("5 mg");
        assert_eq!(out, "<keep>5 mg</keep>");
    }

    #[test]
    fn unprotect_restores_plain_text() {
        let original = "take 5 mg at 14:30";
        let round_trip = unprotect_spans(&protect_spans(original));
        assert_eq!(round_trip, original);
    }

    #[test]
    fn tokens_are_balanced() {
        let out = protect_spans("dose 2.5ml at 9:15 am, then 3 more");
        assert_eq!(
            out.matches(PROTECT_OPEN).count(),
            out.matches(PROTECT_CLOSE).count()
        );
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::OK), ResponseClass::Ok);
        assert_eq!(
            classify_status(StatusCode::from_u16(456).unwrap()),
            ResponseClass::Quota
        );
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ResponseClass::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ResponseClass::Auth);
        // 429 is a 4xx here: surfaced, never retried. Only synthesis
        // backs off on rate limits.
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ResponseClass::Client
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            ResponseClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            ResponseClass::Client
        );
    }

    #[tokio::test]
    async fn empty_text_is_rejected_without_io() {
        let translator = Translator::new(MtConfig::default());
        let err = translator
            .translate("   ", Language::En, Language::Tr)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
