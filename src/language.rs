//! Supported languages and their properties.
//!
//! Language tags arrive from clients as BCP-47-ish strings ("en", "tr",
//! "zh-TW"). They are parsed into [`Language`] at join time; unknown tags
//! are rejected with a validation error. The morphology class feeds the
//! utterance gate's grammar heuristic and the synthesizer's language
//! defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Broad morphological class of a language.
///
/// Agglutinative languages (verb suffixes carry the predicate) get a
/// different sentence-completeness heuristic and slightly more stable
/// default voice settings than analytic ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Morphology {
    /// Verb morphology via stacked suffixes (Turkish, Japanese, Korean, …).
    Agglutinative,
    /// Meaning mostly from word order and helper words (English, Chinese, …).
    Analytic,
    /// Inflection fused into word forms (Spanish, Russian, Arabic, …).
    Fusional,
}

/// A language supported by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    En, // English
    Tr, // Turkish
    Es, // Spanish
    Fr, // French
    De, // German
    It, // Italian
    Pt, // Portuguese
    Nl, // Dutch
    Ru, // Russian
    Uk, // Ukrainian
    Ar, // Arabic
    Hi, // Hindi
    Ja, // Japanese
    Ko, // Korean
    Zh, // Chinese (Simplified)
    Vi, // Vietnamese
    Th, // Thai
    Fi, // Finnish
    Hu, // Hungarian
    Pl, // Polish
}

impl Language {
    /// Canonical lowercase tag string.
    pub fn tag(self) -> &'static str {
        match self {
            Self::En => "en",
            Self::Tr => "tr",
            Self::Es => "es",
            Self::Fr => "fr",
            Self::De => "de",
            Self::It => "it",
            Self::Pt => "pt",
            Self::Nl => "nl",
            Self::Ru => "ru",
            Self::Uk => "uk",
            Self::Ar => "ar",
            Self::Hi => "hi",
            Self::Ja => "ja",
            Self::Ko => "ko",
            Self::Zh => "zh",
            Self::Vi => "vi",
            Self::Th => "th",
            Self::Fi => "fi",
            Self::Hu => "hu",
            Self::Pl => "pl",
        }
    }

    /// Human-readable language name.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::En => "English",
            Self::Tr => "Turkish",
            Self::Es => "Spanish",
            Self::Fr => "French",
            Self::De => "German",
            Self::It => "Italian",
            Self::Pt => "Portuguese",
            Self::Nl => "Dutch",
            Self::Ru => "Russian",
            Self::Uk => "Ukrainian",
            Self::Ar => "Arabic",
            Self::Hi => "Hindi",
            Self::Ja => "Japanese",
            Self::Ko => "Korean",
            Self::Zh => "Chinese",
            Self::Vi => "Vietnamese",
            Self::Th => "Thai",
            Self::Fi => "Finnish",
            Self::Hu => "Hungarian",
            Self::Pl => "Polish",
        }
    }

    /// Morphology class used by the gate and the synthesizer defaults.
    pub fn morphology(self) -> Morphology {
        match self {
            Self::Tr | Self::Ja | Self::Ko | Self::Fi | Self::Hu => Morphology::Agglutinative,
            Self::En | Self::Zh | Self::Vi | Self::Th => Morphology::Analytic,
            _ => Morphology::Fusional,
        }
    }

    /// Parse a BCP-47-ish tag, case-insensitively. Region subtags are
    /// ignored ("en-US" parses as English).
    pub fn parse(tag: &str) -> Result<Self> {
        let primary = tag
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_lowercase();
        let lang = match primary.as_str() {
            "en" => Self::En,
            "tr" => Self::Tr,
            "es" => Self::Es,
            "fr" => Self::Fr,
            "de" => Self::De,
            "it" => Self::It,
            "pt" => Self::Pt,
            "nl" => Self::Nl,
            "ru" => Self::Ru,
            "uk" => Self::Uk,
            "ar" => Self::Ar,
            "hi" => Self::Hi,
            "ja" => Self::Ja,
            "ko" => Self::Ko,
            "zh" => Self::Zh,
            "vi" => Self::Vi,
            "th" => Self::Th,
            "fi" => Self::Fi,
            "hu" => Self::Hu,
            "pl" => Self::Pl,
            _ => {
                return Err(Error::Validation(format!(
                    "unsupported language tag: {tag}"
                )))
            }
        };
        Ok(lang)
    }

    /// All supported languages.
    pub fn all() -> &'static [Language] {
        &[
            Self::En,
            Self::Tr,
            Self::Es,
            Self::Fr,
            Self::De,
            Self::It,
            Self::Pt,
            Self::Nl,
            Self::Ru,
            Self::Uk,
            Self::Ar,
            Self::Hi,
            Self::Ja,
            Self::Ko,
            Self::Zh,
            Self::Vi,
            Self::Th,
            Self::Fi,
            Self::Hu,
            Self::Pl,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for lang in Language::all() {
            assert_eq!(Language::parse(lang.tag()).unwrap(), *lang);
        }
    }

    #[test]
    fn parse_ignores_region_and_case() {
        assert_eq!(Language::parse("en-US").unwrap(), Language::En);
        assert_eq!(Language::parse("TR").unwrap(), Language::Tr);
        assert_eq!(Language::parse("pt_BR").unwrap(), Language::Pt);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(Language::parse("xx").is_err());
        assert!(Language::parse("").is_err());
    }

    #[test]
    fn morphology_classes() {
        assert_eq!(Language::Tr.morphology(), Morphology::Agglutinative);
        assert_eq!(Language::En.morphology(), Morphology::Analytic);
        assert_eq!(Language::Es.morphology(), Morphology::Fusional);
    }
}
