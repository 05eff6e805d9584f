use isolang::Language;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::ValidationError;

/// Language utilities for the idiom languages
///
/// This module resolves the many spellings of a language code callers use
/// (ISO 639-1, ISO 639-3, English names, NLLB codes) to one of the supported
/// idiom languages, and detects the dominant script of a piece of text.
/// Supported idiom language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdiomLanguage {
    #[serde(rename = "en", alias = "eng", alias = "eng_Latn", alias = "english")]
    English,
    #[serde(rename = "hi", alias = "hin", alias = "hin_Deva", alias = "hindi")]
    Hindi,
    #[serde(rename = "te", alias = "tel", alias = "tel_Telu", alias = "telugu")]
    Telugu,
}

impl IdiomLanguage {
    /// All supported languages in their canonical order
    pub const ALL: [IdiomLanguage; 3] = [Self::English, Self::Hindi, Self::Telugu];

    /// ISO 639-1 code
    pub fn code(&self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Hindi => "hi",
            Self::Telugu => "te",
        }
    }

    /// ISO 639-3 code
    pub fn part3(&self) -> &'static str {
        match self {
            Self::English => "eng",
            Self::Hindi => "hin",
            Self::Telugu => "tel",
        }
    }

    /// NLLB language token, used as the forced first decoder token
    pub fn nllb_code(&self) -> &'static str {
        match self {
            Self::English => "eng_Latn",
            Self::Hindi => "hin_Deva",
            Self::Telugu => "tel_Telu",
        }
    }

    /// Script the language is written in
    pub fn script(&self) -> Script {
        match self {
            Self::English => Script::Latin,
            Self::Hindi => Script::Devanagari,
            Self::Telugu => Script::Telugu,
        }
    }

    /// English name of the language
    pub fn name(&self) -> String {
        Language::from_639_3(self.part3())
            .map(|lang| lang.to_name().to_string())
            .unwrap_or_else(|| self.part3().to_string())
    }

    fn from_part3(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|lang| lang.part3() == code)
    }

    /// Parse any accepted spelling of a language code
    pub fn parse(code: &str) -> Result<Self, ValidationError> {
        let normalized = code.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(ValidationError::UnknownLanguage(code.to_string()));
        }

        // NLLB codes carry a script suffix, e.g. "hin_Deva"
        let base = normalized.split('_').next().unwrap_or(&normalized);

        let part3 = match base.len() {
            2 => Language::from_639_1(base).map(|lang| lang.to_639_3().to_string()),
            3 => Language::from_639_3(base).map(|lang| lang.to_639_3().to_string()),
            _ => None,
        };

        if let Some(found) = part3.as_deref().and_then(Self::from_part3) {
            return Ok(found);
        }

        Self::ALL
            .into_iter()
            .find(|lang| lang.name().to_lowercase() == normalized)
            .ok_or_else(|| ValidationError::UnknownLanguage(code.to_string()))
    }
}

impl fmt::Display for IdiomLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for IdiomLanguage {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Writing system of a piece of text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Script {
    Latin,
    Devanagari,
    Telugu,
    Mixed,
    Unknown,
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Latin => "Latin",
            Self::Devanagari => "Devanagari",
            Self::Telugu => "Telugu",
            Self::Mixed => "Mixed",
            Self::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

/// Script of a single alphabetic character, if it is one we track
fn char_script(c: char) -> Option<Script> {
    match c {
        '\u{0C00}'..='\u{0C7F}' => Some(Script::Telugu),
        '\u{0900}'..='\u{097F}' => Some(Script::Devanagari),
        c if c.is_ascii_alphabetic() => Some(Script::Latin),
        _ => None,
    }
}

/// Detect the dominant script of a text
///
/// A script is dominant when more than half of the alphabetic characters
/// belong to it. Text without alphabetic characters is `Unknown`.
pub fn detect_script(text: &str) -> Script {
    let mut latin = 0usize;
    let mut devanagari = 0usize;
    let mut telugu = 0usize;
    let mut total = 0usize;

    for c in text.chars().filter(|c| c.is_alphabetic()) {
        total += 1;
        match char_script(c) {
            Some(Script::Latin) => latin += 1,
            Some(Script::Devanagari) => devanagari += 1,
            Some(Script::Telugu) => telugu += 1,
            _ => {}
        }
    }

    if total == 0 {
        return Script::Unknown;
    }

    let share = |count: usize| count as f64 / total as f64 > 0.5;
    if share(telugu) {
        Script::Telugu
    } else if share(devanagari) {
        Script::Devanagari
    } else if share(latin) {
        Script::Latin
    } else {
        Script::Mixed
    }
}

/// Script of a vocabulary piece; `None` for pieces without letters
pub fn piece_script(piece: &str) -> Option<Script> {
    match detect_script(piece) {
        Script::Unknown => None,
        script => Some(script),
    }
}
