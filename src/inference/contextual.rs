/*!
 * Idiom-aware sentence translation.
 *
 * Known idioms are located in a sentence, translated through the aligned
 * idiom tables, and the surrounding text goes through the engine piece by
 * piece. Sentences without a known idiom are translated whole.
 */

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::dataset::aligner::IdiomTriplet;
use crate::dataset::normalizer::normalize;
use crate::errors::TranslationError;
use crate::language_utils::IdiomLanguage;

use super::engine::{InferenceEngine, TranslateOptions};

static WORD_CHAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w$").unwrap());

/// Words of this many neighbours on each side are checked for literal usage
const CONTEXT_WINDOW: usize = 10;

/// Punctuation that attaches to the previous English word
const CLOSING_PUNCTUATION: &[char] = &['.', ',', '!', '?', ';', ':'];

/// English idioms that also have a literal reading, with the words that signal it
const LITERAL_CUES: &[(&str, &[&str])] = &[
    ("break the ice", &["frozen", "cold", "winter", "skating", "hockey", "cubes", "freezer"]),
    ("piece of cake", &["chocolate", "vanilla", "birthday", "wedding", "frosting", "batter", "slice"]),
];

/// Nouns that make a directly following "blue" literal, as in "out of the blue tub"
const BLUE_OBJECTS: &[&str] = &[
    "tub", "car", "house", "box", "bag", "shirt", "sky", "ocean", "water", "bottle", "container", "room",
    "building", "truck",
];

/// An idiom found in a sentence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdiomMatch {
    /// Table form of the idiom
    pub canonical: String,
    /// Text as it appears in the sentence
    pub original: String,
    /// Byte offsets into the sentence
    pub start: usize,
    pub end: usize,
    /// Row of the idiom group in the aligned tables
    pub row_index: usize,
}

/// A run of plain text or a detected idiom
#[derive(Debug, Clone, PartialEq)]
pub enum SentencePart {
    Text(String),
    Idiom(IdiomMatch),
}

struct IdiomPattern {
    language: IdiomLanguage,
    canonical: String,
    row_index: usize,
    regex: Regex,
}

/// Finds table idioms inside sentences
pub struct IdiomDetector {
    patterns: Vec<IdiomPattern>,
    // @field: Idiom text of each row by language
    translations: HashMap<usize, BTreeMap<IdiomLanguage, String>>,
}

impl IdiomDetector {
    /// Detector over aligned idiom groups
    pub fn from_triplets(triplets: &[IdiomTriplet]) -> Result<Self, regex::Error> {
        let mut patterns = Vec::new();
        let mut translations = HashMap::new();

        for triplet in triplets {
            let mut row = BTreeMap::new();
            for language in triplet.present_languages() {
                let Some(record) = triplet.get(language) else { continue };
                row.insert(language, record.idiom_text.clone());
                patterns.push(IdiomPattern {
                    language,
                    canonical: record.idiom_text.clone(),
                    row_index: triplet.row_index,
                    regex: idiom_regex(&record.idiom_text)?,
                });
            }
            translations.insert(triplet.row_index, row);
        }

        debug!("Idiom detector built with {} patterns", patterns.len());
        Ok(Self { patterns, translations })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Idioms of `language` in `text`, ordered by position, without overlaps
    ///
    /// When two idioms overlap, the earlier one wins, and the longer one
    /// when they start together.
    pub fn detect(&self, text: &str, language: IdiomLanguage) -> Vec<IdiomMatch> {
        let mut found = Vec::new();
        for pattern in self.patterns.iter().filter(|p| p.language == language) {
            for m in pattern.regex.find_iter(text) {
                if language == IdiomLanguage::English && is_literal(text, m.start(), m.end(), &pattern.canonical) {
                    info!("Rejected idiom '{}' in literal context: '{}'", pattern.canonical, m.as_str());
                    continue;
                }
                found.push(IdiomMatch {
                    canonical: pattern.canonical.clone(),
                    original: m.as_str().to_string(),
                    start: m.start(),
                    end: m.end(),
                    row_index: pattern.row_index,
                });
            }
        }

        found.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| b.end.cmp(&a.end)));
        let mut kept: Vec<IdiomMatch> = Vec::with_capacity(found.len());
        for m in found {
            if kept.last().is_some_and(|last| m.start < last.end) {
                continue;
            }
            kept.push(m);
        }
        kept
    }

    /// Table idiom of the same group in `target`
    pub fn table_translation(&self, idiom: &IdiomMatch, target: IdiomLanguage) -> Option<&str> {
        self.translations
            .get(&idiom.row_index)
            .and_then(|row| row.get(&target))
            .map(String::as_str)
    }
}

/// Case-insensitive pattern for an idiom, flexible in its whitespace
fn idiom_regex(idiom: &str) -> Result<Regex, regex::Error> {
    let body = idiom
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    let lead = if idiom.chars().next().is_some_and(is_word_char) { r"\b" } else { "" };
    let tail = if idiom.chars().last().is_some_and(is_word_char) { r"\b" } else { "" };
    RegexBuilder::new(&format!("{}{}{}", lead, body, tail))
        .case_insensitive(true)
        .build()
}

fn is_word_char(c: char) -> bool {
    let mut buffer = [0u8; 4];
    WORD_CHAR.is_match(c.encode_utf8(&mut buffer))
}

/// Lowercased words with edge punctuation removed
fn context_words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Whether the context around a match signals the literal reading
fn is_literal(text: &str, start: usize, end: usize, canonical: &str) -> bool {
    let before = context_words(&text[..start]);
    let after = context_words(&text[end..]);
    let before = &before[before.len().saturating_sub(CONTEXT_WINDOW)..];
    let after = &after[..after.len().min(CONTEXT_WINDOW)];

    let canonical = canonical.to_lowercase();
    if canonical == "out of the blue" {
        return after.first().is_some_and(|next| BLUE_OBJECTS.contains(&next.as_str()));
    }
    LITERAL_CUES
        .iter()
        .find(|(idiom, _)| *idiom == canonical)
        .is_some_and(|(_, cues)| before.iter().chain(after).any(|w| cues.contains(&w.as_str())))
}

/// Split `text` around `idioms`, which must be ordered and disjoint
pub fn split_sentence(text: &str, idioms: &[IdiomMatch]) -> Vec<SentencePart> {
    let mut parts = Vec::with_capacity(idioms.len() * 2 + 1);
    let mut cursor = 0;
    for idiom in idioms {
        let before = text[cursor..idiom.start].trim();
        if !before.is_empty() {
            parts.push(SentencePart::Text(before.to_string()));
        }
        parts.push(SentencePart::Idiom(idiom.clone()));
        cursor = idiom.end;
    }
    let rest = text[cursor..].trim();
    if !rest.is_empty() {
        parts.push(SentencePart::Text(rest.to_string()));
    }
    parts
}

/// Join translated parts; English keeps closing punctuation attached
pub fn join_parts(parts: &[String], target: IdiomLanguage) -> String {
    let mut result = String::new();
    for part in parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let attach = target == IdiomLanguage::English && part.starts_with(CLOSING_PUNCTUATION);
        if !result.is_empty() && !attach {
            result.push(' ');
        }
        result.push_str(part);
    }
    result
}

/// How a sentence was translated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationMethod {
    /// Whole sentence through the engine
    Direct,
    /// Idioms from the tables, the rest piecewise through the engine
    Contextual,
}

/// One idiom of a contextual translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdiomTranslation {
    pub original: String,
    pub canonical: String,
    pub translation: String,
    /// Taken from the aligned tables rather than generated
    pub from_table: bool,
}

/// A translated sentence with how it was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualTranslation {
    pub text: String,
    pub method: TranslationMethod,
    pub idioms: Vec<IdiomTranslation>,
    /// Parts kept in the source language because the engine could not translate them
    pub untranslated_parts: usize,
    /// Some generated part came from the base model without adapters
    pub used_fallback: bool,
}

/// Translates sentences with idioms resolved through the tables
pub struct ContextualTranslator<'a> {
    engine: &'a InferenceEngine,
    detector: &'a IdiomDetector,
    options: TranslateOptions,
}

impl<'a> ContextualTranslator<'a> {
    pub fn new(engine: &'a InferenceEngine, detector: &'a IdiomDetector, options: TranslateOptions) -> Self {
        Self {
            engine,
            detector,
            options: TranslateOptions {
                num_candidates: 1,
                ..options
            },
        }
    }

    /// Translate a sentence
    ///
    /// Without a detected idiom the whole sentence goes through the engine
    /// and its error is returned. With idioms, a part the engine cannot
    /// translate keeps its source text.
    pub fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<ContextualTranslation, TranslationError> {
        let source = IdiomLanguage::parse(source_lang)?;
        let target = IdiomLanguage::parse(target_lang)?;
        let text = normalize(text);

        let idioms = self.detector.detect(&text, source);
        if idioms.is_empty() {
            debug!("No idioms detected, translating the whole sentence");
            let candidates = self.engine.translate(&text, source_lang, target_lang, &self.options)?;
            let best = candidates.into_iter().next();
            return Ok(ContextualTranslation {
                used_fallback: best.as_ref().is_some_and(|c| c.fallback),
                text: best.map(|c| c.text).unwrap_or_default(),
                method: TranslationMethod::Direct,
                idioms: Vec::new(),
                untranslated_parts: 0,
            });
        }

        info!("Detected {} idiom(s) in '{}'", idioms.len(), text);
        let mut translated = Vec::new();
        let mut details = Vec::with_capacity(idioms.len());
        let mut untranslated_parts = 0usize;
        let mut used_fallback = false;

        for part in split_sentence(&text, &idioms) {
            match part {
                SentencePart::Text(content) => match self.generate(&content, source_lang, target_lang) {
                    Some((translation, fallback)) => {
                        used_fallback |= fallback;
                        translated.push(translation);
                    }
                    None => {
                        untranslated_parts += 1;
                        translated.push(content);
                    }
                },
                SentencePart::Idiom(idiom) => {
                    let (translation, from_table) = match self.detector.table_translation(&idiom, target) {
                        Some(table) => (table.to_string(), true),
                        None => match self.generate(&idiom.canonical, source_lang, target_lang) {
                            Some((translation, fallback)) => {
                                warn!("No table translation for '{}', generated '{}'", idiom.canonical, translation);
                                used_fallback |= fallback;
                                (translation, false)
                            }
                            None => {
                                untranslated_parts += 1;
                                (idiom.original.clone(), false)
                            }
                        },
                    };
                    translated.push(translation.clone());
                    details.push(IdiomTranslation {
                        original: idiom.original,
                        canonical: idiom.canonical,
                        translation,
                        from_table,
                    });
                }
            }
        }

        Ok(ContextualTranslation {
            text: join_parts(&translated, target),
            method: TranslationMethod::Contextual,
            idioms: details,
            untranslated_parts,
            used_fallback,
        })
    }

    /// Best engine translation of a part and whether it came from the base model
    fn generate(&self, text: &str, source_lang: &str, target_lang: &str) -> Option<(String, bool)> {
        match self.engine.translate(text, source_lang, target_lang, &self.options) {
            Ok(candidates) => candidates.into_iter().next().map(|c| (c.text, c.fallback)),
            Err(e) => {
                debug!("Keeping '{}' untranslated: {}", text, e);
                None
            }
        }
    }
}
