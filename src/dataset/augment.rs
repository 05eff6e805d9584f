/*!
 * Context augmentation.
 *
 * Idioms rarely appear alone; they sit inside sentences. The augmenter wraps
 * a pair's idioms into multilingual sentence templates so the model also
 * learns to translate them in context. Every template carries one phrasing
 * per language, so an augmented pair never mixes scripts.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::language_utils::IdiomLanguage;

use super::pairs::{PairMode, TranslationPair};

/// Placeholder substituted by the idiom text
pub const IDIOM_PLACEHOLDER: &str = "{idiom}";

/// A sentence template with one phrasing per language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTemplate {
    pub name: String,
    pub phrasings: BTreeMap<IdiomLanguage, String>,
}

impl ContextTemplate {
    pub fn new(name: &str, phrasings: [(IdiomLanguage, &str); 3]) -> Self {
        Self {
            name: name.to_string(),
            phrasings: phrasings
                .into_iter()
                .map(|(language, text)| (language, text.to_string()))
                .collect(),
        }
    }

    /// Fill the phrasing of a language, if the template has a usable one
    pub fn render(&self, language: IdiomLanguage, idiom: &str) -> Option<String> {
        self.phrasings
            .get(&language)
            .filter(|phrasing| phrasing.contains(IDIOM_PLACEHOLDER))
            .map(|phrasing| phrasing.replace(IDIOM_PLACEHOLDER, idiom))
    }
}

/// Built-in templates
pub fn default_templates() -> Vec<ContextTemplate> {
    use IdiomLanguage::*;

    vec![
        ContextTemplate::new(
            "saying",
            [
                (English, "As the saying goes, {idiom}."),
                (Hindi, "जैसा कि कहावत है, {idiom}।"),
                (Telugu, "సామెత చెప్పినట్లు, {idiom}."),
            ],
        ),
        ContextTemplate::new(
            "habit",
            [
                (English, "He always says: {idiom}."),
                (Hindi, "वह हमेशा कहता है: {idiom}।"),
                (Telugu, "అతను ఎప్పుడూ అంటాడు: {idiom}."),
            ],
        ),
        ContextTemplate::new(
            "situation",
            [
                (English, "In that situation, {idiom}."),
                (Hindi, "उस स्थिति में, {idiom}।"),
                (Telugu, "ఆ పరిస్థితిలో, {idiom}."),
            ],
        ),
    ]
}

/// Adds templated variants of a pair
#[derive(Debug, Clone)]
pub struct ContextAugmenter {
    templates: Vec<ContextTemplate>,
    mode: PairMode,
}

impl ContextAugmenter {
    pub fn new(templates: Vec<ContextTemplate>, mode: PairMode) -> Self {
        Self { templates, mode }
    }

    pub fn templates(&self) -> &[ContextTemplate] {
        &self.templates
    }

    /// Templated variants of one pair
    ///
    /// The source idiom is always embedded. In idiom mode the target idiom
    /// is embedded into the same template's target phrasing; in meaning mode
    /// the target stays the bare paraphrase. Augmented pairs yield nothing.
    pub fn augment(&self, pair: &TranslationPair) -> Vec<TranslationPair> {
        if pair.is_augmented {
            return Vec::new();
        }

        self.templates
            .iter()
            .filter_map(|template| {
                let source_text = template.render(pair.source_lang, &pair.source_text)?;
                let target_text = match self.mode {
                    PairMode::IdiomToIdiom => template.render(pair.target_lang, &pair.target_text)?,
                    PairMode::IdiomToMeaning => pair.target_text.clone(),
                };

                Some(TranslationPair {
                    source_lang: pair.source_lang,
                    target_lang: pair.target_lang,
                    source_text,
                    target_text,
                    is_augmented: true,
                    base_row_index: pair.base_row_index,
                })
            })
            .collect()
    }

    /// Every pair followed by its variants
    pub fn augment_all(&self, pairs: &[TranslationPair]) -> Vec<TranslationPair> {
        let mut out = Vec::with_capacity(pairs.len() * (self.templates.len() + 1));
        for pair in pairs {
            out.push(pair.clone());
            out.extend(self.augment(pair));
        }
        out
    }
}
