/*!
 * Directed translation pairs generated from aligned triplets.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::language_utils::IdiomLanguage;

use super::aligner::IdiomTriplet;

/// What the target side of a pair holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairMode {
    /// Idiom in the target language
    #[default]
    IdiomToIdiom,
    /// Meaning in the target language
    IdiomToMeaning,
}

impl fmt::Display for PairMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdiomToIdiom => write!(f, "idiom_to_idiom"),
            Self::IdiomToMeaning => write!(f, "idiom_to_meaning"),
        }
    }
}

/// One directed training example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationPair {
    pub source_lang: IdiomLanguage,
    pub target_lang: IdiomLanguage,
    pub source_text: String,
    pub target_text: String,
    #[serde(default)]
    pub is_augmented: bool,
    pub base_row_index: usize,
}

impl TranslationPair {
    /// Direction label such as `en->te`
    pub fn direction(&self) -> String {
        direction_key(self.source_lang, self.target_lang)
    }

    /// A pair is well formed when both texts are non-empty and the languages differ
    pub fn is_well_formed(&self) -> bool {
        self.source_lang != self.target_lang
            && !self.source_text.trim().is_empty()
            && !self.target_text.trim().is_empty()
    }
}

/// Direction label used as a stable report key
pub fn direction_key(source: IdiomLanguage, target: IdiomLanguage) -> String {
    format!("{}->{}", source.code(), target.code())
}

/// Expand triplets into directed pairs
///
/// Each ordered pair of distinct present languages yields one pair, sources
/// in language order and targets in language order within a source.
pub fn generate(triplets: &[IdiomTriplet], mode: PairMode) -> Vec<TranslationPair> {
    let mut pairs = Vec::new();

    for triplet in triplets {
        let present = triplet.present_languages();
        for &source_lang in &present {
            for &target_lang in &present {
                if source_lang == target_lang {
                    continue;
                }

                let (Some(source), Some(target)) = (triplet.get(source_lang), triplet.get(target_lang)) else {
                    continue;
                };

                let target_text = match mode {
                    PairMode::IdiomToIdiom => &target.idiom_text,
                    PairMode::IdiomToMeaning => &target.meaning_text,
                };
                if target_text.is_empty() {
                    continue;
                }

                pairs.push(TranslationPair {
                    source_lang,
                    target_lang,
                    source_text: source.idiom_text.clone(),
                    target_text: target_text.clone(),
                    is_augmented: false,
                    base_row_index: triplet.row_index,
                });
            }
        }
    }

    pairs
}
