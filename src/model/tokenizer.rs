/*!
 * Word-level tokenizer with NLLB-style language tokens.
 *
 * The vocabulary is built from a corpus. Ids 0..=3 are the special tokens,
 * followed by one language token per supported language and then the
 * corpus pieces in sorted order, so the same corpus always yields the same
 * ids. Every piece remembers its script for constrained decoding.
 */

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use crate::dataset::normalizer::normalize;
use crate::dataset::pairs::TranslationPair;
use crate::errors::ModelLoadError;
use crate::language_utils::{piece_script, IdiomLanguage, Script};

use super::TrainingExample;

pub const PAD_ID: u32 = 0;
pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const UNK_ID: u32 = 3;

/// Decoder start token, as in NLLB
pub const DECODER_START_ID: u32 = EOS_ID;

/// File name inside a checkpoint directory
pub const TOKENIZER_FILE: &str = "tokenizer.json";

const SPECIAL_PIECES: [&str; 4] = ["<pad>", "<s>", "</s>", "<unk>"];
const FORMAT_VERSION: u32 = 1;

static PIECE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+|[^\w\s]").unwrap());

/// Split normalized text into lowercase pieces
pub fn split_pieces(text: &str) -> Vec<String> {
    let text = normalize(text);
    PIECE_REGEX
        .find_iter(&text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

#[derive(Serialize, Deserialize)]
struct TokenizerFile {
    version: u32,
    pieces: Vec<String>,
}

/// Corpus-built word tokenizer
#[derive(Debug, Clone, PartialEq)]
pub struct Tokenizer {
    pieces: Vec<String>,
    scripts: Vec<Option<Script>>,
    index: HashMap<String, u32>,
}

impl Tokenizer {
    /// Build the vocabulary from texts
    pub fn build<'a, I>(texts: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let words: BTreeSet<String> = texts.into_iter().flat_map(split_pieces).collect();
        let mut pieces: Vec<String> = SPECIAL_PIECES.iter().map(|p| p.to_string()).collect();
        pieces.extend(IdiomLanguage::ALL.iter().map(|l| l.nllb_code().to_string()));
        let fresh: Vec<String> = words.into_iter().filter(|w| !pieces.contains(w)).collect();
        pieces.extend(fresh);
        Self::from_pieces(pieces)
    }

    /// Build the vocabulary from both sides of every pair
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = &'a TranslationPair>,
    {
        Self::build(
            pairs
                .into_iter()
                .flat_map(|p| [p.source_text.as_str(), p.target_text.as_str()]),
        )
    }

    fn from_pieces(pieces: Vec<String>) -> Self {
        let reserved = SPECIAL_PIECES.len() + IdiomLanguage::ALL.len();
        let scripts = pieces
            .iter()
            .enumerate()
            .map(|(id, piece)| if id < reserved { None } else { piece_script(piece) })
            .collect();
        let index = pieces
            .iter()
            .enumerate()
            .map(|(id, piece)| (piece.clone(), id as u32))
            .collect();
        Self {
            pieces,
            scripts,
            index,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.pieces.len()
    }

    pub fn pieces(&self) -> &[String] {
        &self.pieces
    }

    pub fn piece(&self, id: u32) -> Option<&str> {
        self.pieces.get(id as usize).map(String::as_str)
    }

    /// Script of a content piece; `None` for special, language and punctuation tokens
    pub fn script(&self, id: u32) -> Option<Script> {
        self.scripts.get(id as usize).copied().flatten()
    }

    pub fn language_token(&self, language: IdiomLanguage) -> u32 {
        let position = IdiomLanguage::ALL
            .iter()
            .position(|l| *l == language)
            .unwrap_or_default();
        (SPECIAL_PIECES.len() + position) as u32
    }

    pub fn language_of_token(&self, id: u32) -> Option<IdiomLanguage> {
        IdiomLanguage::ALL.into_iter().find(|l| self.language_token(*l) == id)
    }

    /// Special and language tokens
    pub fn is_special(&self, id: u32) -> bool {
        (id as usize) < SPECIAL_PIECES.len() + IdiomLanguage::ALL.len()
    }

    pub fn token_id(&self, piece: &str) -> u32 {
        self.index.get(piece).copied().unwrap_or(UNK_ID)
    }

    /// `[language token, pieces..., </s>]`, truncated to `max_length`
    pub fn encode(&self, text: &str, language: IdiomLanguage, max_length: usize) -> Vec<u32> {
        let max_length = max_length.max(2);
        let mut ids = vec![self.language_token(language)];
        ids.extend(
            split_pieces(text)
                .iter()
                .take(max_length - 2)
                .map(|piece| self.token_id(piece)),
        );
        ids.push(EOS_ID);
        ids
    }

    /// Number of known, non-special tokens
    pub fn content_len(&self, ids: &[u32]) -> usize {
        ids.iter().filter(|id| !self.is_special(**id)).count()
    }

    /// Training example for a pair; `None` when either side has no content
    pub fn training_example(&self, pair: &TranslationPair, max_length: usize) -> Option<TrainingExample> {
        if !pair.is_well_formed() {
            return None;
        }

        let source_ids = self.encode(&pair.source_text, pair.source_lang, max_length);
        let labels = self.encode(&pair.target_text, pair.target_lang, max_length);
        if self.content_len(&source_ids) == 0 || self.content_len(&labels) == 0 {
            return None;
        }

        let mut decoder_input = Vec::with_capacity(labels.len());
        decoder_input.push(DECODER_START_ID);
        decoder_input.extend_from_slice(&labels[..labels.len() - 1]);

        Some(TrainingExample {
            source_ids,
            decoder_input,
            labels,
        })
    }

    /// Text of the content tokens
    ///
    /// Punctuation attaches to the preceding word.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut text = String::new();
        for &id in ids {
            if self.is_special(id) {
                continue;
            }
            let Some(piece) = self.piece(id) else { continue };
            let attaches = self.script(id).is_none() && !piece.chars().any(char::is_alphanumeric);
            if !text.is_empty() && !attaches {
                text.push(' ');
            }
            text.push_str(piece);
        }
        text
    }

    /// Write `tokenizer.json` into a directory
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> std::io::Result<()> {
        let file = TokenizerFile {
            version: FORMAT_VERSION,
            pieces: self.pieces.clone(),
        };
        let json = serde_json::to_string(&file).map_err(std::io::Error::other)?;
        fs::write(dir.as_ref().join(TOKENIZER_FILE), json)
    }

    /// Read `tokenizer.json` from a directory
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, ModelLoadError> {
        let path = dir.as_ref().join(TOKENIZER_FILE);
        if !path.exists() {
            return Err(ModelLoadError::MissingArtifact(path));
        }
        let content = fs::read_to_string(&path)?;
        let file: TokenizerFile = serde_json::from_str(&content).map_err(|e| ModelLoadError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
        if file.version != FORMAT_VERSION {
            return Err(ModelLoadError::Incompatible(format!(
                "tokenizer format version {} (expected {})",
                file.version, FORMAT_VERSION
            )));
        }

        let reserved: Vec<String> = SPECIAL_PIECES
            .iter()
            .map(|p| p.to_string())
            .chain(IdiomLanguage::ALL.iter().map(|l| l.nllb_code().to_string()))
            .collect();
        if file.pieces.len() < reserved.len() || file.pieces[..reserved.len()] != reserved[..] {
            return Err(ModelLoadError::Incompatible(
                "tokenizer does not start with the special and language tokens".to_string(),
            ));
        }

        Ok(Self::from_pieces(file.pieces))
    }
}
