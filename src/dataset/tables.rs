/*!
 * Per-language idiom tables.
 *
 * Each language has its own independently authored table with an idiom and
 * a meaning column. The tables arrive either as CSV files or, from the
 * CRUD layer, as plain rows.
 */

use anyhow::{anyhow, Context, Result};
use csv::ReaderBuilder;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::app_config::DataConfig;
use crate::language_utils::IdiomLanguage;

use super::normalizer::normalize;

/// One row of a per-language idiom table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdiomRecord {
    /// Language of the row
    pub language: IdiomLanguage,
    /// Idiom expression
    pub idiom_text: String,
    /// Meaning or paraphrase
    pub meaning_text: String,
    /// Position in the table; the join key across languages
    pub row_index: usize,
    /// Shared identifier, when the tables carry one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl IdiomRecord {
    /// Create a record from raw strings, normalizing both texts
    pub fn new(language: IdiomLanguage, idiom: &str, meaning: &str, row_index: usize) -> Self {
        Self {
            language,
            idiom_text: normalize(idiom),
            meaning_text: normalize(meaning),
            row_index,
            key: None,
        }
    }

    /// Attach a shared identifier
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        let key = normalize(&key.into());
        self.key = if key.is_empty() { None } else { Some(key) };
        self
    }

    /// Whether the idiom survived normalization
    pub fn has_idiom(&self) -> bool {
        !self.idiom_text.is_empty()
    }
}

/// Ordered records for each language
pub type IdiomTables = BTreeMap<IdiomLanguage, Vec<IdiomRecord>>;

/// Build records from `(idiom, meaning)` rows in table order
pub fn records_from_rows<I, S1, S2>(language: IdiomLanguage, rows: I) -> Vec<IdiomRecord>
where
    I: IntoIterator<Item = (S1, S2)>,
    S1: AsRef<str>,
    S2: AsRef<str>,
{
    rows.into_iter()
        .enumerate()
        .map(|(row_index, (idiom, meaning))| {
            IdiomRecord::new(language, idiom.as_ref(), meaning.as_ref(), row_index)
        })
        .collect()
}

/// Column headers to look for in a table
#[derive(Debug, Clone)]
pub struct TableColumns {
    pub idiom: String,
    pub meaning: String,
    pub key: Option<String>,
}

impl TableColumns {
    /// Columns as configured in the data section
    pub fn from_config(config: &DataConfig) -> Self {
        Self {
            idiom: config.idiom_column.clone(),
            meaning: config.meaning_column.clone(),
            key: config.key_column.clone(),
        }
    }
}

impl Default for TableColumns {
    fn default() -> Self {
        Self {
            idiom: "idiom".to_string(),
            meaning: "meaning".to_string(),
            key: None,
        }
    }
}

const IDIOM_ALIASES: &[&str] = &["idiom", "proverb", "source", "text"];
const MEANING_ALIASES: &[&str] = &["meaning", "translation", "explanation", "paraphrase"];

fn find_column(headers: &csv::StringRecord, preferred: &str, aliases: &[&str]) -> Option<usize> {
    let position = |name: &str| {
        headers
            .iter()
            .position(|header| normalize(header).eq_ignore_ascii_case(name))
    };

    position(preferred).or_else(|| aliases.iter().find_map(|alias| position(alias)))
}

/// Load one language table from a CSV file
///
/// Headers are matched case-insensitively, falling back to common aliases.
/// Extra columns (such as cross-references to other languages) are ignored.
/// Every data row keeps its position, even when its idiom is empty, so the
/// row index stays aligned with the other tables.
pub fn load_table<P: AsRef<Path>>(
    path: P,
    language: IdiomLanguage,
    columns: &TableColumns,
) -> Result<Vec<IdiomRecord>> {
    let path = path.as_ref();
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .context(format!("Failed to open idiom table: {}", path.display()))?;

    let headers = reader
        .headers()
        .context(format!("Failed to read headers of {}", path.display()))?
        .clone();

    // The original tables name the idiom column after the language
    let language_name = language.name().to_lowercase();
    let idiom_column = find_column(&headers, &columns.idiom, IDIOM_ALIASES)
        .or_else(|| find_column(&headers, &language_name, &[]))
        .ok_or_else(|| anyhow!("No idiom column '{}' in {}", columns.idiom, path.display()))?;
    let meaning_column = find_column(&headers, &columns.meaning, MEANING_ALIASES);
    if meaning_column.is_none() {
        warn!("No meaning column in {}, meanings will be empty", path.display());
    }
    let key_column = match &columns.key {
        Some(key) => Some(
            find_column(&headers, key, &[])
                .ok_or_else(|| anyhow!("No key column '{}' in {}", key, path.display()))?,
        ),
        None => None,
    };

    let mut records = Vec::new();
    for (row_index, result) in reader.records().enumerate() {
        let row = result.context(format!("Failed to read row {} of {}", row_index + 1, path.display()))?;
        let idiom = row.get(idiom_column).unwrap_or_default();
        let meaning = meaning_column.and_then(|c| row.get(c)).unwrap_or_default();

        let mut record = IdiomRecord::new(language, idiom, meaning, row_index);
        if let Some(key) = key_column.and_then(|c| row.get(c)) {
            record = record.with_key(key);
        }
        records.push(record);
    }

    debug!("Loaded {} {} rows from {}", records.len(), language, path.display());
    Ok(records)
}

/// Load every configured language table
///
/// A missing file is logged and treated as an absent language.
pub fn load_tables(config: &DataConfig) -> Result<IdiomTables> {
    let columns = TableColumns::from_config(config);
    let mut tables = IdiomTables::new();

    for language in IdiomLanguage::ALL {
        let path = config.table_path(language);
        if !path.exists() {
            warn!("Idiom table for {} not found at {}", language.name(), path.display());
            continue;
        }
        tables.insert(language, load_table(&path, language, &columns)?);
    }

    if tables.is_empty() {
        return Err(anyhow!(
            "No idiom tables found in {}",
            config.dataset_dir.display()
        ));
    }

    Ok(tables)
}
