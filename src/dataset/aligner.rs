/*!
 * Cross-language alignment of idiom tables into triplets.
 *
 * The tables are aligned positionally by default: row `i` of the English,
 * Hindi and Telugu tables describe the same idiom. When the tables carry a
 * shared key column, alignment can use that key instead.
 */

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::app_config::DataConfig;
use crate::language_utils::IdiomLanguage;

use super::tables::{IdiomRecord, IdiomTables};

/// Language-matched records sharing one row index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdiomTriplet {
    pub row_index: usize,
    pub entries: BTreeMap<IdiomLanguage, IdiomRecord>,
}

impl IdiomTriplet {
    /// Languages with a non-empty idiom, in canonical order
    pub fn present_languages(&self) -> Vec<IdiomLanguage> {
        self.entries
            .iter()
            .filter(|(_, record)| record.has_idiom())
            .map(|(language, _)| *language)
            .collect()
    }

    /// Record for a language, if present
    pub fn get(&self, language: IdiomLanguage) -> Option<&IdiomRecord> {
        self.entries.get(&language).filter(|record| record.has_idiom())
    }
}

/// A row index that could not form a usable triplet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentGap {
    pub row_index: usize,
    pub present: Vec<IdiomLanguage>,
}

/// Outcome of an alignment run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub triplets: Vec<IdiomTriplet>,
    pub gaps: Vec<AlignmentGap>,
}

/// How rows of different tables are matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentStrategy {
    /// Same row index in every table
    Positional,
    /// Same value in the shared key column
    Keyed,
}

/// Aligns per-language tables into triplets
#[derive(Debug, Clone)]
pub struct TripletAligner {
    strategy: AlignmentStrategy,
}

impl Default for TripletAligner {
    fn default() -> Self {
        Self::new(AlignmentStrategy::Positional)
    }
}

impl TripletAligner {
    pub fn new(strategy: AlignmentStrategy) -> Self {
        Self { strategy }
    }

    /// Keyed alignment when a key column is configured
    pub fn from_config(config: &DataConfig) -> Self {
        match config.key_column {
            Some(_) => Self::new(AlignmentStrategy::Keyed),
            None => Self::new(AlignmentStrategy::Positional),
        }
    }

    pub fn strategy(&self) -> AlignmentStrategy {
        self.strategy
    }

    /// Align the tables
    pub fn align(&self, tables: &IdiomTables) -> AlignmentReport {
        match self.strategy {
            AlignmentStrategy::Positional => align(tables),
            AlignmentStrategy::Keyed => align_by_key(tables),
        }
    }
}

/// Positional alignment by row index
///
/// Produces one candidate per row index present in any table. Candidates
/// with fewer than two present languages become gaps.
pub fn align(tables: &IdiomTables) -> AlignmentReport {
    let mut rows: BTreeMap<usize, BTreeMap<IdiomLanguage, IdiomRecord>> = BTreeMap::new();

    for (language, records) in tables {
        for record in records {
            rows.entry(record.row_index)
                .or_default()
                .insert(*language, record.clone());
        }
    }

    collect(rows)
}

/// Alignment on the shared key column
///
/// Keys are numbered in first-seen order, walking the tables in language
/// order; that number becomes the triplet's row index. Rows without a key
/// are ignored and a key repeated within one table keeps its first row.
pub fn align_by_key(tables: &IdiomTables) -> AlignmentReport {
    let mut key_order: HashMap<String, usize> = HashMap::new();
    let mut rows: BTreeMap<usize, BTreeMap<IdiomLanguage, IdiomRecord>> = BTreeMap::new();
    let mut unkeyed = 0usize;

    for (language, records) in tables {
        for record in records {
            let Some(key) = record.key.as_deref() else {
                unkeyed += 1;
                continue;
            };

            let next = key_order.len();
            let row_index = *key_order.entry(key.to_string()).or_insert(next);
            let entry = rows.entry(row_index).or_default();
            if entry.contains_key(language) {
                warn!("Duplicate key '{}' in {} table, keeping the first row", key, language);
                continue;
            }

            let mut aligned = record.clone();
            aligned.row_index = row_index;
            entry.insert(*language, aligned);
        }
    }

    if unkeyed > 0 {
        warn!("Ignored {} rows without a key", unkeyed);
    }

    collect(rows)
}

fn collect(rows: BTreeMap<usize, BTreeMap<IdiomLanguage, IdiomRecord>>) -> AlignmentReport {
    let mut report = AlignmentReport::default();

    for (row_index, entries) in rows {
        let triplet = IdiomTriplet { row_index, entries };
        let present = triplet.present_languages();
        if present.len() < 2 {
            report.gaps.push(AlignmentGap { row_index, present });
        } else {
            report.triplets.push(triplet);
        }
    }

    debug!(
        "Aligned {} triplets, {} gaps",
        report.triplets.len(),
        report.gaps.len()
    );
    report
}

impl AlignmentReport {
    /// Number of triplets per present-language combination
    pub fn coverage(&self) -> BTreeMap<String, usize> {
        let mut coverage = BTreeMap::new();
        for triplet in &self.triplets {
            let languages: BTreeSet<_> = triplet.present_languages().into_iter().collect();
            let label = languages
                .iter()
                .map(|l| l.code())
                .collect::<Vec<_>>()
                .join("+");
            *coverage.entry(label).or_insert(0) += 1;
        }
        coverage
    }
}
