/*!
 * Corpus preparation.
 *
 * Runs the preprocessing chain (normalize, align, generate, augment, split)
 * and persists the resulting splits as JSON lines next to a statistics file.
 */

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::app_config::DataConfig;

use super::aligner::{AlignmentGap, TripletAligner};
use super::augment::ContextAugmenter;
use super::pairs::{self, PairMode, TranslationPair};
use super::splitter::{self, DatasetSplit, SplitDataset, SplitRatios};
use super::tables::{self, IdiomTables};

/// File holding the corpus statistics
pub const STATS_FILE: &str = "corpus_stats.json";

/// Summary of a prepared corpus
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub pair_mode: PairMode,
    pub num_triplets: usize,
    pub num_gaps: usize,
    pub base_pairs: usize,
    pub augmented_pairs: usize,
    pub split_sizes: BTreeMap<String, usize>,
    pub directions: BTreeMap<String, usize>,
    pub fingerprint: String,
}

/// Splits plus the bookkeeping of how they were built
#[derive(Debug, Clone, Default)]
pub struct PreparedCorpus {
    pub dataset: SplitDataset,
    pub gaps: Vec<AlignmentGap>,
    pub stats: CorpusStats,
}

/// Builds the training corpus from idiom tables
#[derive(Debug, Clone)]
pub struct CorpusBuilder {
    aligner: TripletAligner,
    mode: PairMode,
    augmenter: Option<ContextAugmenter>,
    ratios: SplitRatios,
    seed: u64,
}

impl CorpusBuilder {
    /// Builder with the given split seed
    pub fn new(config: &DataConfig, seed: u64) -> Self {
        let augmenter = config
            .add_context_variations
            .then(|| ContextAugmenter::new(config.context_templates.clone(), config.pair_mode));

        Self {
            aligner: TripletAligner::from_config(config),
            mode: config.pair_mode,
            augmenter,
            ratios: config.ratios(),
            seed,
        }
    }

    /// Load the configured tables and build the corpus
    pub fn build_from_config(config: &DataConfig, seed: u64) -> Result<PreparedCorpus> {
        let tables = tables::load_tables(config)?;
        Self::new(config, seed).build(&tables)
    }

    /// Build the corpus from in-memory tables
    pub fn build(&self, tables: &IdiomTables) -> Result<PreparedCorpus> {
        let report = self.aligner.align(tables);
        if !report.gaps.is_empty() {
            warn!(
                "{} rows are present in fewer than two languages and were skipped",
                report.gaps.len()
            );
        }

        let base: Vec<TranslationPair> = pairs::generate(&report.triplets, self.mode)
            .into_iter()
            .filter(|pair| pair.is_well_formed())
            .collect();
        let all = match &self.augmenter {
            Some(augmenter) => augmenter.augment_all(&base),
            None => base.clone(),
        };

        let dataset = splitter::split(&all, &self.ratios, self.seed)?;
        let stats = compute_stats(self.mode, report.triplets.len(), report.gaps.len(), &dataset);

        info!(
            "Prepared corpus: {} triplets, {} pairs ({} augmented), train/validation/test = {}/{}/{}",
            stats.num_triplets,
            dataset.len(),
            stats.augmented_pairs,
            dataset.train.len(),
            dataset.validation.len(),
            dataset.test.len()
        );

        Ok(PreparedCorpus {
            dataset,
            gaps: report.gaps,
            stats,
        })
    }
}

fn compute_stats(mode: PairMode, num_triplets: usize, num_gaps: usize, dataset: &SplitDataset) -> CorpusStats {
    let mut stats = CorpusStats {
        pair_mode: mode,
        num_triplets,
        num_gaps,
        fingerprint: dataset.fingerprint(),
        ..Default::default()
    };

    for split in DatasetSplit::ALL {
        let pairs = dataset.get(split);
        stats.split_sizes.insert(split.name().to_string(), pairs.len());
        for pair in pairs {
            if pair.is_augmented {
                stats.augmented_pairs += 1;
            } else {
                stats.base_pairs += 1;
            }
            *stats.directions.entry(pair.direction()).or_insert(0) += 1;
        }
    }

    stats
}

impl PreparedCorpus {
    /// Write the splits and statistics into a directory
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).context(format!("Failed to create corpus directory: {}", dir.display()))?;

        for split in DatasetSplit::ALL {
            write_jsonl(dir.join(format!("{}.jsonl", split.name())), self.dataset.get(split))?;
        }

        let stats = serde_json::to_string_pretty(&self.stats).context("Failed to serialize corpus stats")?;
        fs::write(dir.join(STATS_FILE), stats)
            .context(format!("Failed to write {}", dir.join(STATS_FILE).display()))?;

        info!("Corpus saved to {}", dir.display());
        Ok(())
    }

    /// Load a corpus written by `save`
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let dataset = SplitDataset {
            train: read_jsonl(dir.join("train.jsonl"))?,
            validation: read_jsonl(dir.join("validation.jsonl"))?,
            test: read_jsonl(dir.join("test.jsonl"))?,
        };

        let stats_path = dir.join(STATS_FILE);
        let stats = match fs::read_to_string(&stats_path) {
            Ok(content) => serde_json::from_str(&content)
                .context(format!("Failed to parse {}", stats_path.display()))?,
            Err(_) => {
                warn!("No {} in {}, recomputing", STATS_FILE, dir.display());
                compute_stats(PairMode::default(), 0, 0, &dataset)
            }
        };

        Ok(Self {
            dataset,
            gaps: Vec::new(),
            stats,
        })
    }
}

/// Write pairs as one JSON object per line
pub fn write_jsonl<P: AsRef<Path>>(path: P, pairs: &[TranslationPair]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).context(format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for pair in pairs {
        serde_json::to_writer(&mut writer, pair).context("Failed to serialize pair")?;
        writer.write_all(b"\n")?;
    }
    writer.flush().context(format!("Failed to write {}", path.display()))
}

/// Read pairs written by `write_jsonl`, skipping blank lines
pub fn read_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<TranslationPair>> {
    let path = path.as_ref();
    let file = File::open(path).context(format!("Failed to open {}", path.display()))?;
    let mut pairs = Vec::new();

    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line.context(format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let pair = serde_json::from_str(&line)
            .context(format!("Invalid pair on line {} of {}", number + 1, path.display()))?;
        pairs.push(pair);
    }

    Ok(pairs)
}
