/*!
 * Leakage-free train/validation/test splitting.
 *
 * Every pair derived from one base row (both directions, every augmented
 * variant) lands in the same split, so no idiom seen in training shows up
 * in evaluation.
 */

use anyhow::{anyhow, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::pairs::TranslationPair;

/// Split a base row is assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetSplit {
    Train,
    Validation,
    Test,
}

impl DatasetSplit {
    pub const ALL: [DatasetSplit; 3] = [Self::Train, Self::Validation, Self::Test];

    /// File stem used when the split is persisted
    pub fn name(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for DatasetSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Target share of pairs per split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub validation: f64,
    pub test: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.8,
            validation: 0.1,
            test: 0.1,
        }
    }
}

impl SplitRatios {
    const TOLERANCE: f64 = 1e-6;

    /// Ratios must be non-negative and sum to one
    pub fn validate(&self) -> Result<()> {
        let ratios = [self.train, self.validation, self.test];
        if ratios.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(anyhow!("ratios must be non-negative, got {:?}", ratios));
        }
        let sum: f64 = ratios.iter().sum();
        if (sum - 1.0).abs() > Self::TOLERANCE {
            return Err(anyhow!("ratios must sum to 1, got {}", sum));
        }
        Ok(())
    }

    fn get(&self, split: DatasetSplit) -> f64 {
        match split {
            DatasetSplit::Train => self.train,
            DatasetSplit::Validation => self.validation,
            DatasetSplit::Test => self.test,
        }
    }
}

/// Pairs partitioned into the three splits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitDataset {
    pub train: Vec<TranslationPair>,
    pub validation: Vec<TranslationPair>,
    pub test: Vec<TranslationPair>,
}

impl SplitDataset {
    pub fn get(&self, split: DatasetSplit) -> &[TranslationPair] {
        match split {
            DatasetSplit::Train => &self.train,
            DatasetSplit::Validation => &self.validation,
            DatasetSplit::Test => &self.test,
        }
    }

    fn get_mut(&mut self, split: DatasetSplit) -> &mut Vec<TranslationPair> {
        match split {
            DatasetSplit::Train => &mut self.train,
            DatasetSplit::Validation => &mut self.validation,
            DatasetSplit::Test => &mut self.test,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every pair, train first
    pub fn all_pairs(&self) -> impl Iterator<Item = &TranslationPair> {
        self.train.iter().chain(&self.validation).chain(&self.test)
    }

    /// Split of every base row
    pub fn assignment(&self) -> BTreeMap<usize, DatasetSplit> {
        let mut assignment = BTreeMap::new();
        for split in DatasetSplit::ALL {
            for pair in self.get(split) {
                assignment.insert(pair.base_row_index, split);
            }
        }
        assignment
    }

    /// Base rows of one split
    pub fn row_indices(&self, split: DatasetSplit) -> BTreeSet<usize> {
        self.get(split).iter().map(|p| p.base_row_index).collect()
    }

    /// SHA-256 over the row assignment, hex encoded
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (row_index, split) in self.assignment() {
            hasher.update(format!("{}:{}\n", row_index, split).as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }
}

/// Partition pairs by base row
///
/// Row indices are shuffled with `seed`; groups are then handed to train
/// until it holds its share of the pairs, then to validation, and the
/// remainder goes to test. A group is never broken.
pub fn split(pairs: &[TranslationPair], ratios: &SplitRatios, seed: u64) -> Result<SplitDataset> {
    ratios.validate()?;

    let mut groups: BTreeMap<usize, usize> = BTreeMap::new();
    for pair in pairs {
        *groups.entry(pair.base_row_index).or_insert(0) += 1;
    }

    let mut order: Vec<usize> = groups.keys().copied().collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let total = pairs.len() as f64;
    let mut counts = [0usize; 3];
    let mut current = 0usize;
    let mut assignment: BTreeMap<usize, DatasetSplit> = BTreeMap::new();

    for row_index in order {
        while current < 2 {
            let target = ratios.get(DatasetSplit::ALL[current]) * total;
            if counts[current] as f64 + 1e-9 >= target {
                current += 1;
            } else {
                break;
            }
        }
        counts[current] += groups[&row_index];
        assignment.insert(row_index, DatasetSplit::ALL[current]);
    }

    let mut dataset = SplitDataset::default();
    for pair in pairs {
        if let Some(split) = assignment.get(&pair.base_row_index) {
            dataset.get_mut(*split).push(pair.clone());
        }
    }

    Ok(dataset)
}
