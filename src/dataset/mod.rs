/*!
 * Dataset preparation for idiom translation.
 *
 * - `normalizer`: text cleanup
 * - `tables`: per-language table loading
 * - `aligner`: cross-language triplets
 * - `pairs`: directed pair generation
 * - `augment`: sentence-template augmentation
 * - `splitter`: leakage-free splits
 * - `corpus`: the full chain and its persistence
 */

pub mod aligner;
pub mod augment;
pub mod corpus;
pub mod normalizer;
pub mod pairs;
pub mod splitter;
pub mod tables;

pub use aligner::{AlignmentGap, AlignmentReport, IdiomTriplet, TripletAligner};
pub use augment::{ContextAugmenter, ContextTemplate};
pub use corpus::{CorpusBuilder, CorpusStats, PreparedCorpus};
pub use normalizer::normalize;
pub use pairs::{PairMode, TranslationPair};
pub use splitter::{DatasetSplit, SplitDataset, SplitRatios};
pub use tables::{IdiomRecord, IdiomTables};
