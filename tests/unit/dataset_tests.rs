/*!
 * Tests for corpus construction: normalization, alignment, pairs,
 * augmentation and splitting
 */

use std::collections::BTreeSet;

use contextbridge::app_config::DataConfig;
use contextbridge::dataset::aligner::{self, AlignmentStrategy, TripletAligner};
use contextbridge::dataset::augment::{default_templates, ContextAugmenter};
use contextbridge::dataset::normalizer::normalize;
use contextbridge::dataset::pairs::{self, PairMode, TranslationPair};
use contextbridge::dataset::splitter::{self, DatasetSplit, SplitRatios};
use contextbridge::dataset::tables::{records_from_rows, IdiomRecord, IdiomTables};
use contextbridge::dataset::CorpusBuilder;
use contextbridge::language_utils::{detect_script, IdiomLanguage};

use crate::common;

fn synthetic_pairs(groups: usize) -> Vec<TranslationPair> {
    let tables: IdiomTables = IdiomLanguage::ALL
        .into_iter()
        .map(|language| {
            let rows: Vec<(String, String)> = (0..groups)
                .map(|i| (format!("{} idiom {}", language.code(), i), format!("meaning {}", i)))
                .collect();
            (language, records_from_rows(language, rows))
        })
        .collect();
    pairs::generate(&aligner::align(&tables).triplets, PairMode::IdiomToIdiom)
}

/// Test normalization is idempotent on messy input
#[test]
fn test_normalize_appliedTwice_shouldMatchSingleApplication() {
    let samples = [
        "\u{FEFF}  break the   ice ",
        "बाएं\u{00A0}हाथ  का\u{200B} खेल",
        "\tమొదటి\n\nఅడుగు ",
        "",
    ];

    for sample in samples {
        let once = normalize(sample);
        assert_eq!(normalize(&once), once);
        assert_eq!(once.trim(), once);
        assert!(!once.contains("  "));
    }
}

/// Test the single-row three-language example
#[test]
fn test_generate_withOneFullTriplet_shouldProduceSixDirections() {
    let tables = common::all_tables();
    let report = aligner::align(&tables);
    let first = &report.triplets[..1];

    let pairs = pairs::generate(first, PairMode::IdiomToIdiom);
    assert_eq!(pairs.len(), 6);

    let directions: BTreeSet<String> = pairs.iter().map(|p| p.direction()).collect();
    assert_eq!(directions.len(), 6);

    let en_te = pairs.iter().find(|p| p.direction() == "en->te").unwrap();
    assert_eq!(en_te.source_text, "break the ice");
    assert_eq!(en_te.target_text, "మొదటి అడుగు");
    assert!(!en_te.is_augmented);
}

/// Test a triplet missing Telugu yields only the en/hi directions
#[test]
fn test_generate_withMissingLanguage_shouldSkipItsDirections() {
    let mut tables = common::tables_for(&[IdiomLanguage::English, IdiomLanguage::Hindi]);
    tables.insert(
        IdiomLanguage::Telugu,
        records_from_rows(IdiomLanguage::Telugu, [("   ", "")]),
    );

    let report = aligner::align(&tables);
    let first = report.triplets.iter().find(|t| t.row_index == 0).unwrap();
    let pairs = pairs::generate(std::slice::from_ref(first), PairMode::IdiomToIdiom);

    let directions: Vec<String> = pairs.iter().map(|p| p.direction()).collect();
    assert_eq!(directions, vec!["en->hi", "hi->en"]);
    assert!(pairs.iter().all(|p| p.is_well_formed()));
}

/// Test every group yields n(n-1) pairs for its n present languages
#[test]
fn test_generate_countPerGroup_shouldBeOrderedPairsOfPresentLanguages() {
    let mut tables = common::all_tables();
    // drop the Telugu idiom of the last row
    if let Some(records) = tables.get_mut(&IdiomLanguage::Telugu) {
        records.pop();
    }

    let report = aligner::align(&tables);
    let pairs = pairs::generate(&report.triplets, PairMode::IdiomToIdiom);

    for triplet in &report.triplets {
        let n = triplet.present_languages().len();
        let count = pairs.iter().filter(|p| p.base_row_index == triplet.row_index).count();
        assert_eq!(count, n * (n - 1), "row {}", triplet.row_index);
    }
    assert_eq!(pairs.len(), 3 * 6 + 2);
}

/// Test rows present in a single table are reported as gaps
#[test]
fn test_align_withSingleLanguageRow_shouldReportGap() {
    let mut tables = common::all_tables();
    if let Some(records) = tables.get_mut(&IdiomLanguage::English) {
        records.push(IdiomRecord::new(IdiomLanguage::English, "hit the sack", "go to sleep", 4));
    }

    let report = aligner::align(&tables);
    assert_eq!(report.triplets.len(), 4);
    assert_eq!(report.gaps.len(), 1);
    assert_eq!(report.gaps[0].row_index, 4);
    assert_eq!(report.gaps[0].present, vec![IdiomLanguage::English]);
}

/// Test keyed alignment pairs rows regardless of position
#[test]
fn test_alignByKey_withShuffledRows_shouldMatchOnKey() {
    let mut tables = IdiomTables::new();
    tables.insert(
        IdiomLanguage::English,
        vec![
            IdiomRecord::new(IdiomLanguage::English, "break the ice", "", 0).with_key("ice"),
            IdiomRecord::new(IdiomLanguage::English, "piece of cake", "", 1).with_key("cake"),
        ],
    );
    tables.insert(
        IdiomLanguage::Hindi,
        vec![
            IdiomRecord::new(IdiomLanguage::Hindi, "बाएं हाथ का खेल", "", 0).with_key("cake"),
            IdiomRecord::new(IdiomLanguage::Hindi, "बर्फ तोड़ना", "", 1).with_key("ice"),
        ],
    );

    let aligner = TripletAligner::new(AlignmentStrategy::Keyed);
    let report = aligner.align(&tables);
    assert_eq!(report.triplets.len(), 2);

    let pairs = pairs::generate(&report.triplets, PairMode::IdiomToIdiom);
    let en_hi: Vec<(&str, &str)> = pairs
        .iter()
        .filter(|p| p.direction() == "en->hi")
        .map(|p| (p.source_text.as_str(), p.target_text.as_str()))
        .collect();
    assert!(en_hi.contains(&("break the ice", "बर्फ तोड़ना")));
    assert!(en_hi.contains(&("piece of cake", "बाएं हाथ का खेल")));
}

/// Test meaning mode targets the paraphrase instead of the idiom
#[test]
fn test_generate_inMeaningMode_shouldTargetMeaning() {
    let report = aligner::align(&common::all_tables());
    let pairs = pairs::generate(&report.triplets[..1], PairMode::IdiomToMeaning);

    let en_hi = pairs.iter().find(|p| p.direction() == "en->hi").unwrap();
    assert_eq!(en_hi.source_text, "break the ice");
    assert_eq!(en_hi.target_text, "बातचीत शुरू करना");
}

/// Test augmented pairs keep both sides in their own script and group
#[test]
fn test_augment_shouldEmbedIdiomsWithoutMixingScripts() {
    let base = common::fixture_pairs();
    let augmenter = ContextAugmenter::new(default_templates(), PairMode::IdiomToIdiom);
    let all = augmenter.augment_all(&base);

    assert_eq!(all.len(), base.len() * (1 + default_templates().len()));

    for pair in all.iter().filter(|p| p.is_augmented) {
        assert_eq!(detect_script(&pair.source_text), pair.source_lang.script());
        assert_eq!(detect_script(&pair.target_text), pair.target_lang.script());
        assert!(base.iter().any(|b| b.base_row_index == pair.base_row_index
            && pair.source_text.contains(&b.source_text)));
    }

    // Augmenting an augmented pair is a no-op
    let augmented = all.iter().find(|p| p.is_augmented).unwrap();
    assert!(augmenter.augment(augmented).is_empty());
}

/// Test the 100-group split proportions and reproducibility
#[test]
fn test_split_withHundredGroups_shouldBeEightyTenTenAndReproducible() {
    let pairs = synthetic_pairs(100);
    assert_eq!(pairs.len(), 600);

    let ratios = SplitRatios::default();
    let first = splitter::split(&pairs, &ratios, 42).unwrap();
    let second = splitter::split(&pairs, &ratios, 42).unwrap();

    assert_eq!(first.row_indices(DatasetSplit::Train).len(), 80);
    assert_eq!(first.row_indices(DatasetSplit::Validation).len(), 10);
    assert_eq!(first.row_indices(DatasetSplit::Test).len(), 10);
    assert_eq!(first.len(), pairs.len());

    assert_eq!(first, second);
    assert_eq!(first.fingerprint(), second.fingerprint());
}

/// Test no idiom group appears in two splits
#[test]
fn test_split_withAugmentedCorpus_shouldNotLeakGroups() {
    let base = synthetic_pairs(30);
    let augmented = ContextAugmenter::new(default_templates(), PairMode::IdiomToIdiom).augment_all(&base);
    let dataset = splitter::split(&augmented, &SplitRatios::default(), 7).unwrap();

    let train = dataset.row_indices(DatasetSplit::Train);
    let validation = dataset.row_indices(DatasetSplit::Validation);
    let test = dataset.row_indices(DatasetSplit::Test);

    assert!(train.is_disjoint(&validation));
    assert!(train.is_disjoint(&test));
    assert!(validation.is_disjoint(&test));
    assert_eq!(train.len() + validation.len() + test.len(), 30);
}

/// Test the builder drops malformed pairs and reports stats
#[test]
fn test_corpusBuilder_withFixtureTables_shouldReportStats() {
    let mut config = DataConfig::default();
    config.add_context_variations = false;
    config.train_split = 0.5;
    config.val_split = 0.25;
    config.test_split = 0.25;

    let corpus = CorpusBuilder::new(&config, 42).build(&common::all_tables()).unwrap();

    assert_eq!(corpus.stats.num_triplets, 4);
    assert_eq!(corpus.stats.num_gaps, 0);
    assert_eq!(corpus.stats.base_pairs, 24);
    assert_eq!(corpus.stats.augmented_pairs, 0);
    assert_eq!(corpus.stats.directions.len(), 6);
    assert_eq!(corpus.dataset.train.len(), 12);
    assert_eq!(corpus.stats.fingerprint, corpus.dataset.fingerprint());
}
