/*!
 * Integration tests from idiom tables on disk to a persisted corpus
 */

use anyhow::Result;

use contextbridge::app_controller::Controller;
use contextbridge::dataset::corpus::PreparedCorpus;
use contextbridge::dataset::splitter::DatasetSplit;
use contextbridge::dataset::tables;
use contextbridge::file_utils::{FileManager, FileType};
use contextbridge::language_utils::IdiomLanguage;

use crate::common;

/// Test preparing from CSV tables writes every split and the stats
#[test]
fn test_prepare_fromCsvTables_shouldPersistCorpus() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    common::write_tables(&config)?;

    let controller = Controller::with_config(config.clone())?;
    let corpus = controller.prepare()?;

    assert_eq!(corpus.stats.num_triplets, 4);
    assert_eq!(corpus.stats.base_pairs, 24);
    assert_eq!(corpus.stats.augmented_pairs, 24 * config.data.context_templates.len());
    assert!(corpus.gaps.is_empty());

    for split in DatasetSplit::ALL {
        assert!(config.data.corpus_dir.join(format!("{}.jsonl", split.name())).is_file());
    }
    assert_eq!(FileManager::detect_file_type(&config.data.corpus_dir)?, FileType::Corpus);

    let loaded = PreparedCorpus::load(&config.data.corpus_dir)?;
    assert_eq!(loaded.dataset, corpus.dataset);
    assert_eq!(loaded.stats, corpus.stats);
    Ok(())
}

/// Test an existing corpus is reused instead of rebuilt
#[test]
fn test_loadOrPrepare_withExistingCorpus_shouldReuseIt() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    common::write_tables(&config)?;

    let controller = Controller::with_config(config.clone())?;
    let prepared = controller.prepare()?;

    // Removing the tables proves the second call reads the corpus directory
    std::fs::remove_dir_all(&config.data.dataset_dir)?;
    let reused = controller.load_or_prepare()?;
    assert_eq!(reused.stats.fingerprint, prepared.stats.fingerprint);
    Ok(())
}

/// Test the same tables and seed always give the same split
#[test]
fn test_prepare_twice_shouldProduceIdenticalFingerprint() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    common::write_tables(&config)?;

    let controller = Controller::with_config(config)?;
    let first = controller.prepare()?;
    let second = controller.prepare()?;
    assert_eq!(first.stats.fingerprint, second.stats.fingerprint);
    assert_eq!(first.dataset, second.dataset);
    Ok(())
}

/// Test a missing language table drops only that language
#[test]
fn test_prepare_withoutTeluguTable_shouldKeepEnglishHindiPairs() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = common::test_config(temp_dir.path());
    config.data.add_context_variations = false;
    common::write_tables(&config)?;
    std::fs::remove_file(config.data.table_path(IdiomLanguage::Telugu))?;

    let corpus = Controller::with_config(config)?.prepare()?;
    assert_eq!(corpus.stats.base_pairs, 8);
    assert_eq!(
        corpus.stats.directions.keys().cloned().collect::<Vec<_>>(),
        vec!["en->hi".to_string(), "hi->en".to_string()]
    );
    Ok(())
}

/// Test tables with a byte-order mark and spreadsheet noise load cleanly
#[test]
fn test_loadTable_withBomAndRaggedWhitespace_shouldNormalize() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let path = common::create_test_file(
        temp_dir.path(),
        "English.csv",
        "\u{FEFF}Idiom,Meaning,Telugu\n\"  break   the ice \",start a conversation,మొదటి అడుగు\n",
    )?;

    let records = tables::load_table(&path, IdiomLanguage::English, &tables::TableColumns::default())?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].idiom_text, "break the ice");
    assert_eq!(records[0].meaning_text, "start a conversation");
    Ok(())
}

/// Test preparing without any table fails
#[test]
fn test_prepare_withNoTables_shouldFail() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());

    let result = Controller::with_config(config)?.prepare();
    assert!(result.is_err());
    Ok(())
}
