/*!
 * Common test utilities for the contextbridge test suite
 */

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use contextbridge::app_config::Config;
use contextbridge::dataset::pairs::{self, PairMode, TranslationPair};
use contextbridge::dataset::tables::{records_from_rows, IdiomTables};
use contextbridge::dataset::aligner;
use contextbridge::inference::InferenceEngine;
use contextbridge::language_utils::IdiomLanguage;
use contextbridge::model::lora::AdapterSet;
use contextbridge::model::{load_base_model, AdapterCheckpoint, Tokenizer};

/// English, Hindi and Telugu idioms with their meanings, one row per idiom group
pub const IDIOM_ROWS: [[(&str, &str); 3]; 4] = [
    [
        ("break the ice", "start a conversation"),
        ("बर्फ तोड़ना", "बातचीत शुरू करना"),
        ("మొదటి అడుగు", "సంభాషణ ప్రారంభించడం"),
    ],
    [
        ("piece of cake", "very easy"),
        ("बाएं हाथ का खेल", "बहुत आसान"),
        ("నల్లేరు మీద నడక", "చాలా సులభం"),
    ],
    [
        ("actions speak louder than words", "deeds matter more"),
        ("करनी कथनी से बड़ी", "काम बातों से बड़ा"),
        ("మాటలు కాదు చేతలు", "పనులే ముఖ్యం"),
    ],
    [
        ("once in a blue moon", "very rarely"),
        ("ईद का चांद", "बहुत कम दिखना"),
        ("అమావాస్యకో పున్నానికో", "అరుదుగా"),
    ],
];

/// Creates a temporary directory for test files
pub fn create_temp_dir() -> Result<TempDir> {
    Ok(TempDir::new()?)
}

/// Creates a test file with the given content in the specified directory
pub fn create_test_file(dir: &Path, filename: &str, content: &str) -> Result<PathBuf> {
    let file_path = dir.join(filename);
    fs::write(&file_path, content)?;
    Ok(file_path)
}

fn language_index(language: IdiomLanguage) -> usize {
    match language {
        IdiomLanguage::English => 0,
        IdiomLanguage::Hindi => 1,
        IdiomLanguage::Telugu => 2,
    }
}

/// In-memory tables for the given languages
pub fn tables_for(languages: &[IdiomLanguage]) -> IdiomTables {
    languages
        .iter()
        .map(|&language| {
            let rows = IDIOM_ROWS.iter().map(|row| row[language_index(language)]);
            (language, records_from_rows(language, rows))
        })
        .collect()
}

pub fn all_tables() -> IdiomTables {
    tables_for(&IdiomLanguage::ALL)
}

/// Every non-augmented pair of the fixture
pub fn fixture_pairs() -> Vec<TranslationPair> {
    pairs::generate(&aligner::align(&all_tables()).triplets, PairMode::IdiomToIdiom)
}

/// Writes the fixture as the configured CSV tables and returns their directory
pub fn write_tables(config: &Config) -> Result<PathBuf> {
    let dataset_dir = config.data.dataset_dir.clone();
    fs::create_dir_all(&dataset_dir)?;

    for language in IdiomLanguage::ALL {
        let mut writer = csv::Writer::from_path(config.data.table_path(language))?;
        writer.write_record(["idiom", "meaning", "notes"])?;
        for row in IDIOM_ROWS.iter() {
            let (idiom, meaning) = row[language_index(language)];
            writer.write_record([idiom, meaning, ""])?;
        }
        writer.flush()?;
    }
    Ok(dataset_dir)
}

/// Routes library logs to the test harness; later calls are no-ops
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Small, fast configuration rooted in `dir`
pub fn test_config(dir: &Path) -> Config {
    init_logging();
    let mut config = Config::default();
    config.model.model_name = "test/reference-base".to_string();
    config.model.hidden_size = 16;
    config.model.max_length = 32;

    config.lora.r = 4;
    config.lora.lora_alpha = 8.0;
    config.lora.lora_dropout = 0.0;

    config.training.output_dir = dir.join("output");
    config.training.per_device_train_batch_size = 4;
    config.training.per_device_eval_batch_size = 8;
    config.training.gradient_accumulation_steps = 1;
    config.training.learning_rate = 0.02;
    config.training.warmup_steps = 0;
    config.training.num_train_epochs = 3;
    config.training.show_progress = false;
    config.training.early_stopping_patience = 0;

    config.data.dataset_dir = dir.join("Dataset");
    config.data.corpus_dir = dir.join("corpus");
    config.data.train_split = 0.5;
    config.data.val_split = 0.25;
    config.data.test_split = 0.25;

    config.inference.beam_width = 3;
    config.inference.max_length = 8;
    config
}

/// Ready engine over freshly injected (untrained) adapters
pub fn untrained_engine(config: &Config) -> Result<InferenceEngine> {
    let tokenizer = Arc::new(Tokenizer::from_pairs(&fixture_pairs()));
    let model = load_base_model(&config.model, &tokenizer)?;
    let adapters = AdapterSet::inject(model.as_ref(), &config.lora, config.training.seed)?;
    let checkpoint = AdapterCheckpoint::new(model.model_id(), model.hidden_size(), adapters, 0, None);
    Ok(InferenceEngine::from_parts(
        model,
        tokenizer,
        Arc::new(checkpoint),
        config.inference.clone(),
    )?)
}
