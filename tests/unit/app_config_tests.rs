/*!
 * Tests for application configuration functionality
 */

use contextbridge::app_config::{Config, LogLevel};
use contextbridge::dataset::pairs::PairMode;

/// Test default configuration values
#[test]
fn test_default_config_withNoParameters_shouldHaveCorrectDefaults() {
    let config = Config::default();

    assert_eq!(config.model.model_name, "facebook/nllb-200-distilled-600M");
    assert_eq!(config.model.max_length, 256);

    assert_eq!(config.lora.r, 16);
    assert_eq!(config.lora.lora_alpha, 32.0);
    assert_eq!(config.lora.lora_dropout, 0.05);
    assert_eq!(config.lora.scaling(), 2.0);
    assert_eq!(
        config.lora.target_modules,
        vec!["q_proj", "v_proj", "k_proj", "o_proj", "fc1", "fc2"]
    );

    assert_eq!(config.training.per_device_train_batch_size, 12);
    assert_eq!(config.training.gradient_accumulation_steps, 4);
    assert_eq!(config.training.effective_batch_size(), 48);
    assert_eq!(config.training.learning_rate, 5e-4);
    assert_eq!(config.training.warmup_steps, 100);
    assert_eq!(config.training.num_train_epochs, 2);
    assert_eq!(config.training.save_total_limit, 2);
    assert!(config.training.use_mixed_precision);
    assert!(config.training.use_gradient_checkpointing);

    assert_eq!(config.data.pair_mode, PairMode::IdiomToIdiom);
    assert!(config.data.add_context_variations);
    assert_eq!(config.data.key_column, None);

    assert_eq!(config.inference.beam_width, 5);
    assert_eq!(config.inference.num_candidates, 1);
    assert_eq!(config.inference.no_repeat_ngram_size, 3);
    assert_eq!(config.inference.repetition_penalty, 1.2);

    assert_eq!(config.log_level, LogLevel::Info);
    assert!(config.validate().is_ok());
}

/// Test configuration validation
#[test]
fn test_config_validation_withVariousConfigs_shouldValidateCorrectly() {
    let mut config = Config::default();
    assert!(config.validate().is_ok());

    config.lora.r = 0;
    assert!(config.validate().is_err());
    config.lora.r = 16;

    config.lora.target_modules.push("lm_head".to_string());
    assert!(config.validate().is_err());
    config.lora.target_modules.pop();

    config.training.gradient_accumulation_steps = 0;
    assert!(config.validate().is_err());
    config.training.gradient_accumulation_steps = 4;

    config.data.train_split = 0.9;
    assert!(config.validate().is_err());
    config.data.train_split = 0.8;

    config.inference.num_candidates = 6;
    assert!(config.validate().is_err());
    config.inference.num_candidates = 1;

    assert!(config.validate().is_ok());
}

/// Test partial JSON falls back to defaults for missing fields
#[test]
fn test_config_fromPartialJson_shouldFillDefaults() {
    let json = r#"{
        "lora": { "r": 8 },
        "training": { "fp16": false, "num_train_epochs": 5 },
        "data": { "pair_mode": "idiom_to_meaning" },
        "log_level": "debug"
    }"#;
    let config: Config = serde_json::from_str(json).unwrap();

    assert_eq!(config.lora.r, 8);
    assert_eq!(config.lora.lora_alpha, 32.0);
    assert!(!config.training.use_mixed_precision);
    assert_eq!(config.training.num_train_epochs, 5);
    assert_eq!(config.data.pair_mode, PairMode::IdiomToMeaning);
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.inference.beam_width, 5);
}

/// Test a missing config file is created with defaults
#[test]
fn test_loadOrCreate_withMissingFile_shouldWriteDefaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf.json");

    let created = Config::load_or_create(&path).unwrap();
    assert!(path.exists());

    let reloaded = Config::from_file(&path).unwrap();
    assert_eq!(reloaded.lora.r, created.lora.r);
    assert_eq!(reloaded.training.output_dir, created.training.output_dir);
}

/// Test the served checkpoint follows the training output unless overridden
#[test]
fn test_checkpointDir_shouldDefaultToOutputDir() {
    let mut config = Config::default();
    assert_eq!(config.checkpoint_dir(), config.training.output_dir);

    config.inference.checkpoint_dir = Some("elsewhere".into());
    assert_eq!(config.checkpoint_dir(), std::path::PathBuf::from("elsewhere"));
}
