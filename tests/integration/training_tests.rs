/*!
 * Integration tests for adapter training, checkpointing and resumption
 */

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use contextbridge::app_config::Config;
use contextbridge::dataset::pairs::TranslationPair;
use contextbridge::dataset::splitter::SplitDataset;
use contextbridge::errors::TrainingError;
use contextbridge::model::{AdapterCheckpoint, Tokenizer};
use contextbridge::training::trainer::{list_checkpoints, TRAINER_STATE_FILE};
use contextbridge::training::AdapterTrainer;

use crate::common;

/// Every fixture pair in train, validated on the same pairs
fn memorization_set() -> SplitDataset {
    let pairs = common::fixture_pairs();
    SplitDataset {
        train: pairs.clone(),
        validation: pairs,
        test: Vec::new(),
    }
}

fn trainer(config: &Config, dataset: &SplitDataset) -> Result<AdapterTrainer> {
    let tokenizer = Arc::new(Tokenizer::from_pairs(dataset.all_pairs()));
    Ok(AdapterTrainer::from_config(config, tokenizer)?)
}

fn config_in(dir: &Path) -> Config {
    let mut config = common::test_config(dir);
    config.training.use_mixed_precision = false;
    config
}

/// Test training lowers the validation loss below its initial value
#[test]
fn test_train_onMemorizationSet_shouldLowerValidationLoss() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.num_train_epochs = 8;

    let dataset = memorization_set();
    let outcome = trainer(&config, &dataset)?.train(&dataset)?;
    let state = &outcome.state;

    let initial = state.initial_validation_loss.unwrap();
    let best = state.best_validation_loss.unwrap();
    assert!(best < initial, "best {} should be below initial {}", best, initial);
    assert_eq!(state.global_step, 8 * 6);
    assert_eq!(state.skipped_pairs, 0);
    assert!(!state.stopped_early);
    assert_eq!(outcome.checkpoint.validation_loss, Some(best));

    // The best model sits at the root of the output directory
    assert!(AdapterCheckpoint::exists(&outcome.output_dir));
    assert!(outcome.output_dir.join(TRAINER_STATE_FILE).is_file());
    assert_eq!(Tokenizer::load(&outcome.output_dir)?, Tokenizer::from_pairs(dataset.all_pairs()));
    Ok(())
}

/// Test a step that does not fit into the memory budget fails with a remedy
#[test]
fn test_train_withTinyMemoryLimit_shouldReturnResourceExhausted() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.memory_limit_mb = Some(0);

    let dataset = memorization_set();
    let result = trainer(&config, &dataset)?.train(&dataset);

    match result {
        Err(TrainingError::ResourceExhausted { limit_mb, batch_size, .. }) => {
            assert_eq!(limit_mb, 0);
            assert_eq!(batch_size, 4);
        }
        other => panic!("expected ResourceExhausted, got {:?}", other.map(|o| o.state.global_step)),
    }
    Ok(())
}

/// Test malformed pairs are skipped and counted
#[test]
fn test_train_withMalformedPair_shouldSkipAndCount() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.num_train_epochs = 1;

    let mut dataset = memorization_set();
    let mut malformed: TranslationPair = dataset.train[0].clone();
    malformed.source_text = "   ".to_string();
    dataset.train.push(malformed);

    let outcome = trainer(&config, &dataset)?.train(&dataset)?;
    assert_eq!(outcome.state.skipped_pairs, 1);
    assert!(outcome.state.global_step > 0);
    Ok(())
}

/// Test a split with nothing usable is rejected
#[test]
fn test_train_withOnlyMalformedPairs_shouldFail() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = config_in(temp_dir.path());

    let mut dataset = memorization_set();
    for pair in dataset.train.iter_mut() {
        pair.target_text.clear();
    }

    let result = trainer(&config, &dataset)?.train(&dataset);
    assert!(matches!(
        result,
        Err(TrainingError::EmptyTrainingSplit { skipped }) if skipped == 24
    ));
    Ok(())
}

/// Test a run continues from an intermediate checkpoint
#[test]
fn test_resume_fromStepCheckpoint_shouldContinueSameRun() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.max_steps = Some(2);
    config.training.eval_steps = Some(1);
    config.training.save_total_limit = 0;

    let dataset = memorization_set();
    let first = trainer(&config, &dataset)?.train(&dataset)?;
    assert_eq!(first.state.global_step, 2);

    let checkpoints = list_checkpoints(&first.output_dir)?;
    let (step, latest) = checkpoints.last().cloned().unwrap();
    assert!(step >= 1);

    config.training.max_steps = Some(4);
    let resumed = trainer(&config, &dataset)?.resume(&dataset, &latest)?;
    assert_eq!(resumed.state.global_step, 4);
    assert_eq!(resumed.state.run_id, first.state.run_id);
    assert_eq!(resumed.state.initial_validation_loss, first.state.initial_validation_loss);
    assert!(resumed.state.loss_history.len() >= 4 - step);
    Ok(())
}

/// Test resuming with another vocabulary is refused
#[test]
fn test_resume_withDifferentVocabulary_shouldFail() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.max_steps = Some(1);

    let dataset = memorization_set();
    let first = trainer(&config, &dataset)?.train(&dataset)?;

    let mut other = dataset.clone();
    other.train.truncate(6);
    other.validation.truncate(6);
    let result = trainer(&config, &other)?.resume(&other, &first.output_dir);
    assert!(result.is_err());
    Ok(())
}

/// Test only `save_total_limit` step checkpoints are kept
#[test]
fn test_train_withSaveLimit_shouldPruneOldCheckpoints() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.max_steps = Some(6);
    config.training.eval_steps = Some(1);
    config.training.save_total_limit = 1;

    let dataset = memorization_set();
    let outcome = trainer(&config, &dataset)?.train(&dataset)?;

    let checkpoints = list_checkpoints(&outcome.output_dir)?;
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(outcome.state.best_checkpoint.as_deref(), Some(checkpoints[0].1.as_path()));
    Ok(())
}

/// Test a fresh run into a used output directory replaces the earlier run's checkpoints
#[test]
fn test_train_inReusedOutputDir_shouldKeepOnlyNewRunCheckpoints() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.max_steps = Some(12);
    config.training.eval_steps = Some(1);
    config.training.save_total_limit = 2;
    config.training.early_stopping_patience = 0;

    let dataset = memorization_set();
    let first = trainer(&config, &dataset)?.train(&dataset)?;
    assert!(list_checkpoints(&first.output_dir)?.iter().any(|(step, _)| *step > 4));

    config.training.max_steps = Some(4);
    let second = trainer(&config, &dataset)?.train(&dataset)?;
    assert_ne!(second.state.run_id, first.state.run_id);

    let checkpoints = list_checkpoints(&second.output_dir)?;
    assert!(!checkpoints.is_empty());
    assert!(checkpoints.len() <= 2);
    for (step, dir) in &checkpoints {
        assert!(*step <= 4, "stale checkpoint at step {}", step);
        let state: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(dir.join(TRAINER_STATE_FILE))?)?;
        assert_eq!(state["run_id"], second.state.run_id.as_str());
    }
    Ok(())
}

/// Test training stops once validation stops improving
#[test]
fn test_train_withPatience_shouldStopEarly() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = config_in(temp_dir.path());
    config.training.num_train_epochs = 5;
    config.training.early_stopping_patience = 1;
    // No later evaluation can beat the first by this much
    config.training.early_stopping_threshold = 1e6;

    let dataset = memorization_set();
    let outcome = trainer(&config, &dataset)?.train(&dataset)?;

    assert!(outcome.state.stopped_early);
    assert_eq!(outcome.state.eval_history.len(), 2);
    assert_eq!(outcome.state.global_step, 2 * 6);
    Ok(())
}
