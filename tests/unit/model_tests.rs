/*!
 * Tests for the tokenizer, adapters, checkpoints and the reference model
 */

use anyhow::Result;

use contextbridge::app_config::{LoraConfig, ModelConfig};
use contextbridge::language_utils::{IdiomLanguage, Script};
use candle_core::{Device, Tensor};
use contextbridge::model::tokenizer::{DECODER_START_ID, EOS_ID, UNK_ID};
use contextbridge::model::{load_base_model, AdapterCheckpoint, AdapterSet, BaseModel, StepOptions, Tokenizer};

use crate::common;

fn lora_config() -> LoraConfig {
    LoraConfig {
        r: 4,
        lora_alpha: 8.0,
        lora_dropout: 0.0,
        ..LoraConfig::default()
    }
}

fn model_config() -> ModelConfig {
    ModelConfig {
        model_name: "test/reference-base".to_string(),
        hidden_size: 16,
        ..ModelConfig::default()
    }
}

fn setup() -> (Tokenizer, std::sync::Arc<dyn BaseModel>) {
    let tokenizer = Tokenizer::from_pairs(&common::fixture_pairs());
    let model = load_base_model(&model_config(), &tokenizer).unwrap();
    (tokenizer, model)
}

fn nonzero_b(adapters: &AdapterSet) -> Result<()> {
    for weights in adapters.layers.values() {
        let (rows, cols) = weights.lora_b.dims2()?;
        let values: Vec<f32> = (0..rows * cols)
            .map(|i| 0.03 * ((3 * (i / cols) + i % cols) % 7) as f32 - 0.09)
            .collect();
        weights.lora_b.set(&Tensor::from_vec(values, (rows, cols), &Device::Cpu)?)?;
    }
    Ok(())
}

/// Test encoding and decoding known text
#[test]
fn test_tokenizer_encodeDecode_shouldRecoverNormalizedText() {
    let (tokenizer, _) = setup();

    let ids = tokenizer.encode("  Break the ICE ", IdiomLanguage::English, 32);
    assert_eq!(ids[0], tokenizer.language_token(IdiomLanguage::English));
    assert_eq!(*ids.last().unwrap(), EOS_ID);
    assert_eq!(tokenizer.content_len(&ids), 3);
    assert_eq!(tokenizer.decode(&ids), "break the ice");

    let telugu = tokenizer.encode("మొదటి అడుగు", IdiomLanguage::Telugu, 32);
    assert_eq!(tokenizer.decode(&telugu), "మొదటి అడుగు");
}

/// Test unknown words map to the unknown token and carry no content
#[test]
fn test_tokenizer_withUnknownWords_shouldUseUnkToken() {
    let (tokenizer, _) = setup();

    let ids = tokenizer.encode("zebra crossing", IdiomLanguage::English, 32);
    assert_eq!(&ids[1..3], &[UNK_ID, UNK_ID]);
    assert_eq!(tokenizer.content_len(&ids), 0);
    assert_eq!(tokenizer.decode(&ids), "");
}

/// Test language tokens and piece scripts
#[test]
fn test_tokenizer_languageTokens_shouldBeSpecialAndDistinct() {
    let (tokenizer, _) = setup();

    let tokens: Vec<u32> = IdiomLanguage::ALL.iter().map(|l| tokenizer.language_token(*l)).collect();
    assert_eq!(tokens.len(), 3);
    assert!(tokens.iter().all(|t| tokenizer.is_special(*t)));
    assert_ne!(tokens[0], tokens[1]);
    assert_eq!(tokenizer.language_of_token(tokens[2]), Some(IdiomLanguage::Telugu));
    assert_eq!(tokenizer.piece(tokens[1]), Some("hin_Deva"));

    assert_eq!(tokenizer.script(tokenizer.token_id("ice")), Some(Script::Latin));
    assert_eq!(tokenizer.script(tokenizer.token_id("అడుగు")), Some(Script::Telugu));
}

/// Test the same corpus always yields the same vocabulary
#[test]
fn test_tokenizer_saveLoad_shouldRoundTrip() -> Result<()> {
    let (tokenizer, _) = setup();
    let rebuilt = Tokenizer::from_pairs(common::fixture_pairs().iter().rev());
    assert_eq!(tokenizer, rebuilt);

    let temp_dir = common::create_temp_dir()?;
    tokenizer.save(temp_dir.path())?;
    let loaded = Tokenizer::load(temp_dir.path())?;
    assert_eq!(loaded, tokenizer);
    Ok(())
}

/// Test training examples are shifted by the decoder start token
#[test]
fn test_trainingExample_shouldShiftLabelsRight() {
    let (tokenizer, _) = setup();
    let pair = common::fixture_pairs()
        .into_iter()
        .find(|p| p.direction() == "en->te")
        .unwrap();

    let example = tokenizer.training_example(&pair, 32).unwrap();
    assert_eq!(example.decoder_input[0], DECODER_START_ID);
    assert_eq!(example.decoder_input[1], tokenizer.language_token(IdiomLanguage::Telugu));
    assert_eq!(&example.decoder_input[1..], &example.labels[..example.labels.len() - 1]);
    assert_eq!(*example.labels.last().unwrap(), EOS_ID);

    let mut blank = pair.clone();
    blank.source_text = "   ".to_string();
    assert!(tokenizer.training_example(&blank, 32).is_none());
}

/// Test a freshly injected adapter leaves the base model output unchanged
#[test]
fn test_inject_freshAdapters_shouldNotChangeOutput() -> Result<()> {
    let (tokenizer, model) = setup();
    let adapters = AdapterSet::inject(model.as_ref(), &lora_config(), 42)?;

    assert_eq!(adapters.rank, 4);
    assert_eq!(adapters.target_layers().len(), 6);
    for layer in adapters.target_layers() {
        let values = adapters.values(&format!("{}.lora_B", layer))?.unwrap();
        assert!(values.iter().all(|v| *v == 0.0));
    }
    assert!(adapters.num_parameters() > 0);

    for pair in common::fixture_pairs().iter().take(6) {
        let example = tokenizer.training_example(pair, 32).unwrap();
        let base = model.forward(&example, None)?.loss_sum;
        let adapted = model.forward(&example, Some(&adapters))?.loss_sum;
        assert!((base - adapted).abs() < 1e-5, "{} vs {}", base, adapted);
    }
    Ok(())
}

/// Test injection is deterministic per seed
#[test]
fn test_inject_withSameSeed_shouldBeIdentical() -> Result<()> {
    let (_, model) = setup();
    let a = AdapterSet::inject(model.as_ref(), &lora_config(), 7)?;
    let b = AdapterSet::inject(model.as_ref(), &lora_config(), 7)?;
    let c = AdapterSet::inject(model.as_ref(), &lora_config(), 8)?;
    assert_eq!(a, b);
    assert_ne!(a, c);
    Ok(())
}

/// Test injection into a projection the base model does not have
#[test]
fn test_inject_withUnknownLayer_shouldFail() {
    let (_, model) = setup();
    let mut config = lora_config();
    config.target_modules = vec!["lm_head".to_string()];
    assert!(AdapterSet::inject(model.as_ref(), &config, 42).is_err());
}

/// Test recomputing activations yields the same gradients
#[test]
fn test_forwardBackward_withGradientCheckpointing_shouldMatchGradients() -> Result<()> {
    let (tokenizer, model) = setup();
    let adapters = AdapterSet::inject(model.as_ref(), &lora_config(), 42)?;
    nonzero_b(&adapters)?;

    let pair = &common::fixture_pairs()[3];
    let example = tokenizer.training_example(pair, 32).unwrap();

    let mut options = StepOptions {
        dropout_seed: 1,
        gradient_scale: 1.0,
        mixed_precision: false,
        gradient_checkpointing: false,
    };
    let mut stored = adapters.zero_gradients();
    let loss_stored = model.forward_backward(&example, &adapters, &options, &mut stored)?;

    options.gradient_checkpointing = true;
    let mut recomputed = adapters.zero_gradients();
    let loss_recomputed = model.forward_backward(&example, &adapters, &options, &mut recomputed)?;

    let relative = (loss_stored.loss_sum - loss_recomputed.loss_sum).abs() / loss_stored.loss_sum.max(1e-6);
    assert!(relative < 1e-4, "relative difference {}", relative);
    assert!(stored.global_norm()? > 0.0);
    assert_eq!(stored.named().len(), recomputed.named().len());
    for ((name, a), (_, b)) in stored.named().into_iter().zip(recomputed.named()) {
        let a = a.flatten_all()?.to_vec1::<f32>()?;
        let b = b.flatten_all()?.to_vec1::<f32>()?;
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4, "{}: {} vs {}", name, x, y);
        }
    }

    assert!(model.activation_floats_per_token(true) < model.activation_floats_per_token(false));
    Ok(())
}

/// Test bf16 activations stay close to full precision
#[test]
fn test_forwardBackward_withMixedPrecision_shouldStayClose() -> Result<()> {
    let (tokenizer, model) = setup();
    let adapters = AdapterSet::inject(model.as_ref(), &lora_config(), 42)?;
    let example = tokenizer.training_example(&common::fixture_pairs()[0], 32).unwrap();

    let full = model.forward(&example, Some(&adapters))?;
    let options = StepOptions {
        dropout_seed: 0,
        gradient_scale: 1.0,
        mixed_precision: true,
        gradient_checkpointing: false,
    };
    let mut gradients = adapters.zero_gradients();
    let mixed = model.forward_backward(&example, &adapters, &options, &mut gradients)?;

    assert_eq!(full.tokens, mixed.tokens);
    let relative = (full.loss_sum - mixed.loss_sum).abs() / full.loss_sum.max(1e-6);
    assert!(relative < 0.05, "relative difference {}", relative);
    Ok(())
}

/// Test checkpoints round trip and are checked against the base model
#[test]
fn test_checkpoint_saveLoad_shouldRoundTripAndValidate() -> Result<()> {
    let (_, model) = setup();
    let adapters = AdapterSet::inject(model.as_ref(), &lora_config(), 42)?;
    nonzero_b(&adapters)?;
    let checkpoint = AdapterCheckpoint::new(model.model_id(), model.hidden_size(), adapters, 17, Some(1.25));

    let temp_dir = common::create_temp_dir()?;
    checkpoint.save(temp_dir.path())?;
    assert!(AdapterCheckpoint::exists(temp_dir.path()));

    let loaded = AdapterCheckpoint::load(temp_dir.path())?;
    assert_eq!(loaded, checkpoint);
    assert_eq!(loaded.rank(), 4);
    assert_eq!(loaded.training_step, 17);
    assert!(loaded.adapter_weights.check_compatible(model.as_ref()).is_ok());

    // A base model with another hidden size cannot take these adapters
    let tokenizer = Tokenizer::from_pairs(&common::fixture_pairs());
    let mut other = model_config();
    other.hidden_size = 8;
    let smaller = load_base_model(&other, &tokenizer)?;
    assert!(loaded.adapter_weights.check_compatible(smaller.as_ref()).is_err());
    Ok(())
}
