/*!
 * Integration tests for the inference engine and its front-end modes
 */

use anyhow::Result;
use std::io::Cursor;

use contextbridge::dataset::aligner;
use contextbridge::errors::{ModelLoadError, TranslationError, ValidationError, NO_TRANSLATION_PLACEHOLDER};
use contextbridge::inference::modes::{self, DEMO_CASES};
use contextbridge::inference::{
    ContextualTranslator, EngineState, IdiomDetector, InferenceEngine, TranslateOptions, TranslationMethod,
    TranslationRequest,
};
use contextbridge::language_utils::{detect_script, IdiomLanguage};

use crate::common;

fn options(beam_width: usize, num_candidates: usize) -> TranslateOptions {
    TranslateOptions {
        beam_width,
        num_candidates,
    }
}

/// Writes an untrained checkpoint with its tokenizer into `dir`
fn save_engine_parts(engine: &InferenceEngine, dir: &std::path::Path) -> Result<()> {
    engine.checkpoint().unwrap().save(dir)?;
    engine.tokenizer().unwrap().save(dir)?;
    Ok(())
}

/// Test an English idiom translated to Telugu comes back in Telugu script
#[test]
fn test_translate_englishToTelugu_shouldReturnTeluguScript() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;

    let candidates = engine.translate("break the ice", "en", "te", &options(3, 1))?;
    assert_eq!(candidates.len(), 1);
    assert!(!candidates[0].text.is_empty());
    assert_eq!(detect_script(&candidates[0].text), IdiomLanguage::Telugu.script());
    assert_eq!(candidates[0].language, IdiomLanguage::Telugu);
    Ok(())
}

/// Test an idiom inside a sentence is replaced by its table translation
#[test]
fn test_contextualTranslate_withEmbeddedIdiom_shouldUseTableTranslation() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;
    let detector = IdiomDetector::from_triplets(&aligner::align(&common::all_tables()).triplets)?;

    let translator = ContextualTranslator::new(&engine, &detector, options(2, 3));
    let result = translator.translate("we should break the ice", "en", "te")?;

    assert_eq!(result.method, TranslationMethod::Contextual);
    assert_eq!(result.idioms.len(), 1);
    assert_eq!(result.idioms[0].canonical, "break the ice");
    assert!(result.idioms[0].from_table);
    assert!(result.text.contains("మొదటి అడుగు"), "got '{}'", result.text);
    Ok(())
}

/// Test the first generated token is the target-language token for every target
#[test]
fn test_translate_eachTarget_shouldStartWithLanguageToken() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;
    let tokenizer = engine.tokenizer().unwrap();

    for (text, source, target) in [
        ("break the ice", IdiomLanguage::English, IdiomLanguage::Hindi),
        ("ईद का चांद", IdiomLanguage::Hindi, IdiomLanguage::English),
        ("నల్లేరు మీద నడక", IdiomLanguage::Telugu, IdiomLanguage::Hindi),
    ] {
        let candidates = engine.translate(text, source.code(), target.nllb_code(), &options(3, 3))?;
        for candidate in &candidates {
            assert_eq!(candidate.tokens[0], tokenizer.language_token(target));
            assert_eq!(detect_script(&candidate.text), target.script());
        }
    }
    Ok(())
}

/// Test several candidates are distinct and ranked best first
#[test]
fn test_translate_withSeveralCandidates_shouldRankDistinctTexts() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;

    let candidates = engine.translate("piece of cake", "en", "hi", &options(4, 4))?;
    assert!(!candidates.is_empty());
    assert!(candidates.len() <= 4);
    for window in candidates.windows(2) {
        assert!(window[0].score >= window[1].score);
        assert_ne!(window[0].text, window[1].text);
    }

    // Deterministic across calls
    let again = engine.translate("piece of cake", "en", "hi", &options(4, 4))?;
    assert_eq!(candidates, again);
    Ok(())
}

/// Test requests are rejected before decoding
#[test]
fn test_translate_withInvalidRequests_shouldReturnValidationErrors() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = common::test_config(temp_dir.path());
    config.inference.min_input_chars = 4;
    let engine = common::untrained_engine(&config)?;
    let opts = options(2, 1);

    assert_eq!(
        engine.translate(" \u{200B}  ", "en", "te", &opts),
        Err(TranslationError::Validation(ValidationError::EmptyInput))
    );
    assert_eq!(
        engine.translate("break the ice", "en", "eng_Latn", &opts),
        Err(TranslationError::Validation(ValidationError::SameLanguage("en".to_string())))
    );
    assert!(matches!(
        engine.translate("break the ice", "en", "fr", &opts),
        Err(TranslationError::Validation(ValidationError::UnknownLanguage(_)))
    ));
    assert!(matches!(
        engine.translate("ice", "en", "hi", &opts),
        Err(TranslationError::Validation(ValidationError::InputTooShort { minimum: 4, actual: 3 }))
    ));
    Ok(())
}

/// Test batch results keep the input order and isolate bad requests
#[test]
fn test_translateBatch_withMixedRequests_shouldKeepOrder() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;
    let opts = options(3, 1);

    let requests = vec![
        TranslationRequest::new("break the ice", "en", "te"),
        TranslationRequest::new("", "en", "hi"),
        TranslationRequest::new("बाएं हाथ का खेल", "hi", "en"),
        TranslationRequest::new("once in a blue moon", "en", "xx"),
        TranslationRequest::new("మాటలు కాదు చేతలు", "te", "hi"),
    ];
    let results = engine.translate_batch(&requests, &opts);
    assert_eq!(results.len(), requests.len());

    assert!(results[1].is_err());
    assert!(results[3].is_err());
    for index in [0, 2, 4] {
        let request = &requests[index];
        let single = engine.translate(&request.text, &request.source_lang, &request.target_lang, &opts)?;
        assert_eq!(results[index].as_ref().unwrap(), &single);
    }
    Ok(())
}

/// Test an engine without a model refuses to translate
#[test]
fn test_translate_beforeLoad_shouldReturnNotReady() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = InferenceEngine::from_config(&config);

    assert_eq!(engine.state(), EngineState::Unloaded);
    assert!(matches!(
        engine.translate("break the ice", "en", "te", &options(2, 1)),
        Err(TranslationError::NotReady(_))
    ));
    let batch = engine.translate_batch(&[TranslationRequest::new("a", "en", "te")], &options(2, 1));
    assert!(matches!(batch[0], Err(TranslationError::NotReady(_))));
    Ok(())
}

/// Test a missing checkpoint leaves the engine unloaded
#[test]
fn test_load_withMissingCheckpoint_shouldStayUnloaded() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let mut engine = InferenceEngine::new(config.model.clone(), config.inference.clone(), temp_dir.path().join("nope"));

    assert!(matches!(engine.load(), Err(ModelLoadError::MissingArtifact(_))));
    assert_eq!(engine.state(), EngineState::Unloaded);
    assert!(!engine.is_ready());
    Ok(())
}

/// Test a checkpoint for another base model is refused
#[test]
fn test_load_withOtherBaseModel_shouldBeIncompatible() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let source = common::untrained_engine(&config)?;
    let dir = temp_dir.path().join("ckpt");
    save_engine_parts(&source, &dir)?;

    let mut other_model = config.model.clone();
    other_model.model_name = "test/another-base".to_string();
    let mut engine = InferenceEngine::new(other_model, config.inference.clone(), &dir);

    assert!(matches!(engine.load(), Err(ModelLoadError::Incompatible(_))));
    assert_eq!(engine.state(), EngineState::Unloaded);
    Ok(())
}

/// Test loading a saved checkpoint serves the same translations, and release unloads it
#[test]
fn test_load_fromSavedCheckpoint_shouldMatchInMemoryEngine() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let source = common::untrained_engine(&config)?;
    let dir = temp_dir.path().join("ckpt");
    save_engine_parts(&source, &dir)?;

    let mut engine = InferenceEngine::new(config.model.clone(), config.inference.clone(), &dir);
    engine.load()?;
    assert_eq!(engine.state(), EngineState::Ready);

    let opts = options(3, 2);
    assert_eq!(
        engine.translate("break the ice", "en", "hi", &opts)?,
        source.translate("break the ice", "en", "hi", &opts)?
    );
    assert_eq!(engine.embed("break the ice", IdiomLanguage::English)?.len(), 16);

    engine.release();
    assert_eq!(engine.state(), EngineState::Unloaded);
    assert!(engine.translate("break the ice", "en", "hi", &opts).is_err());
    Ok(())
}

/// Test line mode keeps blank lines and writes the placeholder for failures
#[test]
fn test_translateLines_withBlankAndShortLines_shouldKeepLineCount() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let mut config = common::test_config(temp_dir.path());
    config.inference.min_input_chars = 3;
    let engine = common::untrained_engine(&config)?;

    let input = Cursor::new("break the ice\n\nab\npiece of cake\n");
    let mut output = Vec::new();
    let summary = modes::translate_lines(&engine, "en", "te", &options(2, 1), input, &mut output)?;

    assert_eq!(summary.total, 4);
    assert_eq!(summary.blank, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.translated, 2);

    let text = String::from_utf8(output)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(detect_script(lines[0]), IdiomLanguage::Telugu.script());
    assert_eq!(lines[1], "");
    assert_eq!(lines[2], NO_TRANSLATION_PLACEHOLDER);
    assert_eq!(detect_script(lines[3]), IdiomLanguage::Telugu.script());
    Ok(())
}

/// Test file mode writes one output line per input line
#[test]
fn test_translateFile_shouldWriteOutputFile() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;

    let input = common::create_test_file(temp_dir.path(), "queries.txt", "बर्फ तोड़ना\nईद का चांद\n")?;
    let output = temp_dir.path().join("queries.en.txt");
    let summary = modes::translate_file(&engine, &input, &output, "hi", "en", &options(2, 1))?;

    assert_eq!(summary.translated, 2);
    let written = std::fs::read_to_string(&output)?;
    assert_eq!(written.lines().count(), 2);
    assert!(written.lines().all(|line| detect_script(line) == IdiomLanguage::English.script()));
    Ok(())
}

/// Test interactive mode answers a query, reprompts on empty text and exits on quit
#[test]
fn test_runInteractive_withQuit_shouldStop() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;

    let mut input = Cursor::new("break the ice\nen\nte\n\nquit\nnever read\n");
    let mut output = Vec::new();
    let answered = modes::run_interactive(&engine, &options(2, 1), &mut input, &mut output)?;

    assert_eq!(answered, 1);
    let text = String::from_utf8(output)?;
    assert!(text.contains("Please provide text to translate."));
    assert!(text.contains("Expected script: Telugu"));
    assert!(text.trim_end().ends_with("Exiting..."));
    Ok(())
}

/// Test interactive mode ends cleanly at end of input
#[test]
fn test_runInteractive_atEndOfInput_shouldExit() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;

    let mut input = Cursor::new("piece of cake\nen\n");
    let mut output = Vec::new();
    let answered = modes::run_interactive(&engine, &options(2, 1), &mut input, &mut output)?;
    assert_eq!(answered, 0);
    assert!(String::from_utf8(output)?.contains("Exiting..."));
    Ok(())
}

/// Test the demonstration runs every case
#[test]
fn test_runDemo_shouldCoverEveryCase() -> Result<()> {
    let temp_dir = common::create_temp_dir()?;
    let config = common::test_config(temp_dir.path());
    let engine = common::untrained_engine(&config)?;

    let mut output = Vec::new();
    let summary = modes::run_demo(&engine, &options(2, 1), &mut output)?;
    assert_eq!(summary.total, DEMO_CASES.len());
    assert_eq!(summary.translated + summary.failed, DEMO_CASES.len());

    let text = String::from_utf8(output)?;
    for case in DEMO_CASES.iter() {
        assert!(text.contains(case.text));
    }
    Ok(())
}
