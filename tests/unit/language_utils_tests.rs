/*!
 * Tests for language utility functions
 */

use contextbridge::errors::ValidationError;
use contextbridge::language_utils::{detect_script, IdiomLanguage, Script};

/// Test language code conversions
#[test]
fn test_language_codes_shouldMatchIsoAndNllb() {
    assert_eq!(IdiomLanguage::English.code(), "en");
    assert_eq!(IdiomLanguage::Hindi.part3(), "hin");
    assert_eq!(IdiomLanguage::Telugu.nllb_code(), "tel_Telu");
    assert_eq!(IdiomLanguage::Hindi.name(), "Hindi");
    assert_eq!(IdiomLanguage::Telugu.to_string(), "te");
}

/// Test every accepted spelling parses to the same language
#[test]
fn test_parse_withMixedSpellings_shouldNormalize() {
    let spellings = [
        ("en", IdiomLanguage::English),
        ("ENG", IdiomLanguage::English),
        ("eng_Latn", IdiomLanguage::English),
        ("hi", IdiomLanguage::Hindi),
        ("Hindi", IdiomLanguage::Hindi),
        ("tel", IdiomLanguage::Telugu),
    ];

    for (code, expected) in spellings {
        let parsed: IdiomLanguage = code.parse().unwrap();
        assert_eq!(parsed, expected, "spelling {}", code);
    }
}

/// Test unsupported languages are rejected with the original code
#[test]
fn test_parse_withUnsupportedLanguage_shouldKeepCodeInError() {
    let err = IdiomLanguage::parse("de").unwrap_err();
    assert_eq!(err, ValidationError::UnknownLanguage("de".to_string()));
    assert!(IdiomLanguage::parse("klingon").is_err());
}

/// Test each language declares the script its text is written in
#[test]
fn test_script_shouldMatchDetectedScriptOfIdioms() {
    assert_eq!(detect_script("once in a blue moon"), IdiomLanguage::English.script());
    assert_eq!(detect_script("ईद का चांद"), IdiomLanguage::Hindi.script());
    assert_eq!(detect_script("నల్లేరు మీద నడక"), IdiomLanguage::Telugu.script());
}

/// Test text with no dominant script
#[test]
fn test_detectScript_withEvenMix_shouldReturnMixed() {
    assert_eq!(detect_script("ab कख"), Script::Mixed);
    assert_eq!(detect_script(""), Script::Unknown);
}
