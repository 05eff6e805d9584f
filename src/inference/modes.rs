/*!
 * Front-end modes of the translate command.
 *
 * Every mode reads and writes through generic `BufRead`/`Write` handles so
 * the CLI passes stdin/stdout and tests pass in-memory buffers.
 */

use anyhow::{Context, Result};
use log::{info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::errors::{TranslationError, NO_TRANSLATION_PLACEHOLDER};
use crate::language_utils::{detect_script, IdiomLanguage};

use super::engine::{Candidate, InferenceEngine, TranslateOptions, TranslationRequest};

/// One fixed demonstration query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DemoCase {
    pub text: &'static str,
    pub source: IdiomLanguage,
    pub target: IdiomLanguage,
}

/// Demonstration set covering every source language
pub const DEMO_CASES: [DemoCase; 6] = [
    DemoCase {
        text: "A bird in the hand is worth two in the bush",
        source: IdiomLanguage::English,
        target: IdiomLanguage::Hindi,
    },
    DemoCase {
        text: "Don't count your chickens before they hatch",
        source: IdiomLanguage::English,
        target: IdiomLanguage::Telugu,
    },
    DemoCase {
        text: "Actions speak louder than words",
        source: IdiomLanguage::English,
        target: IdiomLanguage::Hindi,
    },
    DemoCase {
        text: "Where there's smoke, there's fire",
        source: IdiomLanguage::English,
        target: IdiomLanguage::Telugu,
    },
    DemoCase {
        text: "अंधों में काना राजा",
        source: IdiomLanguage::Hindi,
        target: IdiomLanguage::English,
    },
    DemoCase {
        text: "जैसा देश वैसा भेष",
        source: IdiomLanguage::Hindi,
        target: IdiomLanguage::Telugu,
    },
];

/// Counts reported by the batch modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub translated: usize,
    pub failed: usize,
    pub blank: usize,
}

/// Best candidate text or the placeholder
pub fn best_or_placeholder(result: &Result<Vec<Candidate>, TranslationError>) -> String {
    match result {
        Ok(candidates) => candidates
            .first()
            .map(|c| c.text.clone())
            .unwrap_or_else(|| NO_TRANSLATION_PLACEHOLDER.to_string()),
        Err(_) => NO_TRANSLATION_PLACEHOLDER.to_string(),
    }
}

fn write_candidates<W: Write>(
    output: &mut W,
    result: &Result<Vec<Candidate>, TranslationError>,
    target: IdiomLanguage,
) -> std::io::Result<()> {
    match result {
        Ok(candidates) => {
            for (rank, candidate) in candidates.iter().enumerate() {
                writeln!(
                    output,
                    "   {}. {} (score {:.3}, script {})",
                    rank + 1,
                    candidate.text,
                    candidate.score,
                    detect_script(&candidate.text)
                )?;
            }
            writeln!(output, "   Expected script: {}", target.script())
        }
        Err(e) => writeln!(output, "   {} ({})", NO_TRANSLATION_PLACEHOLDER, e),
    }
}

/// Run the demonstration set
pub fn run_demo<W: Write>(
    engine: &InferenceEngine,
    options: &TranslateOptions,
    output: &mut W,
) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();

    for (index, case) in DEMO_CASES.iter().enumerate() {
        writeln!(output, "\n{}. {} -> {}", index + 1, case.source.name(), case.target.name())?;
        writeln!(output, "   Source: {}", case.text)?;

        let result = engine.translate(case.text, case.source.code(), case.target.code(), options);
        write_candidates(output, &result, case.target)?;

        summary.total += 1;
        if result.is_ok() {
            summary.translated += 1;
        } else {
            summary.failed += 1;
        }
    }

    output.flush()?;
    Ok(summary)
}

/// Read queries until `quit`, `exit` or end of input
///
/// Each query is a text line followed by a source and a target language line.
pub fn run_interactive<R: BufRead, W: Write>(
    engine: &InferenceEngine,
    options: &TranslateOptions,
    input: &mut R,
    output: &mut W,
) -> Result<usize> {
    writeln!(output, "Language codes: en (English), hi (Hindi), te (Telugu)")?;
    writeln!(output, "Type 'quit' to exit.")?;

    let mut answered = 0;
    loop {
        let Some(text) = prompt(input, output, "\nEnter text to translate: ")? else {
            break;
        };
        if is_quit(&text) {
            break;
        }
        if text.is_empty() {
            writeln!(output, "Please provide text to translate.")?;
            continue;
        }

        let Some(source) = prompt(input, output, "Source language: ")? else {
            break;
        };
        let Some(target) = prompt(input, output, "Target language: ")? else {
            break;
        };
        if source.is_empty() || target.is_empty() {
            writeln!(output, "Please provide both languages.")?;
            continue;
        }

        let result = engine.translate(&text, &source, &target, options);
        match IdiomLanguage::parse(&target) {
            Ok(language) => write_candidates(output, &result, language)?,
            Err(e) => writeln!(output, "   {} ({})", NO_TRANSLATION_PLACEHOLDER, e)?,
        }
        answered += 1;
    }

    writeln!(output, "Exiting...")?;
    output.flush()?;
    Ok(answered)
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, message: &str) -> Result<Option<String>> {
    write!(output, "{}", message)?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn is_quit(text: &str) -> bool {
    text.eq_ignore_ascii_case("quit") || text.eq_ignore_ascii_case("exit")
}

/// Translate newline-delimited texts, one output line per input line
///
/// Blank input lines stay blank and failed lines get the placeholder.
pub fn translate_lines<R: BufRead, W: Write>(
    engine: &InferenceEngine,
    source_lang: &str,
    target_lang: &str,
    options: &TranslateOptions,
    input: R,
    output: &mut W,
) -> Result<BatchSummary> {
    let lines: Vec<String> = input
        .lines()
        .collect::<std::io::Result<_>>()
        .context("Failed to read input lines")?;

    let requests: Vec<TranslationRequest> = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| TranslationRequest::new(line, source_lang, target_lang))
        .collect();
    let mut results = engine.translate_batch(&requests, options).into_iter();

    let mut summary = BatchSummary::default();
    for line in &lines {
        summary.total += 1;
        if line.trim().is_empty() {
            summary.blank += 1;
            writeln!(output)?;
            continue;
        }

        let result = results
            .next()
            .unwrap_or_else(|| Err(TranslationError::NotReady("missing batch result".to_string())));
        match &result {
            Ok(_) => summary.translated += 1,
            Err(e) => {
                warn!("Line {} failed: {}", summary.total, e);
                summary.failed += 1;
            }
        }
        writeln!(output, "{}", best_or_placeholder(&result))?;
    }

    output.flush()?;
    Ok(summary)
}

/// File-batch mode
pub fn translate_file<P: AsRef<Path>, Q: AsRef<Path>>(
    engine: &InferenceEngine,
    input_file: P,
    output_file: Q,
    source_lang: &str,
    target_lang: &str,
    options: &TranslateOptions,
) -> Result<BatchSummary> {
    let input_file = input_file.as_ref();
    let output_file = output_file.as_ref();

    let reader = BufReader::new(
        File::open(input_file).context(format!("Failed to open input file: {}", input_file.display()))?,
    );
    let mut writer = BufWriter::new(
        File::create(output_file).context(format!("Failed to create output file: {}", output_file.display()))?,
    );

    let summary = translate_lines(engine, source_lang, target_lang, options, reader, &mut writer)?;
    info!(
        "Translated {}/{} lines into {} ({} failed, {} blank)",
        summary.translated,
        summary.total - summary.blank,
        output_file.display(),
        summary.failed,
        summary.blank
    );
    Ok(summary)
}
