/*!
 * Corpus-level translation metrics on a 0-100 scale.
 */

use std::collections::HashMap;
use std::hash::Hash;

use crate::model::tokenizer::split_pieces;

const BLEU_ORDER: usize = 4;
const CHRF_CHAR_ORDER: usize = 6;
const CHRF_BETA: f64 = 2.0;

fn ngram_counts<T: Eq + Hash + Clone>(items: &[T], n: usize) -> HashMap<Vec<T>, usize> {
    let mut counts = HashMap::new();
    if n == 0 || items.len() < n {
        return counts;
    }
    for window in items.windows(n) {
        *counts.entry(window.to_vec()).or_insert(0) += 1;
    }
    counts
}

/// Clipped matches, hypothesis n-grams and reference n-grams
fn ngram_stats<T: Eq + Hash + Clone>(hypothesis: &[T], reference: &[T], n: usize) -> (usize, usize, usize) {
    let hyp = ngram_counts(hypothesis, n);
    let reference = ngram_counts(reference, n);
    let matches = hyp
        .iter()
        .map(|(gram, count)| (*count).min(reference.get(gram).copied().unwrap_or(0)))
        .sum();
    (matches, hyp.values().sum(), reference.values().sum())
}

/// Corpus BLEU over 1-4-grams with a brevity penalty and exponential smoothing
///
/// Tokens are lowercased words and punctuation marks. Orders with no
/// hypothesis n-grams anywhere in the corpus are left out of the mean.
pub fn corpus_bleu(hypotheses: &[&str], references: &[&str]) -> f64 {
    let mut matches = [0usize; BLEU_ORDER];
    let mut totals = [0usize; BLEU_ORDER];
    let mut hyp_len = 0usize;
    let mut ref_len = 0usize;

    for (hypothesis, reference) in hypotheses.iter().zip(references) {
        let hyp = split_pieces(hypothesis);
        let reference = split_pieces(reference);
        hyp_len += hyp.len();
        ref_len += reference.len();
        for n in 1..=BLEU_ORDER {
            let (matched, total, _) = ngram_stats(&hyp, &reference, n);
            matches[n - 1] += matched;
            totals[n - 1] += total;
        }
    }

    if hyp_len == 0 {
        return 0.0;
    }

    let mut smoothing = 1.0;
    let mut log_sum = 0.0;
    let mut order = 0usize;
    for n in 0..BLEU_ORDER {
        if totals[n] == 0 {
            break;
        }
        let precision = if matches[n] == 0 {
            smoothing *= 2.0;
            1.0 / (smoothing * totals[n] as f64)
        } else {
            matches[n] as f64 / totals[n] as f64
        };
        log_sum += precision.ln();
        order += 1;
    }
    if order == 0 {
        return 0.0;
    }

    let brevity = if hyp_len < ref_len {
        (1.0 - ref_len as f64 / hyp_len as f64).exp()
    } else {
        1.0
    };
    100.0 * brevity * (log_sum / order as f64).exp()
}

/// chrF over character 1-6-grams with whitespace removed, beta 2
///
/// Statistics are summed over the corpus; the F-beta score is averaged over
/// the orders that occur in both hypothesis and reference.
pub fn corpus_chrf(hypotheses: &[&str], references: &[&str]) -> f64 {
    let mut stats = vec![(0usize, 0usize, 0usize); CHRF_CHAR_ORDER];

    for (hypothesis, reference) in hypotheses.iter().zip(references) {
        let hyp_chars: Vec<char> = hypothesis.chars().filter(|c| !c.is_whitespace()).collect();
        let ref_chars: Vec<char> = reference.chars().filter(|c| !c.is_whitespace()).collect();
        for n in 1..=CHRF_CHAR_ORDER {
            accumulate(&mut stats[n - 1], ngram_stats(&hyp_chars, &ref_chars, n));
        }
    }

    let factor = CHRF_BETA * CHRF_BETA;
    let mut total = 0.0;
    let mut effective = 0usize;
    for (matched, hyp, reference) in stats {
        if hyp == 0 || reference == 0 {
            continue;
        }
        let precision = matched as f64 / hyp as f64;
        let recall = matched as f64 / reference as f64;
        let denominator = factor * precision + recall;
        if denominator > 0.0 {
            total += (1.0 + factor) * precision * recall / denominator;
        }
        effective += 1;
    }

    if effective == 0 {
        return 0.0;
    }
    100.0 * total / effective as f64
}

fn accumulate(into: &mut (usize, usize, usize), stats: (usize, usize, usize)) {
    into.0 += stats.0;
    into.1 += stats.1;
    into.2 += stats.2;
}

/// Percentage of hypotheses equal to their reference, ignoring case and edge whitespace
pub fn exact_match(hypotheses: &[&str], references: &[&str]) -> f64 {
    if hypotheses.is_empty() {
        return 0.0;
    }
    let hits = hypotheses
        .iter()
        .zip(references)
        .filter(|(h, r)| h.trim().to_lowercase() == r.trim().to_lowercase())
        .count();
    100.0 * hits as f64 / hypotheses.len() as f64
}

/// Cosine similarity mapped to 0-100, negative similarity counts as zero
pub fn similarity_score(hypothesis: &[f32], reference: &[f32]) -> f64 {
    (cosine(hypothesis, reference).max(0.0) as f64 * 100.0).min(100.0)
}

/// Cosine similarity; zero when either vector is zero
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
