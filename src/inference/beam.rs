/*!
 * Beam search with target-language constraints.
 *
 * Hypotheses start with the decoder start token followed by the forced
 * target-language token. At each step every live hypothesis is expanded,
 * the candidates are ranked in a priority queue and the best `beam_width`
 * survive. Before ranking, logits get a repetition penalty, no-repeat
 * n-gram bans, a minimum length and a vocabulary mask restricted to the
 * target script.
 */

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::app_config::InferenceConfig;
use crate::language_utils::{IdiomLanguage, Script};
use crate::model::tokenizer::{Tokenizer, DECODER_START_ID, EOS_ID};

/// Decoding parameters
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub beam_width: usize,
    pub num_candidates: usize,
    /// Maximum generated tokens after the language token
    pub max_length: usize,
    pub min_length: usize,
    pub no_repeat_ngram_size: usize,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
}

impl From<&InferenceConfig> for GenerationConfig {
    fn from(config: &InferenceConfig) -> Self {
        Self {
            beam_width: config.beam_width,
            num_candidates: config.num_candidates,
            max_length: config.max_length,
            min_length: config.min_length,
            no_repeat_ngram_size: config.no_repeat_ngram_size,
            repetition_penalty: config.repetition_penalty,
            length_penalty: config.length_penalty,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::from(&InferenceConfig::default())
    }
}

/// A finished or truncated beam
#[derive(Debug, Clone, PartialEq)]
pub struct BeamHypothesis {
    /// Generated tokens, starting with the target-language token
    pub tokens: Vec<u32>,
    pub log_prob: f32,
    /// Length-normalized log probability
    pub score: f32,
    pub finished: bool,
}

#[derive(Debug, Clone)]
struct Frontier {
    tokens: Vec<u32>,
    log_prob: f32,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    // Max-heap on log probability; lower token ids win ties
    fn cmp(&self, other: &Self) -> Ordering {
        self.log_prob
            .total_cmp(&other.log_prob)
            .then_with(|| other.tokens.cmp(&self.tokens))
    }
}

/// Which vocabulary entries may be generated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenClass {
    /// A word in the target script
    Word,
    /// Punctuation or digits
    Neutral,
    /// Special tokens and words in other scripts
    Blocked,
}

/// Beam search over a step function
pub struct BeamSearch<'a> {
    config: &'a GenerationConfig,
    tokenizer: &'a Tokenizer,
    language_token: u32,
    classes: Vec<TokenClass>,
}

impl<'a> BeamSearch<'a> {
    pub fn new(config: &'a GenerationConfig, tokenizer: &'a Tokenizer, target: IdiomLanguage) -> Self {
        let script = target.script();
        let classes = (0..tokenizer.vocab_size() as u32)
            .map(|id| classify(tokenizer, id, script))
            .collect();

        Self {
            config,
            tokenizer,
            language_token: tokenizer.language_token(target),
            classes,
        }
    }

    /// Termination predicate
    fn should_stop(&self, generated: usize, live: &[Frontier], finished: &[BeamHypothesis]) -> bool {
        generated >= self.config.max_length
            || live.is_empty()
            || finished.len() >= self.config.beam_width.max(1)
    }

    /// Run the search; `step` returns next-token logits for a prefix
    ///
    /// The result is ordered best first. The first error from `step` ends the search.
    pub fn search<F, E>(&self, mut step: F) -> Result<Vec<BeamHypothesis>, E>
    where
        F: FnMut(&[u32]) -> Result<Vec<f32>, E>,
    {
        let beam_width = self.config.beam_width.max(1);
        let mut live = vec![Frontier {
            tokens: vec![DECODER_START_ID, self.language_token],
            log_prob: 0.0,
        }];
        let mut finished: Vec<BeamHypothesis> = Vec::new();
        let mut generated = 0usize;

        while !self.should_stop(generated, &live, &finished) {
            let mut frontier = BinaryHeap::new();

            for hypothesis in &live {
                let scores = self.process_logits(&hypothesis.tokens, step(&hypothesis.tokens)?);
                for (token, log_prob) in top_k(&scores, beam_width * 2) {
                    let mut tokens = hypothesis.tokens.clone();
                    tokens.push(token);
                    frontier.push(Frontier {
                        tokens,
                        log_prob: hypothesis.log_prob + log_prob,
                    });
                }
            }

            live.clear();
            while let Some(candidate) = frontier.pop() {
                if live.len() >= beam_width {
                    break;
                }
                if candidate.tokens.last() == Some(&EOS_ID) {
                    if finished.len() < beam_width {
                        finished.push(self.hypothesis(candidate, true));
                    }
                } else {
                    live.push(candidate);
                }
            }
            generated += 1;
        }

        // Beams cut off by the length limit still count as candidates
        if finished.len() < beam_width {
            let missing = beam_width - finished.len();
            finished.extend(live.into_iter().take(missing).map(|f| self.hypothesis(f, false)));
        }

        finished.sort_by(|a, b| rank_hypotheses(self.tokenizer, a, b));
        Ok(finished)
    }

    fn hypothesis(&self, frontier: Frontier, finished: bool) -> BeamHypothesis {
        let tokens = frontier.tokens[1..].to_vec();
        let length = (tokens.len().saturating_sub(1)).max(1) as f32;
        BeamHypothesis {
            score: frontier.log_prob / length.powf(self.config.length_penalty),
            log_prob: frontier.log_prob,
            tokens,
            finished,
        }
    }

    /// Turn raw logits into masked log probabilities for the next token
    fn process_logits(&self, prefix: &[u32], mut logits: Vec<f32>) -> Vec<f32> {
        let generated = &prefix[1..];
        let content = &generated[1..];

        let penalty = self.config.repetition_penalty;
        if penalty != 1.0 {
            let seen: HashSet<u32> = content.iter().copied().collect();
            for token in seen {
                if let Some(logit) = logits.get_mut(token as usize) {
                    *logit = if *logit > 0.0 { *logit / penalty } else { *logit * penalty };
                }
            }
        }

        let mut scores = log_softmax(&logits);
        let content_len = self.tokenizer.content_len(content);

        for (id, score) in scores.iter_mut().enumerate() {
            let allowed = match self.classes.get(id).copied().unwrap_or(TokenClass::Blocked) {
                TokenClass::Word => true,
                TokenClass::Neutral => content_len > 0,
                TokenClass::Blocked => id as u32 == EOS_ID && content_len >= self.config.min_length,
            };
            if !allowed {
                *score = f32::NEG_INFINITY;
            }
        }

        for banned in banned_ngram_tokens(generated, self.config.no_repeat_ngram_size) {
            if let Some(score) = scores.get_mut(banned as usize) {
                *score = f32::NEG_INFINITY;
            }
        }

        scores
    }
}

/// Best score first, then fewer content tokens, then lower token ids
pub fn rank_hypotheses(tokenizer: &Tokenizer, a: &BeamHypothesis, b: &BeamHypothesis) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| tokenizer.content_len(&a.tokens).cmp(&tokenizer.content_len(&b.tokens)))
        .then_with(|| a.tokens.cmp(&b.tokens))
}

/// Numerically stable log-softmax; masked `-inf` entries stay `-inf`
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    let log_sum = logits.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|v| v - log_sum).collect()
}

fn classify(tokenizer: &Tokenizer, id: u32, target: Script) -> TokenClass {
    if tokenizer.is_special(id) {
        return TokenClass::Blocked;
    }
    match tokenizer.script(id) {
        Some(script) if script == target => TokenClass::Word,
        Some(_) => TokenClass::Blocked,
        None => TokenClass::Neutral,
    }
}

/// Tokens that would complete an n-gram already present in `tokens`
pub fn banned_ngram_tokens(tokens: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || tokens.len() + 1 < n {
        return Vec::new();
    }
    if n == 1 {
        return tokens.to_vec();
    }

    let prefix = &tokens[tokens.len() + 1 - n..];
    tokens
        .windows(n)
        .filter(|window| &window[..n - 1] == prefix)
        .map(|window| window[n - 1])
        .collect()
}

/// Highest finite scores, best first, ties to the lower id
fn top_k(scores: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = scores
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .map(|(id, s)| (id as u32, *s))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}
