/*!
 * Deterministic reference encoder-decoder on candle.
 *
 * A compact stand-in for the pretrained translation model. All weights are
 * derived from the model id and the vocabulary strings, so two instances
 * built from the same tokenizer are identical and a word keeps its
 * embedding across vocabularies.
 *
 * Encoder: the mean source embedding `e` is projected to a key `k_proj(e)`
 * and a value `v_proj(e)`.
 *
 * Decoder, for every target position `t` with input token `x`:
 *
 * ```text
 * s = E[x] + P[t]
 * q = q_proj(s)
 * g = sigmoid(q . k / sqrt(d))
 * o = o_proj(q + g v)
 * f = o + fc2(relu(fc1(o)))
 * logits = sqrt(d) * f E^T
 * ```
 *
 * The embedding matrix `E` is tied between input and output. Base weights
 * are plain tensors; only adapter variables receive gradients.
 */

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::ops::Range;

use super::lora::{AdapterGradients, AdapterSet};
use super::{
    derive_seed, BaseModel, EncoderOutput, LossOutput, ParameterGroup, StepOptions, TrainingExample,
    PROJECTION_LAYERS,
};

const ENCODER_POSITION: usize = usize::MAX;

/// Per-example dropout masks, reproducible by position and layer
#[derive(Debug, Clone, Copy)]
struct DropoutPlan {
    seed: u64,
    probability: f32,
}

impl DropoutPlan {
    /// Inverted dropout mask with one row per position
    fn mask(&self, positions: &[usize], layer: &str, width: usize, device: &Device) -> candle_core::Result<Option<Tensor>> {
        if self.probability <= 0.0 {
            return Ok(None);
        }
        let keep = 1.0 / (1.0 - self.probability);
        let mut values = Vec::with_capacity(positions.len() * width);
        for position in positions {
            let seed = derive_seed(&[&self.seed.to_string(), &position.to_string(), layer]);
            let mut rng = StdRng::seed_from_u64(seed);
            values.extend((0..width).map(|_| if rng.random::<f32>() < self.probability { 0.0 } else { keep }));
        }
        Ok(Some(Tensor::from_vec(values, (positions.len(), width), device)?))
    }
}

/// Context shared by every projection of one pass
struct Pass<'a> {
    adapters: Option<&'a AdapterSet>,
    dropout: Option<DropoutPlan>,
    mixed_precision: bool,
}

impl Pass<'_> {
    fn inference(adapters: Option<&AdapterSet>) -> Pass<'_> {
        Pass {
            adapters,
            dropout: None,
            mixed_precision: false,
        }
    }

    /// bf16 round trip on the forward pass; gradients pass straight through
    fn round(&self, x: Tensor) -> candle_core::Result<Tensor> {
        if self.mixed_precision {
            x.to_dtype(DType::BF16)?.to_dtype(DType::F32)
        } else {
            Ok(x)
        }
    }
}

/// The bundled base model
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    model_id: String,
    hidden_size: usize,
    ffn_size: usize,
    vocab_size: usize,
    device: Device,
    embeddings: Embedding,
    projections: BTreeMap<String, Linear>,
    shapes: BTreeMap<String, (usize, usize)>,
    logit_scale: f64,
}

impl ReferenceModel {
    pub fn new(model_id: &str, hidden_size: usize, vocabulary: &[String], device: &Device) -> candle_core::Result<Self> {
        let d = hidden_size.max(1);
        let ffn = d * 2;
        let vocab_size = vocabulary.len().max(1);

        let embed_bound = (3.0 / d as f32).sqrt();
        let mut table = Vec::with_capacity(vocab_size * d);
        for piece in vocabulary {
            let mut rng = StdRng::seed_from_u64(derive_seed(&[model_id, "embed", piece]));
            table.extend((0..d).map(|_| rng.random_range(-embed_bound..embed_bound)));
        }
        table.resize(vocab_size * d, 0.0);
        let embeddings = Embedding::new(Tensor::from_vec(table, (vocab_size, d), device)?, d);

        let mut projections = BTreeMap::new();
        let mut shapes = BTreeMap::new();
        for (name, rows, cols) in [
            ("q_proj", d, d),
            ("k_proj", d, d),
            ("v_proj", d, d),
            ("o_proj", d, d),
            ("fc1", ffn, d),
            ("fc2", d, ffn),
        ] {
            let mut rng = StdRng::seed_from_u64(derive_seed(&[model_id, name]));
            let bound = (3.0 / cols as f32).sqrt();
            let values: Vec<f32> = (0..rows * cols).map(|_| rng.random_range(-bound..bound)).collect();
            let weight = Tensor::from_vec(values, (rows, cols), device)?;
            projections.insert(name.to_string(), Linear::new(weight, None));
            shapes.insert(name.to_string(), (rows, cols));
        }

        Ok(Self {
            model_id: model_id.to_string(),
            hidden_size: d,
            ffn_size: ffn,
            vocab_size,
            device: device.clone(),
            embeddings,
            projections,
            shapes,
            logit_scale: (d as f64).sqrt(),
        })
    }

    /// Token ids as a tensor, out-of-vocabulary ids clamped to the last row
    fn ids(&self, ids: &[u32]) -> candle_core::Result<Tensor> {
        let last = self.vocab_size.saturating_sub(1) as u32;
        let clamped: Vec<u32> = ids.iter().map(|&id| id.min(last)).collect();
        Tensor::new(clamped.as_slice(), &self.device)
    }

    fn position_encodings(&self, positions: &[usize]) -> candle_core::Result<Tensor> {
        let d = self.hidden_size;
        let amplitude = 0.5 * (2.0 / d as f32).sqrt();
        let mut values = Vec::with_capacity(positions.len() * d);
        for &position in positions {
            values.extend((0..d).map(|i| {
                let exponent = (2 * (i / 2)) as f32 / d as f32;
                let angle = position as f32 / 10000f32.powf(exponent);
                amplitude * if i % 2 == 0 { angle.sin() } else { angle.cos() }
            }));
        }
        Tensor::from_vec(values, (positions.len(), d), &self.device)
    }

    /// `x W^T` plus the adapter delta; rows of `x` belong to `positions`
    fn project(&self, layer: &str, x: &Tensor, positions: &[usize], pass: &Pass<'_>) -> candle_core::Result<Tensor> {
        let linear = self
            .projections
            .get(layer)
            .ok_or_else(|| candle_core::Error::Msg(format!("unknown projection '{}'", layer)))?;
        let mut y = linear.forward(x)?;

        if let Some(adapters) = pass.adapters {
            if let Some(weights) = adapters.get(layer) {
                let width = x.dim(D::Minus1)?;
                let input = match pass.dropout {
                    Some(plan) => match plan.mask(positions, layer, width, &self.device)? {
                        Some(mask) => x.mul(&mask)?,
                        None => x.clone(),
                    },
                    None => x.clone(),
                };
                let delta = input
                    .matmul(&weights.lora_a.t()?)?
                    .matmul(&weights.lora_b.t()?)?
                    .affine(adapters.scaling() as f64, 0.0)?;
                y = y.add(&delta)?;
            }
        }

        pass.round(y)
    }

    /// Key and value, each `(1, d)`, plus the pooled source embedding
    fn encode_states(&self, source_ids: &[u32], pass: &Pass<'_>) -> candle_core::Result<(Tensor, Tensor)> {
        let pooled = if source_ids.is_empty() {
            Tensor::zeros((1, self.hidden_size), DType::F32, &self.device)?
        } else {
            self.embeddings.forward(&self.ids(source_ids)?)?.mean_keepdim(0)?
        };
        let pooled = pass.round(pooled)?;

        let key = self.project("k_proj", &pooled, &[ENCODER_POSITION], pass)?;
        let value = self.project("v_proj", &pooled, &[ENCODER_POSITION], pass)?;
        Ok((key, value))
    }

    /// Logits `(n, vocab)` for decoder inputs at `positions`
    fn decode_positions(
        &self,
        tokens: &[u32],
        positions: &[usize],
        key: &Tensor,
        value: &Tensor,
        pass: &Pass<'_>,
    ) -> candle_core::Result<Tensor> {
        let s = self
            .embeddings
            .forward(&self.ids(tokens)?)?
            .add(&self.position_encodings(positions)?)?;
        let s = pass.round(s)?;

        let q = self.project("q_proj", &s, positions, pass)?;
        let scores = q
            .broadcast_mul(key)?
            .sum_keepdim(1)?
            .affine(1.0 / (self.hidden_size as f64).sqrt(), 0.0)?;
        let gate = candle_nn::ops::sigmoid(&scores)?;
        let attended = pass.round(q.add(&gate.broadcast_mul(value)?)?)?;

        let o = self.project("o_proj", &attended, positions, pass)?;
        let hidden = self.project("fc1", &o, positions, pass)?.relu()?;
        let f = pass.round(o.add(&self.project("fc2", &hidden, positions, pass)?)?)?;

        f.matmul(&self.embeddings.embeddings().t()?)?
            .affine(self.logit_scale, 0.0)
    }

    /// Summed negative log-likelihood of `labels` under `logits`
    fn summed_nll(&self, logits: &Tensor, labels: &[u32]) -> candle_core::Result<Tensor> {
        let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
        let labels = self.ids(labels)?.unsqueeze(1)?;
        log_probs.gather(&labels, 1)?.sum_all()?.neg()
    }

    /// Loss of positions `range` of an example
    fn range_loss(&self, example: &TrainingExample, range: Range<usize>, pass: &Pass<'_>) -> candle_core::Result<Tensor> {
        let (key, value) = self.encode_states(&example.source_ids, pass)?;
        let positions: Vec<usize> = range.clone().collect();
        let logits = self.decode_positions(&example.decoder_input[range.clone()], &positions, &key, &value, pass)?;
        self.summed_nll(&logits, &example.labels[range])
    }
}

impl BaseModel for ReferenceModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn parameter_groups(&self) -> Vec<ParameterGroup> {
        PROJECTION_LAYERS
            .iter()
            .filter_map(|name| self.shapes.get(*name).map(|shape| (name, shape)))
            .map(|(name, &(rows, cols))| ParameterGroup {
                name: name.to_string(),
                rows,
                cols,
                trainable: false,
            })
            .collect()
    }

    fn encode(&self, source_ids: &[u32], adapters: Option<&AdapterSet>) -> candle_core::Result<EncoderOutput> {
        let (key, value) = self.encode_states(source_ids, &Pass::inference(adapters))?;
        Ok(EncoderOutput {
            pooled: value.squeeze(0)?,
            states: vec![key, value],
        })
    }

    fn decode_step(
        &self,
        encoded: &EncoderOutput,
        prefix: &[u32],
        adapters: Option<&AdapterSet>,
    ) -> candle_core::Result<Vec<f32>> {
        let (Some(key), Some(value)) = (encoded.states.first(), encoded.states.get(1)) else {
            candle_core::bail!("encoder output has no key and value");
        };
        let Some(&token) = prefix.last() else {
            candle_core::bail!("decoder prefix is empty");
        };
        let logits = self.decode_positions(&[token], &[prefix.len() - 1], key, value, &Pass::inference(adapters))?;
        logits.squeeze(0)?.to_vec1::<f32>()
    }

    fn forward(&self, example: &TrainingExample, adapters: Option<&AdapterSet>) -> candle_core::Result<LossOutput> {
        let n = example.decoder_input.len().min(example.labels.len());
        if n == 0 {
            return Ok(LossOutput::default());
        }
        let loss = self.range_loss(example, 0..n, &Pass::inference(adapters))?;
        Ok(LossOutput {
            loss_sum: loss.to_scalar::<f32>()?,
            tokens: n,
        })
    }

    fn forward_backward(
        &self,
        example: &TrainingExample,
        adapters: &AdapterSet,
        options: &StepOptions,
        gradients: &mut AdapterGradients,
    ) -> candle_core::Result<LossOutput> {
        let pass = Pass {
            adapters: Some(adapters),
            dropout: Some(DropoutPlan {
                seed: options.dropout_seed,
                probability: adapters.dropout_probability,
            }),
            mixed_precision: options.mixed_precision,
        };

        let n = example.decoder_input.len().min(example.labels.len());
        let ranges: Vec<Range<usize>> = if options.gradient_checkpointing {
            (0..n).map(|t| t..t + 1).collect()
        } else if n > 0 {
            vec![0..n]
        } else {
            Vec::new()
        };

        let mut output = LossOutput::default();
        for range in ranges {
            let tokens = range.len();
            let loss = self.range_loss(example, range, &pass)?;
            output.loss_sum += loss.to_scalar::<f32>()?;
            output.tokens += tokens;

            let grads = loss.affine(options.gradient_scale as f64, 0.0)?.backward()?;
            gradients.accumulate(adapters, grads)?;
        }
        Ok(output)
    }

    fn activation_floats_per_token(&self, gradient_checkpointing: bool) -> usize {
        let d = self.hidden_size;
        if gradient_checkpointing {
            2 * d + self.vocab_size
        } else {
            8 * d + 3 * self.ffn_size + 2 * self.vocab_size
        }
    }
}
