/*!
 * Low-rank adapters injected into the frozen projection layers.
 *
 * An adapted projection computes `x W^T + (alpha / r) * (x A^T) B^T`. `A`
 * starts random and `B` starts at zero, so a freshly injected adapter leaves
 * the base model's output unchanged.
 *
 * The factors are `candle_core::Var`s registered in a `VarMap` under
 * `<layer>.lora_A` / `<layer>.lora_B`; the map is what the optimizer updates
 * and what a checkpoint writes as safetensors.
 */

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::PoisonError;

use crate::app_config::LoraConfig;
use crate::errors::ModelLoadError;

use super::{derive_seed, BaseModel};

pub const LORA_A_SUFFIX: &str = "lora_A";
pub const LORA_B_SUFFIX: &str = "lora_B";

/// Name of one adapter factor in the var map
pub fn var_name(layer: &str, suffix: &str) -> String {
    format!("{}.{}", layer, suffix)
}

/// The two low-rank factors of one projection
#[derive(Debug, Clone)]
pub struct LoraWeights {
    /// Down projection, `r x in`
    pub lora_a: Var,
    /// Up projection, `out x r`
    pub lora_b: Var,
}

/// Adapters for every targeted projection
///
/// Cloning an `AdapterSet` shares the underlying variables; use `deep_copy`
/// for an independent snapshot.
#[derive(Clone)]
pub struct AdapterSet {
    pub rank: usize,
    pub scaling_factor: f32,
    pub dropout_probability: f32,
    pub layers: BTreeMap<String, LoraWeights>,
    varmap: VarMap,
}

impl AdapterSet {
    /// Create adapters for `target_layers` of a base model
    ///
    /// Only the returned adapter weights are trainable; the base model is
    /// never mutated.
    pub fn inject(
        base: &dyn BaseModel,
        config: &LoraConfig,
        seed: u64,
    ) -> Result<Self, ModelLoadError> {
        let shapes = projection_shapes(base);
        let device = base.device();

        let mut factors = BTreeMap::new();
        for layer in &config.target_modules {
            let &(out_dim, in_dim) = shapes.get(layer).ok_or_else(|| {
                ModelLoadError::Incompatible(format!("base model has no projection named '{}'", layer))
            })?;

            let mut rng = StdRng::seed_from_u64(derive_seed(&[&seed.to_string(), LORA_A_SUFFIX, layer]));
            let bound = 1.0 / (in_dim as f32).sqrt();
            let values: Vec<f32> = (0..config.r * in_dim)
                .map(|_| rng.random_range(-bound..bound))
                .collect();
            let lora_a = Tensor::from_vec(values, (config.r, in_dim), device)?;
            let lora_b = Tensor::zeros((out_dim, config.r), DType::F32, device)?;
            factors.insert(layer.clone(), (lora_a, lora_b));
        }

        Ok(Self::from_tensors(
            config.r,
            config.lora_alpha,
            config.lora_dropout,
            factors,
        )?)
    }

    /// Adapters over existing factor values; every factor becomes a fresh variable
    pub fn from_tensors(
        rank: usize,
        scaling_factor: f32,
        dropout_probability: f32,
        factors: BTreeMap<String, (Tensor, Tensor)>,
    ) -> candle_core::Result<Self> {
        let varmap = VarMap::new();
        let mut layers = BTreeMap::new();
        {
            let mut data = varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
            for (layer, (a, b)) in factors {
                let lora_a = Var::from_tensor(&a.to_dtype(DType::F32)?)?;
                let lora_b = Var::from_tensor(&b.to_dtype(DType::F32)?)?;
                data.insert(var_name(&layer, LORA_A_SUFFIX), lora_a.clone());
                data.insert(var_name(&layer, LORA_B_SUFFIX), lora_b.clone());
                layers.insert(layer, LoraWeights { lora_a, lora_b });
            }
        }

        Ok(Self {
            rank,
            scaling_factor,
            dropout_probability,
            layers,
            varmap,
        })
    }

    /// Independent copy of the current values
    pub fn deep_copy(&self) -> candle_core::Result<Self> {
        let mut factors = BTreeMap::new();
        for (layer, weights) in &self.layers {
            factors.insert(
                layer.clone(),
                (weights.lora_a.as_tensor().copy()?, weights.lora_b.as_tensor().copy()?),
            );
        }
        Self::from_tensors(self.rank, self.scaling_factor, self.dropout_probability, factors)
    }

    /// Multiplier applied to `(x A^T) B^T`
    pub fn scaling(&self) -> f32 {
        self.scaling_factor / self.rank as f32
    }

    pub fn get(&self, layer: &str) -> Option<&LoraWeights> {
        self.layers.get(layer)
    }

    pub fn target_layers(&self) -> Vec<String> {
        self.layers.keys().cloned().collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.layers
            .values()
            .map(|w| w.lora_a.elem_count() + w.lora_b.elem_count())
            .sum()
    }

    pub fn device(&self) -> Device {
        self.layers
            .values()
            .next()
            .map(|w| w.lora_a.device().clone())
            .unwrap_or(Device::Cpu)
    }

    /// Every trainable variable
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Trainable variables by name in a stable order
    pub fn named_vars(&self) -> Vec<(String, &Var)> {
        let mut vars = Vec::with_capacity(self.layers.len() * 2);
        for (layer, weights) in &self.layers {
            vars.push((var_name(layer, LORA_A_SUFFIX), &weights.lora_a));
            vars.push((var_name(layer, LORA_B_SUFFIX), &weights.lora_b));
        }
        vars
    }

    /// Flattened values of one factor
    pub fn values(&self, name: &str) -> candle_core::Result<Option<Vec<f32>>> {
        match self.named_vars().into_iter().find(|(n, _)| n == name) {
            Some((_, var)) => Ok(Some(var.flatten_all()?.to_vec1::<f32>()?)),
            None => Ok(None),
        }
    }

    /// Empty gradient accumulator
    pub fn zero_gradients(&self) -> AdapterGradients {
        AdapterGradients::default()
    }

    /// Write every factor as safetensors
    pub fn save<P: AsRef<Path>>(&self, path: P) -> candle_core::Result<()> {
        self.varmap.save(path)
    }

    /// Check the adapters fit a base model
    pub fn check_compatible(&self, base: &dyn BaseModel) -> Result<(), ModelLoadError> {
        let shapes = projection_shapes(base);

        for (name, weights) in &self.layers {
            let (out_dim, in_dim) = *shapes.get(name).ok_or_else(|| {
                ModelLoadError::Incompatible(format!("base model has no projection named '{}'", name))
            })?;
            let expected_a = (self.rank, in_dim);
            let expected_b = (out_dim, self.rank);
            let actual_a = weights.lora_a.dims2()?;
            let actual_b = weights.lora_b.dims2()?;
            if actual_a != expected_a || actual_b != expected_b {
                return Err(ModelLoadError::Incompatible(format!(
                    "adapter '{}' has shapes {:?}/{:?}, expected {:?}/{:?}",
                    name, actual_a, actual_b, expected_a, expected_b
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("rank", &self.rank)
            .field("scaling_factor", &self.scaling_factor)
            .field("dropout_probability", &self.dropout_probability)
            .field("layers", &self.target_layers())
            .finish_non_exhaustive()
    }
}

impl PartialEq for AdapterSet {
    fn eq(&self, other: &Self) -> bool {
        if self.rank != other.rank
            || self.scaling_factor != other.scaling_factor
            || self.dropout_probability != other.dropout_probability
            || self.target_layers() != other.target_layers()
        {
            return false;
        }
        self.named_vars()
            .into_iter()
            .zip(other.named_vars())
            .all(|((_, a), (_, b))| match (a.flatten_all(), b.flatten_all()) {
                (Ok(a), Ok(b)) => a.to_vec1::<f32>().ok() == b.to_vec1::<f32>().ok(),
                _ => false,
            })
    }
}

fn projection_shapes(base: &dyn BaseModel) -> BTreeMap<String, (usize, usize)> {
    base.parameter_groups()
        .into_iter()
        .map(|group| (group.name, (group.rows, group.cols)))
        .collect()
}

/// Adapter gradients summed over the micro-batches of one optimizer step
#[derive(Default)]
pub struct AdapterGradients {
    sums: BTreeMap<String, Tensor>,
    // @field: Store of the latest backward pass, reused to hand the sums to the optimizer
    store: Option<GradStore>,
}

impl AdapterGradients {
    /// Add the adapter gradients of one backward pass
    pub fn accumulate(&mut self, adapters: &AdapterSet, grads: GradStore) -> candle_core::Result<()> {
        for (name, var) in adapters.named_vars() {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let sum = match self.sums.get(&name) {
                Some(sum) => sum.add(grad)?,
                None => grad.copy()?,
            };
            self.sums.insert(name, sum);
        }
        self.store = Some(grads);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.sums.get(name)
    }

    /// Summed gradients by variable name
    pub fn named(&self) -> Vec<(String, &Tensor)> {
        self.sums.iter().map(|(name, grad)| (name.clone(), grad)).collect()
    }

    pub fn global_norm(&self) -> candle_core::Result<f32> {
        let mut total = 0.0f32;
        for grad in self.sums.values() {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
        Ok(total.sqrt())
    }

    pub fn scale(&mut self, factor: f32) -> candle_core::Result<()> {
        for grad in self.sums.values_mut() {
            *grad = grad.affine(factor as f64, 0.0)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.sums.clear();
        self.store = None;
    }

    /// Gradient store carrying the summed gradients, leaving the accumulator empty
    pub fn take_grad_store(&mut self, adapters: &AdapterSet) -> Option<GradStore> {
        let mut store = self.store.take()?;
        for (name, var) in adapters.named_vars() {
            match self.sums.remove(&name) {
                Some(sum) => {
                    store.insert(var.as_tensor(), sum);
                }
                None => {
                    store.remove(var.as_tensor());
                }
            }
        }
        self.sums.clear();
        Some(store)
    }
}
