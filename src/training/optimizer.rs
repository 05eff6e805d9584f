/*!
 * AdamW over the adapter variables with a warmup-cosine learning rate schedule.
 *
 * The update itself is `candle_nn::optim::AdamW`; `OptimizerState` carries
 * its hyperparameters and the update count into `optimizer_state.json`.
 */

use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use crate::model::lora::{AdapterGradients, AdapterSet};

/// Persisted optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Number of updates applied so far
    pub step: usize,
}

impl OptimizerState {
    pub fn new(weight_decay: f64) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            step: 0,
        }
    }

    fn params(&self, lr: f64) -> ParamsAdamW {
        ParamsAdamW {
            lr,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.epsilon,
            weight_decay: self.weight_decay,
        }
    }
}

/// AdamW with decoupled weight decay over every adapter variable
pub struct AdapterOptimizer {
    inner: AdamW,
    state: OptimizerState,
}

impl AdapterOptimizer {
    pub fn new(adapters: &AdapterSet, weight_decay: f64) -> candle_core::Result<Self> {
        Self::from_state(adapters, OptimizerState::new(weight_decay))
    }

    /// Resume from saved settings; moment estimates start from zero
    pub fn from_state(adapters: &AdapterSet, state: OptimizerState) -> candle_core::Result<Self> {
        let inner = AdamW::new(adapters.vars(), state.params(0.0))?;
        Ok(Self { inner, state })
    }

    /// Apply the accumulated gradients with learning rate `lr`, leaving `gradients` empty
    pub fn step(&mut self, gradients: &mut AdapterGradients, adapters: &AdapterSet, lr: f32) -> candle_core::Result<()> {
        let Some(grads) = gradients.take_grad_store(adapters) else {
            return Ok(());
        };
        self.inner.set_learning_rate(lr as f64);
        self.inner.step(&grads)?;
        self.state.step += 1;
        Ok(())
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }
}

/// Scale gradients so their global norm is at most `max_norm`; returns the norm before clipping
pub fn clip_grad_norm(gradients: &mut AdapterGradients, max_norm: f32) -> candle_core::Result<f32> {
    let norm = gradients.global_norm()?;
    if max_norm > 0.0 && norm > max_norm {
        gradients.scale(max_norm / (norm + 1e-6))?;
    }
    Ok(norm)
}

/// Linear warmup followed by cosine decay to zero
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub base_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LrSchedule {
    /// Learning rate for the update at zero-based `step`
    pub fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            return self.base_lr * step as f32 / self.warmup_steps.max(1) as f32;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f32 / decay_steps as f32).min(1.0);
        self.base_lr * 0.5 * (1.0 + (PI * progress).cos())
    }
}
