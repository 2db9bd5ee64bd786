//! The reference model: per-channel input normalization with running
//! statistics followed by a per-pixel linear classifier.
//!
//! Deliberately minimal; it exists so the orchestration layer has a real
//! model to drive, not to be a competitive architecture. Parameters and
//! gradients live in one flat buffer: weight `[K, C]` first, bias `[K]`
//! after it.

use ndarray::Array4;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    state::{fetch, TensorData},
    ModelError, SegModel, StateDict,
};

const MOMENTUM: f32 = 0.1;
const EPS: f32 = 1e-5;
const INIT_RANGE: f32 = 0.1;

pub struct NormLinearModel {
    in_channels: usize,
    num_classes: usize,
    params: Vec<f32>,
    grads: Vec<f32>,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
    training: bool,
    norm_frozen: bool,
    /// Normalized input of the last train-mode forward, consumed by
    /// the next backward so both passes use the same statistics.
    cache: Option<Array4<f32>>,
}

impl NormLinearModel {
    pub fn new(in_channels: usize, num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weight_len = num_classes * in_channels;

        let mut params = Vec::with_capacity(weight_len + num_classes);
        params.extend((0..weight_len).map(|_| rng.random_range(-INIT_RANGE..INIT_RANGE)));
        params.extend(std::iter::repeat(0.0).take(num_classes));

        Self {
            in_channels,
            num_classes,
            grads: vec![0.0; params.len()],
            params,
            running_mean: vec![0.0; in_channels],
            running_var: vec![1.0; in_channels],
            training: true,
            norm_frozen: false,
            cache: None,
        }
    }

    #[inline]
    fn weight_len(&self) -> usize {
        self.num_classes * self.in_channels
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn norm_frozen(&self) -> bool {
        self.norm_frozen
    }

    /// Normalizes with the given per-channel statistics.
    fn normalize_with(&self, images: &Array4<f32>, mean: &[f32], var: &[f32]) -> Array4<f32> {
        let mut out = images.clone();
        for (c, mut channel) in out.axis_iter_mut(ndarray::Axis(1)).enumerate() {
            let inv_std = 1.0 / (var[c] + EPS).sqrt();
            channel.mapv_inplace(|x| (x - mean[c]) * inv_std);
        }
        out
    }

    /// Per-channel mean and variance over the batch and spatial axes.
    fn batch_stats(images: &Array4<f32>) -> (Vec<f32>, Vec<f32>) {
        let channels = images.shape()[1];
        let mut mean = Vec::with_capacity(channels);
        let mut var = Vec::with_capacity(channels);

        for c in 0..channels {
            let channel = images.index_axis(ndarray::Axis(1), c);
            let count = channel.len() as f32;
            let m = channel.sum() / count;
            let v = channel.mapv(|x| (x - m) * (x - m)).sum() / count;
            mean.push(m);
            var.push(v);
        }

        (mean, var)
    }
}

impl SegModel for NormLinearModel {
    fn forward(&mut self, images: &Array4<f32>) -> Array4<f32> {
        let (n, c, h, w) = images.dim();
        debug_assert_eq!(c, self.in_channels);
        let k = self.num_classes;

        let normalized = if self.training && !self.norm_frozen {
            let (mean, var) = Self::batch_stats(images);
            for ch in 0..c {
                self.running_mean[ch] =
                    (1.0 - MOMENTUM) * self.running_mean[ch] + MOMENTUM * mean[ch];
                self.running_var[ch] =
                    (1.0 - MOMENTUM) * self.running_var[ch] + MOMENTUM * var[ch];
            }
            self.normalize_with(images, &mean, &var)
        } else {
            self.normalize_with(images, &self.running_mean, &self.running_var)
        };

        let weight = &self.params[..self.weight_len()];
        let bias = &self.params[self.weight_len()..];

        let mut logits = Array4::<f32>::zeros((n, k, h, w));
        for ni in 0..n {
            for ki in 0..k {
                for hi in 0..h {
                    for wi in 0..w {
                        let mut acc = bias[ki];
                        for ci in 0..c {
                            acc += weight[ki * c + ci] * normalized[[ni, ci, hi, wi]];
                        }
                        logits[[ni, ki, hi, wi]] = acc;
                    }
                }
            }
        }

        if self.training {
            self.cache = Some(normalized);
        }
        logits
    }

    fn backward(&mut self, images: &Array4<f32>, grad_logits: &Array4<f32>) {
        let normalized = match self.cache.take() {
            Some(x) if x.dim() == images.dim() => x,
            _ => self.normalize_with(images, &self.running_mean, &self.running_var),
        };

        let (n, k, h, w) = grad_logits.dim();
        let c = self.in_channels;
        let weight_len = self.weight_len();
        let (grad_weight, grad_bias) = self.grads.split_at_mut(weight_len);

        for ni in 0..n {
            for ki in 0..k {
                for hi in 0..h {
                    for wi in 0..w {
                        let g = grad_logits[[ni, ki, hi, wi]];
                        grad_bias[ki] += g;
                        for ci in 0..c {
                            grad_weight[ki * c + ci] += g * normalized[[ni, ci, hi, wi]];
                        }
                    }
                }
            }
        }
    }

    fn zero_grad(&mut self) {
        self.grads.fill(0.0);
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn grads_mut(&mut self) -> &mut [f32] {
        &mut self.grads
    }

    fn params_and_grads_mut(&mut self) -> (&mut [f32], &[f32]) {
        let Self { params, grads, .. } = self;
        (params.as_mut_slice(), grads.as_slice())
    }

    fn state_dict(&self) -> StateDict {
        let weight_len = self.weight_len();
        let mut state = StateDict::new();
        state.insert(
            "weight".into(),
            TensorData::new(
                vec![self.num_classes, self.in_channels],
                self.params[..weight_len].to_vec(),
            ),
        );
        state.insert(
            "bias".into(),
            TensorData::new(vec![self.num_classes], self.params[weight_len..].to_vec()),
        );
        state.insert(
            "running_mean".into(),
            TensorData::new(vec![self.in_channels], self.running_mean.clone()),
        );
        state.insert(
            "running_var".into(),
            TensorData::new(vec![self.in_channels], self.running_var.clone()),
        );
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        let weight_len = self.weight_len();
        let weight = fetch(state, "weight", &[self.num_classes, self.in_channels])?;
        let bias = fetch(state, "bias", &[self.num_classes])?;
        let mean = fetch(state, "running_mean", &[self.in_channels])?;
        let var = fetch(state, "running_var", &[self.in_channels])?;

        self.params[..weight_len].copy_from_slice(&weight.data);
        self.params[weight_len..].copy_from_slice(&bias.data);
        self.running_mean.copy_from_slice(&mean.data);
        self.running_var.copy_from_slice(&var.data);
        self.cache = None;
        Ok(())
    }

    fn freeze_norm(&mut self) {
        self.norm_frozen = true;
    }

    fn set_train(&mut self, train: bool) {
        self.training = train;
        if !train {
            self.cache = None;
        }
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}
