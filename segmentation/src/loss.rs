//! Pixel-wise cross-entropy with an ignore index.

use ndarray::{Array3, Array4};

use crate::Criterion;

/// Mean negative log-likelihood over valid pixels; pixels whose target
/// equals `ignore_index` contribute neither loss nor gradient.
pub struct CrossEntropyLoss {
    ignore_index: i64,
}

impl CrossEntropyLoss {
    pub fn new(ignore_index: i64) -> Self {
        Self { ignore_index }
    }
}

impl Criterion for CrossEntropyLoss {
    fn loss_grad(&self, logits: &Array4<f32>, targets: &Array3<i64>) -> (f32, Array4<f32>) {
        let (n, k, h, w) = logits.dim();
        debug_assert_eq!(targets.dim(), (n, h, w));

        let mut grad = Array4::<f32>::zeros((n, k, h, w));
        let mut valid = 0usize;

        for ni in 0..n {
            for hi in 0..h {
                for wi in 0..w {
                    let t = targets[[ni, hi, wi]];
                    if t != self.ignore_index && (0..k as i64).contains(&t) {
                        valid += 1;
                    }
                }
            }
        }
        if valid == 0 {
            return (0.0, grad);
        }

        let inv_valid = 1.0 / valid as f32;
        let mut loss = 0.0f64;
        let mut probs = vec![0.0f32; k];

        for ni in 0..n {
            for hi in 0..h {
                for wi in 0..w {
                    let t = targets[[ni, hi, wi]];
                    if t == self.ignore_index || !(0..k as i64).contains(&t) {
                        continue;
                    }
                    let t = t as usize;

                    // Stable softmax over the class axis.
                    let mut max = f32::NEG_INFINITY;
                    for ki in 0..k {
                        max = max.max(logits[[ni, ki, hi, wi]]);
                    }
                    let mut sum = 0.0f32;
                    for ki in 0..k {
                        let e = (logits[[ni, ki, hi, wi]] - max).exp();
                        probs[ki] = e;
                        sum += e;
                    }
                    for p in probs.iter_mut() {
                        *p /= sum;
                    }

                    loss -= f64::from(probs[t].max(f32::MIN_POSITIVE).ln());
                    for ki in 0..k {
                        let indicator = if ki == t { 1.0 } else { 0.0 };
                        grad[[ni, ki, hi, wi]] = (probs[ki] - indicator) * inv_valid;
                    }
                }
            }
        }

        ((loss * f64::from(inv_valid)) as f32, grad)
    }
}
