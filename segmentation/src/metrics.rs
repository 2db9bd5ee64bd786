//! Confusion-matrix based quality metric (mean intersection over union).

use ndarray::{Array3, Array4};

/// A `K x K` confusion matrix accumulated over prediction/target maps.
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    /// Accumulates one batch of predicted and target class maps.
    /// Pixels whose target equals `ignore_index` are skipped.
    pub fn update(&mut self, pred: &Array3<i64>, target: &Array3<i64>, ignore_index: i64) {
        debug_assert_eq!(pred.dim(), target.dim());
        let k = self.num_classes as i64;

        for (&p, &t) in pred.iter().zip(target.iter()) {
            if t == ignore_index || !(0..k).contains(&t) || !(0..k).contains(&p) {
                continue;
            }
            self.counts[t as usize * self.num_classes + p as usize] += 1;
        }
    }

    /// Mean IoU over classes that appear in either predictions or
    /// targets; classes with an empty union are excluded from the mean.
    pub fn miou(&self) -> f32 {
        let k = self.num_classes;
        let mut sum = 0.0f64;
        let mut present = 0usize;

        for c in 0..k {
            let tp = self.counts[c * k + c];
            let row: u64 = (0..k).map(|j| self.counts[c * k + j]).sum();
            let col: u64 = (0..k).map(|i| self.counts[i * k + c]).sum();
            let union = row + col - tp;
            if union > 0 {
                sum += tp as f64 / union as f64;
                present += 1;
            }
        }

        if present == 0 {
            0.0
        } else {
            (sum / present as f64) as f32
        }
    }
}

/// Collapses logits `[N, K, H, W]` to predicted class maps `[N, H, W]`.
pub fn argmax_classes(logits: &Array4<f32>) -> Array3<i64> {
    let (n, k, h, w) = logits.dim();
    Array3::from_shape_fn((n, h, w), |(ni, hi, wi)| {
        let mut best = 0usize;
        let mut best_val = logits[[ni, 0, hi, wi]];
        for ki in 1..k {
            let v = logits[[ni, ki, hi, wi]];
            if v > best_val {
                best_val = v;
                best = ki;
            }
        }
        best as i64
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_prediction_is_miou_one() {
        let target = Array3::from_shape_fn((1, 2, 2), |(_, hi, wi)| ((hi + wi) % 2) as i64);
        let mut cm = ConfusionMatrix::new(2);
        cm.update(&target.clone(), &target, 255);
        assert_eq!(cm.miou(), 1.0);
    }

    #[test]
    fn known_confusion_matrix_value() {
        // Targets: two class-0 pixels, two class-1 pixels.
        // Predictions: one of each pair wrong.
        let target = ndarray::arr3(&[[[0i64, 0], [1, 1]]]);
        let pred = ndarray::arr3(&[[[0i64, 1], [1, 0]]]);

        let mut cm = ConfusionMatrix::new(2);
        cm.update(&pred, &target, 255);

        // Each class: tp = 1, union = 3 -> IoU = 1/3.
        assert!((cm.miou() - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn ignored_targets_are_skipped() {
        let target = ndarray::arr3(&[[[0i64, 255], [255, 255]]]);
        let pred = ndarray::arr3(&[[[0i64, 1], [1, 1]]]);

        let mut cm = ConfusionMatrix::new(2);
        cm.update(&pred, &target, 255);
        assert_eq!(cm.miou(), 1.0);
    }

    #[test]
    fn argmax_picks_the_strongest_class() {
        let mut logits = Array4::<f32>::zeros((1, 3, 1, 2));
        logits[[0, 2, 0, 0]] = 1.0;
        logits[[0, 1, 0, 1]] = 2.0;

        let pred = argmax_classes(&logits);
        assert_eq!(pred[[0, 0, 0]], 2);
        assert_eq!(pred[[0, 0, 1]], 1);
    }
}
