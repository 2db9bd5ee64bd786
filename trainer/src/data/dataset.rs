use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use segmentation::palette::voc_colormap;

/// A segmentation dataset held fully in memory: one `[C, H, W]` image and
/// one `[H, W]` class map per sample.
pub struct InMemoryDataset {
    images: Vec<Array3<f32>>,
    targets: Vec<Array2<i64>>,
    num_classes: usize,
    ignore_index: i64,
    palette: Vec<[u8; 3]>,
}

impl InMemoryDataset {
    pub fn new(
        images: Vec<Array3<f32>>,
        targets: Vec<Array2<i64>>,
        num_classes: usize,
        ignore_index: i64,
    ) -> Self {
        assert_eq!(images.len(), targets.len(), "images and targets differ");
        let palette = voc_colormap(num_classes);
        Self {
            images,
            targets,
            num_classes,
            ignore_index,
            palette,
        }
    }

    /// Deterministic synthetic split. Each sample gets a banded class map
    /// and an image whose channels weakly encode the class, so a small
    /// model can actually learn something from it.
    pub fn synthetic(
        len: usize,
        channels: usize,
        num_classes: usize,
        height: usize,
        width: usize,
        ignore_index: i64,
        seed: u64,
    ) -> Self {
        let mut images = Vec::with_capacity(len);
        let mut targets = Vec::with_capacity(len);
        for sample in 0..len {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(sample as u64));
            let band = 1 + height / num_classes.min(height).max(1);
            let target = Array2::from_shape_fn((height, width), |(h, w)| {
                ((h / band + w / band + sample) % num_classes) as i64
            });
            let image = Array3::from_shape_fn((channels, height, width), |(c, h, w)| {
                let class = target[[h, w]] as usize;
                let signal = if class % channels == c { 1.0 } else { 0.0 };
                signal + rng.random_range(-0.05..0.05)
            });
            images.push(image);
            targets.push(target);
        }
        Self::new(images, targets, num_classes, ignore_index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    #[inline]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    #[inline]
    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    #[inline]
    pub fn palette(&self) -> &[[u8; 3]] {
        &self.palette
    }

    pub fn sample(&self, index: usize) -> (&Array3<f32>, &Array2<i64>) {
        (&self.images[index], &self.targets[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_split_is_deterministic() {
        let a = InMemoryDataset::synthetic(4, 3, 5, 8, 8, 255, 7);
        let b = InMemoryDataset::synthetic(4, 3, 5, 8, 8, 255, 7);
        for i in 0..4 {
            assert_eq!(a.sample(i).0, b.sample(i).0);
            assert_eq!(a.sample(i).1, b.sample(i).1);
        }
    }

    #[test]
    fn targets_stay_within_class_range() {
        let ds = InMemoryDataset::synthetic(3, 3, 4, 6, 6, 255, 0);
        for i in 0..3 {
            assert!(ds.sample(i).1.iter().all(|&c| (0..4).contains(&c)));
        }
    }
}
