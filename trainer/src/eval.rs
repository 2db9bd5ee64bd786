use segmentation::metrics::{argmax_classes, ConfusionMatrix};
use segmentation::{Criterion, SegModel};

use crate::data::ShardedLoader;

/// Runs a forward-only pass over the full validation split and returns
/// `(mean loss, mean IoU)`. The caller is responsible for putting the
/// model into eval mode first.
pub fn evaluate(
    model: &mut dyn SegModel,
    criterion: &dyn Criterion,
    loader: &mut ShardedLoader,
) -> (f32, f32) {
    loader.reset();
    let ignore_index = loader.dataset().ignore_index();
    let mut confusion = ConfusionMatrix::new(model.num_classes());
    let mut total_loss = 0.0;
    let mut batches = 0usize;
    while let Some(batch) = loader.next_batch() {
        let logits = model.forward(&batch.images);
        total_loss += criterion.loss(&logits, &batch.targets);
        let predictions = argmax_classes(&logits);
        confusion.update(&predictions, &batch.targets, ignore_index);
        batches += 1;
    }
    let mean_loss = total_loss / batches.max(1) as f32;
    (mean_loss, confusion.miou())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryDataset, ShardSpec};
    use segmentation::registry::build_model;
    use segmentation::CrossEntropyLoss;

    #[test]
    fn evaluation_is_deterministic_in_eval_mode() {
        let dataset = InMemoryDataset::synthetic(8, 3, 4, 6, 6, 255, 21);
        let mut loader = ShardedLoader::new(dataset, ShardSpec::solo(), 4, 0, false);
        let mut model = build_model("norm_linear", 3, 4, 7).unwrap();
        let criterion = CrossEntropyLoss::new(255);

        model.set_train(false);
        let (loss_a, miou_a) = evaluate(model.as_mut(), &criterion, &mut loader);
        let (loss_b, miou_b) = evaluate(model.as_mut(), &criterion, &mut loader);
        assert_eq!(loss_a, loss_b);
        assert_eq!(miou_a, miou_b);
        assert!(loss_a.is_finite());
        assert!((0.0..=1.0).contains(&miou_a));
    }
}
