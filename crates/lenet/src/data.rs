use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::dataset::ImageItem;

// CIFAR-100 mean and std values
const MEAN: [f32; 3] = [0.5071, 0.4865, 0.4409];
const STD: [f32; 3] = [0.2673, 0.2564, 0.2762];

/// Normalizer for the CIFAR-100 dataset.
#[derive(Clone, Debug)]
pub struct Normalizer<B: Backend> {
    pub mean: Tensor<B, 4>,
    pub std: Tensor<B, 4>,
}

impl<B: Backend> Normalizer<B> {
    /// Creates a new normalizer.
    pub fn new(device: &B::Device) -> Self {
        let mean = Tensor::<B, 1>::from_floats(MEAN, device).reshape([1, 3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(STD, device).reshape([1, 3, 1, 1]);
        Self { mean, std }
    }

    /// Normalizes the input image according to the CIFAR-100 channel statistics.
    ///
    /// The input image should be in the range [0, 1].
    ///
    /// `output = (input - mean) / std`
    pub fn normalize(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        (input - self.mean.clone()) / self.std.clone()
    }
}

/// Turns [image items](ImageItem) into a [classification batch](ClassificationBatch).
#[derive(Clone, Debug)]
pub struct ClassificationBatcher<B: Backend> {
    device: B::Device,
    input_shape: [usize; 2],
    normalizer: Option<Normalizer<B>>,
}

#[derive(Clone, Debug)]
pub struct ClassificationBatch<B: Backend> {
    /// Images with shape `[batch_size, 3, height, width]`.
    pub images: Tensor<B, 4>,
    /// Class indices with shape `[batch_size]`.
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ClassificationBatcher<B> {
    /// Batcher scaling pixels to [0, 1] and normalizing each channel.
    pub fn new(device: B::Device, input_shape: [usize; 2]) -> Self {
        Self {
            normalizer: Some(Normalizer::new(&device)),
            device,
            input_shape,
        }
    }

    /// Batcher only scaling pixels to [0, 1].
    pub fn raw(device: B::Device, input_shape: [usize; 2]) -> Self {
        Self {
            normalizer: None,
            device,
            input_shape,
        }
    }
}

impl<B: Backend> Batcher<ImageItem, ClassificationBatch<B>> for ClassificationBatcher<B> {
    fn batch(&self, items: Vec<ImageItem>) -> ClassificationBatch<B> {
        let [height, width] = self.input_shape;

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data(
                    TensorData::from([(item.label as i64).elem::<B::IntElem>()]),
                    &self.device,
                )
            })
            .collect();

        let images = items
            .into_iter()
            .map(|item| {
                assert_eq!(
                    item.image.len(),
                    3 * height * width,
                    "Image of {} bytes does not match the {height}x{width} input shape",
                    item.image.len()
                );
                TensorData::new(item.image, Shape::new([3, height, width]))
            })
            .map(|data| Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device))
            .map(|tensor| tensor / 255)
            .collect();

        let images = Tensor::stack(images, 0);
        let targets = Tensor::cat(targets, 0);

        let images = match &self.normalizer {
            Some(normalizer) => normalizer.normalize(images),
            None => images,
        };

        ClassificationBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::cast::ToElement;

    fn item(pixel: u8, label: u8) -> ImageItem {
        ImageItem {
            image: vec![pixel; 3 * 32 * 32],
            label,
        }
    }

    #[test]
    fn raw_batch_scales_pixels() {
        let batcher = ClassificationBatcher::<TestBackend>::raw(Default::default(), [32, 32]);

        let batch = batcher.batch(vec![item(255, 4), item(0, 9), item(51, 0)]);

        assert_eq!(batch.images.dims(), [3, 3, 32, 32]);
        assert_eq!(
            batch.targets.into_data().to_vec::<i64>().unwrap(),
            vec![4, 9, 0]
        );

        let means = batch
            .images
            .mean_dim(3)
            .mean_dim(2)
            .mean_dim(1)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!((means[0] - 1.0).abs() < 1e-6);
        assert!(means[1].abs() < 1e-6);
        assert!((means[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn normalized_batch_uses_channel_statistics() {
        let batcher = ClassificationBatcher::<TestBackend>::new(Default::default(), [32, 32]);

        let batch = batcher.batch(vec![item(255, 1)]);

        for (channel, (mean, std)) in MEAN.iter().zip(STD).enumerate() {
            let value = batch
                .images
                .clone()
                .slice([0..1, channel..channel + 1, 0..1, 0..1])
                .into_scalar()
                .to_f32();
            assert!((value - (1.0 - mean) / std).abs() < 1e-4);
        }
    }

    #[test]
    fn channels_are_kept_apart() {
        let batcher = ClassificationBatcher::<TestBackend>::raw(Default::default(), [2, 2]);
        let image = vec![0, 0, 0, 0, 255, 255, 255, 255, 0, 0, 0, 0];

        let batch = batcher.batch(vec![ImageItem { image, label: 0 }]);

        let sums = batch
            .images
            .sum_dim(3)
            .sum_dim(2)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(sums, vec![0.0, 4.0, 0.0]);
    }

    #[test]
    #[should_panic = "does not match the 28x28 input shape"]
    fn image_size_must_match_input_shape() {
        let batcher = ClassificationBatcher::<TestBackend>::raw(Default::default(), [28, 28]);

        batcher.batch(vec![item(0, 0)]);
    }
}
