use std::collections::BTreeMap;
use std::fmt;

use burn::{
    backend::NdArray,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    prelude::*,
};

/// Number of features entering `fc1`: 16 channels over a 5x5 map.
pub const FLATTENED_FEATURES: usize = 16 * 5 * 5;

/// Configuration to create a [LeNet](LeNet) model using the [init function](LeNetConfig::init).
#[derive(Config, Debug)]
pub struct LeNetConfig {
    /// Spatial size (height, width) of the input images.
    #[config(default = "[32, 32]")]
    pub input_shape: [usize; 2],
    /// Number of output classes.
    #[config(default = 100)]
    pub num_classes: usize,
}

/// LeNet-style classifier.
///
/// Two convolution blocks (conv, relu, max pool) followed by three linear layers. The layer
/// sizes are fixed; only the number of output classes is configurable.
#[derive(Module, Debug)]
pub struct LeNet<B: Backend> {
    pub(crate) conv1: Conv2d<B>,
    pub(crate) pool1: MaxPool2d,
    pub(crate) conv2: Conv2d<B>,
    pub(crate) pool2: MaxPool2d,
    pub(crate) fc1: Linear<B>,
    pub(crate) fc2: Linear<B>,
    pub(crate) fc3: Linear<B>,
    pub(crate) activation: Relu,
}

impl LeNetConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LeNet<B> {
        LeNet {
            conv1: Conv2dConfig::new([3, 6], [5, 5]).init(device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: Conv2dConfig::new([6, 16], [5, 5]).init(device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            fc1: LinearConfig::new(FLATTENED_FEATURES, 256).init(device),
            fc2: LinearConfig::new(256, 128).init(device),
            fc3: LinearConfig::new(128, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }

    /// Number of trainable parameters, in millions, of a model built from this config.
    pub fn count_params(&self) -> f64 {
        let model = self.init::<NdArray>(&Default::default());
        model.num_params() as f64 / 1_000_000.0
    }
}

impl<B: Backend> LeNet<B> {
    /// Computes the class logits of a batch of images.
    ///
    /// # Shapes
    ///   - images: `[batch_size, 3, height, width]`
    ///   - output: `[batch_size, num_classes]`
    ///
    /// The spatial size must reduce to 5x5 after both convolution blocks (32x32 inputs do),
    /// otherwise `fc1` fails with a shape mismatch.
    pub fn forward(&self, images: Tensor<B, 4>) -> (Tensor<B, 2>, ShapeTrace) {
        let mut trace = ShapeTrace::default();

        let x = self.conv1.forward(images);
        let x = self.pool1.forward(self.activation.forward(x));
        trace.record(1, &x.dims());

        let x = self.conv2.forward(x);
        let x = self.pool2.forward(self.activation.forward(x));
        trace.record(2, &x.dims());

        let x: Tensor<B, 2> = x.flatten(1, 3);
        trace.record(3, &x.dims());

        let x = self.activation.forward(self.fc1.forward(x));
        trace.record(4, &x.dims());

        let x = self.activation.forward(self.fc2.forward(x));
        trace.record(5, &x.dims());

        let x = self.fc3.forward(x);
        trace.record(6, &x.dims());

        (x, trace)
    }
}

/// Returns the number of trainable parameters of the default LeNet, in millions.
pub fn count_model_params() -> f64 {
    LeNetConfig::new().count_params()
}

/// Tensor shapes observed at each stage of a forward pass.
///
/// Stages are numbered from 1: the two convolution blocks, the flatten, the two hidden linear
/// layers and the logits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeTrace {
    stages: BTreeMap<usize, Vec<usize>>,
}

impl ShapeTrace {
    fn record(&mut self, stage: usize, dims: &[usize]) {
        self.stages.insert(stage, dims.to_vec());
    }

    /// Shape recorded for the given stage.
    pub fn get(&self, stage: usize) -> Option<&[usize]> {
        self.stages.get(&stage).map(Vec::as_slice)
    }

    /// Number of recorded stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage was recorded.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Iterates over `(stage, shape)` in stage order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &[usize])> {
        self.stages
            .iter()
            .map(|(stage, dims)| (*stage, dims.as_slice()))
    }
}

impl fmt::Display for ShapeTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (stage, dims) in self.iter() {
            writeln!(f, "{stage}: {dims:?}")?;
        }
        Ok(())
    }
}

/// Two-class LeNet with every weight pinned, so outputs can be derived by hand.
///
/// All conv, `fc1` and `fc2` parameters are `0.01`. `fc3` maps every hidden unit to
/// `[0.0, 0.001]` with bias `[0.5, 0.0]`. An all-ones 32x32 image gives logits
/// `[0.5, 1.5118848]`, an all-zeros one `[0.5, 0.0373248]`.
#[cfg(test)]
pub(crate) fn constant_model<B: Backend>(device: &B::Device) -> LeNet<B> {
    use burn::{module::Param, nn::Initializer};

    let constant = Initializer::Constant { value: 0.01 };
    let mut model = LeNet {
        conv1: Conv2dConfig::new([3, 6], [5, 5])
            .with_initializer(constant.clone())
            .init(device),
        pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        conv2: Conv2dConfig::new([6, 16], [5, 5])
            .with_initializer(constant.clone())
            .init(device),
        pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        fc1: LinearConfig::new(FLATTENED_FEATURES, 256)
            .with_initializer(constant.clone())
            .init(device),
        fc2: LinearConfig::new(256, 128)
            .with_initializer(constant)
            .init(device),
        fc3: LinearConfig::new(128, 2).init(device),
        activation: Relu::new(),
    };

    let weight: Vec<f32> = (0..128).flat_map(|_| [0.0, 0.001]).collect();
    let weight = Tensor::<B, 2>::from_data(TensorData::new(weight, [128, 2]), device);
    let bias = Tensor::<B, 1>::from_floats([0.5, 0.0], device);

    model.fc3.weight = Param::from_tensor(weight);
    model.fc3.bias = Some(Param::from_tensor(bias));
    model
}

/// Mean cross entropy of [constant_model] on one all-ones and one all-zeros image, both
/// labelled as class 1.
#[cfg(test)]
pub(crate) fn golden_loss() -> f64 {
    let cross_entropy = |logit0: f64, logit1: f64| (logit0.exp() + logit1.exp()).ln() - logit1;

    (cross_entropy(0.5, 1.5118848) + cross_entropy(0.5, 0.0373248)) / 2.0
}
