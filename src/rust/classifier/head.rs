use ndarray::{Array1, Array2, ArrayView2, ArrayView4, Axis};
use rand::Rng;

use super::error::AssemblyError;
use super::layer::{Activation, LayerDescriptor, LayerKind};
use super::utils::{glorot_uniform, relu_inplace, softmax_rows};
use crate::config::HeadConfig;

/// Number of layers the head appends to a backbone.
pub const HEAD_LAYER_COUNT: usize = 4;

/// Kernel and bias of a fully connected layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseParams {
    /// `inputs x units`
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DenseParams {
    fn init<R: Rng + ?Sized>(inputs: usize, units: usize, rng: &mut R) -> Self {
        Self {
            kernel: glorot_uniform(inputs, units, rng),
            bias: Array1::zeros(units),
        }
    }

    pub fn inputs(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn units(&self) -> usize {
        self.kernel.ncols()
    }

    pub fn param_count(&self) -> usize {
        self.kernel.len() + self.bias.len()
    }

    fn apply(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(&self.kernel) + &self.bias
    }
}

/// Global average pool -> dense(ReLU) -> dropout -> dense(softmax).
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationHead {
    config: HeadConfig,
    hidden: DenseParams,
    output: DenseParams,
}

impl ClassificationHead {
    /// Creates a freshly initialized head on top of `input_channels` features.
    pub fn new<R: Rng + ?Sized>(input_channels: usize, config: HeadConfig, rng: &mut R) -> Self {
        let hidden = DenseParams::init(input_channels, config.hidden_units, rng);
        let output = DenseParams::init(config.hidden_units, config.num_classes, rng);
        Self { config, hidden, output }
    }

    /// Rebuilds a head from stored parameters, checking that the pieces fit.
    ///
    /// # Errors
    /// - `ShapeMismatch` if a kernel, bias or the config disagree on a width
    pub fn from_parts(config: HeadConfig, hidden: DenseParams, output: DenseParams) -> Result<Self, AssemblyError> {
        let checks = [
            ("hidden units", config.hidden_units, hidden.units()),
            ("hidden bias", hidden.units(), hidden.bias.len()),
            ("output inputs", hidden.units(), output.inputs()),
            ("output classes", config.num_classes, output.units()),
            ("output bias", output.units(), output.bias.len()),
        ];
        for (context, expected, actual) in checks {
            if expected != actual {
                return Err(AssemblyError::ShapeMismatch {
                    context: format!("classification head {}", context),
                    expected,
                    actual,
                });
            }
        }
        Ok(Self { config, hidden, output })
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    pub fn input_channels(&self) -> usize {
        self.hidden.inputs()
    }

    pub fn num_classes(&self) -> usize {
        self.output.units()
    }

    pub fn hidden(&self) -> &DenseParams {
        &self.hidden
    }

    pub fn output(&self) -> &DenseParams {
        &self.output
    }

    /// Mutable access for a training harness applying weight updates.
    pub fn hidden_mut(&mut self) -> &mut DenseParams {
        &mut self.hidden
    }

    pub fn output_mut(&mut self) -> &mut DenseParams {
        &mut self.output
    }

    /// Descriptors for the head's layers, all trainable.
    pub fn layers(&self) -> Vec<LayerDescriptor> {
        vec![
            LayerDescriptor::new("global_average_pooling2d", LayerKind::GlobalAveragePooling2d, 0),
            LayerDescriptor::new(
                "dense",
                LayerKind::Dense { units: self.hidden.units(), activation: Activation::Relu },
                self.hidden.param_count(),
            ),
            LayerDescriptor::new("dropout", LayerKind::Dropout { rate: self.config.dropout_rate }, 0),
            LayerDescriptor::new(
                "dense_1",
                LayerKind::Dense { units: self.output.units(), activation: Activation::Softmax },
                self.output.param_count(),
            ),
        ]
    }

    /// Averages an `N x H x W x C` feature map over its spatial axes.
    ///
    /// # Errors
    /// - `ShapeMismatch` if `C` differs from the head's input width or the
    ///   map has no spatial extent
    pub fn pool(&self, features: ArrayView4<'_, f32>) -> Result<Array2<f32>, AssemblyError> {
        let (_, h, w, c) = features.dim();
        if c != self.input_channels() {
            return Err(AssemblyError::ShapeMismatch {
                context: "feature map channels".into(),
                expected: self.input_channels(),
                actual: c,
            });
        }
        features
            .mean_axis(Axis(1))
            .and_then(|rows| rows.mean_axis(Axis(1)))
            .ok_or_else(|| AssemblyError::ShapeMismatch {
                context: "feature map spatial size".into(),
                expected: 1,
                actual: h * w,
            })
    }

    /// Class probabilities for already pooled features, dropout inactive.
    pub fn forward_pooled(&self, pooled: ArrayView2<'_, f32>) -> Result<Array2<f32>, AssemblyError> {
        self.check_pooled(pooled)?;
        let mut hidden = self.hidden.apply(pooled);
        relu_inplace(&mut hidden);
        Ok(softmax_rows(self.output.apply(hidden.view())))
    }

    /// Class probabilities for an `N x H x W x C` feature map, dropout inactive.
    pub fn forward(&self, features: ArrayView4<'_, f32>) -> Result<Array2<f32>, AssemblyError> {
        let pooled = self.pool(features)?;
        self.forward_pooled(pooled.view())
    }

    /// Training-mode forward pass with inverted dropout on the hidden layer.
    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        features: ArrayView4<'_, f32>,
        rng: &mut R,
    ) -> Result<Array2<f32>, AssemblyError> {
        let pooled = self.pool(features)?;
        let mut hidden = self.hidden.apply(pooled.view());
        relu_inplace(&mut hidden);

        let rate = self.config.dropout_rate;
        if rate > 0.0 {
            let scale = 1.0 / (1.0 - rate);
            hidden.mapv_inplace(|v| if rng.gen::<f32>() < rate { 0.0 } else { v * scale });
        }
        Ok(softmax_rows(self.output.apply(hidden.view())))
    }

    fn check_pooled(&self, pooled: ArrayView2<'_, f32>) -> Result<(), AssemblyError> {
        if pooled.ncols() != self.input_channels() {
            return Err(AssemblyError::ShapeMismatch {
                context: "pooled feature width".into(),
                expected: self.input_channels(),
                actual: pooled.ncols(),
            });
        }
        Ok(())
    }
}
