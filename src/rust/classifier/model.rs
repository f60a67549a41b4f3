use std::fmt;
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2, ArrayView4};
use serde::{Deserialize, Serialize};

use super::backbone::{BackboneSpec, FeatureExtractor};
use super::checkpoint;
use super::error::AssemblyError;
use super::head::{ClassificationHead, HEAD_LAYER_COUNT};
use super::layer::{self, LayerDescriptor};
use crate::loss::{categorical_accuracy, LossSpec};

/// Adam hyperparameters. The defaults match the common reference values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-7,
        }
    }
}

/// The optimizer an external harness should use to update the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adam(AdamConfig),
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self::Adam(AdamConfig::default())
    }
}

impl fmt::Display for OptimizerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adam(config) => write!(f, "adam(lr={})", config.learning_rate),
        }
    }
}

/// Metrics tracked alongside the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Accuracy,
}

/// Loss, optimizer and metrics a model is compiled with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileSpec {
    pub loss: LossSpec,
    pub optimizer: OptimizerSpec,
    pub metrics: Vec<Metric>,
}

impl Default for CompileSpec {
    fn default() -> Self {
        Self {
            loss: LossSpec::CategoricalCrossentropy,
            optimizer: OptimizerSpec::default(),
            metrics: vec![Metric::Accuracy],
        }
    }
}

impl CompileSpec {
    pub fn with_loss(mut self, loss: LossSpec) -> Self {
        self.loss = loss;
        self
    }

    /// Checks the loss can be built and fits `num_classes`.
    pub(crate) fn validate(&self, num_classes: usize) -> Result<(), AssemblyError> {
        let loss = self.loss.build().map_err(|e| AssemblyError::InvalidConfig(e.to_string()))?;
        if let LossSpec::WeightedCategoricalCrossentropy { weights } = &self.loss {
            if weights.len() != num_classes {
                return Err(AssemblyError::InvalidConfig(format!(
                    "{} expects {} class weights, got {}",
                    loss.name(),
                    num_classes,
                    weights.len()
                )));
            }
        }
        Ok(())
    }
}

/// Mean loss and metric values over an evaluated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f32,
    pub metrics: Vec<(Metric, f32)>,
}

/// A backbone plus classification head, annotated with how it is to be
/// trained.
///
/// The layer list is ordered input to output: the backbone's layers followed
/// by the four head layers. Trainability flags live on the descriptors; an
/// external harness reads them to decide which parameters to update.
#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub(crate) backbone_spec: BackboneSpec,
    pub(crate) backbone: Option<Arc<dyn FeatureExtractor>>,
    pub(crate) layers: Vec<LayerDescriptor>,
    pub(crate) head: ClassificationHead,
    pub(crate) compile: CompileSpec,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<CompiledModel>();
    }
};

impl CompiledModel {
    pub(crate) fn new(
        backbone_spec: BackboneSpec,
        backbone: Option<Arc<dyn FeatureExtractor>>,
        head: ClassificationHead,
        compile: CompileSpec,
    ) -> Self {
        let mut layers = backbone_spec.layers.clone();
        layers.extend(head.layers());
        Self { backbone_spec, backbone, layers, head, compile }
    }

    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&LayerDescriptor> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Layers belonging to the feature extractor.
    pub fn backbone_layers(&self) -> &[LayerDescriptor] {
        &self.layers[..self.backbone_layer_count()]
    }

    /// Layers belonging to the classification head.
    pub fn head_layers(&self) -> &[LayerDescriptor] {
        &self.layers[self.backbone_layer_count()..]
    }

    pub fn backbone_layer_count(&self) -> usize {
        self.layers.len() - HEAD_LAYER_COUNT
    }

    pub fn backbone_spec(&self) -> &BackboneSpec {
        &self.backbone_spec
    }

    pub fn backbone(&self) -> Option<&Arc<dyn FeatureExtractor>> {
        self.backbone.as_ref()
    }

    /// Attaches a feature extractor, e.g. after loading a detached checkpoint.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the extractor's output width differs from the
    ///   head's input width
    pub fn attach_backbone(&mut self, backbone: Arc<dyn FeatureExtractor>) -> Result<(), AssemblyError> {
        let channels = backbone.spec().output_channels;
        if channels != self.head.input_channels() {
            return Err(AssemblyError::ShapeMismatch {
                context: "backbone output channels".into(),
                expected: self.head.input_channels(),
                actual: channels,
            });
        }
        self.backbone = Some(backbone);
        Ok(())
    }

    pub fn head(&self) -> &ClassificationHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut ClassificationHead {
        &mut self.head
    }

    pub fn compile_spec(&self) -> &CompileSpec {
        &self.compile
    }

    /// Replaces the loss, optimizer and metrics.
    ///
    /// # Errors
    /// - `InvalidConfig` if the loss cannot be built for the head's classes
    pub fn compile(&mut self, spec: CompileSpec) -> Result<(), AssemblyError> {
        spec.validate(self.head.num_classes())?;
        self.compile = spec;
        Ok(())
    }

    /// Sets `trainable = value` on layers `[from, to)`.
    pub fn set_trainable(&mut self, from: usize, to: usize, value: bool) -> Result<(), AssemblyError> {
        layer::set_trainable(&mut self.layers, from, to, value)
    }

    /// Makes the last `count` layers trainable, leaving earlier layers as
    /// they are. Returns the index of the first unfrozen layer.
    pub fn unfreeze_last(&mut self, count: usize) -> usize {
        let len = self.layers.len();
        let from = layer::tail_start(len, count);
        for layer in &mut self.layers[from..] {
            layer.trainable = true;
        }
        from
    }

    pub fn trainable_layer_count(&self) -> usize {
        self.layers.iter().filter(|l| l.trainable).count()
    }

    /// `(trainable, non_trainable)` parameter totals.
    pub fn parameter_counts(&self) -> (usize, usize) {
        self.layers.iter().fold((0, 0), |(t, n), l| {
            if l.trainable { (t + l.params, n) } else { (t, n + l.params) }
        })
    }

    /// Class probabilities for a batch of preprocessed `N x H x W x C` images.
    ///
    /// # Errors
    /// - `NoBackbone` if the model was loaded without its feature extractor
    /// - any error from the backbone or the head
    pub fn predict(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>, AssemblyError> {
        let backbone = self.backbone.as_ref().ok_or(AssemblyError::NoBackbone)?;
        let features = backbone.extract(images)?;
        self.head.forward(features.view())
    }

    /// Class probabilities for a precomputed backbone feature map.
    pub fn predict_features(&self, features: ArrayView4<'_, f32>) -> Result<Array2<f32>, AssemblyError> {
        self.head.forward(features)
    }

    /// Mean compiled loss and compiled metrics over a feature batch.
    pub fn evaluate_features(
        &self,
        features: ArrayView4<'_, f32>,
        y_true: ArrayView2<'_, f32>,
    ) -> Result<Evaluation, AssemblyError> {
        let y_pred = self.predict_features(features)?;
        let loss = self.compile.loss.build()?.mean(y_true, y_pred.view())?;
        let mut metrics = Vec::with_capacity(self.compile.metrics.len());
        for metric in &self.compile.metrics {
            let value = match metric {
                Metric::Accuracy => categorical_accuracy(y_true, y_pred.view())?,
            };
            metrics.push((*metric, value));
        }
        Ok(Evaluation { loss, metrics })
    }

    /// Persists the model as a JSON checkpoint.
    ///
    /// The checkpoint records the layer list with its trainability flags,
    /// the head weights, the compile spec and the path of the backbone
    /// weights file. Backbone weights themselves are not written: the
    /// backbone is re-attached from that file on load, so updates a training
    /// harness made to trainable backbone layers (the unfrozen variant, or
    /// the backbone layers unfrozen for a second pass) are not preserved.
    /// Persist those weights alongside, e.g. by re-exporting the ONNX graph.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), AssemblyError> {
        checkpoint::save(self, path.as_ref())
    }

    pub fn summary(&self) -> ModelSummary<'_> {
        ModelSummary { model: self }
    }
}

/// Layer table and parameter totals, printable with `{}`.
pub struct ModelSummary<'a> {
    model: &'a CompiledModel,
}

impl fmt::Display for ModelSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let model = self.model;
        writeln!(f, "Model: {} + classification head", model.backbone_spec.name)?;
        writeln!(f, "{:<4} {:<32} {:<24} {:>10} {:>9}", "#", "Layer", "Type", "Params", "Trainable")?;
        for (i, layer) in model.layers.iter().enumerate() {
            writeln!(
                f,
                "{:<4} {:<32} {:<24} {:>10} {:>9}",
                i, layer.name, layer.kind.to_string(), layer.params, layer.trainable
            )?;
        }
        let (trainable, frozen) = model.parameter_counts();
        writeln!(f, "Total params: {}", trainable + frozen)?;
        writeln!(f, "Trainable params: {}", trainable)?;
        writeln!(f, "Non-trainable params: {}", frozen)?;
        write!(
            f,
            "Loss: {} | Optimizer: {} | Metrics: {:?}",
            model.compile.loss, model.compile.optimizer, model.compile.metrics
        )
    }
}
