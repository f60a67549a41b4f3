use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use ndarray::{Array4, ArrayView4, Ix4};
use ort::session::Session;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};

use super::error::AssemblyError;
use super::layer::LayerDescriptor;
use crate::models::{BuiltinBackbone, InputShape};
use crate::runtime::{create_session_builder, RuntimeConfig};

/// Static description of a feature extractor: what it accepts, what it
/// produces, and its ordered layer list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackboneSpec {
    pub name: String,
    pub input_shape: InputShape,
    /// Channels of the feature map returned by `extract`
    pub output_channels: usize,
    pub layers: Vec<LayerDescriptor>,
}

impl BackboneSpec {
    pub fn builtin(model: BuiltinBackbone) -> Self {
        let characteristics = model.characteristics();
        Self {
            name: model.name().to_string(),
            input_shape: characteristics.input_shape,
            output_channels: characteristics.output_channels,
            layers: model.layers(),
        }
    }
}

/// A pretrained network mapping `N x H x W x C` images to an
/// `N x H' x W' x C'` feature map.
///
/// Implementations must be shareable across threads; the assembler keeps
/// them behind an `Arc`.
pub trait FeatureExtractor: fmt::Debug + Send + Sync {
    fn spec(&self) -> &BackboneSpec;

    /// Runs the network on a batch of preprocessed images.
    fn extract(&self, images: ArrayView4<'_, f32>) -> Result<Array4<f32>, AssemblyError>;

    /// Location of the weights file backing this extractor, if any. Stored in
    /// checkpoints so the backbone can be re-attached on load.
    fn artefact(&self) -> Option<&Path> {
        None
    }
}

/// Scales `[0, 255]` pixel values into `[-1, 1]`, the range Xception's
/// ImageNet weights were trained on.
pub fn preprocess_input(images: &mut Array4<f32>) {
    images.mapv_inplace(|v| v / 127.5 - 1.0);
}

/// Feature extractor running an exported backbone through ONNX Runtime.
///
/// The ONNX graph is expected to take a single NHWC `f32` input and return
/// the final feature map (classification top removed) as its first output.
#[derive(Debug)]
pub struct OnnxBackbone {
    spec: BackboneSpec,
    session: Arc<Session>,
    model_path: PathBuf,
}

impl OnnxBackbone {
    /// Loads the backbone graph at `model_path`.
    ///
    /// # Errors
    /// - `ResourceUnavailable` if the file is missing or ONNX Runtime cannot
    ///   load it, or the graph has no inputs or outputs
    pub fn from_file<P: AsRef<Path>>(
        model_path: P,
        spec: BackboneSpec,
        runtime: &RuntimeConfig,
    ) -> Result<Self, AssemblyError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(AssemblyError::ResourceUnavailable(format!(
                "Backbone weights not found: {}",
                model_path.display()
            )));
        }

        let session = create_session_builder(runtime)
            .and_then(|builder| builder.commit_from_file(model_path))
            .map_err(|e| AssemblyError::ResourceUnavailable(format!(
                "Failed to load backbone '{}' from {}: {}",
                spec.name,
                model_path.display(),
                e
            )))?;

        Self::validate_model(&session)?;
        info!("Backbone '{}' loaded from {:?}", spec.name, model_path);

        Ok(Self {
            spec,
            session: Arc::new(session),
            model_path: model_path.to_path_buf(),
        })
    }

    /// Checks the graph has the single image input and at least one output
    fn validate_model(session: &Session) -> Result<(), AssemblyError> {
        if session.inputs.is_empty() {
            return Err(AssemblyError::ResourceUnavailable(
                "Backbone model must have an image input".to_string(),
            ));
        }
        if session.outputs.is_empty() {
            return Err(AssemblyError::ResourceUnavailable(
                "Backbone model must have at least 1 output for features".to_string(),
            ));
        }
        Ok(())
    }

    fn check_input(&self, images: &ArrayView4<'_, f32>) -> Result<(), AssemblyError> {
        let (_, h, w, c) = images.dim();
        let expected = self.spec.input_shape;
        let checks = [
            ("image height", expected.height, h),
            ("image width", expected.width, w),
            ("image channels", expected.channels, c),
        ];
        for (context, expected, actual) in checks {
            if expected != actual {
                return Err(AssemblyError::ShapeMismatch {
                    context: context.to_string(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl FeatureExtractor for OnnxBackbone {
    fn spec(&self) -> &BackboneSpec {
        &self.spec
    }

    fn extract(&self, images: ArrayView4<'_, f32>) -> Result<Array4<f32>, AssemblyError> {
        self.check_input(&images)?;
        debug!("Extracting features for {} images", images.dim().0);

        let input_dyn = images.into_dyn();
        let input = input_dyn.as_standard_layout();

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            self.session.inputs[0].name.as_str(),
            Tensor::from_array(&input)
                .map_err(|e| AssemblyError::Backbone(format!("Failed to create input tensor: {}", e)))?,
        );

        let outputs = self.session.run(input_tensors)
            .map_err(|e| AssemblyError::Backbone(format!("Failed to run backbone: {}", e)))?;
        let features = outputs[0].try_extract_tensor::<f32>()
            .map_err(|e| AssemblyError::Backbone(format!("Failed to extract feature tensor: {}", e)))?;

        let features = features
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|e| AssemblyError::Backbone(format!("Feature map is not 4-dimensional: {}", e)))?;

        let channels = features.dim().3;
        if channels != self.spec.output_channels {
            return Err(AssemblyError::ShapeMismatch {
                context: "backbone output channels".into(),
                expected: self.spec.output_channels,
                actual: channels,
            });
        }
        Ok(features)
    }

    fn artefact(&self) -> Option<&Path> {
        Some(&self.model_path)
    }
}
