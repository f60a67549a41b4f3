#![allow(dead_code)]

use std::sync::Arc;

use finetune::classifier::AssemblyError;
use finetune::models::InputShape;
use finetune::{AssemblyConfig, BackboneSpec, FeatureExtractor, HeadConfig, LayerDescriptor, LayerKind, ModelAssembler};
use ndarray::{Array4, ArrayView4, Axis};

pub const MOCK_CHANNELS: usize = 8;
pub const MOCK_LAYERS: usize = 24;

/// Stand-in backbone: a 4x4x3 input, a 2x2x8 feature map, and a layer list of
/// alternating convolutions and batch norms.
#[derive(Debug)]
pub struct MockBackbone {
    spec: BackboneSpec,
}

impl MockBackbone {
    pub fn new() -> Self {
        Self { spec: mock_spec() }
    }

    pub fn shared() -> Arc<dyn FeatureExtractor> {
        Arc::new(Self::new())
    }
}

impl FeatureExtractor for MockBackbone {
    fn spec(&self) -> &BackboneSpec {
        &self.spec
    }

    fn extract(&self, images: ArrayView4<'_, f32>) -> Result<Array4<f32>, AssemblyError> {
        let n = images.len_of(Axis(0));
        let mut features = Array4::zeros((n, 2, 2, MOCK_CHANNELS));
        for (i, image) in images.axis_iter(Axis(0)).enumerate() {
            let mean = image.mean().unwrap_or(0.0);
            for c in 0..MOCK_CHANNELS {
                features
                    .slice_mut(ndarray::s![i, .., .., c])
                    .fill(mean * (c as f32 + 1.0));
            }
        }
        Ok(features)
    }
}

pub fn mock_spec() -> BackboneSpec {
    let mut layers = vec![LayerDescriptor::new("input_1", LayerKind::Input, 0)];
    for i in 1..MOCK_LAYERS {
        let layer = if i % 2 == 1 {
            LayerDescriptor::new(
                format!("conv_{}", i),
                LayerKind::Conv2d { filters: MOCK_CHANNELS, kernel: 3, stride: 1 },
                100,
            )
        } else {
            LayerDescriptor::new(format!("bn_{}", i), LayerKind::BatchNormalization, 32)
        };
        layers.push(layer);
    }
    BackboneSpec {
        name: "mock".to_string(),
        input_shape: InputShape::new(4, 4, 3),
        output_channels: MOCK_CHANNELS,
        layers,
    }
}

pub fn small_config() -> AssemblyConfig {
    let mut config = AssemblyConfig::default().with_seed(42);
    config.head = HeadConfig {
        hidden_units: 6,
        dropout_rate: 0.5,
        num_classes: 5,
    };
    config
}

pub fn assembler() -> ModelAssembler {
    ModelAssembler::new()
        .with_config(small_config())
        .expect("small config is valid")
}
