mod assembler;
mod backbone;
pub mod checkpoint;
mod error;
mod head;
mod layer;
mod model;
mod utils;

pub use assembler::{FreezePolicy, ModelAssembler};
pub use backbone::{preprocess_input, BackboneSpec, FeatureExtractor, OnnxBackbone};
pub use error::AssemblyError;
pub use head::{ClassificationHead, DenseParams, HEAD_LAYER_COUNT};
pub use layer::{set_trainable, tail_start, Activation, LayerDescriptor, LayerKind};
pub use model::{AdamConfig, CompileSpec, CompiledModel, Evaluation, Metric, ModelSummary, OptimizerSpec};
