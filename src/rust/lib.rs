//! Transfer-learning model assembly for image classifiers.
//!
//! A pretrained convolutional backbone (Xception, ImageNet weights) is run
//! through ONNX Runtime; a fresh classification head is appended and the
//! resulting [`CompiledModel`] carries per-layer trainability flags, the head
//! parameters, and the loss / optimizer / metrics a training harness should
//! use. Models persist as JSON checkpoints and can be reloaded for a second
//! fine-tuning pass with the last layers unfrozen.
//!
//! # Basic Usage
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use finetune::{ModelAssembler, ModelManager};
//!
//! let manager = ModelManager::new_default()?;
//! let model = ModelAssembler::new().build_fresh_pretrained(&manager).await?;
//! assert!(model.backbone_layers().iter().all(|l| !l.trainable));
//! # Ok(())
//! # }
//! ```
//!
//! # Weighted Loss
//!
//! ```rust
//! use finetune::loss::{make_weighted_loss, Loss};
//! use ndarray::array;
//!
//! let loss = make_weighted_loss(vec![1.0, 6.0, 6.0, 13.0, 13.0]).unwrap();
//! let y_true = array![[0.0, 0.0, 0.0, 1.0, 0.0]];
//! let y_pred = array![[0.1, 0.1, 0.1, 0.6, 0.1]];
//! let per_sample = loss.compute(y_true.view(), y_pred.view()).unwrap();
//! assert!(per_sample[0] > 0.0);
//! ```

pub mod classifier;
pub mod config;
pub mod loss;
pub mod model_manager;
pub mod models;
mod runtime;

pub use classifier::{
    AssemblyError, BackboneSpec, ClassificationHead, CompileSpec, CompiledModel, FeatureExtractor,
    FreezePolicy, LayerDescriptor, LayerKind, ModelAssembler, OnnxBackbone,
};
pub use config::{AssemblyConfig, HeadConfig};
pub use loss::{make_weighted_loss, ClassWeights, Loss, LossSpec, WeightedCategoricalCrossentropy};
pub use model_manager::{FetchError, ModelManager};
pub use models::{BackboneInfo, BuiltinBackbone, InputShape};
pub use runtime::{create_session_builder, RuntimeConfig};

pub fn init_logger() {
    env_logger::init();
}
