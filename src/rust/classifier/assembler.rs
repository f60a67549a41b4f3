use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::backbone::{BackboneSpec, FeatureExtractor, OnnxBackbone};
use super::checkpoint;
use super::error::AssemblyError;
use super::head::ClassificationHead;
use super::layer::set_trainable;
use super::model::{CompileSpec, CompiledModel};
use crate::config::AssemblyConfig;
use crate::models::BuiltinBackbone;
use crate::runtime::RuntimeConfig;
use crate::ModelManager;

/// Which layers of a freshly assembled model receive updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezePolicy {
    /// Backbone frozen, head trainable
    FreezeBackbone,
    /// Every layer trainable
    TrainAll,
}

/// Builds compiled transfer-learning models.
///
/// # Example
/// ```no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use finetune::{ModelAssembler, ModelManager};
///
/// let manager = ModelManager::new_default()?;
/// let assembler = ModelAssembler::new();
///
/// let model = assembler.build_fresh_pretrained(&manager).await?;
/// model.save("checkpoints/stage1.json")?;
///
/// let model = assembler.build_from_checkpoint("checkpoints/stage1.json")?;
/// println!("{}", model.summary());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct ModelAssembler {
    config: AssemblyConfig,
    runtime_config: RuntimeConfig,
}

impl ModelAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `config` for head shape, unfreeze count and compile spec.
    ///
    /// # Errors
    /// - `InvalidConfig` if the config fails validation
    pub fn with_config(mut self, config: AssemblyConfig) -> Result<Self, AssemblyError> {
        self.config = config.validate()?;
        Ok(self)
    }

    /// Sets the runtime configuration for ONNX backbone execution
    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Pretrained Xception with a fresh head; backbone frozen, head trainable.
    ///
    /// # Errors
    /// - `ResourceUnavailable` if no weights source is configured (see
    ///   [`BuiltinBackbone::get_backbone_info`]) or the weights cannot be
    ///   fetched or loaded
    pub async fn build_fresh_pretrained(&self, manager: &ModelManager) -> Result<CompiledModel, AssemblyError> {
        let backbone = self.load_pretrained(manager, BuiltinBackbone::Xception).await?;
        self.assemble(backbone, FreezePolicy::FreezeBackbone)
    }

    /// Pretrained Xception with a fresh head; every layer trainable.
    ///
    /// # Errors
    /// - `ResourceUnavailable` if the weights cannot be fetched or loaded
    pub async fn build_fresh_unfrozen(&self, manager: &ModelManager) -> Result<CompiledModel, AssemblyError> {
        let backbone = self.load_pretrained(manager, BuiltinBackbone::Xception).await?;
        self.assemble(backbone, FreezePolicy::TrainAll)
    }

    /// Reloads a persisted model for a second fine-tuning pass.
    ///
    /// The last `unfreeze_last` layers become trainable. Every earlier layer
    /// keeps the flag it was persisted with. The model is recompiled with the
    /// configured compile spec.
    ///
    /// # Errors
    /// - `CheckpointNotFound` if `path` is not a valid checkpoint
    /// - `InvalidConfig` if the compile spec does not fit the loaded head
    pub fn build_from_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<CompiledModel, AssemblyError> {
        let mut model = checkpoint::load(path.as_ref(), &self.runtime_config)?;
        let from = model.unfreeze_last(self.config.unfreeze_last);
        model.compile(self.config.compile.clone())?;
        info!(
            "Unfroze layers [{}, {}) of checkpoint {:?}; {} of {} layers trainable",
            from,
            model.layers().len(),
            path.as_ref(),
            model.trainable_layer_count(),
            model.layers().len()
        );
        Ok(model)
    }

    /// Appends a fresh classification head to `backbone` and applies `policy`.
    ///
    /// # Errors
    /// - `InvalidConfig` if the compile spec does not fit the head
    pub fn assemble(
        &self,
        backbone: Arc<dyn FeatureExtractor>,
        policy: FreezePolicy,
    ) -> Result<CompiledModel, AssemblyError> {
        let spec = backbone.spec().clone();
        self.assemble_spec(spec, Some(backbone), policy)
    }

    /// Like [`assemble`](Self::assemble) but without an attached extractor,
    /// for harnesses that feed precomputed feature maps.
    pub fn assemble_detached(
        &self,
        spec: BackboneSpec,
        policy: FreezePolicy,
    ) -> Result<CompiledModel, AssemblyError> {
        self.assemble_spec(spec, None, policy)
    }

    fn assemble_spec(
        &self,
        spec: BackboneSpec,
        backbone: Option<Arc<dyn FeatureExtractor>>,
        policy: FreezePolicy,
    ) -> Result<CompiledModel, AssemblyError> {
        let head = match self.config.seed {
            Some(seed) => ClassificationHead::new(spec.output_channels, self.config.head.clone(), &mut StdRng::seed_from_u64(seed)),
            None => ClassificationHead::new(spec.output_channels, self.config.head.clone(), &mut rand::thread_rng()),
        };

        let name = spec.name.clone();
        let mut model = CompiledModel::new(spec, backbone, head, CompileSpec::default());

        let backbone_layers = model.backbone_layer_count();
        let len = model.layers().len();
        match policy {
            FreezePolicy::FreezeBackbone => set_trainable(&mut model.layers, 0, backbone_layers, false)?,
            FreezePolicy::TrainAll => set_trainable(&mut model.layers, 0, len, true)?,
        }
        model.compile(self.config.compile.clone())?;

        info!(
            "Assembled '{}' + head: {} layers, {} trainable ({:?})",
            name,
            len,
            model.trainable_layer_count(),
            policy
        );
        Ok(model)
    }

    async fn load_pretrained(
        &self,
        manager: &ModelManager,
        model: BuiltinBackbone,
    ) -> Result<Arc<dyn FeatureExtractor>, AssemblyError> {
        let info = model.get_backbone_info().map_err(|e| {
            warn!("No pretrained weights source for '{}': {}", model.name(), e);
            AssemblyError::from(e)
        })?;
        manager.ensure_backbone_downloaded(&info).await.map_err(|e| {
            warn!("Could not fetch pretrained weights for '{}': {}", info.name, e);
            AssemblyError::from(e)
        })?;
        let path = manager.get_model_path(&info.name);
        let backbone = OnnxBackbone::from_file(path, BackboneSpec::builtin(model), &self.runtime_config)?;
        Ok(Arc::new(backbone))
    }
}
