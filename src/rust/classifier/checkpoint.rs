//! JSON persistence for compiled models.
//!
//! A checkpoint holds everything except the backbone's own weights: the full
//! layer list with trainability flags, the head parameters, the compile spec,
//! and the path of the backbone weights file (if the model had one) so the
//! feature extractor can be re-attached on load. Updates to trainable
//! backbone layers are therefore not carried across a save/load cycle.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::backbone::{BackboneSpec, FeatureExtractor, OnnxBackbone};
use super::error::AssemblyError;
use super::head::{ClassificationHead, DenseParams, HEAD_LAYER_COUNT};
use super::layer::LayerDescriptor;
use super::model::{CompileSpec, CompiledModel};
use crate::config::HeadConfig;
use crate::models::InputShape;
use crate::runtime::RuntimeConfig;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredMatrix {
    fn from_array(array: &Array2<f32>) -> Self {
        Self {
            rows: array.nrows(),
            cols: array.ncols(),
            data: array.iter().copied().collect(),
        }
    }

    fn into_array(self) -> Result<Array2<f32>, String> {
        Array2::from_shape_vec((self.rows, self.cols), self.data).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDense {
    kernel: StoredMatrix,
    bias: Vec<f32>,
}

impl StoredDense {
    fn from_params(params: &DenseParams) -> Self {
        Self {
            kernel: StoredMatrix::from_array(&params.kernel),
            bias: params.bias.to_vec(),
        }
    }

    fn into_params(self) -> Result<DenseParams, String> {
        Ok(DenseParams {
            kernel: self.kernel.into_array()?,
            bias: Array1::from(self.bias),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBackbone {
    name: String,
    input_shape: InputShape,
    output_channels: usize,
    artefact: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredHead {
    config: HeadConfig,
    hidden: StoredDense,
    output: StoredDense,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    format_version: u32,
    backbone: StoredBackbone,
    backbone_layers: usize,
    layers: Vec<LayerDescriptor>,
    head: StoredHead,
    compile: CompileSpec,
}

pub(crate) fn save(model: &CompiledModel, path: &Path) -> Result<(), AssemblyError> {
    let file = CheckpointFile {
        format_version: FORMAT_VERSION,
        backbone: StoredBackbone {
            name: model.backbone_spec.name.clone(),
            input_shape: model.backbone_spec.input_shape,
            output_channels: model.backbone_spec.output_channels,
            artefact: model.backbone.as_ref().and_then(|b| b.artefact().map(Path::to_path_buf)),
        },
        backbone_layers: model.backbone_layer_count(),
        layers: model.layers.clone(),
        head: StoredHead {
            config: model.head.config().clone(),
            hidden: StoredDense::from_params(model.head.hidden()),
            output: StoredDense::from_params(model.head.output()),
        },
        compile: model.compile.clone(),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &file)
        .map_err(|e| AssemblyError::Io(std::io::Error::other(e)))?;
    info!("Saved checkpoint with {} layers to {:?}", file.layers.len(), path);
    Ok(())
}

/// Loads a checkpoint written by [`CompiledModel::save`].
///
/// Layer flags and the compile spec are restored exactly as persisted. If
/// the checkpoint references a backbone weights file that still exists, the
/// backbone is re-attached through ONNX Runtime; otherwise the model is
/// returned detached.
///
/// # Errors
/// - `CheckpointNotFound` if `path` does not exist or does not hold a valid
///   checkpoint
pub fn load<P: AsRef<Path>>(path: P, runtime: &RuntimeConfig) -> Result<CompiledModel, AssemblyError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(AssemblyError::checkpoint_not_found(path, "no such file"));
    }
    let reader = BufReader::new(
        File::open(path).map_err(|e| AssemblyError::checkpoint_not_found(path, e))?,
    );
    let file: CheckpointFile = serde_json::from_reader(reader)
        .map_err(|e| AssemblyError::checkpoint_not_found(path, format!("unreadable checkpoint: {}", e)))?;

    let invalid = |reason: String| AssemblyError::checkpoint_not_found(path, reason);

    if file.format_version != FORMAT_VERSION {
        return Err(invalid(format!("unsupported format version {}", file.format_version)));
    }
    if file.layers.len() != file.backbone_layers + HEAD_LAYER_COUNT {
        return Err(invalid(format!(
            "layer list has {} entries but {} backbone + {} head layers were recorded",
            file.layers.len(),
            file.backbone_layers,
            HEAD_LAYER_COUNT
        )));
    }

    let hidden = file.head.hidden.into_params().map_err(&invalid)?;
    let output = file.head.output.into_params().map_err(&invalid)?;
    let head = ClassificationHead::from_parts(file.head.config, hidden, output)
        .map_err(|e| invalid(e.to_string()))?;
    if head.input_channels() != file.backbone.output_channels {
        return Err(invalid(format!(
            "head expects {} features but backbone produces {}",
            head.input_channels(),
            file.backbone.output_channels
        )));
    }

    let spec = BackboneSpec {
        name: file.backbone.name,
        input_shape: file.backbone.input_shape,
        output_channels: file.backbone.output_channels,
        layers: file.layers[..file.backbone_layers].to_vec(),
    };
    let backbone = reattach_backbone(file.backbone.artefact, &spec, runtime);

    info!("Loaded checkpoint '{}' ({} layers) from {:?}", spec.name, file.layers.len(), path);
    Ok(CompiledModel {
        backbone_spec: spec,
        backbone,
        layers: file.layers,
        head,
        compile: file.compile,
    })
}

fn reattach_backbone(
    artefact: Option<PathBuf>,
    spec: &BackboneSpec,
    runtime: &RuntimeConfig,
) -> Option<Arc<dyn FeatureExtractor>> {
    let artefact = artefact?;
    if !artefact.exists() {
        warn!("Backbone weights {:?} no longer exist; loading model without feature extractor", artefact);
        return None;
    }
    match OnnxBackbone::from_file(&artefact, spec.clone(), runtime) {
        Ok(backbone) => Some(Arc::new(backbone)),
        Err(e) => {
            warn!("Failed to re-attach backbone from {:?}: {}", artefact, e);
            None
        }
    }
}
