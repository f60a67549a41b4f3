use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::classifier::{LayerDescriptor, LayerKind};
use crate::model_manager::FetchError;

pub const XCEPTION_URL_ENV: &str = "FINETUNE_XCEPTION_URL";
pub const XCEPTION_SHA256_ENV: &str = "FINETUNE_XCEPTION_SHA256";

const XCEPTION_EXPORT_HINT: &str = "export keras.applications.Xception(include_top=False, \
weights=\"imagenet\", input_shape=(299, 299, 3)) to ONNX (e.g. with tf2onnx, NHWC input, \
final feature map as the first output), host the file, and point this variable at it";

/// Height x width x channels of the images a backbone accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self { height, width, channels }
    }
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.height, self.width, self.channels)
    }
}

/// Pretrained backbones the crate knows how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinBackbone {
    /// Xception with ImageNet weights and its classification top removed
    Xception,
}

/// Static characteristics of a backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneCharacteristics {
    pub input_shape: InputShape,
    /// Channels of the final feature map
    pub output_channels: usize,
    /// Spatial size of the final feature map for `input_shape`
    pub output_hw: (usize, usize),
}

/// Where to fetch a backbone's weights from and how to verify them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackboneInfo {
    pub name: String,
    pub model_url: String,
    /// Expected SHA-256 of the weights file, lowercase hex. Verification is
    /// skipped when absent.
    pub model_hash: Option<String>,
}

impl BuiltinBackbone {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Xception => "xception",
        }
    }

    pub fn characteristics(&self) -> BackboneCharacteristics {
        match self {
            Self::Xception => BackboneCharacteristics {
                input_shape: InputShape::new(299, 299, 3),
                output_channels: 2048,
                output_hw: (10, 10),
            },
        }
    }

    /// Returns the download descriptor.
    ///
    /// There is no bundled weights source: the URL comes from
    /// `FINETUNE_XCEPTION_URL` and the optional checksum from
    /// `FINETUNE_XCEPTION_SHA256`.
    ///
    /// # Errors
    /// - `SourceNotConfigured` if the URL variable is unset or empty
    pub fn get_backbone_info(&self) -> Result<BackboneInfo, FetchError> {
        let (url_var, hash_var) = match self {
            Self::Xception => (XCEPTION_URL_ENV, XCEPTION_SHA256_ENV),
        };
        let model_url = env::var(url_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| FetchError::SourceNotConfigured {
                name: self.name().to_string(),
                variable: url_var,
                hint: XCEPTION_EXPORT_HINT,
            })?;
        let model_hash = env::var(hash_var).ok().filter(|v| !v.trim().is_empty());
        if model_hash.is_none() {
            log::warn!("{} is unset; downloaded {} weights will not be verified", hash_var, self.name());
        }
        Ok(BackboneInfo {
            name: self.name().to_string(),
            model_url: model_url.trim().to_string(),
            model_hash,
        })
    }

    /// The backbone's ordered layer list, every layer trainable.
    pub fn layers(&self) -> Vec<LayerDescriptor> {
        match self {
            Self::Xception => xception_layers(),
        }
    }
}

struct CatalogBuilder {
    layers: Vec<LayerDescriptor>,
    channels: usize,
    shortcuts: usize,
    adds: usize,
}

/// Keras suffixes auto-named layers: `conv2d`, `conv2d_1`, `conv2d_2`, ...
fn keras_name(base: &str, index: usize) -> String {
    if index == 0 {
        base.to_string()
    } else {
        format!("{}_{}", base, index)
    }
}

impl CatalogBuilder {
    fn new(channels: usize) -> Self {
        Self { layers: Vec::new(), channels, shortcuts: 0, adds: 0 }
    }

    fn push(&mut self, name: String, kind: LayerKind, params: usize) {
        self.layers.push(LayerDescriptor::new(name, kind, params));
    }

    fn input(&mut self) {
        self.push("input_1".into(), LayerKind::Input, 0);
    }

    fn conv(&mut self, name: String, filters: usize, kernel: usize, stride: usize) {
        let params = kernel * kernel * self.channels * filters;
        self.push(name, LayerKind::Conv2d { filters, kernel, stride }, params);
        self.channels = filters;
    }

    fn sepconv(&mut self, name: String, filters: usize) {
        let params = 9 * self.channels + self.channels * filters;
        self.push(name, LayerKind::SeparableConv2d { filters, kernel: 3 }, params);
        self.channels = filters;
    }

    fn bn(&mut self, name: String) {
        let params = 4 * self.channels;
        self.push(name, LayerKind::BatchNormalization, params);
    }

    fn act(&mut self, name: String) {
        self.push(name, LayerKind::Activation, 0);
    }

    fn add(&mut self) {
        let name = keras_name("add", self.adds);
        self.adds += 1;
        self.push(name, LayerKind::Add, 0);
    }

    /// Tail of a downsampling block, in graph-depth order: the 1x1 shortcut
    /// projection of the block input, the main-path pool, the shortcut's
    /// batch norm, then the merge.
    fn downsample(&mut self, block: usize, block_input_channels: usize) {
        let filters = self.channels;
        let index = self.shortcuts;
        self.shortcuts += 1;
        self.push(
            keras_name("conv2d", index),
            LayerKind::Conv2d { filters, kernel: 1, stride: 2 },
            block_input_channels * filters,
        );
        self.push(format!("block{}_pool", block), LayerKind::MaxPooling2d, 0);
        self.push(keras_name("batch_normalization", index), LayerKind::BatchNormalization, 4 * filters);
        self.add();
    }
}

/// Layer catalog of Xception without its top, in the order Keras reports
/// `model.layers`.
fn xception_layers() -> Vec<LayerDescriptor> {
    let mut b = CatalogBuilder::new(3);
    b.input();

    // entry flow stem
    b.conv("block1_conv1".into(), 32, 3, 2);
    b.bn("block1_conv1_bn".into());
    b.act("block1_conv1_act".into());
    b.conv("block1_conv2".into(), 64, 3, 1);
    b.bn("block1_conv2_bn".into());
    b.act("block1_conv2_act".into());

    for (block, filters) in [(2usize, 128usize), (3, 256), (4, 728)] {
        let block_input = b.channels;
        if block > 2 {
            b.act(format!("block{}_sepconv1_act", block));
        }
        b.sepconv(format!("block{}_sepconv1", block), filters);
        b.bn(format!("block{}_sepconv1_bn", block));
        b.act(format!("block{}_sepconv2_act", block));
        b.sepconv(format!("block{}_sepconv2", block), filters);
        b.bn(format!("block{}_sepconv2_bn", block));
        b.downsample(block, block_input);
    }

    // middle flow
    for block in 5..=12 {
        for conv in 1..=3 {
            b.act(format!("block{}_sepconv{}_act", block, conv));
            b.sepconv(format!("block{}_sepconv{}", block, conv), 728);
            b.bn(format!("block{}_sepconv{}_bn", block, conv));
        }
        b.add();
    }

    // exit flow
    let block_input = b.channels;
    b.act("block13_sepconv1_act".into());
    b.sepconv("block13_sepconv1".into(), 728);
    b.bn("block13_sepconv1_bn".into());
    b.act("block13_sepconv2_act".into());
    b.sepconv("block13_sepconv2".into(), 1024);
    b.bn("block13_sepconv2_bn".into());
    b.downsample(13, block_input);

    b.sepconv("block14_sepconv1".into(), 1536);
    b.bn("block14_sepconv1_bn".into());
    b.act("block14_sepconv1_act".into());
    b.sepconv("block14_sepconv2".into(), 2048);
    b.bn("block14_sepconv2_bn".into());
    b.act("block14_sepconv2_act".into());

    b.layers
}
