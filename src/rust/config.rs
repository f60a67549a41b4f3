use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::classifier::{AssemblyError, CompileSpec};

/// Shape of the classification head appended to a backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HeadConfig {
    /// Width of the hidden ReLU layer
    pub hidden_units: usize,
    /// Fraction of hidden activations dropped while training
    pub dropout_rate: f32,
    /// Width of the softmax output
    pub num_classes: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            hidden_units: 128,
            dropout_rate: 0.5,
            num_classes: 5,
        }
    }
}

/// Policy constants for model assembly.
///
/// Every field has a default, so a config file only needs the values it
/// changes:
///
/// ```
/// use finetune::AssemblyConfig;
///
/// let config: AssemblyConfig = serde_json::from_str(r#"{"unfreeze_last": 30}"#).unwrap();
/// assert_eq!(config.unfreeze_last, 30);
/// assert_eq!(config.head.hidden_units, 128);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssemblyConfig {
    pub head: HeadConfig,
    /// Number of trailing layers made trainable when reloading a checkpoint
    pub unfreeze_last: usize,
    /// Loss, optimizer and metrics every assembled model is compiled with
    pub compile: CompileSpec,
    /// Seed for head initialization; random when absent
    pub seed: Option<u64>,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            head: HeadConfig::default(),
            unfreeze_last: 15,
            compile: CompileSpec::default(),
            seed: None,
        }
    }
}

impl AssemblyConfig {
    /// Reads a JSON config file and validates it.
    ///
    /// # Errors
    /// - `Io` if the file cannot be opened
    /// - `InvalidConfig` if the JSON is malformed or fails validation
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, AssemblyError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)
            .map_err(|e| AssemblyError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_compile(mut self, compile: CompileSpec) -> Self {
        self.compile = compile;
        self
    }

    /// Ensures the configuration values are usable.
    ///
    /// # Errors
    /// - `InvalidConfig` if the head has zero width or classes, the dropout
    ///   rate is outside `[0, 1)`, or the compiled loss cannot be built for
    ///   the configured class count
    pub fn validate(self) -> Result<Self, AssemblyError> {
        if self.head.hidden_units == 0 {
            return Err(AssemblyError::InvalidConfig("hidden_units must be greater than 0".into()));
        }
        if self.head.num_classes == 0 {
            return Err(AssemblyError::InvalidConfig("num_classes must be greater than 0".into()));
        }
        if !(0.0..1.0).contains(&self.head.dropout_rate) {
            return Err(AssemblyError::InvalidConfig(format!(
                "dropout_rate must be in [0, 1), got {}",
                self.head.dropout_rate
            )));
        }
        self.compile.validate(self.head.num_classes)?;
        Ok(self)
    }
}
