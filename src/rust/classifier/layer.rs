use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::AssemblyError;

/// Activation applied by a dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Softmax,
}

/// The structural kind of a layer, with the hyperparameters that matter to
/// the head or the parameter count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Conv2d { filters: usize, kernel: usize, stride: usize },
    SeparableConv2d { filters: usize, kernel: usize },
    BatchNormalization,
    Activation,
    MaxPooling2d,
    Add,
    GlobalAveragePooling2d,
    Dense { units: usize, activation: Activation },
    Dropout { rate: f32 },
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "InputLayer"),
            Self::Conv2d { .. } => write!(f, "Conv2D"),
            Self::SeparableConv2d { .. } => write!(f, "SeparableConv2D"),
            Self::BatchNormalization => write!(f, "BatchNormalization"),
            Self::Activation => write!(f, "Activation"),
            Self::MaxPooling2d => write!(f, "MaxPooling2D"),
            Self::Add => write!(f, "Add"),
            Self::GlobalAveragePooling2d => write!(f, "GlobalAveragePooling2D"),
            Self::Dense { .. } => write!(f, "Dense"),
            Self::Dropout { .. } => write!(f, "Dropout"),
        }
    }
}

/// One entry of a model's ordered layer list.
///
/// Descriptors carry no weights; they are the unit the trainability policy
/// operates on and what an external harness reads to decide which parameters
/// receive updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub name: String,
    pub kind: LayerKind,
    /// Number of parameters owned by the layer
    pub params: usize,
    pub trainable: bool,
}

impl LayerDescriptor {
    pub fn new(name: impl Into<String>, kind: LayerKind, params: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
            trainable: true,
        }
    }
}

/// Sets `trainable = value` on every layer in `[from, to)`.
///
/// Layers outside the range are left untouched.
///
/// # Errors
/// - `InvalidLayerRange` if `from > to` or `to` exceeds the layer count
pub fn set_trainable(
    layers: &mut [LayerDescriptor],
    from: usize,
    to: usize,
    value: bool,
) -> Result<(), AssemblyError> {
    if from > to || to > layers.len() {
        return Err(AssemblyError::InvalidLayerRange {
            from,
            to,
            len: layers.len(),
        });
    }
    for layer in &mut layers[from..to] {
        layer.trainable = value;
    }
    Ok(())
}

/// Returns the start index of the last `count` layers, clamped to zero when
/// the model has fewer layers than requested.
pub fn tail_start(len: usize, count: usize) -> usize {
    len.saturating_sub(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layers(n: usize) -> Vec<LayerDescriptor> {
        (0..n)
            .map(|i| LayerDescriptor::new(format!("layer_{}", i), LayerKind::Activation, 0))
            .collect()
    }

    #[test]
    fn test_set_trainable_range_only() {
        let mut list = layers(6);
        set_trainable(&mut list, 2, 4, false).unwrap();
        let flags: Vec<bool> = list.iter().map(|l| l.trainable).collect();
        assert_eq!(flags, vec![true, true, false, false, true, true]);
    }

    #[test]
    fn test_set_trainable_empty_range() {
        let mut list = layers(3);
        assert!(set_trainable(&mut list, 3, 3, false).is_ok());
        assert!(list.iter().all(|l| l.trainable));
    }

    #[test]
    fn test_set_trainable_rejects_bad_range() {
        let mut list = layers(3);
        assert!(matches!(
            set_trainable(&mut list, 2, 1, true),
            Err(AssemblyError::InvalidLayerRange { from: 2, to: 1, len: 3 })
        ));
        assert!(set_trainable(&mut list, 0, 4, true).is_err());
    }

    #[test]
    fn test_tail_start_clamps() {
        assert_eq!(tail_start(136, 15), 121);
        assert_eq!(tail_start(10, 15), 0);
    }

    #[test]
    fn test_layer_kind_serialization() {
        let kind = LayerKind::Dense { units: 128, activation: Activation::Relu };
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, r#"{"type":"dense","units":128,"activation":"relu"}"#);
    }
}
