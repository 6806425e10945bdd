use fieldpack_types::LayerId;
use thiserror::Error;

/// Errors raised while loading or validating a project description.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid project file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize project: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("duplicate layer id: {0}")]
    DuplicateLayer(LayerId),

    #[error("relationship {relationship} references unknown layer {layer}")]
    UnknownLayer { relationship: String, layer: LayerId },

    #[error("invalid project: {0}")]
    Invalid(String),
}

pub type ModelResult<T> = Result<T, ModelError>;
