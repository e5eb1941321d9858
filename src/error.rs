//! Error types for every stage of the collect → train → listen loop.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised by a feature stream or while cutting windows out of its frames.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A second activation was requested while one is outstanding.
    #[error("feature stream is already active")]
    AlreadyActive,

    /// The producing side of the subscription went away.
    #[error("feature stream closed")]
    Closed,

    /// The frame does not hold enough time steps for a full window.
    #[error("spectrogram frame holds {actual} values, window needs {needed}")]
    ShortFrame { needed: usize, actual: usize },

    /// The frame's bin count disagrees with the configured window.
    #[error("spectrogram frame size {actual} does not match {expected} frequency bins")]
    FrameSize { expected: usize, actual: usize },
}

/// Errors raised when turning the collected examples into tensors.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset is empty")]
    Empty,

    #[error("example {index} has {actual} features, window needs {expected}")]
    WindowLength {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("example {index} has label {label}, only {class_count} classes exist")]
    Label {
        index: usize,
        label: usize,
        class_count: usize,
    },

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Errors raised by the classifier and its network.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid fit options: {0}")]
    InvalidFitOptions(String),

    #[error("loss diverged at epoch {epoch}")]
    NumericalInstability { epoch: usize },

    #[error("stored model is incompatible: {0}")]
    Incompatible(String),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl ModelError {
    pub fn invalid_topology(reason: impl Into<String>) -> Self {
        Self::InvalidTopology(reason.into())
    }

    pub fn incompatible(reason: impl Into<String>) -> Self {
        Self::Incompatible(reason.into())
    }

    /// True when a stored model could not be used and a fresh build is the
    /// right recovery.
    pub fn is_load_failure(&self) -> bool {
        match self {
            Self::Incompatible(_) => true,
            Self::Store(e) => e.is_load_failure(),
            _ => false,
        }
    }
}

/// Errors raised by a model store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no model stored at {0}")]
    NotFound(String),

    #[error("model at {location} is corrupt: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("invalid model location '{0}'")]
    InvalidLocation(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode model: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn corrupt(location: impl ToString, reason: impl ToString) -> Self {
        Self::Corrupt {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that mean "nothing usable is stored here".
    pub fn is_load_failure(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Corrupt { .. })
    }
}

/// Errors raised while reading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

/// Errors surfaced by the session controller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot train on an empty dataset, collect some examples first")]
    EmptyDataset,

    #[error("label {label} is out of range for {class_count} classes")]
    InvalidLabel { label: usize, class_count: usize },

    #[error("threshold {0} must lie within [0, 1]")]
    InvalidThreshold(f32),

    #[error("operation not allowed while {state}")]
    Busy { state: SessionState },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, SessionError>;
