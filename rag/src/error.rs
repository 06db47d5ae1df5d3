use thiserror::Error;

use crate::region_graph::NodeId;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("Feature {0} not supported")]
    UnsupportedFeatureKind(String),
    #[error("Classifier supplied without any feature information")]
    MissingFeatureConfiguration,
    #[error("Invalid parameters for feature {feature}: {message}")]
    InvalidFeatureParameter {
        feature: &'static str,
        message: String,
    },
    #[error("Probability channel {channel} has shape {actual:?}, expected {expected:?}")]
    ChannelShapeMismatch {
        channel: usize,
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
    #[error("Output volume has shape {actual:?}, expected {expected:?}")]
    VolumeShapeMismatch {
        expected: (usize, usize, usize),
        actual: (usize, usize, usize),
    },
    #[error("Feature manager does not match the feature layout the graph was built with")]
    FeatureLayoutMismatch,
    #[error("Agglomeration threshold must be finite, got {0}")]
    InvalidThreshold(f64),
    #[error("Expected {expected} probability channels, got {actual}")]
    ChannelCountMismatch { expected: usize, actual: usize },
    #[error("Invalid merge of {a} and {b}: {reason}")]
    InvalidMergeAttempt {
        a: NodeId,
        b: NodeId,
        reason: MergeRejection,
    },
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
    #[error("No edge between {0} and {1}")]
    UnknownEdge(NodeId, NodeId),
    #[error("Coordinate ({x}, {y}, {z}) lies outside the volume")]
    OutOfBounds { x: usize, y: usize, z: usize },
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    Serde(#[from] common::SerdeFormatError),
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported configuration file: {0}")]
    FileFormat(#[from] common::FileExtensionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MergeRejection {
    #[strum(to_string = "node is inactive")]
    Inactive,
    #[strum(to_string = "nodes are identical")]
    SameNode,
    #[strum(to_string = "nodes are constrained apart")]
    Constrained,
}

pub type RagResult<T> = std::result::Result<T, RagError>;
