use thiserror::Error;

use crate::node::{Bounds, NodeId};

#[derive(Error, Debug)]
pub enum NestsetError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Node must exist: {0}")]
    NodeMissing(String),
    #[error("Node must not be a descendant: {0}")]
    Descendant(String),
    #[error("Nodes must be in the same scope: {left} vs {right}")]
    ScopeMismatch { left: String, right: String },
    #[error("Cannot move node {bounds} into itself at position {position}")]
    MoveIntoSelf { bounds: Bounds, position: i64 },
    #[error("Unknown node {0} referenced by rebuild input")]
    UnknownNode(NodeId),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl NestsetError {
    /// True for rejections raised before anything was written.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::NodeMissing(_)
                | Self::Descendant(_)
                | Self::ScopeMismatch { .. }
                | Self::MoveIntoSelf { .. }
                | Self::UnknownNode(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NestsetError>;

// Helper conversions
impl From<rusqlite::Error> for NestsetError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
impl From<config::ConfigError> for NestsetError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
impl From<serde_json::Error> for NestsetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}
