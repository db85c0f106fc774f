//! Error types for stages and whole runs.

use crate::process::ToolError;
use recon_data::{ExportError, PlyError};
use std::path::PathBuf;
use thiserror::Error;

/// Anything a single stage can fail with.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("point cloud: {0}")]
    Ply(#[from] PlyError),

    #[error("export: {0}")]
    Export(#[from] ExportError),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Input(String),

    /// The progress consumer went away.
    #[error("run cancelled")]
    Cancelled,
}

/// Terminal failure of a run. Exactly one is reported per failed run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: StageError,
    },

    #[error("declared output missing: {}", path.display())]
    OutputMissing { path: PathBuf },

    #[error("no input images found in {}", dir.display())]
    NoInputImages { dir: PathBuf },

    #[error("run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Wrap a stage failure with the stage name, keeping cancellation distinct.
    pub fn from_stage(stage: &'static str, source: StageError) -> Self {
        match source {
            StageError::Cancelled => PipelineError::Cancelled,
            source => PipelineError::Stage { stage, source },
        }
    }

    /// Name of the failing stage, if a stage failed.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            PipelineError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}
