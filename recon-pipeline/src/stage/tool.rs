//! Stages that are a single external tool invocation.

use crate::error::StageError;
use crate::layout::RunLayout;
use crate::process::{ToolInvocation, require_output};
use crate::progress::ProgressParser;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use recon_data::PlyField;
use recon_data::synthetic::{synthetic_mesh, synthetic_point_cloud, synthetic_splat_columns};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Output written in place of a real tool's in simulated mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Placeholder {
    Directory(PathBuf),
    /// An empty file, unless one already exists.
    File(PathBuf),
    PointCloud { path: PathBuf, points: usize },
    Splat { path: PathBuf, points: usize },
    Mesh(PathBuf),
}

impl Placeholder {
    pub fn materialize(&self) -> Result<(), StageError> {
        match self {
            Placeholder::Directory(dir) => {
                std::fs::create_dir_all(dir)?;
            }
            Placeholder::File(path) => {
                ensure_parent(path)?;
                if !path.exists() {
                    std::fs::write(path, b"")?;
                }
            }
            Placeholder::PointCloud { path, points } => {
                ensure_parent(path)?;
                recon_data::write_points(&synthetic_point_cloud(*points), PlyField::FULL, path)?;
            }
            Placeholder::Splat { path, points } => {
                ensure_parent(path)?;
                recon_data::write_columns(&synthetic_splat_columns(*points), path)?;
            }
            Placeholder::Mesh(path) => {
                ensure_parent(path)?;
                recon_data::write_mesh_ply(&synthetic_mesh(), path)?;
            }
        }
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    debug!("Writing placeholder {}", path.display());
    match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Runs after a successful real invocation to adjust the tool's output.
pub type PostStep = fn(&RunLayout) -> std::io::Result<()>;

/// One external command, its expected outputs, and how to fake it.
pub struct ToolStage {
    invocation: ToolInvocation,
    parser: Option<Box<dyn ProgressParser>>,
    outputs: Vec<PathBuf>,
    placeholders: Vec<Placeholder>,
    post: Option<PostStep>,
}

impl ToolStage {
    pub fn new(invocation: ToolInvocation) -> Self {
        Self {
            invocation,
            parser: None,
            outputs: Vec::new(),
            placeholders: Vec::new(),
            post: None,
        }
    }

    pub fn parser(mut self, parser: impl ProgressParser + 'static) -> Self {
        self.parser = Some(Box::new(parser));
        self
    }

    /// A path that must exist once the tool exits successfully.
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn placeholder(mut self, placeholder: Placeholder) -> Self {
        self.placeholders.push(placeholder);
        self
    }

    pub fn post(mut self, step: PostStep) -> Self {
        self.post = Some(step);
        self
    }

    pub fn invocation(&self) -> &ToolInvocation {
        &self.invocation
    }
}

#[async_trait]
impl Stage for ToolStage {
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let tool = self.invocation.tool_name();
        if ctx.is_simulated() {
            ctx.simulate(&tool).await?;
            for placeholder in &self.placeholders {
                placeholder.materialize()?;
            }
        } else {
            ctx.run_tool(&self.invocation, self.parser.as_deref()).await?;
            if let Some(post) = self.post {
                post(ctx.layout())?;
            }
        }
        for output in &self.outputs {
            require_output(&tool, output)?;
        }
        Ok(())
    }
}

/// Copy the undistorter's flat `dense/sparse/*` files into `dense/sparse/0`,
/// the layout splat trainers read.
///
/// The flat copy stays in place: stereo matching and fusion read the model
/// from `<workspace>/sparse`.
pub fn nest_dense_model(layout: &RunLayout) -> std::io::Result<()> {
    let sparse = layout.dense_dir().join("sparse");
    let target = layout.dense_sparse_dir();
    std::fs::create_dir_all(&target)?;
    for entry in std::fs::read_dir(&sparse)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), target.join(entry.file_name()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nest_dense_model_keeps_stereo_workspace() {
        let root = tempfile::tempdir().unwrap();
        let layout = RunLayout::new("r", root.path(), root.path().join("out"));
        let sparse = layout.dense_dir().join("sparse");
        std::fs::create_dir_all(&sparse).unwrap();
        for name in ["cameras.bin", "images.bin", "points3D.bin"] {
            std::fs::write(sparse.join(name), name.as_bytes()).unwrap();
        }

        nest_dense_model(&layout).unwrap();
        nest_dense_model(&layout).unwrap();

        for name in ["cameras.bin", "images.bin", "points3D.bin"] {
            assert_eq!(std::fs::read(sparse.join(name)).unwrap(), name.as_bytes());
            assert_eq!(
                std::fs::read(layout.dense_sparse_dir().join(name)).unwrap(),
                name.as_bytes()
            );
        }
        assert!(!layout.dense_sparse_dir().join("0").exists());
    }

    #[test]
    fn test_placeholders_are_readable() {
        let root = tempfile::tempdir().unwrap();
        let cloud = root.path().join("a/fused.ply");
        let splat = root.path().join("b/splat.ply");
        let mesh = root.path().join("c/mesh.ply");

        Placeholder::PointCloud { path: cloud.clone(), points: 50 }
            .materialize()
            .unwrap();
        Placeholder::Splat { path: splat.clone(), points: 20 }
            .materialize()
            .unwrap();
        Placeholder::Mesh(mesh.clone()).materialize().unwrap();

        assert_eq!(recon_data::read_point_cloud(&cloud).unwrap().len(), 50);
        assert!(recon_data::read_point_cloud(&splat).unwrap().column("f_dc_0").is_some());
        assert_eq!(recon_data::load_mesh_from_ply(&mesh).unwrap().triangle_count(), 20);
    }

    #[test]
    fn test_file_placeholder_keeps_existing_content() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("database.db");
        std::fs::write(&path, b"keep").unwrap();
        Placeholder::File(path.clone()).materialize().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");
    }
}
