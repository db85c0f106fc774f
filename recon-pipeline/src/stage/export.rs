//! Final conversions into the published artifacts.

use crate::error::StageError;
use crate::layout::RunLayout;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use recon_data::{
    PlyField, SceneGeometry, load_mesh_from_ply, read_point_cloud, write_glb, write_gltf,
    write_mesh_ply, write_points,
};
use std::path::PathBuf;
use tracing::info;

fn write_scenes(scene: &SceneGeometry, layout: &RunLayout, binary: bool) -> Result<(), StageError> {
    write_gltf(scene, layout.scene_path())?;
    if binary {
        write_glb(scene, layout.binary_scene_path())?;
    }
    Ok(())
}

async fn run_blocking<F>(work: F) -> Result<(), StageError>
where
    F: FnOnce() -> Result<(), StageError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StageError::Io(std::io::Error::other(e)))?
}

/// Publishes the Poisson mesh as `model.ply` and glTF scenes.
pub struct MeshExport;

#[async_trait]
impl Stage for MeshExport {
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let layout = ctx.layout().clone();
        let binary = ctx.config().emit_binary_scene;

        run_blocking(move || {
            let mesh = load_mesh_from_ply(layout.mesh_path())?;
            info!(
                "Exporting mesh: {} vertices, {} triangles",
                mesh.vertex_count(),
                mesh.triangle_count()
            );
            write_mesh_ply(&mesh, layout.point_cloud_path())?;
            write_scenes(&SceneGeometry::from_mesh(&mesh), &layout, binary)
        })
        .await?;

        ctx.progress.report(100, "Mesh exported").await?;
        Ok(())
    }
}

/// Publishes a trained splat model as a coloured point set.
///
/// `model.ply` keeps position and colour only; SH coefficients are reduced
/// to RGB and everything else is dropped.
pub struct ModelExport {
    source: PathBuf,
}

impl ModelExport {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl Stage for ModelExport {
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let layout = ctx.layout().clone();
        let binary = ctx.config().emit_binary_scene;
        let source = self.source.clone();

        run_blocking(move || {
            let points = read_point_cloud(&source)?.to_records()?;
            info!("Exporting {} splats as points", points.len());
            write_points(&points, PlyField::POSITION_COLOR, layout.point_cloud_path())?;
            write_scenes(&SceneGeometry::from_points(&points), &layout, binary)
        })
        .await?;

        ctx.progress.report(100, "Model exported").await?;
        Ok(())
    }
}
