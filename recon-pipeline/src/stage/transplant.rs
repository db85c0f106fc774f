//! Replace the trainer's sparse initialization with the fused dense cloud.

use crate::error::StageError;
use crate::stage::{Stage, StageContext};
use async_trait::async_trait;
use recon_data::{PlyField, downsample_points, read_point_cloud, write_points};
use std::path::Path;
use tracing::{info, warn};

/// Reads `dense/fused.ply`, caps it at `point_cap` points and writes it as
/// `dense/sparse/0/points3D.ply`.
///
/// An empty fused cloud is not an error: training then starts from the
/// sparse points the undistorter left behind.
pub struct DenseTransplant;

/// Returns the number of points written, zero when nothing was transplanted.
fn transplant(fused: &Path, target: &Path, cap: usize) -> Result<usize, StageError> {
    let records = read_point_cloud(fused)?.to_records()?;
    if records.is_empty() {
        return Ok(0);
    }
    let dense = records.len();
    let kept = downsample_points(records, cap, &mut rand::rng());
    if kept.len() < dense {
        info!("Dense cloud capped from {} to {} points", dense, kept.len());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_points(&kept, PlyField::FULL, target)?;
    Ok(kept.len())
}

#[async_trait]
impl Stage for DenseTransplant {
    async fn execute(&self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        let fused = ctx.layout().fused_cloud_path();
        let target = ctx.layout().init_points_path();
        let cap = ctx.config().point_cap;

        let written = tokio::task::spawn_blocking(move || transplant(&fused, &target, cap))
            .await
            .map_err(|e| StageError::Io(std::io::Error::other(e)))??;

        if written == 0 {
            warn!("Fused cloud is empty, keeping the sparse initialization");
            ctx.progress.report(100, "Dense cloud empty, using sparse points").await?;
        } else {
            ctx.progress
                .report(100, format!("Transplanted {written} dense points"))
                .await?;
        }
        Ok(())
    }
}
