//! Random count reduction for dense clouds.
//!
//! This is not a spatial simplification: indices are drawn uniformly without
//! replacement so the kept points follow the original density.

use crate::ply::{PointCloudColumns, PointRecord};
use rand::Rng;
use tracing::debug;

/// Pick `min(len, cap)` distinct indices in ascending order.
///
/// Returns `None` when no reduction is needed (`len <= cap`).
pub fn sample_indices<R: Rng + ?Sized>(len: usize, cap: usize, rng: &mut R) -> Option<Vec<usize>> {
    if len <= cap {
        return None;
    }
    let mut indices = rand::seq::index::sample(rng, len, cap).into_vec();
    indices.sort_unstable();
    Some(indices)
}

/// Reduce a column set to at most `cap` records, subsetting all fields together.
///
/// Inputs at or under the cap, including empty ones, come back unchanged.
pub fn downsample_columns<R: Rng + ?Sized>(
    cloud: PointCloudColumns,
    cap: usize,
    rng: &mut R,
) -> PointCloudColumns {
    match sample_indices(cloud.len(), cap, rng) {
        Some(indices) => {
            debug!("Downsampling {} points to {}", cloud.len(), indices.len());
            cloud.select(&indices)
        }
        None => cloud,
    }
}

pub fn downsample_points<R: Rng + ?Sized>(
    points: Vec<PointRecord>,
    cap: usize,
    rng: &mut R,
) -> Vec<PointRecord> {
    match sample_indices(points.len(), cap, rng) {
        Some(indices) => {
            debug!("Downsampling {} points to {}", points.len(), indices.len());
            indices.into_iter().map(|i| points[i]).collect()
        }
        None => points,
    }
}
