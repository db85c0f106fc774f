//! Core geometry types shared by the loaders and exporters.

use crate::ply::PointRecord;
use glam::Vec3;

/// An indexed triangle mesh with optional per-vertex attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangleMesh {
    /// Vertex positions in world space.
    pub positions: Vec<Vec3>,
    /// Per-vertex normals, when the producer wrote them.
    pub normals: Option<Vec<Vec3>>,
    /// Per-vertex RGB, when the producer wrote them.
    pub colors: Option<Vec<[u8; 3]>>,
    /// Triangles as vertex index triplets.
    pub triangles: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() || self.triangles.is_empty()
    }

    /// Vertices as interchange records. Missing colour becomes neutral gray.
    pub fn vertex_records(&self) -> Vec<PointRecord> {
        self.positions
            .iter()
            .enumerate()
            .map(|(i, &position)| PointRecord {
                position,
                normal: self
                    .normals
                    .as_ref()
                    .map(|n| n[i])
                    .unwrap_or(Vec3::ZERO),
                color: self
                    .colors
                    .as_ref()
                    .map(|c| c[i])
                    .unwrap_or([crate::color::NEUTRAL_GRAY; 3]),
            })
            .collect()
    }
}

/// Axis-aligned bounds of a set of positions. `None` for an empty set.
pub fn bounds(positions: &[Vec3]) -> Option<(Vec3, Vec3)> {
    let first = *positions.first()?;
    Some(
        positions
            .iter()
            .fold((first, first), |(min, max), p| (min.min(*p), max.max(*p))),
    )
}
