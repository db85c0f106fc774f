//! Scene export for web viewers.
//!
//! Two encodings of the same glTF 2.0 document are produced: a self-contained
//! binary container (`.glb`) and a textual `.gltf` whose buffer lives in a
//! sibling `.bin` file.

mod gltf;

pub use gltf::{encode_glb, write_glb, write_gltf};

use crate::ply::PointRecord;
use crate::types::TriangleMesh;
use glam::Vec3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scene has no vertices")]
    EmptyScene,

    #[error("triangle {triangle} references vertex {index} of {vertex_count}")]
    InvalidIndex {
        triangle: usize,
        index: u32,
        vertex_count: usize,
    },

    #[error("{attribute} has {len} entries, expected {expected}")]
    AttributeLength {
        attribute: &'static str,
        len: usize,
        expected: usize,
    },
}

/// Geometry of a single-primitive scene.
///
/// With non-empty `triangles` the primitive is a triangle list, otherwise a
/// point set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneGeometry {
    pub positions: Vec<Vec3>,
    pub normals: Option<Vec<Vec3>>,
    pub colors: Option<Vec<[u8; 3]>>,
    pub triangles: Option<Vec<[u32; 3]>>,
}

impl SceneGeometry {
    pub fn from_mesh(mesh: &TriangleMesh) -> Self {
        Self {
            positions: mesh.positions.clone(),
            normals: mesh.normals.clone(),
            colors: mesh.colors.clone(),
            triangles: Some(mesh.triangles.clone()),
        }
    }

    /// A coloured point set. Normals are dropped since viewers do not light points.
    pub fn from_points(points: &[PointRecord]) -> Self {
        Self {
            positions: points.iter().map(|p| p.position).collect(),
            normals: None,
            colors: Some(points.iter().map(|p| p.color).collect()),
            triangles: None,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_point_set(&self) -> bool {
        self.triangles.as_ref().is_none_or(|t| t.is_empty())
    }

    pub fn validate(&self) -> Result<(), ExportError> {
        let n = self.positions.len();
        if n == 0 {
            return Err(ExportError::EmptyScene);
        }
        if let Some(normals) = &self.normals
            && normals.len() != n
        {
            return Err(ExportError::AttributeLength {
                attribute: "normals",
                len: normals.len(),
                expected: n,
            });
        }
        if let Some(colors) = &self.colors
            && colors.len() != n
        {
            return Err(ExportError::AttributeLength {
                attribute: "colors",
                len: colors.len(),
                expected: n,
            });
        }
        for (t, triangle) in self.triangles.iter().flatten().enumerate() {
            if let Some(&index) = triangle.iter().find(|&&i| i as usize >= n) {
                return Err(ExportError::InvalidIndex {
                    triangle: t,
                    index,
                    vertex_count: n,
                });
            }
        }
        Ok(())
    }
}
