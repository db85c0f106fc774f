//! Triangle mesh loading from PLY files.

use crate::ply::PlyError;
use crate::types::TriangleMesh;
use glam::Vec3;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, info, warn};

// Face structure for PLY files
#[derive(Deserialize, Debug)]
struct PlyFace {
    #[serde(alias = "vertex_index")]
    vertex_indices: Vec<i64>,
}

// PLY file structure
#[derive(Deserialize, Debug)]
struct PlyFile {
    #[serde(rename = "vertex")]
    vertex: Vec<HashMap<String, JsonValue>>,
    #[serde(default, rename = "face")]
    face: Vec<PlyFace>,
}

fn get_f32(prop: Option<&JsonValue>) -> Option<f32> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n.as_f64().map(|f| f as f32),
        _ => None,
    })
}

fn get_u8(prop: Option<&JsonValue>) -> Option<u8> {
    prop.and_then(|v| match v {
        JsonValue::Number(n) => n
            .as_u64()
            .map(|u| u.min(255) as u8)
            .or_else(|| n.as_f64().map(|f| f.round().clamp(0.0, 255.0) as u8)),
        _ => None,
    })
}

fn get_vec3(vertex: &HashMap<String, JsonValue>, names: [&str; 3]) -> Option<Vec3> {
    Some(Vec3::new(
        get_f32(vertex.get(names[0]))?,
        get_f32(vertex.get(names[1]))?,
        get_f32(vertex.get(names[2]))?,
    ))
}

/// Load a triangle mesh (vertices plus faces) from a PLY file.
///
/// Polygons with more than three corners are fan-triangulated. Colours and
/// normals are kept only when every vertex carries them.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn load_mesh_from_ply(path: impl AsRef<Path>) -> Result<TriangleMesh, PlyError> {
    debug!("Loading PLY mesh");
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let ply_data: PlyFile = serde_ply::from_reader(reader).map_err(|e| {
        warn!("Failed to parse PLY mesh: {}", e);
        PlyError::Mesh(e.to_string())
    })?;

    info!(
        "PLY mesh parsed: {} vertices, {} faces",
        ply_data.vertex.len(),
        ply_data.face.len()
    );

    let mut positions = Vec::with_capacity(ply_data.vertex.len());
    let mut normals = Vec::with_capacity(ply_data.vertex.len());
    let mut colors = Vec::with_capacity(ply_data.vertex.len());

    for (i, vertex) in ply_data.vertex.iter().enumerate() {
        let position = get_vec3(vertex, ["x", "y", "z"]).ok_or_else(|| PlyError::MissingField {
            name: format!("x/y/z at vertex {}", i),
        })?;
        positions.push(position);

        if let Some(n) = get_vec3(vertex, ["nx", "ny", "nz"]) {
            normals.push(n);
        }

        if let (Some(r), Some(g), Some(b)) = (
            get_u8(vertex.get("red")),
            get_u8(vertex.get("green")),
            get_u8(vertex.get("blue")),
        ) {
            colors.push([r, g, b]);
        }
    }

    let vertex_count = positions.len();
    let mut triangles = Vec::with_capacity(ply_data.face.len());
    for (f, face) in ply_data.face.iter().enumerate() {
        let indices = face
            .vertex_indices
            .iter()
            .map(|&idx| {
                u32::try_from(idx)
                    .ok()
                    .filter(|&i| (i as usize) < vertex_count)
                    .ok_or_else(|| {
                        PlyError::Mesh(format!(
                            "face {} references vertex {} of {}",
                            f, idx, vertex_count
                        ))
                    })
            })
            .collect::<Result<Vec<u32>, PlyError>>()?;

        if indices.len() < 3 {
            continue;
        }
        for k in 1..indices.len() - 1 {
            triangles.push([indices[0], indices[k], indices[k + 1]]);
        }
    }

    debug!(
        "Loaded mesh with {} vertices and {} triangles",
        vertex_count,
        triangles.len()
    );

    Ok(TriangleMesh {
        normals: (normals.len() == vertex_count && vertex_count > 0).then_some(normals),
        colors: (colors.len() == vertex_count && vertex_count > 0).then_some(colors),
        positions,
        triangles,
    })
}
