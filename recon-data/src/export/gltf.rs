//! glTF 2.0 document assembly and GLB container encoding.

use crate::atomic::write_atomically;
use crate::export::{ExportError, SceneGeometry};
use crate::types::bounds;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

const GENERATOR: &str = "recon";

const COMPONENT_UNSIGNED_BYTE: u32 = 5121;
const COMPONENT_UNSIGNED_INT: u32 = 5125;
const COMPONENT_FLOAT: u32 = 5126;

const TARGET_ARRAY_BUFFER: u32 = 34962;
const TARGET_ELEMENT_ARRAY_BUFFER: u32 = 34963;

const MODE_POINTS: u32 = 0;
const MODE_TRIANGLES: u32 = 4;

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const GLB_CHUNK_JSON: u32 = 0x4E4F_534A;
const GLB_CHUNK_BIN: u32 = 0x004E_4942;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    asset: Asset,
    scene: u32,
    scenes: Vec<Scene>,
    nodes: Vec<Node>,
    meshes: Vec<Mesh>,
    buffers: Vec<Buffer>,
    buffer_views: Vec<BufferView>,
    accessors: Vec<Accessor>,
}

#[derive(Serialize)]
struct Asset {
    version: &'static str,
    generator: &'static str,
}

#[derive(Serialize)]
struct Scene {
    nodes: Vec<u32>,
}

#[derive(Serialize)]
struct Node {
    mesh: u32,
}

#[derive(Serialize)]
struct Mesh {
    primitives: Vec<Primitive>,
}

#[derive(Serialize)]
struct Primitive {
    attributes: BTreeMap<&'static str, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    indices: Option<u32>,
    mode: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Buffer {
    byte_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BufferView {
    buffer: u32,
    byte_offset: usize,
    byte_length: usize,
    target: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Accessor {
    buffer_view: u32,
    component_type: u32,
    count: usize,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<[f32; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<[f32; 3]>,
}

/// Accumulates the binary buffer and the views/accessors that describe it.
#[derive(Default)]
struct BufferBuilder {
    bin: Vec<u8>,
    views: Vec<BufferView>,
    accessors: Vec<Accessor>,
}

impl BufferBuilder {
    fn push(&mut self, bytes: &[u8], target: u32, accessor: Accessor) -> u32 {
        // Every section is a multiple of four bytes, so offsets stay aligned.
        let view = self.views.len() as u32;
        self.views.push(BufferView {
            buffer: 0,
            byte_offset: self.bin.len(),
            byte_length: bytes.len(),
            target,
        });
        self.bin.extend_from_slice(bytes);
        self.accessors.push(Accessor {
            buffer_view: view,
            ..accessor
        });
        (self.accessors.len() - 1) as u32
    }
}

fn vec3_accessor(count: usize) -> Accessor {
    Accessor {
        buffer_view: 0,
        component_type: COMPONENT_FLOAT,
        count,
        kind: "VEC3",
        normalized: None,
        min: None,
        max: None,
    }
}

/// Build the document and its binary buffer. `buffer_uri` is `None` for GLB.
fn assemble(
    scene: &SceneGeometry,
    buffer_uri: Option<String>,
) -> Result<(Document, Vec<u8>), ExportError> {
    scene.validate()?;
    let count = scene.vertex_count();
    let mut builder = BufferBuilder::default();
    let mut attributes = BTreeMap::new();

    // glTF buffers are little-endian; bytemuck casts in native order.
    let positions: Vec<[f32; 3]> = scene.positions.iter().map(|p| p.to_array()).collect();
    let (min, max) = bounds(&scene.positions).ok_or(ExportError::EmptyScene)?;
    let position_accessor = builder.push(
        bytemuck::cast_slice(&positions),
        TARGET_ARRAY_BUFFER,
        Accessor {
            min: Some(min.to_array()),
            max: Some(max.to_array()),
            ..vec3_accessor(count)
        },
    );
    attributes.insert("POSITION", position_accessor);

    if let Some(normals) = &scene.normals {
        let normals: Vec<[f32; 3]> = normals
            .iter()
            .map(|n| n.normalize_or(glam::Vec3::Z).to_array())
            .collect();
        let accessor = builder.push(
            bytemuck::cast_slice(&normals),
            TARGET_ARRAY_BUFFER,
            vec3_accessor(count),
        );
        attributes.insert("NORMAL", accessor);
    }

    if let Some(colors) = &scene.colors {
        // RGBA keeps each vertex on a four-byte boundary.
        let rgba: Vec<[u8; 4]> = colors.iter().map(|c| [c[0], c[1], c[2], 255]).collect();
        let accessor = builder.push(
            bytemuck::cast_slice(&rgba),
            TARGET_ARRAY_BUFFER,
            Accessor {
                buffer_view: 0,
                component_type: COMPONENT_UNSIGNED_BYTE,
                count,
                kind: "VEC4",
                normalized: Some(true),
                min: None,
                max: None,
            },
        );
        attributes.insert("COLOR_0", accessor);
    }

    // A zero-length index accessor is invalid glTF, so a mesh without
    // triangles is exported as its vertices.
    let (indices, mode) = match scene.triangles.as_deref() {
        Some(triangles) if !triangles.is_empty() => {
            let accessor = builder.push(
                bytemuck::cast_slice(triangles),
                TARGET_ELEMENT_ARRAY_BUFFER,
                Accessor {
                    buffer_view: 0,
                    component_type: COMPONENT_UNSIGNED_INT,
                    count: triangles.len() * 3,
                    kind: "SCALAR",
                    normalized: None,
                    min: None,
                    max: None,
                },
            );
            (Some(accessor), MODE_TRIANGLES)
        }
        _ => (None, MODE_POINTS),
    };

    let document = Document {
        asset: Asset {
            version: "2.0",
            generator: GENERATOR,
        },
        scene: 0,
        scenes: vec![Scene { nodes: vec![0] }],
        nodes: vec![Node { mesh: 0 }],
        meshes: vec![Mesh {
            primitives: vec![Primitive {
                attributes,
                indices,
                mode,
            }],
        }],
        buffers: vec![Buffer {
            byte_length: builder.bin.len(),
            uri: buffer_uri,
        }],
        buffer_views: builder.views,
        accessors: builder.accessors,
    };

    Ok((document, builder.bin))
}

fn pad_to_four(bytes: &mut Vec<u8>, fill: u8) {
    while bytes.len() % 4 != 0 {
        bytes.push(fill);
    }
}

/// Encode a scene as a GLB container (header, JSON chunk, BIN chunk).
pub fn encode_glb(scene: &SceneGeometry) -> Result<Vec<u8>, ExportError> {
    let (document, mut bin) = assemble(scene, None)?;
    let mut json = serde_json::to_vec(&document)?;
    pad_to_four(&mut json, b' ');
    pad_to_four(&mut bin, 0);

    let total = 12 + 8 + json.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());

    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&GLB_CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json);

    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&GLB_CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);
    Ok(out)
}

/// Write a self-contained `.glb` file atomically.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn write_glb(scene: &SceneGeometry, path: impl AsRef<Path>) -> Result<(), ExportError> {
    let bytes = encode_glb(scene)?;
    write_atomically(path.as_ref(), |file| file.write_all(&bytes))?;
    info!(
        "Wrote GLB: {} vertices, {} bytes",
        scene.vertex_count(),
        bytes.len()
    );
    Ok(())
}

/// Write a textual `.gltf` document plus its `.bin` buffer next to it.
///
/// The buffer is written first so the document never points at a missing file.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn write_gltf(scene: &SceneGeometry, path: impl AsRef<Path>) -> Result<(), ExportError> {
    let path = path.as_ref();
    let bin_path = path.with_extension("bin");
    let uri = bin_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "buffer.bin".to_string());

    let (document, bin) = assemble(scene, Some(uri))?;
    write_atomically(&bin_path, |file| file.write_all(&bin))?;

    let json = serde_json::to_vec_pretty(&document)?;
    write_atomically(path, |file| file.write_all(&json))?;
    info!(
        "Wrote glTF: {} vertices, buffer {} bytes",
        scene.vertex_count(),
        bin.len()
    );
    Ok(())
}
