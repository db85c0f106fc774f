//! Binary PLY writing.
//!
//! Output always uses `binary_little_endian` so general-purpose tools
//! (MeshLab, CloudCompare, trainers reading `points3D.ply`) accept it.

use crate::atomic::write_atomically;
use crate::ply::header::ScalarType;
use crate::ply::{Column, ColumnValues, PlyError, PointCloudColumns, PointRecord};
use crate::types::TriangleMesh;
use std::path::Path;
use tracing::info;

/// Field groups a caller can choose to keep when writing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyField {
    /// `x y z` as float
    Position,
    /// `nx ny nz` as float
    Normal,
    /// `red green blue` as uchar
    Color,
}

impl PlyField {
    /// Position, normal and colour: the layout trainers expect for initialization points.
    pub const FULL: &'static [PlyField] = &[PlyField::Position, PlyField::Normal, PlyField::Color];
    /// Position and colour only, for viewers.
    pub const POSITION_COLOR: &'static [PlyField] = &[PlyField::Position, PlyField::Color];
}

/// Turn records into columns holding only the requested field groups.
pub fn records_to_columns(records: &[PointRecord], fields: &[PlyField]) -> PointCloudColumns {
    let mut columns = Vec::new();
    for field in fields {
        match field {
            PlyField::Position => {
                for (axis, name) in ["x", "y", "z"].into_iter().enumerate() {
                    columns.push(Column::f32(
                        name,
                        records.iter().map(|r| r.position[axis]).collect(),
                    ));
                }
            }
            PlyField::Normal => {
                for (axis, name) in ["nx", "ny", "nz"].into_iter().enumerate() {
                    columns.push(Column::f32(
                        name,
                        records.iter().map(|r| r.normal[axis]).collect(),
                    ));
                }
            }
            PlyField::Color => {
                for (channel, name) in ["red", "green", "blue"].into_iter().enumerate() {
                    columns.push(Column::u8(
                        name,
                        records.iter().map(|r| r.color[channel]).collect(),
                    ));
                }
            }
        }
    }
    PointCloudColumns::from_parts(records.len(), columns)
}

/// Encode columns as a complete binary PLY file.
pub fn encode_columns(cloud: &PointCloudColumns) -> Vec<u8> {
    let mut header = String::from("ply\nformat binary_little_endian 1.0\n");
    header.push_str(&format!("element vertex {}\n", cloud.len()));
    for column in cloud.columns() {
        header.push_str(&format!("property {} {}\n", column.ty.keyword(), column.name));
    }
    header.push_str("end_header\n");

    let stride: usize = cloud.columns().iter().map(|c| c.ty.size()).sum();
    let mut bytes = Vec::with_capacity(header.len() + stride * cloud.len());
    bytes.extend_from_slice(header.as_bytes());

    for i in 0..cloud.len() {
        for column in cloud.columns() {
            encode_value(&mut bytes, column, i);
        }
    }
    bytes
}

fn encode_value(out: &mut Vec<u8>, column: &Column, i: usize) {
    match (&column.values, column.ty) {
        (ColumnValues::F32(v), _) => out.extend_from_slice(&v[i].to_le_bytes()),
        (ColumnValues::U8(v), _) => out.push(v[i]),
        (ColumnValues::F64(v), ty) => {
            let value = v[i];
            match ty {
                ScalarType::I8 => out.extend_from_slice(&(value as i8).to_le_bytes()),
                ScalarType::U8 => out.push(value as u8),
                ScalarType::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
                ScalarType::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
                ScalarType::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
                ScalarType::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
                ScalarType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
                ScalarType::F64 => out.extend_from_slice(&value.to_le_bytes()),
            }
        }
    }
}

/// Write columns to `path` atomically.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display(), points = cloud.len()))]
pub fn write_columns(cloud: &PointCloudColumns, path: impl AsRef<Path>) -> Result<(), PlyError> {
    let bytes = encode_columns(cloud);
    write_atomically(path.as_ref(), |file| file.write_all(&bytes))?;
    info!("Wrote {} points ({} bytes)", cloud.len(), bytes.len());
    Ok(())
}

/// Write records keeping only `fields`.
pub fn write_points(
    records: &[PointRecord],
    fields: &[PlyField],
    path: impl AsRef<Path>,
) -> Result<(), PlyError> {
    write_columns(&records_to_columns(records, fields), path)
}

/// Write a triangle mesh as binary PLY: vertex records followed by
/// `list uchar int vertex_indices` faces, the layout Poisson meshers emit.
#[tracing::instrument(
    skip_all,
    fields(path = %path.as_ref().display(), triangles = mesh.triangle_count())
)]
pub fn write_mesh_ply(mesh: &TriangleMesh, path: impl AsRef<Path>) -> Result<(), PlyError> {
    let mut fields = vec![PlyField::Position];
    if mesh.normals.is_some() {
        fields.push(PlyField::Normal);
    }
    if mesh.colors.is_some() {
        fields.push(PlyField::Color);
    }
    let vertices = records_to_columns(&mesh.vertex_records(), &fields);
    let mut bytes = encode_columns(&vertices);

    // Splice the face element in front of the sentinel.
    let sentinel = b"end_header\n";
    let header_end = bytes.len() - vertex_payload_len(&vertices);
    let face_header = format!(
        "element face {}\nproperty list uchar int vertex_indices\n",
        mesh.triangle_count()
    );
    let sentinel_at = header_end - sentinel.len();
    bytes.splice(sentinel_at..sentinel_at, face_header.bytes());

    for triangle in &mesh.triangles {
        bytes.push(3);
        for &index in triangle {
            bytes.extend_from_slice(&(index as i32).to_le_bytes());
        }
    }

    write_atomically(path.as_ref(), |file| file.write_all(&bytes))?;
    info!(
        "Wrote mesh: {} vertices, {} triangles",
        mesh.vertex_count(),
        mesh.triangle_count()
    );
    Ok(())
}

fn vertex_payload_len(cloud: &PointCloudColumns) -> usize {
    cloud.columns().iter().map(|c| c.ty.size()).sum::<usize>() * cloud.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ply::read_point_cloud;
    use glam::Vec3;

    fn sample_records(n: usize) -> Vec<PointRecord> {
        (0..n)
            .map(|i| {
                let t = i as f32 * 0.37;
                PointRecord::new(
                    Vec3::new(t.sin() * 3.0, t.cos() * -2.0, t * 0.001),
                    Vec3::new(0.0, 0.0, 1.0),
                    [(i % 256) as u8, (i * 7 % 256) as u8, 255 - (i % 256) as u8],
                )
            })
            .collect()
    }

    #[test]
    fn test_written_records_parse_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.ply");
        let records = sample_records(300);

        write_points(&records, PlyField::FULL, &path).unwrap();
        let parsed = read_point_cloud(&path).unwrap().to_records().unwrap();

        assert_eq!(parsed.len(), records.len());
        for (a, b) in parsed.iter().zip(&records) {
            assert!((a.position - b.position).length() < 1e-6);
            assert!((a.normal - b.normal).length() < 1e-6);
            assert_eq!(a.color, b.color);
        }
    }

    #[test]
    fn test_field_subset_drops_normals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("viewer.ply");

        write_points(&sample_records(4), PlyField::POSITION_COLOR, &path).unwrap();
        let parsed = read_point_cloud(&path).unwrap();

        let names: Vec<&str> = parsed.field_names().collect();
        assert_eq!(names, ["x", "y", "z", "red", "green", "blue"]);
        assert!(parsed.normals().is_none());
    }

    #[test]
    fn test_header_declares_count_and_types() {
        let bytes =
            encode_columns(&records_to_columns(&sample_records(2), PlyField::POSITION_COLOR));
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("ply\nformat binary_little_endian 1.0\nelement vertex 2\n"));
        assert!(text.contains("property float x\n"));
        assert!(text.contains("property uchar blue\nend_header\n"));
    }

    #[test]
    fn test_mesh_header_declares_faces_before_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.ply");
        let mesh = TriangleMesh {
            positions: vec![Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z],
            normals: None,
            colors: Some(vec![[255, 0, 0]; 4]),
            triangles: vec![[0, 1, 2], [0, 2, 3]],
        };
        write_mesh_ply(&mesh, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = crate::ply::PlyHeader::parse(&bytes).unwrap();
        assert_eq!(header.element("vertex").unwrap().count, 4);
        assert_eq!(header.element("face").unwrap().count, 2);
        // 4 vertices * 15 bytes + 2 faces * (1 + 12) bytes
        assert_eq!(bytes.len() - header.data_offset, 4 * 15 + 2 * 13);

        // The vertex element still decodes through the column reader.
        let cloud = read_point_cloud(&path).unwrap();
        assert_eq!(cloud.len(), 4);
        assert_eq!(cloud.colors()[3], [255, 0, 0]);
    }

    #[test]
    fn test_empty_cloud_is_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.ply");
        write_points(&[], PlyField::FULL, &path).unwrap();
        assert!(read_point_cloud(&path).unwrap().is_empty());
    }
}
