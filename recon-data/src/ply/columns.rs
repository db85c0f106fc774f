//! Column-oriented access to binary PLY vertex records.
//!
//! Dense clouds from stereo fusion and trained splat files are both a single
//! `vertex` element of fixed-width little-endian records. They are read into
//! one array per declared field so subsets can be selected without caring
//! about the producer's field order.

use crate::color::{NEUTRAL_GRAY, sh_dc_to_channel};
use crate::ply::header::{PlyFormat, PlyHeader, PlyProperty, PropertyKind, ScalarType};
use crate::ply::{PlyError, PointRecord};
use glam::Vec3;
use std::path::Path;
use tracing::{debug, info};

/// Values of one field across all records.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    F32(Vec<f32>),
    U8(Vec<u8>),
    /// Any other scalar type, widened losslessly.
    F64(Vec<f64>),
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_f32(&self, i: usize) -> f32 {
        match self {
            Self::F32(v) => v[i],
            Self::U8(v) => v[i] as f32,
            Self::F64(v) => v[i] as f32,
        }
    }

    /// Read a value as a colour byte. Float columns are rounded and clamped.
    pub fn get_u8(&self, i: usize) -> u8 {
        match self {
            Self::U8(v) => v[i],
            Self::F32(v) => v[i].round().clamp(0.0, 255.0) as u8,
            Self::F64(v) => v[i].round().clamp(0.0, 255.0) as u8,
        }
    }

    /// Keep only the values at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        match self {
            Self::F32(v) => Self::F32(indices.iter().map(|&i| v[i]).collect()),
            Self::U8(v) => Self::U8(indices.iter().map(|&i| v[i]).collect()),
            Self::F64(v) => Self::F64(indices.iter().map(|&i| v[i]).collect()),
        }
    }
}

/// One named field and its values.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ScalarType,
    pub values: ColumnValues,
}

impl Column {
    pub fn f32(name: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            ty: ScalarType::F32,
            values: ColumnValues::F32(values),
        }
    }

    pub fn u8(name: impl Into<String>, values: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            ty: ScalarType::U8,
            values: ColumnValues::U8(values),
        }
    }
}

/// A vertex element decoded into per-field columns.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloudColumns {
    count: usize,
    columns: Vec<Column>,
}

impl PointCloudColumns {
    /// Build from columns that must all hold `count` values.
    pub fn new(count: usize, columns: Vec<Column>) -> Result<Self, PlyError> {
        for column in &columns {
            if column.values.len() != count {
                return Err(PlyError::ColumnLength {
                    name: column.name.clone(),
                    len: column.values.len(),
                    expected: count,
                });
            }
        }
        Ok(Self { count, columns })
    }

    /// Caller guarantees every column holds `count` values.
    pub(crate) fn from_parts(count: usize, columns: Vec<Column>) -> Self {
        Self { count, columns }
    }

    pub fn empty() -> Self {
        Self {
            count: 0,
            columns: Vec::new(),
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_at(&self, index: usize) -> Result<&Column, PlyError> {
        self.columns
            .get(index)
            .ok_or(PlyError::FieldIndexOutOfBounds {
                index,
                len: self.columns.len(),
            })
    }

    fn require(&self, name: &str) -> Result<&Column, PlyError> {
        self.column(name).ok_or_else(|| PlyError::MissingField {
            name: name.to_string(),
        })
    }

    fn triple(&self, names: [&str; 3]) -> Option<[&Column; 3]> {
        Some([
            self.column(names[0])?,
            self.column(names[1])?,
            self.column(names[2])?,
        ])
    }

    /// Subset every column consistently.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            count: indices.len(),
            columns: self
                .columns
                .iter()
                .map(|c| Column {
                    name: c.name.clone(),
                    ty: c.ty,
                    values: c.values.select(indices),
                })
                .collect(),
        }
    }

    /// `x`, `y`, `z` as vectors. All three are required.
    pub fn positions(&self) -> Result<Vec<Vec3>, PlyError> {
        let x = self.require("x")?;
        let y = self.require("y")?;
        let z = self.require("z")?;
        Ok((0..self.count)
            .map(|i| {
                Vec3::new(
                    x.values.get_f32(i),
                    y.values.get_f32(i),
                    z.values.get_f32(i),
                )
            })
            .collect())
    }

    /// `nx`, `ny`, `nz` if all are present.
    pub fn normals(&self) -> Option<Vec<Vec3>> {
        let [x, y, z] = self.triple(["nx", "ny", "nz"])?;
        Some(
            (0..self.count)
                .map(|i| {
                    Vec3::new(
                        x.values.get_f32(i),
                        y.values.get_f32(i),
                        z.values.get_f32(i),
                    )
                })
                .collect(),
        )
    }

    /// Per-record RGB.
    ///
    /// Raw `red/green/blue` bytes win, then SH-DC coefficients (`f_dc_0..2`).
    /// Without either, every record gets neutral gray.
    pub fn colors(&self) -> Vec<[u8; 3]> {
        if let Some([r, g, b]) = self
            .triple(["red", "green", "blue"])
            .or_else(|| self.triple(["r", "g", "b"]))
        {
            return (0..self.count)
                .map(|i| [r.values.get_u8(i), g.values.get_u8(i), b.values.get_u8(i)])
                .collect();
        }

        if let Some([r, g, b]) = self.triple(["f_dc_0", "f_dc_1", "f_dc_2"]) {
            return (0..self.count)
                .map(|i| {
                    [
                        sh_dc_to_channel(r.values.get_f32(i)),
                        sh_dc_to_channel(g.values.get_f32(i)),
                        sh_dc_to_channel(b.values.get_f32(i)),
                    ]
                })
                .collect();
        }

        vec![[NEUTRAL_GRAY; 3]; self.count]
    }

    /// Collapse into interchange records. Missing normals become zero.
    pub fn to_records(&self) -> Result<Vec<PointRecord>, PlyError> {
        let positions = self.positions()?;
        let normals = self.normals();
        let colors = self.colors();
        Ok(positions
            .into_iter()
            .enumerate()
            .map(|(i, position)| PointRecord {
                position,
                normal: normals.as_ref().map(|n| n[i]).unwrap_or(Vec3::ZERO),
                color: colors[i],
            })
            .collect())
    }

    /// Decode the `vertex` element of an in-memory binary PLY file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PlyError> {
        let header = PlyHeader::parse(bytes)?;
        if header.format != PlyFormat::BinaryLittleEndian {
            return Err(PlyError::UnsupportedFormat(header.format.keyword().to_string()));
        }

        // Fixed-width elements declared before `vertex` are skipped.
        let mut offset = header.data_offset;
        let mut vertex = None;
        for element in &header.elements {
            if element.name == "vertex" {
                vertex = Some(element);
                break;
            }
            let size = element.record_size().ok_or_else(|| {
                PlyError::UnsupportedFormat(format!(
                    "variable-width element '{}' before vertex data",
                    element.name
                ))
            })?;
            offset = size
                .checked_mul(element.count)
                .and_then(|block| offset.checked_add(block))
                .ok_or(PlyError::Truncated {
                    offset: bytes.len(),
                    expected: usize::MAX,
                })?;
        }
        let vertex = vertex.ok_or_else(|| PlyError::MissingElement("vertex".to_string()))?;

        let mut layout: Vec<(&PlyProperty, ScalarType, usize)> = Vec::new();
        let mut stride = 0usize;
        for property in &vertex.properties {
            let PropertyKind::Scalar(ty) = property.kind else {
                return Err(PlyError::UnsupportedFormat(format!(
                    "list property '{}' in vertex element",
                    property.name
                )));
            };
            layout.push((property, ty, stride));
            stride += ty.size();
        }

        if stride == 0 && vertex.count > 0 {
            return Err(PlyError::UnsupportedFormat(format!(
                "vertex element declares {} records but no properties",
                vertex.count
            )));
        }

        let available = bytes
            .len()
            .checked_sub(offset)
            .ok_or_else(|| PlyError::Truncated {
                offset: bytes.len(),
                expected: offset - bytes.len(),
            })?;
        let needed = stride.checked_mul(vertex.count).ok_or(PlyError::Truncated {
            offset: bytes.len(),
            expected: usize::MAX,
        })?;
        if available < needed {
            return Err(PlyError::Truncated {
                offset: bytes.len(),
                expected: needed - available,
            });
        }

        let records = &bytes[offset..offset + needed];
        let columns = layout
            .iter()
            .map(|&(property, ty, field_offset)| {
                let values = decode_column(records, vertex.count, stride, field_offset, ty);
                Column {
                    name: property.name.clone(),
                    ty,
                    values,
                }
            })
            .collect();

        debug!(
            "Decoded {} vertex records of {} bytes ({} fields)",
            vertex.count,
            stride,
            vertex.properties.len()
        );

        Ok(Self {
            count: vertex.count,
            columns,
        })
    }
}

fn decode_column(
    records: &[u8],
    count: usize,
    stride: usize,
    field_offset: usize,
    ty: ScalarType,
) -> ColumnValues {
    let field = |i: usize| &records[i * stride + field_offset..];
    match ty {
        ScalarType::F32 => ColumnValues::F32(
            (0..count)
                .map(|i| {
                    let b = field(i);
                    f32::from_le_bytes([b[0], b[1], b[2], b[3]])
                })
                .collect(),
        ),
        ScalarType::U8 => ColumnValues::U8((0..count).map(|i| field(i)[0]).collect()),
        other => ColumnValues::F64((0..count).map(|i| other.read_le(field(i))).collect()),
    }
}

/// Read the vertex records of a binary PLY file.
#[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
pub fn read_point_cloud(path: impl AsRef<Path>) -> Result<PointCloudColumns, PlyError> {
    let bytes = std::fs::read(path.as_ref())?;
    let columns = PointCloudColumns::from_bytes(&bytes)?;
    info!(
        "Point cloud loaded: {} points, fields [{}]",
        columns.len(),
        columns.field_names().collect::<Vec<_>>().join(", ")
    );
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(header: &str, records: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = header.as_bytes().to_vec();
        for r in records {
            bytes.extend_from_slice(r);
        }
        bytes
    }

    fn record(x: f32, y: f32, z: f32, rgb: [u8; 3]) -> Vec<u8> {
        let mut r = Vec::new();
        r.extend_from_slice(&x.to_le_bytes());
        r.extend_from_slice(&y.to_le_bytes());
        r.extend_from_slice(&z.to_le_bytes());
        r.extend_from_slice(&rgb);
        r
    }

    const XYZ_RGB: &str = "ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
                           property float x\nproperty float y\nproperty float z\n\
                           property uchar red\nproperty uchar green\nproperty uchar blue\n\
                           end_header\n";

    #[test]
    fn test_decode_xyz_rgb_records() {
        let bytes = encode(
            XYZ_RGB,
            &[record(1.0, 2.0, 3.0, [10, 20, 30]), record(-1.0, 0.5, 0.0, [255, 0, 7])],
        );
        let cloud = PointCloudColumns::from_bytes(&bytes).unwrap();

        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud.field_index("red"), Some(3));
        assert_eq!(cloud.positions().unwrap()[1], Vec3::new(-1.0, 0.5, 0.0));
        assert_eq!(cloud.colors(), vec![[10, 20, 30], [255, 0, 7]]);
        assert!(cloud.normals().is_none());
    }

    #[test]
    fn test_truncated_payload_reports_offset() {
        let bytes = encode(XYZ_RGB, &[record(1.0, 2.0, 3.0, [1, 2, 3])]);
        let err = PointCloudColumns::from_bytes(&bytes).unwrap_err();
        match err {
            PlyError::Truncated { offset, expected } => {
                assert_eq!(offset, bytes.len());
                assert_eq!(expected, 15);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_field_index_out_of_bounds() {
        let bytes = encode(
            XYZ_RGB,
            &[record(0.0, 0.0, 0.0, [0; 3]), record(0.0, 0.0, 0.0, [0; 3])],
        );
        let cloud = PointCloudColumns::from_bytes(&bytes).unwrap();
        assert!(cloud.column_at(5).is_ok());
        assert!(matches!(
            cloud.column_at(6),
            Err(PlyError::FieldIndexOutOfBounds { index: 6, len: 6 })
        ));
    }

    #[test]
    fn test_ascii_is_rejected() {
        let bytes = b"ply\nformat ascii 1.0\nelement vertex 0\nproperty float x\nend_header\n";
        assert!(matches!(
            PointCloudColumns::from_bytes(bytes),
            Err(PlyError::UnsupportedFormat(f)) if f == "ascii"
        ));
    }

    #[test]
    fn test_missing_position_field() {
        let cloud = PointCloudColumns::new(1, vec![Column::f32("x", vec![1.0])]).unwrap();
        assert!(matches!(
            cloud.positions(),
            Err(PlyError::MissingField { name }) if name == "y"
        ));
    }

    #[test]
    fn test_sh_dc_colors_and_gray_fallback() {
        let splat = PointCloudColumns::new(
            1,
            vec![
                Column::f32("x", vec![0.0]),
                Column::f32("y", vec![0.0]),
                Column::f32("z", vec![0.0]),
                Column::f32("f_dc_0", vec![1.0]),
                Column::f32("f_dc_1", vec![0.0]),
                Column::f32("f_dc_2", vec![-1.0]),
            ],
        )
        .unwrap();
        assert_eq!(splat.colors(), vec![[199, 128, 56]]);

        let bare = PointCloudColumns::new(
            2,
            vec![
                Column::f32("x", vec![0.0, 1.0]),
                Column::f32("y", vec![0.0, 1.0]),
                Column::f32("z", vec![0.0, 1.0]),
            ],
        )
        .unwrap();
        assert_eq!(bare.colors(), vec![[NEUTRAL_GRAY; 3]; 2]);
    }

    #[test]
    fn test_column_length_mismatch() {
        let err = PointCloudColumns::new(2, vec![Column::f32("x", vec![1.0])]).unwrap_err();
        assert!(matches!(err, PlyError::ColumnLength { len: 1, expected: 2, .. }));
    }

    #[test]
    fn test_skips_fixed_width_element_before_vertex() {
        let header = "ply\nformat binary_little_endian 1.0\nelement camera 1\nproperty int id\n\
                      element vertex 1\nproperty float x\nproperty float y\nproperty float z\n\
                      end_header\n";
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(&7i32.to_le_bytes());
        for v in [4.0f32, 5.0, 6.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let cloud = PointCloudColumns::from_bytes(&bytes).unwrap();
        assert_eq!(cloud.positions().unwrap(), vec![Vec3::new(4.0, 5.0, 6.0)]);
    }

    #[test]
    fn test_huge_vertex_count_is_an_error() {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 4611686018427387904\n\
                      property float x\nend_header\n";
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        let err = PointCloudColumns::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, PlyError::Truncated { .. }), "{err}");

        let skipped = "ply\nformat binary_little_endian 1.0\nelement camera 4611686018427387904\n\
                       property int id\nelement vertex 1\nproperty float x\nend_header\n";
        let err = PointCloudColumns::from_bytes(skipped.as_bytes()).unwrap_err();
        assert!(matches!(err, PlyError::Truncated { .. }), "{err}");

        let overshoot = "ply\nformat binary_little_endian 1.0\nelement camera 8\n\
                         property int id\nelement vertex 0\nproperty float x\nend_header\n";
        let err = PointCloudColumns::from_bytes(overshoot.as_bytes()).unwrap_err();
        assert!(matches!(err, PlyError::Truncated { expected: 32, .. }), "{err}");
    }

    #[test]
    fn test_vertex_without_properties_is_rejected() {
        let header = "ply\nformat binary_little_endian 1.0\nelement vertex 4611686018427387904\n\
                      end_header\n";
        let err = PointCloudColumns::from_bytes(header.as_bytes()).unwrap_err();
        assert!(matches!(err, PlyError::UnsupportedFormat(_)), "{err}");
    }
}
