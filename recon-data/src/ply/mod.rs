//! PLY file reading and writing

mod columns;
mod error;
mod header;
mod loader;
mod vertex;
mod writer;

pub use columns::{Column, ColumnValues, PointCloudColumns, read_point_cloud};
pub use error::PlyError;
pub use header::{
    HEADER_SENTINEL, PlyElement, PlyFormat, PlyHeader, PlyProperty, PropertyKind, ScalarType,
};
pub use loader::load_mesh_from_ply;
pub use vertex::PointRecord;
pub use writer::{
    PlyField, encode_columns, records_to_columns, write_columns, write_mesh_ply, write_points,
};
