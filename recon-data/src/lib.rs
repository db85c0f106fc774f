//! Recon Data Crate
//!
//! Interchange formats for the reconstruction pipeline: binary PLY point and
//! mesh records, spherical-harmonic colour reduction, random downsampling and
//! glTF/GLB scene export. Nothing here spawns processes or knows about stages.

mod atomic;
pub mod color;
pub mod export;
pub mod ply;
pub mod sampling;
pub mod synthetic;
pub mod types;

pub use atomic::write_atomically;
pub use color::{SH_C0, sh_dc_to_channel, sh_dc_to_rgb};
pub use export::{ExportError, SceneGeometry, write_glb, write_gltf};
pub use ply::{
    PlyError, PlyField, PointCloudColumns, PointRecord, load_mesh_from_ply, read_point_cloud,
    write_columns, write_mesh_ply, write_points,
};
pub use sampling::{downsample_columns, downsample_points};
pub use types::TriangleMesh;
