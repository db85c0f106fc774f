//! Deterministic placeholder geometry.
//!
//! Used when stages run without external tools, so every downstream reader
//! still receives a well-formed file of the expected kind.

use crate::color::channel_to_sh_dc;
use crate::ply::{Column, PointCloudColumns, PointRecord};
use crate::types::TriangleMesh;
use glam::Vec3;

const GOLDEN_ANGLE: f32 = 2.399_963_2;

fn fibonacci_direction(i: usize, n: usize) -> Vec3 {
    let y = 1.0 - 2.0 * (i as f32 + 0.5) / n as f32;
    let radius = (1.0 - y * y).max(0.0).sqrt();
    let theta = GOLDEN_ANGLE * i as f32;
    Vec3::new(radius * theta.cos(), y, radius * theta.sin())
}

fn direction_color(direction: Vec3) -> [u8; 3] {
    let c = (direction * 0.5 + Vec3::splat(0.5)) * 255.0;
    [c.x.round() as u8, c.y.round() as u8, c.z.round() as u8]
}

/// `n` points spread evenly over the unit sphere, coloured by direction.
pub fn synthetic_point_cloud(n: usize) -> Vec<PointRecord> {
    (0..n)
        .map(|i| {
            let direction = fibonacci_direction(i, n);
            PointRecord::new(direction, direction, direction_color(direction))
        })
        .collect()
}

/// A splat-shaped column set: positions, normals, SH-DC colour, opacity,
/// log-scales and a unit rotation quaternion.
pub fn synthetic_splat_columns(n: usize) -> PointCloudColumns {
    let points = synthetic_point_cloud(n);
    let axis = |f: fn(&PointRecord) -> f32| points.iter().map(f).collect::<Vec<f32>>();

    let mut columns = vec![
        Column::f32("x", axis(|p| p.position.x)),
        Column::f32("y", axis(|p| p.position.y)),
        Column::f32("z", axis(|p| p.position.z)),
        Column::f32("nx", vec![0.0; n]),
        Column::f32("ny", vec![0.0; n]),
        Column::f32("nz", vec![0.0; n]),
    ];
    for channel in 0..3 {
        columns.push(Column::f32(
            format!("f_dc_{channel}"),
            points
                .iter()
                .map(|p| channel_to_sh_dc(p.color[channel]))
                .collect(),
        ));
    }
    columns.push(Column::f32("opacity", vec![2.0; n]));
    for s in 0..3 {
        columns.push(Column::f32(format!("scale_{s}"), vec![-4.0; n]));
    }
    columns.push(Column::f32("rot_0", vec![1.0; n]));
    for r in 1..4 {
        columns.push(Column::f32(format!("rot_{r}"), vec![0.0; n]));
    }

    PointCloudColumns::from_parts(n, columns)
}

/// A coloured icosahedron with outward normals.
pub fn synthetic_mesh() -> TriangleMesh {
    let t = (1.0 + 5.0f32.sqrt()) / 2.0;
    let positions: Vec<Vec3> = [
        [-1.0, t, 0.0],
        [1.0, t, 0.0],
        [-1.0, -t, 0.0],
        [1.0, -t, 0.0],
        [0.0, -1.0, t],
        [0.0, 1.0, t],
        [0.0, -1.0, -t],
        [0.0, 1.0, -t],
        [t, 0.0, -1.0],
        [t, 0.0, 1.0],
        [-t, 0.0, -1.0],
        [-t, 0.0, 1.0],
    ]
    .into_iter()
    .map(|p| Vec3::from_array(p).normalize())
    .collect();

    let triangles = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];

    TriangleMesh {
        normals: Some(positions.clone()),
        colors: Some(positions.iter().map(|&p| direction_color(p)).collect()),
        positions,
        triangles,
    }
}
