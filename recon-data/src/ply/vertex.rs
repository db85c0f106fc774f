//! PLY vertex data structures

use glam::Vec3;

/// Interchange unit for dense-cloud transplant and vertex export.
///
/// Collections of records are unordered, but their length matters: it sets
/// the memory budget of whatever consumes them downstream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointRecord {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: [u8; 3],
}

impl PointRecord {
    pub fn new(position: Vec3, normal: Vec3, color: [u8; 3]) -> Self {
        Self {
            position,
            normal,
            color,
        }
    }
}
