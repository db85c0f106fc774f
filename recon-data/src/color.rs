//! Spherical-harmonic colour reduction.
//!
//! Splat trainers store base colour as the zeroth-order SH coefficient
//! (`f_dc_0..2`) rather than as bytes. Viewers want plain RGB.

/// Normalization constant of the zeroth-order real spherical harmonic, `1 / (2 * sqrt(pi))`.
pub const SH_C0: f64 = 0.28209479177387814;

/// Channel value used when a record carries no colour at all.
pub const NEUTRAL_GRAY: u8 = 128;

/// Convert one SH-DC coefficient into an 8-bit channel.
///
/// `clamp(round((coefficient * C0 + 0.5) * 255), 0, 255)`
pub fn sh_dc_to_channel(coefficient: f32) -> u8 {
    let value = ((coefficient as f64 * SH_C0 + 0.5) * 255.0).round();
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 255.0) as u8
}

pub fn sh_dc_to_rgb(dc: [f32; 3]) -> [u8; 3] {
    [
        sh_dc_to_channel(dc[0]),
        sh_dc_to_channel(dc[1]),
        sh_dc_to_channel(dc[2]),
    ]
}

/// Inverse of [`sh_dc_to_channel`], used when synthesising splat files.
pub fn channel_to_sh_dc(channel: u8) -> f32 {
    ((channel as f64 / 255.0 - 0.5) / SH_C0) as f32
}
