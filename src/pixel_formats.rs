// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The two pixel layouts an upload touches.
//!
//! Sources arrive as [Unorm4]: four bytes per pixel, RGBA order, rows top to bottom.  Textures
//! store [Float4]: four linear 32-bit floats per texel, rows bottom to top.
//!
//! ```
//! use texture_streaming::pixel_formats::{Float4, Unorm4};
//!
//! let white = Unorm4 { r: 255, g: 255, b: 255, a: 255 };
//! assert_eq!(Float4::from_gamma_squared(white), Float4 { r: 1.0, g: 1.0, b: 1.0, a: 1.0 });
//! ```

use crate::config::BYTES_PER_ELEMENT;

/// Bytes per texel of the destination format (RGBA32Float).
pub const TEXTURE_BYTES_PER_PIXEL: usize = 16;

/// Approximate gamma decode: normalizes `v` to 0..1 and squares it.
///
/// This is the gamma-2.0 approximation, not the piecewise sRGB curve.
#[inline]
pub fn decode_gamma_squared(v: u8) -> f32 {
    let n = v as f32 / 255.0;
    n * n
}

/// RGBA pixel with 8-bit normalized channels, as decoders produce it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Unorm4 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Unorm4 {
    /// Reads the pixel at `index` from tightly packed RGBA bytes, such as a staging buffer.
    /// Byte 0 of each element is red.
    #[inline]
    pub fn from_bytes(bytes: &[u8], index: usize) -> Self {
        let start = index * BYTES_PER_ELEMENT;
        Unorm4 {
            r: bytes[start],
            g: bytes[start + 1],
            b: bytes[start + 2],
            a: bytes[start + 3],
        }
    }
}

/// Four-channel linear floating point color; the texel type of uploaded textures.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Float4 {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Float4 {
    /// Applies [decode_gamma_squared] to all four channels, alpha included.
    pub fn from_gamma_squared(p: Unorm4) -> Self {
        Float4 {
            r: decode_gamma_squared(p.r),
            g: decode_gamma_squared(p.g),
            b: decode_gamma_squared(p.b),
            a: decode_gamma_squared(p.a),
        }
    }

    /// Box filter over up to four texels.  Used for mip generation.
    pub fn avg(texels: &[Float4]) -> Self {
        if texels.is_empty() {
            return Float4::default();
        }
        let mut sum = Float4::default();
        for t in texels {
            sum.r += t.r;
            sum.g += t.g;
            sum.b += t.b;
            sum.a += t.a;
        }
        let c = texels.len() as f32;
        Float4 {
            r: sum.r / c,
            g: sum.g / c,
            b: sum.b / c,
            a: sum.a / c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_endpoints() {
        assert_eq!(decode_gamma_squared(0), 0.0);
        assert_eq!(decode_gamma_squared(255), 1.0);
        let mid = decode_gamma_squared(128);
        assert!((mid - (128.0f32 / 255.0).powi(2)).abs() < 1e-6);
    }

    #[test]
    fn from_bytes_reads_rgba_in_order() {
        let p = Unorm4::from_bytes(&[9, 9, 9, 9, 1, 2, 3, 4], 1);
        assert_eq!(p, Unorm4 { r: 1, g: 2, b: 3, a: 4 });
    }

    #[test]
    fn avg_is_box_filter() {
        let a = Float4 { r: 1.0, g: 0.0, b: 0.5, a: 1.0 };
        let b = Float4 { r: 0.0, g: 0.0, b: 0.5, a: 1.0 };
        assert_eq!(
            Float4::avg(&[a, b]),
            Float4 { r: 0.5, g: 0.0, b: 0.5, a: 1.0 }
        );
    }
}
