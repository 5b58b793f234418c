// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoded picture to packed RGBA conversion.
//!
//! Planar input is 8-bit YCbCr 4:2:0 with top-left chroma siting: the chroma
//! sample for luma (x, y) is at (x >> 1, y >> 1), no interpolation. Colors use
//! BT.601 studio range:
//!
//! ```text
//! R = 1.164(Y-16) + 1.596(Cr-128)
//! G = 1.164(Y-16) - 0.813(Cr-128) - 0.391(Cb-128)
//! B = 1.164(Y-16) + 2.018(Cb-128)
//! ```
//!
//! evaluated in 13-bit fixed point, rounded half up, then clamped to 0..=255.
//! A mid-gray input (Y = Cb = Cr = 128) therefore converts to 130.

use crate::engine::{DecodedPicture, InterleavedPicture, PlanarPicture};
use crate::{Error, Result};

// Coefficients ×8192
const Y_SCALE: i32 = 9535;
const CR_R: i32 = 13074;
const CR_G: i32 = 6660;
const CB_G: i32 = 3203;
const CB_B: i32 = 16531;
const ROUND: i32 = 1 << 12;
const SHIFT: u32 = 13;

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Chroma contributions shared by the luma samples of one chroma site.
#[derive(Clone, Copy)]
struct Chroma {
    r: i32,
    g: i32,
    b: i32,
}

impl Chroma {
    #[inline]
    fn new(cb: u8, cr: u8) -> Self {
        let cb = i32::from(cb) - 128;
        let cr = i32::from(cr) - 128;
        Self {
            r: CR_R * cr,
            g: -CR_G * cr - CB_G * cb,
            b: CB_B * cb,
        }
    }

    #[inline]
    fn write(self, y: u8, a: u8, out: &mut [u8]) {
        let yv = (i32::from(y) - 16) * Y_SCALE + ROUND;
        out[0] = clamp_u8((yv + self.r) >> SHIFT);
        out[1] = clamp_u8((yv + self.g) >> SHIFT);
        out[2] = clamp_u8((yv + self.b) >> SHIFT);
        out[3] = a;
    }
}

fn required_len(width: u32, height: u32) -> Result<usize> {
    u64::from(width)
        .checked_mul(u64::from(height))
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| usize::try_from(n).ok())
        .ok_or(Error::InvalidData("image too large"))
}

/// Convert `picture` into `dst`, which must hold exactly `width * height * 4` bytes.
///
/// Output is row-major RGBA with no row padding. Alpha is 255 when the picture has
/// no alpha plane. Premultiplied alpha is copied as is.
pub fn convert_into(picture: &DecodedPicture, dst: &mut [u8]) -> Result<()> {
    let required = required_len(picture.width(), picture.height())?;
    if dst.len() != required {
        return Err(Error::BufferSizeMismatch {
            required,
            actual: dst.len(),
        });
    }
    match picture {
        DecodedPicture::PlanarYCbCrA(planar) => planar_to_rgba(planar, dst),
        DecodedPicture::InterleavedRgba(interleaved) => copy_interleaved(interleaved, dst),
    }
}

/// Convert `picture` into a newly allocated RGBA buffer.
pub fn to_rgba(picture: &DecodedPicture) -> Result<Vec<u8>> {
    let len = required_len(picture.width(), picture.height())?;
    let mut out = Vec::new();
    out.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    out.resize(len, 0);
    convert_into(picture, &mut out)?;
    Ok(out)
}

fn planar_to_rgba(pic: &PlanarPicture, dst: &mut [u8]) -> Result<()> {
    let width = usize::try_from(pic.width)?;
    let height = usize::try_from(pic.height)?;
    let (cw, ch) = PlanarPicture::chroma_size(pic.width, pic.height);
    let (cw, ch) = (usize::try_from(cw)?, usize::try_from(ch)?);

    pic.y.check(width, height)?;
    pic.cb.check(cw, ch)?;
    pic.cr.check(cw, ch)?;
    if let Some(alpha) = &pic.alpha {
        alpha.check(width, height)?;
    }
    if width == 0 {
        return Ok(());
    }

    for (y, out_row) in dst.chunks_exact_mut(width * 4).enumerate() {
        let luma = pic.y.row(y, width);
        let cb = pic.cb.row(y >> 1, cw);
        let cr = pic.cr.row(y >> 1, cw);
        let alpha = pic.alpha.as_ref().map(|a| a.row(y, width));
        let a = |x: usize| alpha.map_or(255, |row| row[x]);

        // Two luma samples per chroma fetch
        let mut pairs = out_row.chunks_exact_mut(8);
        for (cx, out) in (&mut pairs).enumerate() {
            let x = cx * 2;
            let chroma = Chroma::new(cb[cx], cr[cx]);
            chroma.write(luma[x], a(x), &mut out[..4]);
            chroma.write(luma[x + 1], a(x + 1), &mut out[4..]);
        }
        let tail = pairs.into_remainder();
        if !tail.is_empty() {
            let x = width - 1;
            Chroma::new(cb[x >> 1], cr[x >> 1]).write(luma[x], a(x), tail);
        }
    }
    Ok(())
}

fn copy_interleaved(pic: &InterleavedPicture, dst: &mut [u8]) -> Result<()> {
    let row_len = usize::try_from(pic.width)?
        .checked_mul(4)
        .ok_or(Error::InvalidData("image too large"))?;
    let height = usize::try_from(pic.height)?;

    if pic.stride == row_len {
        let src = pic
            .data
            .get(..dst.len())
            .ok_or(Error::InvalidData("interleaved buffer too small"))?;
        dst.copy_from_slice(src);
        return Ok(());
    }

    if pic.stride < row_len {
        return Err(Error::InvalidData("interleaved stride shorter than a row"));
    }
    if height > 0 && pic.data.len() < interleaved_len(pic.stride, row_len, height)? {
        return Err(Error::InvalidData("interleaved buffer too small"));
    }
    if row_len == 0 {
        return Ok(());
    }
    for (y, out_row) in dst.chunks_exact_mut(row_len).enumerate() {
        let start = y * pic.stride;
        out_row.copy_from_slice(&pic.data[start..start + row_len]);
    }
    Ok(())
}

/// Bytes spanned by `rows` rows of `row_len` bytes spaced `stride` apart.
pub(crate) fn interleaved_len(stride: usize, row_len: usize, rows: usize) -> Result<usize> {
    rows.saturating_sub(1)
        .checked_mul(stride)
        .and_then(|n| n.checked_add(row_len))
        .ok_or(Error::InvalidData("image too large"))
}

/// Rotate a packed RGBA raster anti-clockwise by `degrees` (0, 90, 180 or 270).
///
/// Returns the rotated raster and its width and height.
pub fn rotate_rgba(src: &[u8], width: u32, height: u32, degrees: u16) -> Result<(Vec<u8>, u32, u32)> {
    let len = required_len(width, height)?;
    if src.len() != len {
        return Err(Error::BufferSizeMismatch {
            required: len,
            actual: src.len(),
        });
    }
    let (out_width, out_height) = match degrees {
        0 | 180 => (width, height),
        90 | 270 => (height, width),
        _ => return Err(Error::InvalidData("rotation is not a multiple of 90 degrees")),
    };

    let mut out = Vec::new();
    out.try_reserve_exact(len).map_err(|_| Error::OutOfMemory)?;
    if degrees == 0 {
        out.extend_from_slice(src);
        return Ok((out, width, height));
    }
    out.resize(len, 0);

    let (w, h) = (usize::try_from(width)?, usize::try_from(height)?);
    let out_w = usize::try_from(out_width)?;
    for (i, px) in src.chunks_exact(4).enumerate() {
        let (x, y) = (i % w, i / w);
        let (dx, dy) = match degrees {
            90 => (y, w - 1 - x),
            180 => (w - 1 - x, h - 1 - y),
            _ => (h - 1 - y, x),
        };
        let at = (dy * out_w + dx) * 4;
        out[at..at + 4].copy_from_slice(px);
    }
    Ok((out, out_width, out_height))
}
