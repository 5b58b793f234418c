// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract between the decode driver and an external HEVC decoder engine,
//! and the picture types such an engine produces.

use crate::{Error, Result};

/// Outcome of one [`DecoderEngine::decode_step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// The step made progress.
    Ok,
    /// The engine has consumed everything it was given.
    NeedsMoreInput,
    /// Any other engine-specific status, treated as a failure.
    Other(i32),
}

/// Receives each fully reconstructed picture as the engine surfaces it.
pub type FrameCallback = std::boxed::Box<dyn FnMut(DecodedPicture)>;

/// A push/pull HEVC decoder.
///
/// Implementations wrap a real decoder (libde265, a hardware backend, ...); this
/// crate never decodes HEVC itself. Methods are called from one thread, one at a
/// time, by the [`DecodeSession`](crate::DecodeSession) that owns the engine.
///
/// There is no timeout or cancellation: a `decode_step` that never returns stalls
/// its session, and every session scheduled after it.
pub trait DecoderEngine {
    /// Append a chunk of Annex B bytestream. `timestamp` increases by one per push.
    fn push_data(&mut self, data: &[u8], timestamp: u64) -> Result<()>;

    /// Run one unit of decoding work. Frame callbacks fire from inside this call.
    fn decode_step(&mut self) -> DecodeStatus;

    /// Whether decoded pictures or internal work are still pending.
    fn has_more_output(&self) -> bool;

    /// Signal end of input so the engine drains its reorder buffers.
    fn flush(&mut self);

    /// Turn in-loop filtering (deblocking, SAO) off or on.
    fn disable_filters(&mut self, disable: bool);

    /// Install the per-frame callback, replacing any previous one.
    fn set_frame_callback(&mut self, callback: FrameCallback);
}

/// One plane of samples with an explicit row stride in bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub data: Vec<u8>,
    pub stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, stride: usize) -> Self {
        Self { data, stride }
    }

    /// Check that `rows` rows of `row_len` samples fit in the buffer.
    pub(crate) fn check(&self, row_len: usize, rows: usize) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        if self.stride < row_len {
            return Err(Error::InvalidData("plane stride shorter than a row"));
        }
        let needed = (rows - 1)
            .checked_mul(self.stride)
            .and_then(|n| n.checked_add(row_len))
            .ok_or(Error::InvalidData("plane size overflow"))?;
        if self.data.len() < needed {
            return Err(Error::InvalidData("plane buffer too small"));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn row(&self, y: usize, row_len: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + row_len]
    }
}

/// 8-bit YCbCr 4:2:0 output, with an optional alpha plane at luma resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarPicture {
    pub width: u32,
    pub height: u32,
    pub y: Plane,
    pub cb: Plane,
    pub cr: Plane,
    pub alpha: Option<Plane>,
}

impl PlanarPicture {
    /// Chroma plane dimensions for 4:2:0: `ceil(width / 2)` by `ceil(height / 2)`.
    #[must_use]
    pub const fn chroma_size(width: u32, height: u32) -> (u32, u32) {
        (width.div_ceil(2), height.div_ceil(2))
    }

    /// Split a single buffer holding the luma plane (stride = width) followed by the
    /// Cb and Cr planes (stride = `ceil(width / 2)`).
    pub fn from_concatenated(width: u32, height: u32, data: &[u8]) -> Result<Self> {
        let (cw, ch) = Self::chroma_size(width, height);
        let luma_len = usize::try_from(u64::from(width) * u64::from(height))?;
        let chroma_len = usize::try_from(u64::from(cw) * u64::from(ch))?;
        let total = chroma_len
            .checked_mul(2)
            .and_then(|n| n.checked_add(luma_len))
            .ok_or(Error::InvalidData("plane size overflow"))?;
        if data.len() < total {
            return Err(Error::InvalidData("concatenated planes too short"));
        }

        let plane = |range: std::ops::Range<usize>, stride: u32| -> Result<Plane> {
            let mut buf = Vec::new();
            buf.try_reserve_exact(range.len()).map_err(|_| Error::OutOfMemory)?;
            buf.extend_from_slice(&data[range]);
            Ok(Plane::new(buf, usize::try_from(stride)?))
        };

        Ok(Self {
            width,
            height,
            y: plane(0..luma_len, width)?,
            cb: plane(luma_len..luma_len + chroma_len, cw)?,
            cr: plane(luma_len + chroma_len..total, cw)?,
            alpha: None,
        })
    }
}

/// RGBA output already interleaved by the engine, rows possibly padded.
#[derive(Debug, Clone, PartialEq)]
pub struct InterleavedPicture {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub stride: usize,
}

/// A decoded picture in whichever layout the engine produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPicture {
    PlanarYCbCrA(PlanarPicture),
    InterleavedRgba(InterleavedPicture),
}

impl DecodedPicture {
    #[must_use]
    pub fn width(&self) -> u32 {
        match self {
            Self::PlanarYCbCrA(p) => p.width,
            Self::InterleavedRgba(p) => p.width,
        }
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        match self {
            Self::PlanarYCbCrA(p) => p.height,
            Self::InterleavedRgba(p) => p.height,
        }
    }

    /// Whether the picture carries its own alpha samples.
    #[must_use]
    pub fn has_alpha(&self) -> bool {
        match self {
            Self::PlanarYCbCrA(p) => p.alpha.is_some(),
            Self::InterleavedRgba(_) => true,
        }
    }
}
