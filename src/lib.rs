#![deny(unsafe_code)]
//! Decoding pipeline for HEIF/HEIC still images.
//!
//! The crate walks the ISO-BMFF box structure of a HEIF container, pulls out the
//! HEVC decoder configuration (`hvcC`) and the item payload referenced by `iloc`,
//! feeds both to an external HEVC [`DecoderEngine`] one step at a time, and turns
//! the pictures it produces into packed RGBA.
//!
//! Two entry points exist:
//!
//! * [`extract()`] walks the raw box tree ([`ParsedBox`]) and returns the ordered
//!   [`BufferQueue`] for the container's codec configuration and item data.
//! * [`HeifContext`] understands items: it enumerates image ids, knows the primary
//!   image and returns compressed data per id. [`ImageHandle`] and [`HeifDecoder`]
//!   build lazy, memoized decoding on top of it.
//!
//! The HEVC bitstream itself is never decoded here.
//!
//! This crate is written entirely in safe Rust code.

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use byteorder::ReadBytesExt;
use fallible_collections::TryReserveError;
use log::debug;
use std::io::{Read, Take};

mod boxes;
mod context;
mod convert;
mod driver;
mod engine;
mod extract;
mod handle;
mod items;
mod range;

pub use crate::boxes::{BoxType, FourCC, fourcc};
pub use crate::context::{HeifContext, ImageInfo};
pub use crate::convert::{convert_into, rotate_rgba, to_rgba};
pub use crate::driver::{Completion, DecodeSession, DriverState, Scheduler, Spawner, Task, TaskPoll};
pub use crate::engine::{
    DecodeStatus, DecodedPicture, DecoderEngine, FrameCallback, InterleavedPicture, PlanarPicture, Plane,
};
pub use crate::extract::{BufferQueue, extract, extract_from_boxes, extract_images};
pub use crate::handle::{DecodedImage, HeifDecoder, ImageHandle};
pub use crate::items::HevcConfig;
pub use crate::range::{BitstreamRange, ParsedBox, read_all_boxes};

pub use enough::{Stop, StopReason, Unstoppable};

/// Lossless widening to `u64` for box sizes and offsets.
trait ToU64 {
    fn to_u64(self) -> u64;
}

impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap()
    }
}

/// Lossless widening to `usize` for field values read from boxes.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// The `const` assertion rejects types wider than `usize` at compile time.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

/// Bytes consumed so far, used to record `mdat` bounds.
pub(crate) trait Offset {
    fn offset(&self) -> u64;
}

/// Counts bytes read through it.
pub(crate) struct OffsetReader<'a, T> {
    reader: &'a mut T,
    offset: u64,
}

impl<'a, T> OffsetReader<'a, T> {
    pub(crate) fn new(reader: &'a mut T) -> Self {
        Self { reader, offset: 0 }
    }
}

impl<T> Offset for OffsetReader<'_, T> {
    fn offset(&self) -> u64 {
        self.offset
    }
}

impl<T: Read> Read for OffsetReader<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes_read = self.reader.read(buf)?;
        self.offset = self
            .offset
            .checked_add(bytes_read.to_u64())
            .ok_or(Error::Unsupported("total bytes read too large for offset type"))?;
        Ok(bytes_read)
    }
}

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

// Shadow the allocating std types so parsers reach for `TryVec`
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes parser, driver and conversion failures.
///
/// `InvalidData` and `UnexpectedEOF` are the structural container errors: a
/// truncated or malformed box stream. The remaining variants name the specific
/// thing that went wrong.
#[derive(Debug)]
pub enum Error {
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited parser support rather than invalid data.
    Unsupported(&'static str),
    /// Reflect `std::io::ErrorKind::UnexpectedEof` for short data.
    UnexpectedEOF,
    /// Propagate underlying errors from `std::io`.
    Io(std::io::Error),
    /// The top-level box list contains no `meta` box.
    MissingMetaBox,
    /// A box the decoding path depends on (`iloc`, `iprp`, `ipco`, `hvcC`) is absent.
    MissingRequiredBox(&'static str),
    /// Extraction succeeded structurally but produced neither headers nor payload.
    NoDecodableData,
    /// The container declares no decodable top-level image.
    NoImagesFound,
    /// The decoder engine reported a status other than ok / needs-more-input.
    Decode(i32),
    /// An [`ImageHandle`] was used after [`ImageHandle::release`].
    HandleUseAfterRelease,
    /// A caller-provided raster does not have exactly `width * height * 4` bytes.
    BufferSizeMismatch {
        /// Required buffer size in bytes
        required: usize,
        /// Actual buffer size provided
        actual: usize,
    },
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing
    ResourceLimitExceeded(&'static str),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => *s,
            Self::UnexpectedEOF => "EOF",
            Self::Io(err) => return std::fmt::Display::fmt(err, f),
            Self::MissingMetaBox => "Missing meta box",
            Self::MissingRequiredBox(name) => return write!(f, "Missing required '{name}' box"),
            Self::NoDecodableData => "No decodable data in container",
            Self::NoImagesFound => "No images found",
            Self::Decode(code) => return write!(f, "Decoder error {code}"),
            Self::HandleUseAfterRelease => "Image handle used after release",
            Self::BufferSizeMismatch { required, actual } => {
                return write!(f, "Raster size mismatch: need {required}, got {actual}");
            },
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::UnexpectedEOF,
            _ => Self::Io(err),
        }
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::InvalidData(_) => std::io::ErrorKind::InvalidData,
            Error::UnexpectedEOF => std::io::ErrorKind::UnexpectedEof,
            Error::Io(io_err) => return io_err,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand for [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Header of one box on the streaming path. See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    /// Box type.
    pub(crate) name: BoxType,
    /// Size of the box in bytes. `u64::MAX` for a box extending to the end of its parent.
    pub(crate) size: u64,
    /// Offset to the start of the contained data (or header size).
    pub(crate) offset: u64,
    /// Uuid for extended type.
    #[allow(unused)]
    pub(crate) uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    pub(crate) const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 16-byte size
    pub(crate) const MIN_LARGE_SIZE: u64 = 16;
}

/// Options for parsing HEIF files
///
/// Prefer using [`DecodeConfig::lenient()`] with [`HeifContext`] instead.
#[derive(Debug, Clone, Copy)]
#[derive(Default)]
pub struct ParseOptions {
    /// Enable lenient parsing mode
    ///
    /// When true, non-critical validation errors (like non-zero flags in boxes
    /// that expect zero flags) will be ignored instead of returning errors.
    ///
    /// Default: false (strict validation)
    pub lenient: bool,
}

/// Configuration for parsing and decoding HEIF files
///
/// Resource limits are checked **before** allocations occur, preventing out-of-memory
/// conditions from malicious files that claim unrealistic dimensions or counts.
///
/// # Examples
///
/// ```rust
/// use heifdec::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input, with the decoder's in-loop filters left on
/// let config = DecodeConfig::default()
///     .with_peak_memory_limit(100_000_000)  // 100MB
///     .with_total_megapixels_limit(64)       // 64MP max
///     .with_max_images(16)
///     .disable_filters(false);
///
/// // No limits
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum peak heap memory used for compressed buffers, in bytes.
    /// Default: 1GB (1,000,000,000 bytes)
    pub peak_memory_limit: Option<u64>,

    /// Maximum megapixels of a single image, as declared by its `ispe` property.
    /// Default: 512 megapixels
    pub total_megapixels_limit: Option<u32>,

    /// Maximum number of top-level images.
    /// Default: 1,000 images
    pub max_images: Option<u32>,

    /// Enable lenient parsing mode.
    /// Default: false (strict validation)
    pub lenient: bool,

    /// Ask the decoder engine to skip in-loop filtering (deblocking, SAO).
    ///
    /// Faster and deterministic across engines, at some cost in quality.
    /// Default: true
    pub disable_filters: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            peak_memory_limit: Some(1_000_000_000),
            total_megapixels_limit: Some(512),
            max_images: Some(1_000),
            lenient: false,
            disable_filters: true,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            total_megapixels_limit: None,
            max_images: None,
            lenient: false,
            disable_filters: true,
        }
    }

    /// Set the peak memory limit in bytes
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Set the per-image megapixel limit
    pub fn with_total_megapixels_limit(mut self, megapixels: u32) -> Self {
        self.total_megapixels_limit = Some(megapixels);
        self
    }

    /// Set the maximum number of top-level images
    pub fn with_max_images(mut self, images: u32) -> Self {
        self.max_images = Some(images);
        self
    }

    /// Enable lenient parsing mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    /// Choose whether the decoder engine runs its in-loop filters
    pub fn disable_filters(mut self, disable: bool) -> Self {
        self.disable_filters = disable;
        self
    }

    pub(crate) fn parse_options(&self) -> ParseOptions {
        ParseOptions { lenient: self.lenient }
    }
}

/// A box on the streaming path, its reader limited to the box's remaining bytes.
pub(crate) struct BMFFBox<'a, T> {
    pub(crate) head: BoxHeader,
    pub(crate) content: Take<&'a mut T>,
}

impl<T: Read> BMFFBox<'_, T> {
    pub(crate) fn read_into_try_vec(&mut self) -> std::io::Result<TryVec<u8>> {
        let limit = self.content.limit();
        // A size=0 box reads as u64::MAX minus its header length
        let mut vec = if limit >= u64::MAX - BoxHeader::MIN_LARGE_SIZE {
            // Unknown size (size=0 box), read without pre-allocation
            std::vec::Vec::new()
        } else {
            let mut v = std::vec::Vec::new();
            v.try_reserve_exact(limit as usize)
                .map_err(|_| std::io::ErrorKind::OutOfMemory)?;
            v
        };
        self.content.read_to_end(&mut vec)?;
        Ok(vec.into())
    }
}

pub(crate) struct BoxIter<'a, T> {
    src: &'a mut T,
}

impl<T: Read> BoxIter<'_, T> {
    pub(crate) fn new(src: &mut T) -> BoxIter<'_, T> {
        BoxIter { src }
    }

    pub(crate) fn next_box(&mut self) -> Result<Option<BMFFBox<'_, T>>> {
        let r = read_box_header(self.src);
        match r {
            Ok(h) => Ok(Some(BMFFBox {
                head: h,
                content: self.src.take(h.size - h.offset),
            })),
            Err(Error::UnexpectedEOF) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<T: Read> Read for BMFFBox<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.content.read(buf)
    }
}

impl<T: Offset> Offset for BMFFBox<'_, T> {
    fn offset(&self) -> u64 {
        self.content.get_ref().offset()
    }
}

impl<T: Read> BMFFBox<'_, T> {
    pub(crate) fn bytes_left(&self) -> u64 {
        self.content.limit()
    }

    pub(crate) const fn get_header(&self) -> &BoxHeader {
        &self.head
    }

    pub(crate) fn box_iter(&mut self) -> BoxIter<'_, Self> {
        BoxIter::new(self)
    }
}

impl<T> Drop for BMFFBox<'_, T> {
    fn drop(&mut self) {
        if self.content.limit() > 0 {
            let name: FourCC = From::from(self.head.name);
            debug!("Dropping {} bytes in '{}'", self.content.limit(), name);
        }
    }
}

/// Read a box header: size, type and the optional `uuid` extended type.
/// See ISO 14496-12:2015 § 4.2
pub(crate) fn read_box_header<T: ReadBytesExt>(src: &mut T) -> Result<BoxHeader> {
    let size32 = be_u32(src)?;
    let name = BoxType::from(be_u32(src)?);
    let size = match size32 {
        // The box runs to the end of the file
        0 => u64::MAX,
        1 => {
            let size64 = be_u64(src)?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::InvalidData("malformed wide size"));
            }
            size64
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::InvalidData("malformed size"));
            }
            u64::from(size32)
        },
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let uuid = if name == BoxType::UuidBox {
        if size >= offset + 16 {
            let mut buffer = [0u8; 16];
            let count = src.read(&mut buffer)?;
            offset += count.to_u64();
            if count == 16 {
                Some(buffer)
            } else {
                debug!("malformed uuid (short read), skipping");
                None
            }
        } else {
            debug!("malformed uuid, skipping");
            None
        }
    } else {
        None
    };
    if offset > size {
        return Err(Error::InvalidData("box header larger than box"));
    }
    Ok(BoxHeader { name, size, offset, uuid })
}

/// Version and 24-bit flags of a full box.
pub(crate) fn read_fullbox_extra<T: ReadBytesExt>(src: &mut T) -> Result<(u8, u32)> {
    let version = src.read_u8()?;
    let flags_a = src.read_u8()?;
    let flags_b = src.read_u8()?;
    let flags_c = src.read_u8()?;
    Ok((
        version,
        u32::from(flags_a) << 16 | u32::from(flags_b) << 8 | u32::from(flags_c),
    ))
}

/// Version of a full box whose flags must be zero, unless parsing leniently.
pub(crate) fn read_fullbox_version_no_flags<T: ReadBytesExt>(src: &mut T, options: &ParseOptions) -> Result<u8> {
    let (version, flags) = read_fullbox_extra(src)?;

    if flags != 0 && !options.lenient {
        return Err(Error::Unsupported("expected flags to be 0"));
    }

    Ok(version)
}

/// Skip a box whose content is not read.
pub(crate) fn skip_box_content<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let to_skip = {
        let header = src.get_header();
        debug!("{header:?} (skipped)");
        header
            .size
            .checked_sub(header.offset)
            .ok_or(Error::InvalidData("header offset > size"))?
    };
    debug_assert_eq!(to_skip, src.bytes_left());
    skip(src, to_skip)
}

/// Skip whatever is left unread in a box.
pub(crate) fn skip_box_remain<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<()> {
    let remain = {
        let header = src.get_header();
        let len = src.bytes_left();
        debug!("remain {len} (skipped) in {header:?}");
        len
    };
    skip(src, remain)
}

/// Tracks compressed-buffer memory and validates declared sizes against a [`DecodeConfig`].
pub(crate) struct ResourceTracker<'a> {
    config: &'a DecodeConfig,
    current_memory: u64,
    peak_memory: u64,
}

impl<'a> ResourceTracker<'a> {
    pub(crate) fn new(config: &'a DecodeConfig) -> Self {
        Self {
            config,
            current_memory: 0,
            peak_memory: 0,
        }
    }

    pub(crate) fn reserve(&mut self, bytes: u64) -> Result<()> {
        self.current_memory = self.current_memory.saturating_add(bytes);
        self.peak_memory = self.peak_memory.max(self.current_memory);

        if let Some(limit) = self.config.peak_memory_limit {
            if self.peak_memory > limit {
                return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn release(&mut self, bytes: u64) {
        self.current_memory = self.current_memory.saturating_sub(bytes);
    }

    pub(crate) fn validate_total_megapixels(&self, width: u32, height: u32) -> Result<()> {
        if let Some(limit) = self.config.total_megapixels_limit {
            let megapixels = u64::from(width)
                .checked_mul(u64::from(height))
                .ok_or(Error::InvalidData("dimension overflow"))?
                / 1_000_000;

            if megapixels > u64::from(limit) {
                return Err(Error::ResourceLimitExceeded("total megapixels limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_image_count(&self, count: usize) -> Result<()> {
        if let Some(limit) = self.config.max_images {
            if count > limit.to_usize() {
                return Err(Error::ResourceLimitExceeded("image count limit exceeded"));
            }
        }

        Ok(())
    }
}

#[cfg_attr(debug_assertions, track_caller)]
pub(crate) fn check_parser_state<T>(header: &BoxHeader, left: &Take<T>) -> Result<(), Error> {
    let limit = left.limit();
    // Allow fully consumed boxes, or size=0 boxes (where original size was u64::MAX)
    if limit == 0 || header.size == u64::MAX {
        Ok(())
    } else {
        Err(Error::InvalidData("unread box content or bad parser sync"))
    }
}

/// Read and discard `bytes` bytes.
pub(crate) fn skip<T: Read>(src: &mut T, bytes: u64) -> Result<()> {
    std::io::copy(&mut src.take(bytes), &mut std::io::sink())?;
    Ok(())
}

pub(crate) fn be_u16<T: ReadBytesExt>(src: &mut T) -> Result<u16> {
    src.read_u16::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u32<T: ReadBytesExt>(src: &mut T) -> Result<u32> {
    src.read_u32::<byteorder::BigEndian>().map_err(From::from)
}

pub(crate) fn be_u64<T: ReadBytesExt>(src: &mut T) -> Result<u64> {
    src.read_u64::<byteorder::BigEndian>().map_err(From::from)
}

#[test]
fn box_read_to_end() {
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 5, offset: 0, uuid: None },
        content: <_ as Read>::take(tmp, 5),
    };
    let buf = src.read_into_try_vec().unwrap();
    assert_eq!(buf.len(), 5);
    assert_eq!(buf, b"12345".as_ref());
}

#[test]
fn box_read_to_end_oom() {
    let tmp = &mut b"1234567890".as_slice();
    let mut src = BMFFBox {
        head: BoxHeader { name: BoxType::FileTypeBox, size: 5, offset: 0, uuid: None },
        // Use a very large value to trigger OOM, but not near u64::MAX (which indicates size=0 boxes)
        content: <_ as Read>::take(tmp, u64::MAX / 2),
    };
    assert!(src.read_into_try_vec().is_err());
}

#[test]
fn header_rejects_short_size() {
    let data = [0u8, 0, 0, 4, b'f', b'r', b'e', b'e'];
    assert!(matches!(read_box_header(&mut &data[..]), Err(Error::InvalidData(_))));
}

#[test]
fn resource_tracker_limits() {
    let config = DecodeConfig::default().with_peak_memory_limit(100).with_max_images(2);
    let mut tracker = ResourceTracker::new(&config);
    tracker.reserve(60).unwrap();
    tracker.release(60);
    tracker.reserve(90).unwrap();
    assert!(tracker.reserve(20).is_err());
    assert!(tracker.validate_image_count(2).is_ok());
    assert!(tracker.validate_image_count(3).is_err());
    assert!(tracker.validate_total_megapixels(100_000, 100_000).is_err());
}
