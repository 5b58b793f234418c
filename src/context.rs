// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item-aware view of a HEIF container: image ids, the primary image,
//! per-image metadata and compressed data.

use crate::items::{
    HevcConfig, ItemInfoEntry, ItemLocation, ItemProperties, SingleItemTypeReferenceBox, append_annexb,
    read_iinf, read_iloc, read_iprp, read_iref, read_pitm,
};
use crate::{
    BMFFBox, BoxIter, BoxType, BufferQueue, DecodeConfig, Error, FourCC, Offset, OffsetReader, ParseOptions,
    ResourceTracker, Result, Stop, ToU64, TryVec, Unstoppable, be_u32, check_parser_state,
    read_fullbox_version_no_flags, skip_box_content,
};
use log::{debug, warn};
use std::borrow::Cow;
use std::io::Read;
use std::ops::Range;

/// Brands accepted in `ftyp`, as major or compatible brand.
const HEIF_BRANDS: [&[u8; 4]; 6] = [b"heic", b"heix", b"mif1", b"msf1", b"hevc", b"hevx"];

struct FileTypeBox {
    major_brand: FourCC,
    compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    fn is_heif(&self) -> bool {
        HEIF_BRANDS
            .iter()
            .any(|brand| self.major_brand == *brand || self.compatible_brands.iter().any(|b| b == brand))
    }
}

/// Everything read from the `meta` box.
struct HeifMeta {
    primary_item_id: u32,
    item_infos: TryVec<ItemInfoEntry>,
    iloc_items: TryVec<ItemLocation>,
    item_references: TryVec<SingleItemTypeReferenceBox>,
    properties: ItemProperties,
    idat: Option<TryVec<u8>>,
}

impl HeifMeta {
    fn item_type(&self, item_id: u32) -> Option<FourCC> {
        self.item_infos
            .iter()
            .find(|info| info.item_id == item_id)
            .map(|info| info.item_type)
    }

    fn references(&self, kind: &'static [u8; 4]) -> impl Iterator<Item = &SingleItemTypeReferenceBox> + '_ {
        self.item_references.iter().filter(move |r| r.item_type == kind)
    }
}

/// Metadata of one image, available without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// Item id within the container.
    pub id: u32,
    /// Displayed width: the `ispe` width, or its height under a 90 or 270 degree `irot`.
    pub width: u32,
    /// Displayed height, with `irot` applied like `width`.
    pub height: u32,
    pub is_primary: bool,
    /// An alpha auxiliary image references this one.
    pub has_alpha: bool,
    /// Color samples are premultiplied by alpha (`prem` reference). Metadata only.
    pub premultiplied_alpha: bool,
    /// Item id of the alpha auxiliary image, if any.
    pub alpha_item_id: Option<u32>,
    /// Luma bit depth, from `pixi` if present, else from `hvcC`.
    pub bit_depth: u8,
    /// Anti-clockwise rotation from `irot` applied to decoded pixels: 0, 90, 180 or 270.
    pub rotation: u16,
}

/// A parsed HEIF container.
///
/// Parsing records item locations and properties; compressed data is only
/// sliced out of the buffer when [`compressed_data`](Self::compressed_data) is called.
///
/// ```no_run
/// use heifdec::HeifContext;
///
/// let bytes = std::fs::read("image.heic")?;
/// let context = HeifContext::from_bytes(&bytes)?;
/// for id in context.image_ids() {
///     let info = context.image_info(id)?;
///     println!("{id}: {}x{} primary={}", info.width, info.height, info.is_primary);
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct HeifContext<'data> {
    raw: Cow<'data, [u8]>,
    mdat_bounds: TryVec<Range<u64>>,
    meta: HeifMeta,
    images: TryVec<ImageInfo>,
    config: DecodeConfig,
}

impl<'data> HeifContext<'data> {
    /// Parse a container from a borrowed byte slice.
    pub fn from_bytes(data: &'data [u8]) -> Result<Self> {
        Self::from_bytes_with_config(data, &DecodeConfig::unlimited(), &Unstoppable)
    }

    /// Parse a container from a borrowed byte slice with resource limits.
    pub fn from_bytes_with_config(data: &'data [u8], config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        let (meta, mdat_bounds) = Self::parse_raw(data, config, stop)?;
        Self::build(Cow::Borrowed(data), meta, mdat_bounds, config)
    }

    /// Parse a container from an owned buffer.
    pub fn from_owned(data: std::vec::Vec<u8>) -> Result<HeifContext<'static>> {
        HeifContext::from_owned_with_config(data, &DecodeConfig::unlimited(), &Unstoppable)
    }

    /// Parse a container from an owned buffer with resource limits.
    pub fn from_owned_with_config(
        data: std::vec::Vec<u8>,
        config: &DecodeConfig,
        stop: &dyn Stop,
    ) -> Result<HeifContext<'static>> {
        let (meta, mdat_bounds) = HeifContext::parse_raw(&data, config, stop)?;
        HeifContext::build(Cow::Owned(data), meta, mdat_bounds, config)
    }

    /// Read all bytes from `reader`, then parse.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<HeifContext<'static>> {
        HeifContext::from_reader_with_config(reader, &DecodeConfig::unlimited(), &Unstoppable)
    }

    pub fn from_reader_with_config<R: Read>(
        reader: &mut R,
        config: &DecodeConfig,
        stop: &dyn Stop,
    ) -> Result<HeifContext<'static>> {
        let mut buf = std::vec::Vec::new();
        reader.read_to_end(&mut buf)?;
        HeifContext::from_owned_with_config(buf, config, stop)
    }

    /// Walk the top-level boxes, reading `meta` and recording `mdat` bounds.
    fn parse_raw(data: &[u8], config: &DecodeConfig, stop: &dyn Stop) -> Result<(HeifMeta, TryVec<Range<u64>>)> {
        let parse_opts = config.parse_options();
        let mut cursor = std::io::Cursor::new(data);
        let mut f = OffsetReader::new(&mut cursor);
        let mut iter = BoxIter::new(&mut f);

        // 'ftyp' box must occur first; see ISO 14496-12:2015 § 4.3.1
        if let Some(mut b) = iter.next_box()? {
            if b.head.name == BoxType::FileTypeBox {
                let ftyp = read_ftyp(&mut b)?;
                if !ftyp.is_heif() {
                    warn!("ftyp major brand: {}", ftyp.major_brand);
                    return Err(Error::InvalidData("ftyp does not declare a HEIF brand"));
                }
            } else {
                return Err(Error::InvalidData("'ftyp' box must occur first"));
            }
        }

        let mut meta = None;
        let mut mdat_bounds = TryVec::new();

        while let Some(mut b) = iter.next_box()? {
            stop.check()?;

            match b.head.name {
                BoxType::MetadataBox => {
                    if meta.is_some() {
                        return Err(Error::InvalidData(
                            "There should be zero or one meta boxes per ISO 14496-12:2015 § 8.11.1.1",
                        ));
                    }
                    meta = Some(read_heif_meta(&mut b, &parse_opts)?);
                },
                BoxType::MediaDataBox => {
                    if b.bytes_left() > 0 {
                        let offset = b.offset();
                        let end = offset.saturating_add(b.bytes_left());
                        mdat_bounds.push(offset..end)?;
                    }
                    skip_box_content(&mut b)?;
                },
                _ => skip_box_content(&mut b)?,
            }

            check_parser_state(&b.head, &b.content)?;
        }

        let meta = meta.ok_or(Error::MissingMetaBox)?;
        Ok((meta, mdat_bounds))
    }

    fn build(
        raw: Cow<'data, [u8]>,
        meta: HeifMeta,
        mdat_bounds: TryVec<Range<u64>>,
        config: &DecodeConfig,
    ) -> Result<Self> {
        let tracker = ResourceTracker::new(config);

        // Alpha planes and thumbnails are attached to a master image, not shown on their own
        let is_auxiliary = |id: u32| {
            meta.item_references
                .iter()
                .any(|r| r.from_item_id == id && (r.item_type == b"auxl" || r.item_type == b"thmb"))
        };

        let mut images = TryVec::new();
        for info in meta.item_infos.iter() {
            if info.hidden {
                debug!("item {} is hidden", info.item_id);
                continue;
            }
            if is_auxiliary(info.item_id) {
                debug!("item {} is auxiliary", info.item_id);
                continue;
            }
            if info.item_type == b"grid" {
                warn!("item {}: grid images are not supported, skipping", info.item_id);
                continue;
            }
            if info.item_type != b"hvc1" {
                debug!("item {} has type {}, skipping", info.item_id, info.item_type);
                continue;
            }
            images.push(Self::image_info_for(&meta, &tracker, info.item_id)?)?;
        }

        if images.is_empty() {
            return Err(Error::NoImagesFound);
        }
        tracker.validate_image_count(images.len())?;
        if !images.iter().any(|img| img.is_primary) {
            warn!("primary item {} is not a decodable image", meta.primary_item_id);
        }

        Ok(Self {
            raw,
            mdat_bounds,
            meta,
            images,
            config: config.clone(),
        })
    }

    fn image_info_for(meta: &HeifMeta, tracker: &ResourceTracker<'_>, id: u32) -> Result<ImageInfo> {
        let hvcc = meta
            .properties
            .hevc_config(id)
            .ok_or(Error::MissingRequiredBox("hvcC"))?;
        let extents = meta
            .properties
            .spatial_extents(id)
            .ok_or(Error::InvalidData("image item has no ispe property"))?;
        tracker.validate_total_megapixels(extents.width, extents.height)?;

        if !meta.iloc_items.iter().any(|item| item.item_id == id) {
            return Err(Error::InvalidData("image item not found in iloc"));
        }

        let alpha_item_id = meta
            .references(b"auxl")
            .filter(|r| r.to_item_id == id)
            .map(|r| r.from_item_id)
            .find(|&aux| meta.properties.is_alpha(aux) && meta.item_type(aux).is_some_and(|t| t == b"hvc1"));

        let premultiplied_alpha = alpha_item_id.is_some_and(|alpha| {
            meta.references(b"prem")
                .any(|r| r.from_item_id == id && r.to_item_id == alpha)
        });

        let bit_depth = meta
            .properties
            .channels(id)
            .and_then(|c| c.first().copied())
            .unwrap_or(hvcc.bit_depth_luma);

        let rotation = meta.properties.rotation(id);
        let (width, height) = match rotation {
            90 | 270 => (extents.height, extents.width),
            _ => (extents.width, extents.height),
        };

        Ok(ImageInfo {
            id,
            width,
            height,
            is_primary: id == meta.primary_item_id,
            has_alpha: alpha_item_id.is_some(),
            premultiplied_alpha,
            alpha_item_id,
            bit_depth,
            rotation,
        })
    }

    /// Ids of the top-level images, in `iinf` order.
    pub fn image_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.images.iter().map(|img| img.id)
    }

    /// Metadata of every top-level image.
    #[must_use]
    pub fn images(&self) -> &[ImageInfo] {
        &self.images
    }

    /// The item id named by `pitm`.
    #[must_use]
    pub fn primary_image_id(&self) -> u32 {
        self.meta.primary_item_id
    }

    pub fn image_info(&self, id: u32) -> Result<ImageInfo> {
        self.images
            .iter()
            .find(|img| img.id == id)
            .copied()
            .ok_or(Error::InvalidData("no top-level image with this id"))
    }

    /// The `hvcC` record associated with an item.
    #[must_use]
    pub fn hevc_config(&self, id: u32) -> Option<&HevcConfig> {
        self.meta.properties.hevc_config(id)
    }

    /// Decoder input for one `hvc1` item: its parameter sets, then its payload,
    /// both in start-code form.
    ///
    /// Works for auxiliary items (such as alpha planes) as well as top-level images.
    pub fn compressed_data(&self, id: u32) -> Result<BufferQueue> {
        let config = self.hevc_config(id).ok_or(Error::MissingRequiredBox("hvcC"))?;
        let location = self
            .meta
            .iloc_items
            .iter()
            .find(|item| item.item_id == id)
            .ok_or(Error::InvalidData("item not found in iloc"))?;

        let payload = location.data(&self.raw, self.meta.idat.as_deref(), &self.mdat_bounds)?;
        let headers = config.headers()?;

        // Multi-extent payloads are joined into a temporary copy first
        let joined = matches!(payload, Cow::Owned(_));
        let mut tracker = ResourceTracker::new(&self.config);
        tracker.reserve(headers.len().to_u64())?;
        if joined {
            tracker.reserve(payload.len().to_u64())?;
        }
        tracker.reserve(payload.len().to_u64())?;

        let mut annexb = TryVec::new();
        append_annexb(&mut annexb, &payload, config.nal_length_size)?;
        if joined {
            tracker.release(payload.len().to_u64());
        }
        debug!("item {id}: {} header bytes, {} payload bytes", headers.len(), annexb.len());

        let mut queue = BufferQueue::new();
        queue.push(headers)?;
        queue.push(annexb)?;
        if queue.is_empty() {
            return Err(Error::NoDecodableData);
        }
        Ok(queue)
    }

    /// The configuration this context was parsed with.
    #[must_use]
    pub fn config(&self) -> &DecodeConfig {
        &self.config
    }
}

fn read_heif_meta<T: Read>(src: &mut BMFFBox<'_, T>, options: &ParseOptions) -> Result<HeifMeta> {
    let version = read_fullbox_version_no_flags(src, options)?;

    if version != 0 {
        return Err(Error::Unsupported("unsupported meta version"));
    }

    let mut primary_item_id = None;
    let mut item_infos = None;
    let mut iloc_items = None;
    let mut item_references = TryVec::new();
    let mut properties = None;
    let mut idat = None;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ItemInfoBox => {
                if item_infos.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iinf boxes per ISO 14496-12:2015 § 8.11.6.1"));
                }
                item_infos = Some(read_iinf(&mut b, options)?);
            },
            BoxType::ItemLocationBox => {
                if iloc_items.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iloc boxes per ISO 14496-12:2015 § 8.11.3.1"));
                }
                iloc_items = Some(read_iloc(&mut b, options)?);
            },
            BoxType::PrimaryItemBox => {
                if primary_item_id.is_some() {
                    return Err(Error::InvalidData("There should be zero or one pitm boxes per ISO 14496-12:2015 § 8.11.4.1"));
                }
                primary_item_id = Some(read_pitm(&mut b, options)?);
            },
            BoxType::ImageReferenceBox => {
                item_references.append(&mut read_iref(&mut b, options)?)?;
            },
            BoxType::ImagePropertiesBox => {
                properties = Some(read_iprp(&mut b, options)?);
            },
            BoxType::ItemDataBox => {
                if idat.is_some() {
                    return Err(Error::InvalidData("There should be zero or one idat boxes"));
                }
                idat = Some(b.read_into_try_vec()?);
            },
            _ => skip_box_content(&mut b)?,
        }

        check_parser_state(&b.head, &b.content)?;
    }

    let iloc_items = iloc_items.ok_or(Error::MissingRequiredBox("iloc"))?;
    let properties = properties.ok_or(Error::MissingRequiredBox("iprp"))?;
    let item_infos = item_infos.ok_or(Error::MissingRequiredBox("iinf"))?;
    let primary_item_id = primary_item_id.ok_or(Error::InvalidData("Required pitm box not present in meta box"))?;

    if !item_infos.iter().any(|x| x.item_id == primary_item_id) {
        return Err(Error::InvalidData("primary_item_id not present in iinf box"));
    }

    Ok(HeifMeta {
        primary_item_id,
        item_infos,
        iloc_items,
        item_references,
        properties,
        idat,
    })
}

fn read_ftyp<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<FileTypeBox> {
    let major = be_u32(src)?;
    let _minor = be_u32(src)?;
    let bytes_left = src.bytes_left();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData("invalid ftyp size"));
    }
    let brand_count = bytes_left / 4;
    let mut brands = TryVec::with_capacity(brand_count.try_into()?)?;
    for _ in 0..brand_count {
        brands.push(be_u32(src)?.into())?;
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        compatible_brands: brands,
    })
}
