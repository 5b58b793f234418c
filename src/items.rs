// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsers for the item-level boxes of a HEIF `meta` box.
//!
//! Everything here reads from any `Read`, so the same code serves the box tree
//! (content slices) and the streaming parser in `context.rs`.

use crate::{
    BMFFBox, BoxType, Error, FourCC, ParseOptions, Result, ToU64, ToUsize, TryVec, be_u16, be_u32,
    check_parser_state, read_fullbox_extra, read_fullbox_version_no_flags, skip_box_content, skip_box_remain,
};
use arrayvec::ArrayVec;
use bitreader::BitReader;
use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use std::borrow::Cow;
use std::io::Read;
use std::ops::{Range, RangeFrom};

/// Annex B start code prefixed to every NAL unit handed to the decoder.
pub(crate) const START_CODE: [u8; 3] = [0, 0, 1];

/// Auxiliary type URNs that mark an item as an alpha plane.
const ALPHA_URNS: [&[u8]; 2] = [
    b"urn:mpeg:hevc:2015:auxid:1",
    b"urn:mpeg:mpegB:cicp:systems:auxiliary:alpha",
];

fn read_to_try_vec<T: Read>(src: &mut T) -> Result<TryVec<u8>> {
    let mut buf = std::vec::Vec::new();
    src.read_to_end(&mut buf)?;
    Ok(buf.into())
}

/// Potential sizes (in bytes) of variable-sized fields of the 'iloc' box
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug)]
enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    const fn to_bits(&self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 32,
            Self::Eight => 64,
        }
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidData("value must be in the set {0, 4, 8}")),
        }
    }
}

#[derive(PartialEq)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported("unsupported version in 'iloc' box")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConstructionMethod {
    File,
    Idat,
}

#[derive(Clone, Debug)]
pub(crate) enum ExtentRange {
    WithLength(Range<u64>),
    ToEnd(RangeFrom<u64>),
}

impl ExtentRange {
    pub(crate) const fn start(&self) -> u64 {
        match self {
            Self::WithLength(r) => r.start,
            Self::ToEnd(r) => r.start,
        }
    }
}

/// One item of an 'iloc' box.
/// `base_offset` is folded into the extent ranges, and only `data_reference_index == 0`
/// (this file) is accepted.
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug)]
pub(crate) struct ItemLocation {
    pub(crate) item_id: u32,
    pub(crate) construction_method: ConstructionMethod,
    pub(crate) extents: TryVec<ExtentRange>,
}

impl ItemLocation {
    /// Slice every extent of the item out of `file` (or out of `idat` for idat items).
    ///
    /// An extent without a length runs to the end of the `mdat` that contains its
    /// start, or to the end of the source when no `mdat` bounds are known.
    pub(crate) fn extent_slices<'a>(
        &self,
        file: &'a [u8],
        idat: Option<&'a [u8]>,
        mdat_bounds: &[Range<u64>],
    ) -> Result<TryVec<&'a [u8]>> {
        let (source, bounds): (&[u8], &[Range<u64>]) = match self.construction_method {
            ConstructionMethod::File => (file, mdat_bounds),
            ConstructionMethod::Idat => (
                idat.ok_or(Error::InvalidData("idat box missing but construction_method is Idat"))?,
                &[],
            ),
        };

        let mut slices = TryVec::new();
        for extent in self.extents.iter() {
            let start = usize::try_from(extent.start())?;
            let end = match extent {
                ExtentRange::WithLength(range) => usize::try_from(range.end)?,
                ExtentRange::ToEnd(_) => {
                    let mdat_end = bounds
                        .iter()
                        .find(|mdat| mdat.contains(&extent.start()))
                        .map(|mdat| mdat.end);
                    match mdat_end {
                        Some(end) => usize::try_from(end.min(source.len().to_u64()))?,
                        None => source.len(),
                    }
                },
            };
            let slice = source
                .get(start..end)
                .ok_or(Error::InvalidData("extent out of bounds"))?;
            slices.push(slice)?;
        }
        Ok(slices)
    }

    /// The item's bytes: borrowed for a single extent, concatenated otherwise.
    pub(crate) fn data<'a>(
        &self,
        file: &'a [u8],
        idat: Option<&'a [u8]>,
        mdat_bounds: &[Range<u64>],
    ) -> Result<Cow<'a, [u8]>> {
        let slices = self.extent_slices(file, idat, mdat_bounds)?;
        if slices.len() == 1 {
            return Ok(Cow::Borrowed(slices[0]));
        }
        let mut data = TryVec::new();
        for slice in slices.iter() {
            data.extend_from_slice(slice)?;
        }
        Ok(Cow::Owned(data.to_vec()))
    }
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
pub(crate) fn read_iloc<T: Read>(src: &mut T, options: &ParseOptions) -> Result<TryVec<ItemLocation>> {
    let version: IlocVersion = read_fullbox_version_no_flags(src, options)?.try_into()?;

    let iloc = read_to_try_vec(src)?;
    let mut iloc = BitReader::new(&iloc);

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: Option<IlocFieldSize> = match version {
        IlocVersion::One | IlocVersion::Two => Some(iloc.read_u8(4)?.try_into()?),
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            None
        },
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };

    // Every item needs at least 6 bytes; reject counts the box cannot hold before allocating.
    if u64::from(item_count) * 48 > iloc.remaining() {
        return Err(Error::InvalidData("iloc item count exceeds box size"));
    }
    let mut items = TryVec::new();

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };

        // Version 0 has no construction_method field and always addresses the file.
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => return Err(Error::Unsupported("construction_method 'item_offset' is not supported")),
                    _ => return Err(Error::InvalidData("construction_method is taken from the set 0, 1 or 2 per ISO 14496-12:2015 § 8.11.3.3")),
                }
            },
        };

        let data_reference_index = iloc.read_u16(16)?;

        if data_reference_index != 0 {
            return Err(Error::Unsupported("external file references (iloc.data_reference_index != 0) are not supported"));
        }

        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::InvalidData("extent_count must have a value 1 or greater per ISO 14496-12:2015 § 8.11.3.3"));
        }

        let mut extents = TryVec::new();

        for _ in 0..extent_count {
            // Only meaningful for construction_method 'item_offset', which is rejected above.
            if let Some(index_size) = &index_size {
                let _extent_index = iloc.read_u64(index_size.to_bits())?;
            }

            // A zero-sized offset field reads as 0: "the beginning of the source".
            let extent_offset = iloc.read_u64(offset_size.to_bits())?;
            let extent_length = iloc.read_u64(length_size.to_bits())?;

            let start = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData("offset calculation overflow"))?;
            // A zero length means the rest of the source
            let extent_range = if extent_length == 0 {
                ExtentRange::ToEnd(RangeFrom { start })
            } else {
                let end = start
                    .checked_add(extent_length)
                    .ok_or(Error::InvalidData("end calculation overflow"))?;
                ExtentRange::WithLength(Range { start, end })
            };

            extents.push(extent_range)?;
        }

        debug!("iloc item {item_id}: {construction_method:?}, {} extent(s)", extents.len());
        items.push(ItemLocation { item_id, construction_method, extents })?;
    }

    if iloc.remaining() == 0 {
        Ok(items)
    } else {
        Err(Error::InvalidData("invalid iloc size"))
    }
}

/// NAL units of one type from an `hvcC` array.
#[derive(Debug)]
struct NalArray {
    #[allow(unused)]
    array_completeness: bool,
    nal_unit_type: u8,
    units: TryVec<TryVec<u8>>,
}

/// HEVC decoder configuration record ('hvcC').
///
/// See ISO/IEC 14496-15 § 8.3.3.1
#[derive(Debug)]
#[non_exhaustive]
pub struct HevcConfig {
    pub configuration_version: u8,
    pub general_profile_space: u8,
    pub general_tier_flag: bool,
    pub general_profile_idc: u8,
    pub general_profile_compatibility_flags: u32,
    pub general_constraint_indicator_flags: u64,
    pub general_level_idc: u8,
    pub min_spatial_segmentation_idc: u16,
    pub parallelism_type: u8,
    /// 0 = monochrome, 1 = 4:2:0, 2 = 4:2:2, 3 = 4:4:4
    pub chroma_format: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
    pub avg_frame_rate: u16,
    pub constant_frame_rate: u8,
    pub num_temporal_layers: u8,
    pub temporal_id_nested: bool,
    /// Size in bytes of the length prefix on each NAL unit of the item data.
    pub nal_length_size: u8,
    nal_arrays: TryVec<NalArray>,
}

impl HevcConfig {
    const FIXED_SIZE: usize = 23;

    /// Parse the content of an 'hvcC' box.
    pub fn parse(content: &[u8]) -> Result<Self> {
        Self::read(&mut &content[..])
    }

    pub(crate) fn read<T: Read>(src: &mut T) -> Result<Self> {
        let mut fixed = [0u8; Self::FIXED_SIZE];
        src.read_exact(&mut fixed)
            .map_err(|_| Error::InvalidData("hvcC too short"))?;
        let mut bits = BitReader::new(&fixed);

        let configuration_version = bits.read_u8(8)?;
        let general_profile_space = bits.read_u8(2)?;
        let general_tier_flag = bits.read_bool()?;
        let general_profile_idc = bits.read_u8(5)?;
        let general_profile_compatibility_flags = bits.read_u32(32)?;
        let general_constraint_indicator_flags = bits.read_u64(48)?;
        let general_level_idc = bits.read_u8(8)?;
        bits.skip(4)?;
        let min_spatial_segmentation_idc = bits.read_u16(12)?;
        bits.skip(6)?;
        let parallelism_type = bits.read_u8(2)?;
        bits.skip(6)?;
        let chroma_format = bits.read_u8(2)?;
        bits.skip(5)?;
        let bit_depth_luma = bits.read_u8(3)? + 8;
        bits.skip(5)?;
        let bit_depth_chroma = bits.read_u8(3)? + 8;
        let avg_frame_rate = bits.read_u16(16)?;
        let constant_frame_rate = bits.read_u8(2)?;
        let num_temporal_layers = bits.read_u8(3)?;
        let temporal_id_nested = bits.read_bool()?;
        let nal_length_size = bits.read_u8(2)? + 1;
        let num_arrays = bits.read_u8(8)?;

        if nal_length_size == 3 {
            return Err(Error::InvalidData("hvcC lengthSizeMinusOne must not be 2"));
        }

        let mut nal_arrays = TryVec::new();
        for _ in 0..num_arrays {
            let head = src.read_u8()?;
            let array_completeness = head & 0x80 != 0;
            let nal_unit_type = head & 0x3f;
            let num_nalus = be_u16(src)?;

            let mut units: TryVec<TryVec<u8>> = TryVec::new();
            for _ in 0..num_nalus {
                let size = be_u16(src)?.to_usize();
                let mut unit = std::vec::Vec::new();
                unit.try_reserve_exact(size).map_err(|_| Error::OutOfMemory)?;
                unit.resize(size, 0);
                src.read_exact(&mut unit)
                    .map_err(|_| Error::InvalidData("hvcC NAL unit truncated"))?;
                units.push(unit.into())?;
            }
            debug!("hvcC array: nal type {nal_unit_type}, {num_nalus} unit(s)");
            nal_arrays.push(NalArray { array_completeness, nal_unit_type, units })?;
        }

        Ok(Self {
            configuration_version,
            general_profile_space,
            general_tier_flag,
            general_profile_idc,
            general_profile_compatibility_flags,
            general_constraint_indicator_flags,
            general_level_idc,
            min_spatial_segmentation_idc,
            parallelism_type,
            chroma_format,
            bit_depth_luma,
            bit_depth_chroma,
            avg_frame_rate,
            constant_frame_rate,
            num_temporal_layers,
            temporal_id_nested,
            nal_length_size,
            nal_arrays,
        })
    }

    /// Total number of parameter-set NAL units carried by the record.
    #[must_use]
    pub fn nal_unit_count(&self) -> usize {
        self.nal_arrays.iter().map(|a| a.units.len()).sum()
    }

    /// NAL unit types present, in record order.
    pub fn nal_unit_types(&self) -> impl Iterator<Item = u8> + '_ {
        self.nal_arrays.iter().map(|a| a.nal_unit_type)
    }

    /// The parameter sets (VPS/SPS/PPS/SEI) as one start-code delimited byte stream.
    pub fn headers(&self) -> Result<TryVec<u8>> {
        let mut out = TryVec::new();
        for array in self.nal_arrays.iter() {
            for unit in array.units.iter() {
                out.extend_from_slice(&START_CODE)?;
                out.extend_from_slice(unit)?;
            }
        }
        Ok(out)
    }
}

/// Rewrite length-prefixed NAL units (as stored in HEIF items) into start-code form,
/// appending to `dst`.
pub(crate) fn append_annexb(dst: &mut TryVec<u8>, mut src: &[u8], nal_length_size: u8) -> Result<()> {
    let prefix = usize::from(nal_length_size);
    if !(1..=4).contains(&prefix) {
        return Err(Error::InvalidData("invalid NAL length size"));
    }

    while !src.is_empty() {
        if src.len() < prefix {
            return Err(Error::InvalidData("truncated NAL length prefix"));
        }
        let size = usize::try_from(src.read_uint::<BigEndian>(prefix)?)?;
        let unit = src.get(..size).ok_or(Error::InvalidData("NAL unit exceeds item data"))?;
        dst.extend_from_slice(&START_CODE)?;
        dst.extend_from_slice(unit)?;
        src = &src[size..];
    }
    Ok(())
}

/// Image spatial extents (dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageSpatialExtents {
    pub(crate) width: u32,
    pub(crate) height: u32,
}

/// See ISO/IEC 23008-12:2017 § 6.5.3
pub(crate) fn read_ispe<T: Read>(src: &mut T, options: &ParseOptions) -> Result<ImageSpatialExtents> {
    let version = read_fullbox_version_no_flags(src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("ispe version"));
    }
    let width = be_u32(src)?;
    let height = be_u32(src)?;
    if width == 0 || height == 0 {
        return Err(Error::InvalidData("ispe dimensions must be non-zero"));
    }
    Ok(ImageSpatialExtents { width, height })
}

/// Bits per channel from a 'pixi' property.
/// See ISO/IEC 23008-12:2017 § 6.5.6
pub(crate) fn read_pixi<T: Read>(src: &mut T, options: &ParseOptions) -> Result<ArrayVec<u8, 16>> {
    let version = read_fullbox_version_no_flags(src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("pixi version"));
    }

    let num_channels = usize::from(src.read_u8()?);
    let mut channels = ArrayVec::from([0u8; 16]);
    if num_channels > channels.len() {
        return Err(Error::InvalidData("invalid num_channels"));
    }
    channels.truncate(num_channels);
    src.read_exact(&mut channels).map_err(|_| Error::InvalidData("invalid num_channels"))?;
    Ok(channels)
}

/// 'auxC' auxiliary type property: a NUL terminated URN, then optional subtype bytes.
#[derive(Debug, PartialEq)]
pub(crate) struct AuxiliaryTypeProperty {
    aux_type: TryVec<u8>,
}

impl AuxiliaryTypeProperty {
    pub(crate) fn is_alpha(&self) -> bool {
        ALPHA_URNS.iter().any(|urn| *urn == &self.aux_type[..])
    }
}

pub(crate) fn read_auxc<T: Read>(src: &mut T, options: &ParseOptions) -> Result<AuxiliaryTypeProperty> {
    let version = read_fullbox_version_no_flags(src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("auxC version"));
    }
    let aux = read_to_try_vec(src)?;
    let urn_len = aux.iter().position(|&b| b == 0).unwrap_or(aux.len());
    let mut aux_type = TryVec::new();
    aux_type.extend_from_slice(&aux[..urn_len])?;
    Ok(AuxiliaryTypeProperty { aux_type })
}

/// Anti-clockwise rotation in degrees from an 'irot' property: 0, 90, 180 or 270.
/// See ISO/IEC 23008-12:2017 § 6.5.10
pub(crate) fn read_irot<T: Read>(src: &mut T) -> Result<u16> {
    // Six reserved bits, then the angle in quarter turns
    let angle = src.read_u8()? & 0x03;
    Ok(u16::from(angle) * 90)
}

pub(crate) struct Association {
    pub(crate) item_id: u32,
    #[allow(unused)]
    pub(crate) essential: bool,
    pub(crate) property_index: u16,
}

/// Item property associations.
/// See ISO/IEC 23008-12:2017 § 9.3.1
pub(crate) fn read_ipma<T: Read>(src: &mut T) -> Result<TryVec<Association>> {
    let (version, flags) = read_fullbox_extra(src)?;

    let mut associations = TryVec::new();

    let entry_count = be_u32(src)?;
    for _ in 0..entry_count {
        let item_id = if version == 0 {
            be_u16(src)?.into()
        } else {
            be_u32(src)?
        };
        let association_count = src.read_u8()?;
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = &mut [0; 2][..num_association_bytes];
            src.read_exact(association)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(Association {
                item_id,
                essential,
                property_index,
            })?;
        }
    }
    Ok(associations)
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
pub(crate) fn read_pitm<T: Read>(src: &mut T, options: &ParseOptions) -> Result<u32> {
    let version = read_fullbox_version_no_flags(src, options)?;

    let item_id = match version {
        0 => be_u16(src)?.into(),
        1 => be_u32(src)?,
        _ => return Err(Error::Unsupported("unsupported pitm version")),
    };

    Ok(item_id)
}

/// Item type of one 'infe' entry.
#[derive(Debug)]
pub(crate) struct ItemInfoEntry {
    pub(crate) item_id: u32,
    /// All zero for version 0 and 1 entries, which carry no item type.
    pub(crate) item_type: FourCC,
    /// Flag bit 0: the item is not meant to be shown on its own (grid tiles, for one).
    pub(crate) hidden: bool,
}

/// Parse an Item Information Box
/// See ISO 14496-12:2015 § 8.11.6
pub(crate) fn read_iinf<T: Read>(src: &mut BMFFBox<'_, T>, options: &ParseOptions) -> Result<TryVec<ItemInfoEntry>> {
    let version = read_fullbox_version_no_flags(src, options)?;

    match version {
        0 | 1 => (),
        _ => return Err(Error::Unsupported("unsupported iinf version")),
    }

    let entry_count = if version == 0 {
        be_u16(src)?.to_usize()
    } else {
        be_u32(src)?.to_usize()
    };
    if entry_count.to_u64() > src.bytes_left() / 12 {
        return Err(Error::InvalidData("iinf entry count exceeds box size"));
    }
    let mut item_infos = TryVec::with_capacity(entry_count)?;

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        if b.head.name != BoxType::ItemInfoEntry {
            return Err(Error::InvalidData("iinf box should contain only infe boxes"));
        }

        item_infos.push(read_infe(&mut b)?)?;

        check_parser_state(&b.head, &b.content)?;
    }

    Ok(item_infos)
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe<T: Read>(src: &mut BMFFBox<'_, T>) -> Result<ItemInfoEntry> {
    let (version, flags) = read_fullbox_extra(src)?;
    let hidden = flags & 1 == 1;

    let item_id = match version {
        0..=2 => be_u16(src)?.into(),
        3 => be_u32(src)?,
        _ => return Err(Error::Unsupported("unsupported version in 'infe' box")),
    };

    let item_protection_index = be_u16(src)?;

    if item_protection_index != 0 {
        return Err(Error::Unsupported("protected items (infe.item_protection_index != 0) are not supported"));
    }

    let item_type = if version >= 2 {
        FourCC::from(be_u32(src)?)
    } else {
        FourCC::default()
    };
    debug!("infe item_id {item_id} item_type: {item_type} hidden: {hidden}");

    // Item name, content type and encoding follow; none of them matter here
    skip_box_remain(src)?;

    Ok(ItemInfoEntry { item_id, item_type, hidden })
}

/// One typed reference from an 'iref' box.
/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug)]
pub(crate) struct SingleItemTypeReferenceBox {
    pub(crate) item_type: FourCC,
    pub(crate) from_item_id: u32,
    pub(crate) to_item_id: u32,
}

pub(crate) fn read_iref<T: Read>(src: &mut BMFFBox<'_, T>, options: &ParseOptions) -> Result<TryVec<SingleItemTypeReferenceBox>> {
    let mut item_references = TryVec::new();
    let version = read_fullbox_version_no_flags(src, options)?;
    if version > 1 {
        return Err(Error::Unsupported("iref version"));
    }

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        let from_item_id = if version == 0 {
            be_u16(&mut b)?.into()
        } else {
            be_u32(&mut b)?
        };
        let reference_count = be_u16(&mut b)?;
        for _ in 0..reference_count {
            let to_item_id = if version == 0 {
                be_u16(&mut b)?.into()
            } else {
                be_u32(&mut b)?
            };
            if from_item_id == to_item_id {
                return Err(Error::InvalidData("from_item_id and to_item_id must be different"));
            }
            item_references.push(SingleItemTypeReferenceBox {
                item_type: b.head.name.into(),
                from_item_id,
                to_item_id,
            })?;
        }
        check_parser_state(&b.head, &b.content)?;
    }
    Ok(item_references)
}

#[derive(Debug)]
pub(crate) enum ItemProperty {
    HevcConfig(HevcConfig),
    ImageSpatialExtents(ImageSpatialExtents),
    Channels(ArrayVec<u8, 16>),
    AuxiliaryType(AuxiliaryTypeProperty),
    Rotation(u16),
    Unsupported,
}

/// The 'ipco' property list together with the 'ipma' associations into it.
#[derive(Debug)]
pub(crate) struct ItemProperties {
    properties: TryVec<ItemProperty>,
    associations: TryVec<(u32, u16)>,
}

impl ItemProperties {
    /// Properties associated with `item_id`, in association order.
    pub(crate) fn for_item(&self, item_id: u32) -> impl Iterator<Item = &ItemProperty> + '_ {
        self.associations
            .iter()
            .filter(move |&&(id, _)| id == item_id)
            .filter_map(move |&(_, index)| match index {
                // index 0 means "no property"
                0 => None,
                x => self.properties.get(usize::from(x) - 1),
            })
    }

    pub(crate) fn hevc_config(&self, item_id: u32) -> Option<&HevcConfig> {
        self.for_item(item_id).find_map(|p| match p {
            ItemProperty::HevcConfig(c) => Some(c),
            _ => None,
        })
    }

    pub(crate) fn spatial_extents(&self, item_id: u32) -> Option<ImageSpatialExtents> {
        self.for_item(item_id).find_map(|p| match p {
            ItemProperty::ImageSpatialExtents(e) => Some(*e),
            _ => None,
        })
    }

    pub(crate) fn channels(&self, item_id: u32) -> Option<&[u8]> {
        self.for_item(item_id).find_map(|p| match p {
            ItemProperty::Channels(c) => Some(&c[..]),
            _ => None,
        })
    }

    /// Anti-clockwise degrees of the item's 'irot', 0 when it has none.
    pub(crate) fn rotation(&self, item_id: u32) -> u16 {
        self.for_item(item_id)
            .find_map(|p| match p {
                ItemProperty::Rotation(degrees) => Some(*degrees),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub(crate) fn is_alpha(&self, item_id: u32) -> bool {
        self.for_item(item_id).any(|p| matches!(p, ItemProperty::AuxiliaryType(aux) if aux.is_alpha()))
    }
}

/// See ISO/IEC 23008-12:2017 § 9.3
pub(crate) fn read_iprp<T: Read>(src: &mut BMFFBox<'_, T>, options: &ParseOptions) -> Result<ItemProperties> {
    let mut iter = src.box_iter();
    let mut properties = None;
    let mut associations = TryVec::new();

    while let Some(mut b) = iter.next_box()? {
        match b.head.name {
            BoxType::ItemPropertyContainerBox => {
                if properties.is_some() {
                    return Err(Error::InvalidData("There should be exactly one ipco box per iprp"));
                }
                properties = Some(read_ipco(&mut b, options)?);
            },
            BoxType::ItemPropertyAssociationBox => {
                for a in read_ipma(&mut b)? {
                    associations.push((a.item_id, a.property_index))?;
                }
            },
            _ => skip_box_content(&mut b)?,
        }
        check_parser_state(&b.head, &b.content)?;
    }

    let properties = properties.ok_or(Error::MissingRequiredBox("ipco"))?;
    Ok(ItemProperties { properties, associations })
}

fn read_ipco<T: Read>(src: &mut BMFFBox<'_, T>, options: &ParseOptions) -> Result<TryVec<ItemProperty>> {
    let mut properties = TryVec::new();

    let mut iter = src.box_iter();
    while let Some(mut b) = iter.next_box()? {
        // Must push for every property to have correct index for them
        let prop = match b.head.name {
            BoxType::HevcConfigurationBox => {
                let config = HevcConfig::read(&mut b)?;
                skip_box_remain(&mut b)?;
                ItemProperty::HevcConfig(config)
            },
            BoxType::ImageSpatialExtentsBox => ItemProperty::ImageSpatialExtents(read_ispe(&mut b, options)?),
            BoxType::PixelInformationBox => ItemProperty::Channels(read_pixi(&mut b, options)?),
            BoxType::AuxiliaryTypeProperty => ItemProperty::AuxiliaryType(read_auxc(&mut b, options)?),
            BoxType::ImageRotation => ItemProperty::Rotation(read_irot(&mut b)?),
            _ => {
                skip_box_remain(&mut b)?;
                ItemProperty::Unsupported
            },
        };
        properties.push(prop)?;
        check_parser_state(&b.head, &b.content)?;
    }
    Ok(properties)
}
