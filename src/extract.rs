// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pull the decoder input (codec configuration, then item payload) out of a
//! parsed box tree.

use crate::items::{HevcConfig, ItemLocation, append_annexb, read_iloc};
use crate::{Error, ParseOptions, ParsedBox, Result, ToU64, TryVec, fourcc, read_all_boxes};
use log::debug;
use std::collections::VecDeque;
use std::ops::Range;

/// FIFO of buffers waiting to be pushed into a decoder engine.
///
/// Once marked exhausted the queue stays exhausted; it is never refilled.
#[derive(Debug, Default)]
pub struct BufferQueue {
    buffers: VecDeque<TryVec<u8>>,
    exhausted: bool,
}

impl BufferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer. Empty buffers and pushes after exhaustion are ignored.
    pub fn push(&mut self, buffer: TryVec<u8>) -> Result<()> {
        if self.exhausted {
            debug!("push to exhausted queue ignored");
            return Ok(());
        }
        if buffer.is_empty() {
            return Ok(());
        }
        self.buffers.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        self.buffers.push_back(buffer);
        Ok(())
    }

    pub fn pop_front(&mut self) -> Option<TryVec<u8>> {
        self.buffers.pop_front()
    }

    pub fn front(&self) -> Option<&[u8]> {
        self.buffers.front().map(|b| &b[..])
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Total bytes still queued.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.buffers.iter().map(|b| b.len().to_u64()).sum()
    }

    pub fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.buffers.iter().map(|b| &b[..])
    }
}

/// The boxes extraction depends on, located in the tree.
struct RequiredBoxes<'a> {
    meta: &'a ParsedBox,
    iloc: &'a ParsedBox,
    ipco: &'a ParsedBox,
}

fn locate(boxes: &[ParsedBox]) -> Result<RequiredBoxes<'_>> {
    let meta = boxes
        .iter()
        .find(|b| b.short_type() == fourcc(b"meta"))
        .ok_or(Error::MissingMetaBox)?;
    let iloc = meta
        .child_of_type(fourcc(b"iloc"))
        .ok_or(Error::MissingRequiredBox("iloc"))?;
    let iprp = meta
        .child_of_type(fourcc(b"iprp"))
        .ok_or(Error::MissingRequiredBox("iprp"))?;
    let ipco = iprp
        .child_of_type(fourcc(b"ipco"))
        .ok_or(Error::MissingRequiredBox("ipco"))?;
    Ok(RequiredBoxes { meta, iloc, ipco })
}

fn mdat_bounds(boxes: &[ParsedBox]) -> Result<TryVec<Range<u64>>> {
    let mut bounds = TryVec::new();
    for mdat in boxes.iter().filter(|b| b.short_type() == fourcc(b"mdat")) {
        let r = mdat.content_range();
        bounds.push(r.start.to_u64()..r.end.to_u64())?;
    }
    Ok(bounds)
}

/// Everything extraction needs from the `meta` box, borrowed from `data`.
struct ItemSource<'a> {
    data: &'a [u8],
    idat: Option<&'a [u8]>,
    mdat: TryVec<Range<u64>>,
    items: TryVec<ItemLocation>,
}

impl<'a> ItemSource<'a> {
    fn new(boxes: &[ParsedBox], found: &RequiredBoxes<'_>, data: &'a [u8]) -> Result<Self> {
        let items = read_iloc(&mut found.iloc.content(data), &ParseOptions::default())?;
        let idat = found
            .meta
            .child_of_type(fourcc(b"idat"))
            .map(|b| b.content(data));
        Ok(Self { data, idat, mdat: mdat_bounds(boxes)?, items })
    }

    /// Append one item's payload to `dst` in start-code form.
    fn append_item(&self, dst: &mut TryVec<u8>, item: &ItemLocation, nal_length_size: u8) -> Result<()> {
        let payload = item.data(self.data, self.idat, &self.mdat)?;
        debug!("item {}: {} payload bytes", item.item_id, payload.len());
        append_annexb(dst, &payload, nal_length_size)
    }
}

/// Parse `data` as a box stream and extract its decoder input.
///
/// See [`extract_from_boxes`].
pub fn extract(data: &[u8]) -> Result<BufferQueue> {
    let boxes = read_all_boxes(data)?;
    extract_from_boxes(&boxes, data)
}

/// Build the decoder input queue from an already parsed top-level box list.
///
/// The queue holds the `hvcC` parameter sets (if any) followed by the payload of
/// every `iloc` item, both in start-code form. Payload bytes are read from `data`,
/// the buffer the boxes were parsed from.
pub fn extract_from_boxes(boxes: &[ParsedBox], data: &[u8]) -> Result<BufferQueue> {
    let found = locate(boxes)?;
    let hvcc = found
        .ipco
        .child_of_type(fourcc(b"hvcC"))
        .ok_or(Error::MissingRequiredBox("hvcC"))?;
    let config = HevcConfig::parse(hvcc.content(data))?;
    let source = ItemSource::new(boxes, &found, data)?;

    let headers = config.headers()?;
    let mut payload = TryVec::new();
    for item in source.items.iter() {
        source.append_item(&mut payload, item, config.nal_length_size)?;
    }
    debug!("extracted {} header bytes, {} payload bytes", headers.len(), payload.len());

    let mut queue = BufferQueue::new();
    queue.push(headers)?;
    queue.push(payload)?;
    if queue.is_empty() {
        return Err(Error::NoDecodableData);
    }
    Ok(queue)
}

/// Extract one queue per image, pairing the i-th `hvcC` with the i-th `iloc` item.
///
/// This is the simple positional mapping; [`HeifContext`](crate::HeifContext) resolves
/// items through `ipma` associations instead. A container with no `hvcC` at all has
/// no images and yields an empty list.
pub fn extract_images(data: &[u8]) -> Result<Vec<BufferQueue>> {
    let boxes = read_all_boxes(data)?;
    let found = locate(&boxes)?;
    let mut images = Vec::new();

    let hvccs = found.ipco.children_of_type(fourcc(b"hvcC"));
    let source = ItemSource::new(&boxes, &found, data)?;
    let hvcc_count = found.ipco.children_of_type(fourcc(b"hvcC")).count();
    if hvcc_count == 0 {
        return Ok(images);
    }
    if hvcc_count != source.items.len() {
        return Err(Error::InvalidData("hvcC count does not match iloc item count"));
    }
    images.try_reserve_exact(hvcc_count).map_err(|_| Error::OutOfMemory)?;

    for (hvcc, item) in hvccs.zip(source.items.iter()) {
        let config = HevcConfig::parse(hvcc.content(data))?;
        let mut queue = BufferQueue::new();
        queue.push(config.headers()?)?;
        let mut payload = TryVec::new();
        source.append_item(&mut payload, item, config.nal_length_size)?;
        queue.push(payload)?;
        if queue.is_empty() {
            return Err(Error::NoDecodableData);
        }
        images.push(queue);
    }
    Ok(images)
}
