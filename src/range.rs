// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box tree reader over an in-memory buffer.
//!
//! [`BitstreamRange`] is a cursor with a sticky error flag. [`ParsedBox::read`] takes
//! one box off the front of it and never panics on malformed input: structural
//! problems are recorded on the range, and the caller stops looping when
//! [`BitstreamRange::has_error`] is set.

use crate::boxes::{BoxType, FourCC};
use crate::{Error, Result, TryVec, read_box_header, read_fullbox_extra, be_u16, be_u32};
use log::debug;
use std::fmt::Write as _;
use std::ops::Range;

/// Nesting deeper than this is treated as corrupt data.
const MAX_DEPTH: usize = 32;

/// A byte range of a buffer with a read cursor and an error flag.
pub struct BitstreamRange<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    error: Option<Error>,
}

impl<'a> BitstreamRange<'a> {
    /// A range covering all of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, end: data.len(), error: None }
    }

    fn sub_range(data: &'a [u8], start: usize, end: usize) -> Self {
        Self { data, pos: start, end, error: None }
    }

    /// Cursor position, as an offset into the whole buffer.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes between the cursor and the end of the range.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.pos)
    }

    /// True once the cursor reached the end of the range.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.remaining() == 0
    }

    /// True once a structural error was recorded. The flag never clears.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// The recorded structural error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Take the recorded error out of the range.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    fn set_error(&mut self, err: Error) {
        debug!("box range error at {}: {err}", self.pos);
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..self.end]
    }
}

/// One box of the tree: its type, where it sits in the buffer, and its children.
#[derive(Debug)]
pub struct ParsedBox {
    box_type: BoxType,
    range: Range<usize>,
    content: Range<usize>,
    full_header: Option<(u8, u32)>,
    children: TryVec<ParsedBox>,
}

impl ParsedBox {
    /// Consume exactly one box from the front of `range`.
    ///
    /// Returns `None` when the range is exhausted, when a previous call already
    /// failed, or on a structural error. Check [`BitstreamRange::has_error`] after
    /// every call.
    pub fn read(range: &mut BitstreamRange<'_>) -> Option<Self> {
        Self::read_at_depth(range, 0)
    }

    fn read_at_depth(range: &mut BitstreamRange<'_>, depth: usize) -> Option<Self> {
        if range.has_error() || range.eof() {
            return None;
        }
        match Self::parse(range, depth) {
            Ok(b) => Some(b),
            Err(e) => {
                range.set_error(e);
                None
            },
        }
    }

    fn parse(range: &mut BitstreamRange<'_>, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(Error::InvalidData("box nesting too deep"));
        }

        let start = range.pos;
        let mut src = range.rest();
        let available = src.len();
        let head = read_box_header(&mut src).map_err(|e| match e {
            Error::UnexpectedEOF => Error::InvalidData("truncated box header"),
            e => e,
        })?;
        let header_len = available - src.len();

        let size = if head.size == u64::MAX {
            available
        } else {
            usize::try_from(head.size).map_err(|_| Error::InvalidData("box size exceeds parent range"))?
        };
        if size > available {
            return Err(Error::InvalidData("box size exceeds parent range"));
        }

        let end = start + size;
        range.pos = end;

        let mut parsed = Self {
            box_type: head.name,
            range: start..end,
            content: start + header_len..end,
            full_header: None,
            children: TryVec::new(),
        };
        parsed.read_children(range.data, depth)?;
        Ok(parsed)
    }

    fn read_children(&mut self, data: &[u8], depth: usize) -> Result<()> {
        let mut children_start = self.content.start;
        let mut src = &data[self.content.clone()];
        match self.box_type {
            BoxType::MetadataBox | BoxType::ImageReferenceBox => {
                self.full_header = Some(read_fullbox_extra(&mut src)?);
                children_start += 4;
            },
            BoxType::ItemInfoBox => {
                let (version, flags) = read_fullbox_extra(&mut src)?;
                self.full_header = Some((version, flags));
                children_start += if version == 0 {
                    be_u16(&mut src)?;
                    6
                } else {
                    be_u32(&mut src)?;
                    8
                };
            },
            BoxType::ImagePropertiesBox
            | BoxType::ItemPropertyContainerBox
            | BoxType::DataInformationBox
            | BoxType::MovieBox
            | BoxType::TrackBox
            | BoxType::MediaBox
            | BoxType::MediaInformationBox
            | BoxType::SampleTableBox => {},
            _ => return Ok(()),
        }

        let mut sub = BitstreamRange::sub_range(data, children_start, self.content.end);
        while let Some(child) = Self::read_at_depth(&mut sub, depth + 1) {
            self.children.push(child)?;
        }
        match sub.take_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The box type as a big-endian integer, for comparison against [`crate::fourcc`].
    #[must_use]
    pub fn short_type(&self) -> u32 {
        self.box_type.into()
    }

    /// The box type.
    #[must_use]
    pub fn box_type(&self) -> BoxType {
        self.box_type
    }

    /// The whole box, header included, as a range of the original buffer.
    #[must_use]
    pub fn byte_range(&self) -> Range<usize> {
        self.range.clone()
    }

    /// Everything after the box header, as a range of the original buffer.
    ///
    /// For full boxes this still starts with the version and flags.
    #[must_use]
    pub fn content_range(&self) -> Range<usize> {
        self.content.clone()
    }

    /// The box content sliced out of the buffer it was parsed from.
    #[must_use]
    pub fn content<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        data.get(self.content.clone()).unwrap_or(&[])
    }

    /// Version and flags of container full boxes (`meta`, `iref`, `iinf`).
    #[must_use]
    pub fn full_header(&self) -> Option<(u8, u32)> {
        self.full_header
    }

    /// Direct children in document order. Empty for leaf boxes.
    #[must_use]
    pub fn children(&self) -> &[ParsedBox] {
        &self.children
    }

    /// First direct child of the given type.
    #[must_use]
    pub fn child_of_type(&self, short_type: u32) -> Option<&ParsedBox> {
        self.children.iter().find(|b| b.short_type() == short_type)
    }

    /// All direct children of the given type, in document order.
    pub fn children_of_type(&self, short_type: u32) -> impl Iterator<Item = &ParsedBox> + '_ {
        self.children.iter().filter(move |b| b.short_type() == short_type)
    }

    /// Indented, human readable outline of the box and its children.
    #[must_use]
    pub fn dump(&self) -> std::string::String {
        let mut out = std::string::String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut std::string::String, indent: usize) {
        let name = FourCC::from(self.box_type);
        let _ = writeln!(out, "{:indent$}Box: {name} -----", "", indent = indent * 2);
        let _ = writeln!(out, "{:indent$}size: {}   (header size: {})", "",
            self.range.len(), self.content.start - self.range.start, indent = indent * 2);
        if let Some((version, flags)) = self.full_header {
            let _ = writeln!(out, "{:indent$}version: {version}", "", indent = indent * 2);
            let _ = writeln!(out, "{:indent$}flags: {flags:x}", "", indent = indent * 2);
        }
        for child in self.children.iter() {
            child.dump_into(out, indent + 1);
        }
    }
}

/// Read every top-level box of `data`. Fails on the first structural error.
pub fn read_all_boxes(data: &[u8]) -> Result<TryVec<ParsedBox>> {
    let mut range = BitstreamRange::new(data);
    let mut boxes = TryVec::new();
    while let Some(b) = ParsedBox::read(&mut range) {
        debug!("top-level {:?} ({} bytes)", b.box_type(), b.byte_range().len());
        boxes.push(b)?;
    }
    match range.take_error() {
        Some(e) => Err(e),
        None => Ok(boxes),
    }
}
