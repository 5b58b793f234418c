// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lazily decoded images on top of [`HeifContext`].

use crate::context::ImageInfo;
use crate::convert::interleaved_len;
use crate::driver::{Completion, DecodeSession, Scheduler, Spawner};
use crate::engine::{DecodedPicture, DecoderEngine};
use crate::{BufferQueue, DecodeConfig, Error, HeifContext, Result, Unstoppable, rotate_rgba, to_rgba};
use log::{debug, warn};
use std::cell::RefCell;
use std::rc::Rc;

/// A fully decoded image, converted to packed RGBA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub id: u32,
    pub is_primary: bool,
    /// Width of the decoded picture after `irot` rotation.
    pub width: u32,
    pub height: u32,
    /// The container declares an alpha plane for this image.
    pub has_alpha: bool,
    /// Color samples are premultiplied by alpha. Metadata only; `data` is not altered.
    pub premultiplied_alpha: bool,
    /// Row-major RGBA, `width * height * 4` bytes.
    pub data: Vec<u8>,
}

/// Which session of an image a result belongs to.
#[derive(Debug, Clone, Copy)]
enum Part {
    Color,
    Alpha,
}

/// What one session produced.
#[derive(Default)]
struct Slot {
    picture: Option<DecodedPicture>,
    outcome: Option<Result<Completion>>,
}

impl Slot {
    fn take(&mut self) -> Result<DecodedPicture> {
        match self.outcome.take() {
            Some(Ok(_)) => self.picture.take().ok_or(Error::NoDecodableData),
            Some(Err(e)) => Err(e),
            None => Err(Error::NoDecodableData),
        }
    }
}

/// Sessions of one image that have not all finished yet.
struct PendingImage {
    info: ImageInfo,
    color: Slot,
    alpha: Option<Slot>,
    remaining: usize,
}

impl PendingImage {
    fn slot(&mut self, part: Part) -> Option<&mut Slot> {
        match part {
            Part::Color => Some(&mut self.color),
            Part::Alpha => self.alpha.as_mut(),
        }
    }

    fn render(&mut self) -> Result<DecodedImage> {
        let mut picture = self.color.take()?;
        if let Some(alpha) = self.alpha.as_mut() {
            if let Err(e) = alpha.take().and_then(|a| attach_alpha(&mut picture, a)) {
                warn!("image {}: alpha plane dropped: {e}", self.info.id);
            }
        }
        let mut data = to_rgba(&picture)?;
        let (mut width, mut height) = (picture.width(), picture.height());
        if self.info.rotation != 0 {
            (data, width, height) = rotate_rgba(&data, width, height, self.info.rotation)?;
        }
        Ok(DecodedImage {
            id: self.info.id,
            is_primary: self.info.is_primary,
            width,
            height,
            has_alpha: self.info.has_alpha,
            premultiplied_alpha: self.info.premultiplied_alpha,
            data,
        })
    }
}

/// Use the luma plane of `alpha` as the alpha channel of `picture`.
fn attach_alpha(picture: &mut DecodedPicture, alpha: DecodedPicture) -> Result<()> {
    let DecodedPicture::PlanarYCbCrA(alpha) = alpha else {
        return Err(Error::Unsupported("interleaved alpha picture"));
    };
    if (alpha.width, alpha.height) != (picture.width(), picture.height()) {
        return Err(Error::InvalidData("alpha picture size differs from the image"));
    }
    let width = usize::try_from(alpha.width)?;
    let height = usize::try_from(alpha.height)?;
    alpha.y.check(width, height)?;

    match picture {
        DecodedPicture::PlanarYCbCrA(color) => color.alpha = Some(alpha.y),
        DecodedPicture::InterleavedRgba(color) => {
            let row_len = width.checked_mul(4).ok_or(Error::InvalidData("image too large"))?;
            if height == 0 || row_len == 0 {
                return Ok(());
            }
            if color.stride < row_len || color.data.len() < interleaved_len(color.stride, row_len, height)? {
                return Err(Error::InvalidData("interleaved buffer too small"));
            }
            for y in 0..height {
                let row = &mut color.data[y * color.stride..][..row_len];
                for (px, &a) in row.chunks_exact_mut(4).zip(alpha.y.row(y, width)) {
                    px[3] = a;
                }
            }
        },
    }
    Ok(())
}

type Rendered = Rc<RefCell<Vec<(usize, Result<DecodedImage>)>>>;

/// Queue the sessions for one image. The rendered result lands in `rendered`
/// one tick after the last session of the image finishes.
fn schedule_image<E, F>(
    scheduler: &Scheduler,
    context: &HeifContext<'_>,
    index: usize,
    info: ImageInfo,
    new_engine: &mut F,
    rendered: &Rendered,
) -> Result<()>
where
    E: DecoderEngine + 'static,
    F: FnMut() -> E,
{
    let color = context.compressed_data(info.id)?;
    let alpha = match info.alpha_item_id {
        Some(alpha_id) => match context.compressed_data(alpha_id) {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!("image {}: alpha item {alpha_id} unusable: {e}", info.id);
                None
            },
        },
        None => None,
    };

    let pending = Rc::new(RefCell::new(PendingImage {
        info,
        color: Slot::default(),
        alpha: alpha.as_ref().map(|_| Slot::default()),
        remaining: 1 + usize::from(alpha.is_some()),
    }));
    let session = SessionSpec {
        pending: &pending,
        index,
        rendered,
        spawner: scheduler.spawner(),
        config: context.config(),
    };
    scheduler.spawn(session.build(new_engine(), color, Part::Color));
    if let Some(queue) = alpha {
        scheduler.spawn(session.build(new_engine(), queue, Part::Alpha));
    }
    Ok(())
}

struct SessionSpec<'a> {
    pending: &'a Rc<RefCell<PendingImage>>,
    index: usize,
    rendered: &'a Rendered,
    spawner: Spawner,
    config: &'a DecodeConfig,
}

impl SessionSpec<'_> {
    fn build<E: DecoderEngine>(&self, engine: E, queue: BufferQueue, part: Part) -> DecodeSession<E> {
        let frames = Rc::clone(self.pending);
        let on_frame = Box::new(move |picture: DecodedPicture| {
            let mut pending = frames.borrow_mut();
            let id = pending.info.id;
            if let Some(slot) = pending.slot(part) {
                if slot.picture.is_none() {
                    slot.picture = Some(picture);
                } else {
                    debug!("image {id}: extra {part:?} frame ignored");
                }
            }
        });

        let pending = Rc::clone(self.pending);
        let rendered = Rc::clone(self.rendered);
        let spawner = self.spawner.clone();
        let index = self.index;
        let on_complete = move |outcome: Result<Completion>| {
            let finished = {
                let mut p = pending.borrow_mut();
                if let Some(slot) = p.slot(part) {
                    slot.outcome = Some(outcome);
                }
                p.remaining -= 1;
                p.remaining == 0
            };
            if finished {
                spawner.defer(move || {
                    let image = pending.borrow_mut().render();
                    rendered.borrow_mut().push((index, image));
                });
            }
        };

        DecodeSession::new(engine, queue, on_frame, on_complete, self.config)
    }
}

/// One top-level image of a [`HeifContext`].
///
/// Metadata is available without decoding. Pixels are decoded on the first
/// [`decode`](Self::decode) and kept for later calls. After
/// [`release`](Self::release) every method fails with
/// [`Error::HandleUseAfterRelease`].
pub struct ImageHandle<'a> {
    context: Option<&'a HeifContext<'a>>,
    info: ImageInfo,
    decoded: Option<DecodedImage>,
}

impl<'a> ImageHandle<'a> {
    /// Handle for the top-level image `id`.
    pub fn new(context: &'a HeifContext<'a>, id: u32) -> Result<Self> {
        Ok(Self {
            context: Some(context),
            info: context.image_info(id)?,
            decoded: None,
        })
    }

    /// Handle for the primary image.
    pub fn primary(context: &'a HeifContext<'a>) -> Result<Self> {
        Self::new(context, context.primary_image_id())
    }

    /// One handle per top-level image, in container order.
    pub fn all(context: &'a HeifContext<'a>) -> Result<Vec<Self>> {
        context.image_ids().map(|id| Self::new(context, id)).collect()
    }

    fn live(&self) -> Result<&ImageInfo> {
        match self.context {
            Some(_) => Ok(&self.info),
            None => Err(Error::HandleUseAfterRelease),
        }
    }

    pub fn info(&self) -> Result<ImageInfo> {
        self.live().copied()
    }

    pub fn id(&self) -> Result<u32> {
        Ok(self.live()?.id)
    }

    pub fn width(&self) -> Result<u32> {
        Ok(self.live()?.width)
    }

    pub fn height(&self) -> Result<u32> {
        Ok(self.live()?.height)
    }

    pub fn is_primary(&self) -> Result<bool> {
        Ok(self.live()?.is_primary)
    }

    pub fn has_alpha(&self) -> Result<bool> {
        Ok(self.live()?.has_alpha)
    }

    pub fn premultiplied_alpha(&self) -> Result<bool> {
        Ok(self.live()?.premultiplied_alpha)
    }

    /// Whether a decoded result is cached.
    #[must_use]
    pub fn is_decoded(&self) -> bool {
        self.context.is_some() && self.decoded.is_some()
    }

    /// Decode the image, or return the cached result.
    ///
    /// `new_engine` is called once for the color image and once more when the
    /// image has an alpha plane. A failed alpha decode leaves the image opaque. A
    /// failed color decode is returned and not cached.
    pub fn decode<E, F>(&mut self, mut new_engine: F) -> Result<&DecodedImage>
    where
        E: DecoderEngine + 'static,
        F: FnMut() -> E,
    {
        let context = self.context.ok_or(Error::HandleUseAfterRelease)?;
        if self.decoded.is_none() {
            let scheduler = Scheduler::new();
            let rendered = Rendered::default();
            schedule_image(&scheduler, context, 0, self.info, &mut new_engine, &rendered)?;
            let ticks = scheduler.run_until_idle();
            debug!("image {}: decoded in {ticks} ticks", self.info.id);
            let result = rendered.borrow_mut().pop();
            let (_, image) = result.ok_or(Error::NoDecodableData)?;
            self.decoded = Some(image?);
        }
        self.decoded.as_ref().ok_or(Error::NoDecodableData)
    }

    /// Drop the context reference and any cached pixels. Calling this again does nothing.
    pub fn release(&mut self) {
        if self.context.take().is_some() {
            debug!("image {}: handle released", self.info.id);
        }
        self.decoded = None;
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.context.is_none()
    }
}

/// Decodes every top-level image of a container, one engine per session.
///
/// ```no_run
/// # struct MyEngine;
/// # impl heifdec::DecoderEngine for MyEngine {
/// #     fn push_data(&mut self, _: &[u8], _: u64) -> heifdec::Result<()> { Ok(()) }
/// #     fn decode_step(&mut self) -> heifdec::DecodeStatus { heifdec::DecodeStatus::NeedsMoreInput }
/// #     fn has_more_output(&self) -> bool { false }
/// #     fn flush(&mut self) {}
/// #     fn disable_filters(&mut self, _: bool) {}
/// #     fn set_frame_callback(&mut self, _: heifdec::FrameCallback) {}
/// # }
/// use heifdec::HeifDecoder;
///
/// let bytes = std::fs::read("image.heic")?;
/// for image in HeifDecoder::new(|| MyEngine).decode_all(&bytes)? {
///     println!("{}: {}x{} primary={}", image.id, image.width, image.height, image.is_primary);
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct HeifDecoder<F> {
    new_engine: F,
    config: DecodeConfig,
}

impl<F> HeifDecoder<F> {
    pub fn new(new_engine: F) -> Self {
        Self {
            new_engine,
            config: DecodeConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: DecodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Decode all top-level images, in container order.
    ///
    /// Container errors fail the whole call. An image whose data cannot be
    /// extracted or whose decode fails is logged and left out; the others are
    /// still returned.
    pub fn decode_all<E>(&mut self, data: &[u8]) -> Result<Vec<DecodedImage>>
    where
        E: DecoderEngine + 'static,
        F: FnMut() -> E,
    {
        let context = HeifContext::from_bytes_with_config(data, &self.config, &Unstoppable)?;
        let scheduler = Scheduler::new();
        let rendered = Rendered::default();

        for (index, info) in context.images().iter().enumerate() {
            if let Err(e) = schedule_image(&scheduler, &context, index, *info, &mut self.new_engine, &rendered) {
                warn!("image {}: skipped: {e}", info.id);
            }
        }
        let ticks = scheduler.run_until_idle();
        debug!("{} image(s) decoded in {ticks} ticks", context.images().len());

        let mut results = rendered.take();
        results.sort_by_key(|(index, _)| *index);
        let mut images = Vec::new();
        images.try_reserve_exact(results.len()).map_err(|_| Error::OutOfMemory)?;
        for (index, result) in results {
            match result {
                Ok(image) => images.push(image),
                Err(e) => warn!("image {}: decode failed: {e}", context.images()[index].id),
            }
        }
        Ok(images)
    }

    /// Decode only the primary image.
    pub fn decode_primary<E>(&mut self, data: &[u8]) -> Result<DecodedImage>
    where
        E: DecoderEngine + 'static,
        F: FnMut() -> E,
    {
        let context = HeifContext::from_bytes_with_config(data, &self.config, &Unstoppable)?;
        let mut handle = ImageHandle::primary(&context)?;
        let image = handle.decode(&mut self.new_engine)?.clone();
        handle.release();
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::file_with_alpha;
    use crate::engine::{DecodeStatus, FrameCallback, PlanarPicture};
    use std::cell::Cell;

    /// Emits one solid 4x2 picture after the flush. The luma value is picked by
    /// the last payload byte pushed: 0x01 (color) is mid gray, 0x02 (alpha) is 200.
    struct StubEngine {
        marker: Option<u8>,
        flushed: bool,
        emitted: bool,
        fail_with: Option<i32>,
        callback: Option<FrameCallback>,
    }

    impl StubEngine {
        fn new(fail_with: Option<i32>) -> Self {
            Self {
                marker: None,
                flushed: false,
                emitted: false,
                fail_with,
                callback: None,
            }
        }
    }

    impl DecoderEngine for StubEngine {
        fn push_data(&mut self, data: &[u8], _timestamp: u64) -> Result<()> {
            self.marker = data.last().copied();
            Ok(())
        }

        fn decode_step(&mut self) -> DecodeStatus {
            if let Some(code) = self.fail_with {
                return DecodeStatus::Other(code);
            }
            if !self.flushed || self.emitted {
                return DecodeStatus::NeedsMoreInput;
            }
            self.emitted = true;
            let luma = if self.marker == Some(0x02) { 200 } else { 128 };
            let mut data = vec![luma; 8];
            data.extend_from_slice(&[128; 4]);
            let picture = PlanarPicture::from_concatenated(4, 2, &data).unwrap();
            if let Some(cb) = self.callback.as_mut() {
                cb(DecodedPicture::PlanarYCbCrA(picture));
            }
            DecodeStatus::Ok
        }

        fn has_more_output(&self) -> bool {
            false
        }

        fn flush(&mut self) {
            self.flushed = true;
        }

        fn disable_filters(&mut self, _disable: bool) {}

        fn set_frame_callback(&mut self, callback: FrameCallback) {
            self.callback = Some(callback);
        }
    }

    #[test]
    fn decode_merges_alpha_and_is_memoized() {
        let file = file_with_alpha(b"heic");
        let context = HeifContext::from_bytes(&file).unwrap();
        let mut handle = ImageHandle::primary(&context).unwrap();
        assert_eq!((handle.width().unwrap(), handle.height().unwrap()), (4, 2));
        assert!(!handle.is_decoded());

        let engines = Cell::new(0);
        let new_engine = || {
            engines.set(engines.get() + 1);
            StubEngine::new(None)
        };
        let image = handle.decode(new_engine).unwrap();
        assert_eq!(image.data.len(), 4 * 2 * 4);
        assert!(image.data.chunks_exact(4).all(|px| px == [130, 130, 130, 200]));
        assert!(image.is_primary && image.has_alpha && image.premultiplied_alpha);
        assert_eq!(engines.get(), 2);

        let again = handle.decode(|| StubEngine::new(Some(-1))).unwrap();
        assert_eq!(again.data[3], 200);
        assert!(handle.is_decoded());
    }

    #[test]
    fn released_handle_fails() {
        let file = file_with_alpha(b"heic");
        let context = HeifContext::from_bytes(&file).unwrap();
        let mut handle = ImageHandle::new(&context, 1).unwrap();
        handle.decode(|| StubEngine::new(None)).unwrap();

        handle.release();
        handle.release();
        assert!(handle.is_released());
        assert!(!handle.is_decoded());
        assert!(matches!(handle.width(), Err(Error::HandleUseAfterRelease)));
        assert!(matches!(handle.info(), Err(Error::HandleUseAfterRelease)));
        assert!(matches!(
            handle.decode(|| StubEngine::new(None)),
            Err(Error::HandleUseAfterRelease)
        ));
    }

    #[test]
    fn failed_decode_is_not_cached() {
        let file = file_with_alpha(b"heic");
        let context = HeifContext::from_bytes(&file).unwrap();
        let mut handle = ImageHandle::new(&context, 1).unwrap();
        assert!(matches!(handle.decode(|| StubEngine::new(Some(-3))), Err(Error::Decode(-3))));
        assert!(!handle.is_decoded());
        assert!(handle.decode(|| StubEngine::new(None)).is_ok());
    }

    #[test]
    fn alpha_failure_leaves_image_opaque() {
        let file = file_with_alpha(b"heic");
        let engines = Cell::new(0);
        // The alpha session's engine is created second
        let new_engine = || {
            engines.set(engines.get() + 1);
            StubEngine::new((engines.get() == 2).then_some(-9))
        };
        let image = HeifDecoder::new(new_engine).decode_primary(&file).unwrap();
        assert!(image.data.chunks_exact(4).all(|px| px == [130, 130, 130, 255]));
    }

    #[test]
    fn unknown_id() {
        let file = file_with_alpha(b"heic");
        let context = HeifContext::from_bytes(&file).unwrap();
        assert!(ImageHandle::new(&context, 2).is_err());
        assert_eq!(ImageHandle::all(&context).unwrap().len(), 1);
    }
}
