// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use heifdec::{
    BufferQueue, Completion, DecodeConfig, DecodeSession, DecodeStatus, DecodedPicture, DecoderEngine, DriverState,
    Error, FrameCallback, HeifContext, HeifDecoder, ImageHandle, InterleavedPicture, PlanarPicture, Scheduler,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

// ============================================================================
// Synthetic containers
// ============================================================================

fn bx(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    v.extend_from_slice(name);
    v.extend_from_slice(payload);
    v
}

fn full(name: &[u8; 4], version: u8, payload: &[u8]) -> Vec<u8> {
    let mut p = vec![version, 0, 0, 0];
    p.extend_from_slice(payload);
    bx(name, &p)
}

/// hvcC with a single VPS-typed parameter set `[0x40, 0x01, id]` and 4-byte NAL lengths.
fn hvcc(id: u8) -> Vec<u8> {
    let mut p = vec![1, 1, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 90, 0xf0, 0, 0xfc, 0xfd, 0xf8, 0xf8, 0, 0, 0x0f, 1];
    p.extend_from_slice(&[0xa0, 0, 1, 0, 3, 0x40, 0x01, id]);
    bx(b"hvcC", &p)
}

/// Annex B form of the parameter set in [`hvcc`].
fn headers(id: u8) -> Vec<u8> {
    vec![0, 0, 1, 0x40, 0x01, id]
}

/// Annex B form of an image's coded slice.
fn slice(id: u8) -> Vec<u8> {
    vec![0, 0, 1, 0x26, 0x01, id]
}

struct TestImage {
    id: u16,
    width: u32,
    height: u32,
    item_type: [u8; 4],
    hidden: bool,
    rotation: Option<u8>,
}

/// Builds a HEIF file with one item per image, payload stored in `mdat`.
struct HeifBuilder {
    images: Vec<TestImage>,
    references: Vec<([u8; 4], u16, u16)>,
    primary: u16,
    omit: Option<&'static str>,
}

impl HeifBuilder {
    fn new(primary: u16) -> Self {
        Self {
            images: Vec::new(),
            references: Vec::new(),
            primary,
            omit: None,
        }
    }

    fn image(mut self, id: u16, width: u32, height: u32) -> Self {
        self.images.push(TestImage {
            id,
            width,
            height,
            item_type: *b"hvc1",
            hidden: false,
            rotation: None,
        });
        self
    }

    /// A `grid` item; like every item here it still carries `hvcC` and `ispe`.
    fn grid(self, id: u16, width: u32, height: u32) -> Self {
        let mut builder = self.image(id, width, height);
        if let Some(last) = builder.images.last_mut() {
            last.item_type = *b"grid";
        }
        builder
    }

    fn with_image(mut self, id: u16, f: impl FnOnce(&mut TestImage)) -> Self {
        if let Some(image) = self.images.iter_mut().find(|i| i.id == id) {
            f(image);
        }
        self
    }

    fn hidden(self, id: u16) -> Self {
        self.with_image(id, |image| image.hidden = true)
    }

    /// Attach an `irot` with `quarter_turns` anti-clockwise.
    fn rotated(self, id: u16, quarter_turns: u8) -> Self {
        self.with_image(id, |image| image.rotation = Some(quarter_turns))
    }

    fn reference(mut self, kind: &[u8; 4], from: u16, to: u16) -> Self {
        self.references.push((*kind, from, to));
        self
    }

    fn without(mut self, name: &'static str) -> Self {
        self.omit = Some(name);
        self
    }

    fn keeps(&self, name: &str) -> bool {
        self.omit != Some(name)
    }

    /// Length-prefixed slice NAL for one image.
    fn payload(image: &TestImage) -> Vec<u8> {
        vec![0, 0, 0, 3, 0x26, 0x01, image.id as u8]
    }

    fn meta(&self, offsets: &[u32]) -> Vec<u8> {
        let mut meta = full(b"hdlr", 0, &[0, 0, 0, 0, b'p', b'i', b'c', b't', 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        meta.extend(full(b"pitm", 0, &self.primary.to_be_bytes()));

        let mut iinf = (self.images.len() as u16).to_be_bytes().to_vec();
        for image in &self.images {
            // version 2, flags bit 0 marks a hidden item
            let mut p = vec![2, 0, 0, u8::from(image.hidden)];
            p.extend_from_slice(&image.id.to_be_bytes());
            p.extend_from_slice(&[0, 0]);
            p.extend_from_slice(&image.item_type);
            p.push(0);
            iinf.extend(bx(b"infe", &p));
        }
        meta.extend(full(b"iinf", 0, &iinf));

        if !self.references.is_empty() {
            let mut iref = Vec::new();
            for (kind, from, to) in &self.references {
                let mut p = from.to_be_bytes().to_vec();
                p.extend_from_slice(&1u16.to_be_bytes());
                p.extend_from_slice(&to.to_be_bytes());
                iref.extend(bx(kind, &p));
            }
            meta.extend(full(b"iref", 0, &iref));
        }

        if self.keeps("iprp") {
            let mut ipco = Vec::new();
            let mut ipma = (self.images.len() as u32).to_be_bytes().to_vec();
            let mut index = 0u8;
            for image in &self.images {
                let mut properties = Vec::new();
                if self.keeps("hvcC") {
                    properties.push(hvcc(image.id as u8));
                }
                let mut ispe = image.width.to_be_bytes().to_vec();
                ispe.extend_from_slice(&image.height.to_be_bytes());
                properties.push(full(b"ispe", 0, &ispe));
                if let Some(quarter_turns) = image.rotation {
                    properties.push(bx(b"irot", &[quarter_turns]));
                }

                ipma.extend_from_slice(&image.id.to_be_bytes());
                ipma.push(properties.len() as u8);
                for property in properties {
                    ipco.extend(property);
                    index += 1;
                    ipma.push(0x80 | index);
                }
            }
            let mut iprp = Vec::new();
            if self.keeps("ipco") {
                iprp.extend(bx(b"ipco", &ipco));
            }
            iprp.extend(full(b"ipma", 0, &ipma));
            meta.extend(bx(b"iprp", &iprp));
        }

        if self.keeps("iloc") {
            let mut iloc = vec![0x44, 0x00];
            iloc.extend_from_slice(&(self.images.len() as u16).to_be_bytes());
            for (image, offset) in self.images.iter().zip(offsets) {
                iloc.extend_from_slice(&image.id.to_be_bytes());
                iloc.extend_from_slice(&[0, 0, 0, 1]);
                iloc.extend_from_slice(&offset.to_be_bytes());
                iloc.extend_from_slice(&(Self::payload(image).len() as u32).to_be_bytes());
            }
            meta.extend(full(b"iloc", 0, &iloc));
        }

        full(b"meta", 0, &meta)
    }

    fn build(&self) -> Vec<u8> {
        let ftyp = bx(b"ftyp", b"heic\0\0\0\0mif1heic");
        let placeholder = vec![0; self.images.len()];
        let mdat_start = ftyp.len() + self.meta(&placeholder).len() + 8;

        let mut offsets = Vec::new();
        let mut mdat = Vec::new();
        for image in &self.images {
            offsets.push((mdat_start + mdat.len()) as u32);
            mdat.extend(Self::payload(image));
        }

        let mut file = ftyp;
        file.extend(self.meta(&offsets));
        file.extend(bx(b"mdat", &mdat));
        file
    }
}

fn three_images() -> HeifBuilder {
    HeifBuilder::new(2).image(1, 4, 2).image(2, 6, 4).image(3, 3, 3)
}

// ============================================================================
// Mock decoder engine
// ============================================================================

/// Emits one solid mid-gray picture after the flush, sized for the image whose
/// id ends the last pushed buffer.
struct MockEngine {
    sizes: Vec<(u8, u32, u32)>,
    fail_id: Option<u8>,
    last_id: Option<u8>,
    pushed: Vec<u64>,
    flushed: bool,
    emitted: bool,
    callback: Option<FrameCallback>,
    filters_disabled: Rc<Cell<Option<bool>>>,
}

impl MockEngine {
    fn new(builder: &HeifBuilder) -> Self {
        Self {
            sizes: builder.images.iter().map(|i| (i.id as u8, i.width, i.height)).collect(),
            fail_id: None,
            last_id: None,
            pushed: Vec::new(),
            flushed: false,
            emitted: false,
            callback: None,
            filters_disabled: Rc::default(),
        }
    }

    fn failing(mut self, id: u8) -> Self {
        self.fail_id = Some(id);
        self
    }
}

fn solid_gray(width: u32, height: u32) -> PlanarPicture {
    let (cw, ch) = PlanarPicture::chroma_size(width, height);
    let len = (width * height + 2 * cw * ch) as usize;
    PlanarPicture::from_concatenated(width, height, &vec![128; len]).expect("planes")
}

impl DecoderEngine for MockEngine {
    fn push_data(&mut self, data: &[u8], timestamp: u64) -> heifdec::Result<()> {
        self.pushed.push(timestamp);
        self.last_id = data.last().copied();
        Ok(())
    }

    fn decode_step(&mut self) -> DecodeStatus {
        if self.last_id.is_some() && self.last_id == self.fail_id {
            return DecodeStatus::Other(-1);
        }
        if !self.flushed || self.emitted {
            return DecodeStatus::NeedsMoreInput;
        }
        self.emitted = true;
        let Some(&(_, width, height)) = self.sizes.iter().find(|s| Some(s.0) == self.last_id) else {
            return DecodeStatus::Other(-2);
        };
        if let Some(cb) = self.callback.as_mut() {
            cb(DecodedPicture::PlanarYCbCrA(solid_gray(width, height)));
        }
        DecodeStatus::Ok
    }

    fn has_more_output(&self) -> bool {
        false
    }

    fn flush(&mut self) {
        self.flushed = true;
    }

    fn disable_filters(&mut self, disable: bool) {
        self.filters_disabled.set(Some(disable));
    }

    fn set_frame_callback(&mut self, callback: FrameCallback) {
        self.callback = Some(callback);
    }
}

// ============================================================================
// Extraction (manual box walking)
// ============================================================================

#[test]
fn extract_orders_headers_before_payload() {
    init_logger();
    let file = HeifBuilder::new(1).image(1, 8, 8).build();
    let queue = heifdec::extract(&file).expect("extract failed");
    let buffers: Vec<&[u8]> = queue.iter().collect();
    assert_eq!(buffers, [&headers(1)[..], &slice(1)[..]]);
    assert!(!queue.is_exhausted());
}

#[test]
fn extract_concatenates_all_items() {
    let file = three_images().build();
    let queue = heifdec::extract(&file).expect("extract failed");
    let buffers: Vec<&[u8]> = queue.iter().collect();
    assert_eq!(buffers.len(), 2);
    assert_eq!(buffers[0], &headers(1)[..]);
    assert_eq!(buffers[1], [slice(1), slice(2), slice(3)].concat());
}

#[test]
fn extract_images_one_queue_per_image() {
    let file = three_images().build();
    let queues = heifdec::extract_images(&file).expect("extract_images failed");
    assert_eq!(queues.len(), 3);
    for (queue, id) in queues.iter().zip(1u8..) {
        let buffers: Vec<&[u8]> = queue.iter().collect();
        assert_eq!(buffers, [&headers(id)[..], &slice(id)[..]]);
    }
}

#[test]
fn extract_from_parsed_boxes() {
    let file = three_images().build();
    let boxes = heifdec::read_all_boxes(&file).expect("box walk failed");
    let types: Vec<u32> = boxes.iter().map(|b| b.short_type()).collect();
    assert_eq!(types, [u32::from_be_bytes(*b"ftyp"), u32::from_be_bytes(*b"meta"), u32::from_be_bytes(*b"mdat")]);

    let meta = &boxes[1];
    assert_eq!(meta.children_of_type(heifdec::fourcc(b"iloc")).count(), 1);
    let queue = heifdec::extract_from_boxes(&boxes, &file).expect("extract failed");
    assert_eq!(queue.len(), 2);
}

#[test]
fn missing_required_boxes() {
    init_logger();
    for name in ["iloc", "iprp", "ipco", "hvcC"] {
        let file = three_images().without(name).build();
        match heifdec::extract(&file) {
            Err(Error::MissingRequiredBox(missing)) => assert_eq!(missing, name),
            other => panic!("{name}: expected MissingRequiredBox, got {:?}", other.map(|q| q.len())),
        }
        match HeifContext::from_bytes(&file) {
            Err(Error::MissingRequiredBox(missing)) => assert_eq!(missing, name),
            Err(e) => panic!("{name}: unexpected error {e:?}"),
            Ok(_) => panic!("{name}: expected an error"),
        }
    }
}

#[test]
fn truncated_containers_never_panic() {
    let file = three_images().build();
    for len in 0..file.len() {
        let _ = heifdec::extract(&file[..len]);
        let _ = heifdec::extract_images(&file[..len]);
        let _ = HeifContext::from_bytes(&file[..len]);
    }
    assert!(heifdec::extract(&file[..file.len() - 1]).is_err());
    assert!(matches!(heifdec::extract(&[]), Err(Error::MissingMetaBox)));
}

// ============================================================================
// Container API
// ============================================================================

#[test]
fn context_enumerates_images() {
    let file = three_images().build();
    let context = HeifContext::from_bytes(&file).expect("parse failed");
    assert_eq!(context.image_ids().collect::<Vec<_>>(), [1, 2, 3]);
    assert_eq!(context.primary_image_id(), 2);

    let info = context.image_info(2).expect("image 2");
    assert_eq!((info.width, info.height), (6, 4));
    assert!(info.is_primary);
    assert!(!info.has_alpha);
    assert_eq!(info.bit_depth, 8);

    let config = context.hevc_config(3).expect("hvcC for image 3");
    assert_eq!(config.nal_length_size, 4);
    assert_eq!(config.chroma_format, 1);

    let queue = context.compressed_data(3).expect("compressed data");
    let buffers: Vec<&[u8]> = queue.iter().collect();
    assert_eq!(buffers, [&headers(3)[..], &slice(3)[..]]);
}

#[test]
fn hidden_items_are_not_top_level() {
    init_logger();
    let builder = three_images().hidden(3);
    let file = builder.build();
    let context = HeifContext::from_bytes(&file).expect("parse failed");
    assert_eq!(context.image_ids().collect::<Vec<_>>(), [1, 2]);
    assert!(context.image_info(3).is_err());
    // The item itself is still reachable
    let queue = context.compressed_data(3).expect("compressed data");
    assert_eq!(queue.len(), 2);

    let images = HeifDecoder::new(|| MockEngine::new(&builder))
        .decode_all(&file)
        .expect("decode_all failed");
    assert_eq!(images.iter().map(|img| img.id).collect::<Vec<_>>(), [1, 2]);
}

#[test]
fn thumbnails_are_not_top_level() {
    let file = three_images().reference(b"thmb", 3, 2).build();
    let context = HeifContext::from_bytes(&file).expect("parse failed");
    assert_eq!(context.image_ids().collect::<Vec<_>>(), [1, 2]);
    assert!(context.image_info(2).expect("image 2").is_primary);
}

#[test]
fn grid_is_skipped_and_its_tiles_stay_out() {
    init_logger();
    let tiled = || {
        HeifBuilder::new(10)
            .grid(10, 8, 4)
            .image(11, 4, 4)
            .image(12, 4, 4)
            .hidden(11)
            .hidden(12)
            .reference(b"dimg", 10, 11)
            .reference(b"dimg", 10, 12)
    };
    assert!(matches!(HeifContext::from_bytes(&tiled().build()), Err(Error::NoImagesFound)));

    let file = tiled().image(13, 2, 2).build();
    let context = HeifContext::from_bytes(&file).expect("parse failed");
    assert_eq!(context.image_ids().collect::<Vec<_>>(), [13]);
    assert_eq!(context.primary_image_id(), 10);
    assert!(!context.image_info(13).expect("image 13").is_primary);
    assert!(ImageHandle::primary(&context).is_err());
}

#[test]
fn rotation_swaps_reported_dimensions() {
    init_logger();
    let builder = HeifBuilder::new(1).image(1, 6, 4).rotated(1, 1).image(2, 6, 4).rotated(2, 2);
    let file = builder.build();
    let context = HeifContext::from_bytes(&file).expect("parse failed");

    let quarter = context.image_info(1).expect("image 1");
    assert_eq!((quarter.width, quarter.height, quarter.rotation), (4, 6, 90));
    let half = context.image_info(2).expect("image 2");
    assert_eq!((half.width, half.height, half.rotation), (6, 4, 180));

    let handle = ImageHandle::primary(&context).expect("primary");
    assert_eq!((handle.width().expect("width"), handle.height().expect("height")), (4, 6));

    let images = HeifDecoder::new(|| MockEngine::new(&builder))
        .decode_all(&file)
        .expect("decode_all failed");
    assert_eq!(images.len(), 2);
    assert_eq!((images[0].width, images[0].height), (4, 6));
    assert_eq!((images[1].width, images[1].height), (6, 4));
    for image in &images {
        assert_eq!(image.data.len(), 6 * 4 * 4);
        assert!(image.data.chunks_exact(4).all(|px| px == [130, 130, 130, 255]));
    }
}

#[test]
fn context_constructors_agree() {
    let file = three_images().build();
    let borrowed = HeifContext::from_bytes(&file).expect("from_bytes");
    let owned = HeifContext::from_owned(file.clone()).expect("from_owned");
    let read = HeifContext::from_reader(&mut std::io::Cursor::new(&file)).expect("from_reader");
    assert_eq!(borrowed.images(), owned.images());
    assert_eq!(borrowed.images(), read.images());
}

#[test]
fn cancellation_during_parse() {
    struct ImmediatelyCancelled;
    impl heifdec::Stop for ImmediatelyCancelled {
        fn check(&self) -> std::result::Result<(), heifdec::StopReason> {
            Err(heifdec::StopReason::Cancelled)
        }
    }

    let file = three_images().build();
    let result = HeifContext::from_bytes_with_config(&file, &DecodeConfig::default(), &ImmediatelyCancelled);
    match result {
        Err(Error::Stopped(reason)) => assert_eq!(reason, heifdec::StopReason::Cancelled),
        Ok(_) => panic!("Expected cancellation"),
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[test]
fn resource_limits() {
    let file = three_images().build();
    let config = DecodeConfig::default().with_max_images(2);
    assert!(matches!(
        HeifContext::from_bytes_with_config(&file, &config, &heifdec::Unstoppable),
        Err(Error::ResourceLimitExceeded(_))
    ));

    let big = HeifBuilder::new(1).image(1, 100_000, 100_000).build();
    let config = DecodeConfig::default().with_total_megapixels_limit(64);
    assert!(matches!(
        HeifContext::from_bytes_with_config(&big, &config, &heifdec::Unstoppable),
        Err(Error::ResourceLimitExceeded(_))
    ));
}

#[test]
fn decode_config_defaults_and_builder() {
    let config = DecodeConfig::default();
    assert_eq!(config.peak_memory_limit, Some(1_000_000_000));
    assert_eq!(config.total_megapixels_limit, Some(512));
    assert_eq!(config.max_images, Some(1_000));
    assert!(!config.lenient);
    assert!(config.disable_filters);

    let unlimited = DecodeConfig::unlimited();
    assert_eq!(unlimited.peak_memory_limit, None);
    assert_eq!(unlimited.max_images, None);

    let config = DecodeConfig::default()
        .with_peak_memory_limit(42)
        .with_total_megapixels_limit(7)
        .with_max_images(3)
        .lenient(true)
        .disable_filters(false);
    assert_eq!(config.peak_memory_limit, Some(42));
    assert_eq!(config.total_megapixels_limit, Some(7));
    assert_eq!(config.max_images, Some(3));
    assert!(config.lenient);
    assert!(!config.disable_filters);
}

// ============================================================================
// Decoding
// ============================================================================

#[test]
fn decode_all_three_images() {
    init_logger();
    let builder = three_images();
    let file = builder.build();
    let images = HeifDecoder::new(|| MockEngine::new(&builder))
        .decode_all(&file)
        .expect("decode_all failed");

    assert_eq!(images.len(), 3);
    assert_eq!(images.iter().filter(|img| img.is_primary).count(), 1);
    let primary = images.iter().find(|img| img.is_primary).expect("primary");
    assert_eq!(primary.id, 2);
    assert_eq!(images.iter().map(|img| img.id).collect::<Vec<_>>(), [1, 2, 3]);

    for (image, expected) in images.iter().zip(&builder.images) {
        assert_eq!((image.width, image.height), (expected.width, expected.height));
        assert_eq!(image.data.len(), (expected.width * expected.height * 4) as usize);
        assert!(!image.has_alpha);
    }
}

#[test]
fn decode_all_skips_failed_image() {
    init_logger();
    let builder = three_images();
    let file = builder.build();
    let images = HeifDecoder::new(|| MockEngine::new(&builder).failing(3))
        .decode_all(&file)
        .expect("decode_all failed");
    assert_eq!(images.iter().map(|img| img.id).collect::<Vec<_>>(), [1, 2]);
}

#[test]
fn decode_primary_only() {
    let builder = three_images();
    let file = builder.build();
    let image = HeifDecoder::new(|| MockEngine::new(&builder))
        .decode_primary(&file)
        .expect("decode_primary failed");
    assert_eq!((image.id, image.width, image.height), (2, 6, 4));
    assert!(image.is_primary);
}

#[test]
fn filter_setting_reaches_engine() {
    let builder = HeifBuilder::new(1).image(1, 2, 2);
    let file = builder.build();
    let seen = Rc::new(Cell::new(None));

    let factory = || {
        let mut engine = MockEngine::new(&builder);
        engine.filters_disabled = Rc::clone(&seen);
        engine
    };
    HeifDecoder::new(factory).decode_all(&file).expect("decode failed");
    assert_eq!(seen.get(), Some(true));

    let factory = || {
        let mut engine = MockEngine::new(&builder);
        engine.filters_disabled = Rc::clone(&seen);
        engine
    };
    HeifDecoder::new(factory)
        .with_config(DecodeConfig::default().disable_filters(false))
        .decode_all(&file)
        .expect("decode failed");
    assert_eq!(seen.get(), Some(false));
}

#[test]
fn manual_pipeline() {
    let builder = HeifBuilder::new(1).image(1, 5, 3);
    let file = builder.build();
    let queue: BufferQueue = heifdec::extract(&file).expect("extract failed");

    let frames = Rc::new(RefCell::new(Vec::new()));
    let outcomes = Rc::new(RefCell::new(Vec::new()));
    let (f, o) = (Rc::clone(&frames), Rc::clone(&outcomes));
    let mut session = DecodeSession::new(
        MockEngine::new(&builder),
        queue,
        Box::new(move |picture: DecodedPicture| f.borrow_mut().push(picture)),
        move |outcome: heifdec::Result<Completion>| o.borrow_mut().push(outcome.map_err(|e| e.to_string())),
        &DecodeConfig::default(),
    );
    while !session.step().is_terminal() {}

    assert_eq!(session.state(), DriverState::Done);
    assert_eq!(session.engine().pushed, [0, 1]);
    assert_eq!(*outcomes.borrow(), [Ok(Completion::Finished)]);
    let frames = frames.borrow();
    assert_eq!(frames.len(), 1);

    let rgba = heifdec::to_rgba(&frames[0]).expect("convert failed");
    assert_eq!(rgba.len(), 5 * 3 * 4);
    assert!(rgba.chunks_exact(4).all(|px| px == [130, 130, 130, 255]));
}

#[test]
fn sessions_interleave_on_scheduler() {
    let builder = three_images();
    let file = builder.build();
    let queues = heifdec::extract_images(&file).expect("extract failed");

    let order = Rc::new(RefCell::new(Vec::new()));
    let scheduler = Scheduler::new();
    for (queue, id) in queues.into_iter().zip(1u32..) {
        let done = Rc::clone(&order);
        scheduler.spawn(DecodeSession::new(
            MockEngine::new(&builder),
            queue,
            Box::new(|_: DecodedPicture| {}),
            move |outcome: heifdec::Result<Completion>| {
                assert!(outcome.is_ok());
                done.borrow_mut().push(id);
            },
            &DecodeConfig::default(),
        ));
    }
    scheduler.run_until_idle();
    // Identical sessions advance in lockstep, so they also finish in spawn order
    assert_eq!(*order.borrow(), [1, 2, 3]);
}

// ============================================================================
// Image handles
// ============================================================================

#[test]
fn handle_metadata_and_release() {
    let builder = three_images();
    let file = builder.build();
    let context = HeifContext::from_bytes(&file).expect("parse failed");
    let mut handles = ImageHandle::all(&context).expect("handles");
    assert_eq!(handles.len(), 3);

    let handle = &mut handles[2];
    assert_eq!(handle.id().expect("id"), 3);
    assert_eq!((handle.width().expect("width"), handle.height().expect("height")), (3, 3));
    assert!(!handle.is_primary().expect("primary"));

    let image = handle.decode(|| MockEngine::new(&builder)).expect("decode failed").clone();
    assert_eq!(image.data.len(), 3 * 3 * 4);

    handle.release();
    handle.release();
    assert!(matches!(handle.width(), Err(Error::HandleUseAfterRelease)));
    assert!(matches!(handle.has_alpha(), Err(Error::HandleUseAfterRelease)));
    assert!(matches!(
        handle.decode(|| MockEngine::new(&builder)),
        Err(Error::HandleUseAfterRelease)
    ));

    // Other handles on the same context are unaffected
    assert!(handles[1].is_primary().expect("primary"));
}

// ============================================================================
// Color conversion
// ============================================================================

#[test]
fn solid_mid_gray_converts_near_128() {
    let picture = DecodedPicture::PlanarYCbCrA(solid_gray(7, 5));
    let mut rgba = vec![0; 7 * 5 * 4];
    heifdec::convert_into(&picture, &mut rgba).expect("convert failed");
    for px in rgba.chunks_exact(4) {
        for &c in &px[..3] {
            assert!(c.abs_diff(128) <= 3, "channel {c}");
            assert_eq!(c, 130);
        }
        assert_eq!(px[3], 255);
    }

    let mut short = vec![0; 7 * 5 * 4 - 1];
    assert!(matches!(
        heifdec::convert_into(&picture, &mut short),
        Err(Error::BufferSizeMismatch { .. })
    ));
}

#[test]
fn interleaved_padding_is_removed() {
    let (width, height) = (5usize, 3usize);
    let stride = width * 4 + 16;
    let mut padded = vec![0xab; stride * height];
    let mut tight = Vec::new();
    for y in 0..height {
        for x in 0..width * 4 {
            let v = (y * 31 + x) as u8;
            padded[y * stride + x] = v;
            tight.push(v);
        }
    }

    let convert = |data: Vec<u8>, stride: usize| {
        let picture = DecodedPicture::InterleavedRgba(InterleavedPicture {
            width: width as u32,
            height: height as u32,
            data,
            stride,
        });
        let mut out = vec![0; width * height * 4];
        heifdec::convert_into(&picture, &mut out).expect("convert failed");
        out
    };
    assert_eq!(convert(padded, stride), tight);
    assert_eq!(convert(tight.clone(), width * 4), tight);
}
