#![no_main]

use libfuzzer_sys::fuzz_target;

/// Both container paths must reject arbitrary input without panicking.
fuzz_target!(|data: &[u8]| {
    let _ = heifdec::extract(data);
    let _ = heifdec::extract_images(data);

    if let Ok(boxes) = heifdec::read_all_boxes(data) {
        for b in boxes.iter() {
            let _ = b.dump();
        }
    }

    if let Ok(context) = heifdec::HeifContext::from_bytes(data) {
        let ids: Vec<u32> = context.image_ids().collect();
        for id in ids {
            let _ = context.image_info(id);
            let _ = context.compressed_data(id);
        }
    }
});
