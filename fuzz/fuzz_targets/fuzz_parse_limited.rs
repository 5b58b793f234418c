#![no_main]

use libfuzzer_sys::fuzz_target;
use heifdec::{DecodeConfig, HeifContext};

/// Parse with tight limits; errors are fine, panics and runaway allocation are not.
fuzz_target!(|data: &[u8]| {
    let config = DecodeConfig::default()
        .with_peak_memory_limit(16 * 1024 * 1024)
        .with_total_megapixels_limit(16)
        .with_max_images(8);

    if let Ok(context) = HeifContext::from_bytes_with_config(data, &config, &enough::Unstoppable) {
        let primary = context.primary_image_id();
        let _ = context.compressed_data(primary);
    }
});
