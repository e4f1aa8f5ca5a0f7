#![no_main]

use libfuzzer_sys::fuzz_target;
use peerwire::utils::compression::{compress, decompress, CompressionKind, Compressor};

fuzz_target!(|data: &[u8]| {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        if let Ok(compressed) = compress(data, &kind) {
            let restored = decompress(&compressed, &kind).expect("own output decompresses");
            assert_eq!(restored, data);
        }
        // Malformed input must error, never panic or exceed the size cap
        let _ = decompress(data, &kind);
        let _ = kind.compress_adaptive(data, 64);
    }
});
