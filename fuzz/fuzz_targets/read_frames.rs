#![no_main]

use libfuzzer_sys::fuzz_target;
use pces_core::pces::format::FrameReader;

fuzz_target!(|data: &[u8]| {
    let Ok(mut reader) = FrameReader::new(data, 64 * 1024) else {
        return;
    };
    let mut last = reader.offset();
    while let Ok(Some(_)) = reader.next_frame() {
        assert!(reader.offset() > last);
        last = reader.offset();
    }
});
