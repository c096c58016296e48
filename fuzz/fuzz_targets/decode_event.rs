#![no_main]

use libfuzzer_sys::fuzz_target;
use pces_core::event::{EventCodec, EventHasher};

// Anything that decodes must survive a re-encode and hash to the same value
// afterwards.
fuzz_target!(|data: &[u8]| {
    let codec = EventCodec::new(64 * 1024);
    if let Ok(event) = codec.decode(data) {
        let encoded = codec.encode(&event).expect("decoded event re-encodes");
        let again = codec.decode(&encoded).expect("re-encoded event decodes");
        let hasher = EventHasher::new();
        assert_eq!(hasher.hash_of(&event), hasher.hash_of(&again));
    }
});
