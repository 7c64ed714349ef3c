#![no_main]

use libfuzzer_sys::fuzz_target;
use xcoder_codecs::codec::sei::extract_payload;
use xcoder_codecs::codec::sei::find_user_data_unregistered;
use xcoder_codecs::codec::sei::is_sei_only;
use xcoder_codecs::Codec;

fuzz_target!(|data: &[u8]| {
    for codec in [Codec::H264, Codec::H265] {
        let _ = is_sei_only(codec, data);
        let _ = find_user_data_unregistered(codec, data);
    }
    let _ = extract_payload(data);
});
