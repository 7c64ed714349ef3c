#![no_main]

use libfuzzer_sys::fuzz_target;
use xcoder_codecs::codec::h264;
use xcoder_codecs::codec::h265;
use xcoder_codecs::codec::nalu::NalIterator;
use xcoder_codecs::decoder::header_cache::HeaderCache;
use xcoder_codecs::Codec;

fuzz_target!(|data: &[u8]| {
    for nalu in NalIterator::<h264::NaluHeader>::new(data) {
        assert!(nalu.offset() + nalu.size() <= data.len());
    }
    for nalu in NalIterator::<h265::NaluHeader>::new(data) {
        assert!(nalu.offset() + nalu.size() <= data.len());
    }

    // Split the input into a parameter set blob and a packet.
    let split = data.first().map_or(0, |&b| b as usize).min(data.len());
    let (current, packet) = data.split_at(split);
    for codec in [Codec::H264, Codec::H265] {
        let mut cache = HeaderCache::new(codec);
        let _ = cache.should_prepend(packet, current);
        let _ = cache.should_prepend(packet, current);
    }
});
