//! Fuzz target for chunked UTF-8 decoding.
//!
//! Splits input at arbitrary points and checks that decoding the pieces one
//! by one yields the same text as decoding the whole input at once.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use logview::protocol::ChunkDecoder;

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    splits: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut decoder = ChunkDecoder::new();
    let mut out = String::new();
    let mut rest: &[u8] = &input.data;

    for split in input.splits {
        let at = usize::from(split).min(rest.len());
        let (chunk, tail) = rest.split_at(at);
        out.push_str(&decoder.decode(chunk));
        rest = tail;
    }
    out.push_str(&decoder.decode(rest));
    out.extend(decoder.finish());

    if let Ok(text) = std::str::from_utf8(&input.data) {
        assert_eq!(out, text);
    }
    assert_eq!(decoder.pending(), 0);
});
