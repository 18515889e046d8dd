#![no_main]

use dsql_probe::protocol::decode_message;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Walk the input as a stream of back-to-back backend messages, the way
    // the connection consumes its read buffer.
    let mut rest = data;
    while !rest.is_empty() {
        match decode_message(rest) {
            Ok(Some((_, consumed))) => {
                assert!(consumed > 0 && consumed <= rest.len());
                rest = &rest[consumed..];
            }
            Ok(None) | Err(_) => break,
        }
    }
});
