#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use tapedeck::tape::persist::parse_tape;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data)
        && let Ok(tape) = parse_tape(text, Path::new("fuzz.json"))
    {
        // Anything that loads can be written back out
        let _ = serde_json::to_string(&tape.persistable());
    }
});
