#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use tapedeck::config::ConfigLoader;

fuzz_target!(|data: &[u8]| {
    if let Ok(yaml) = std::str::from_utf8(data) {
        let _ = ConfigLoader::new().load_str(yaml, Path::new("fuzz.yaml"));
    }
});
