#![no_main]

use libfuzzer_sys::fuzz_target;
use tapedeck::p4::{Command, parse};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let cmd = parse(line);
    if cmd.is_valid() {
        // Printing a valid command and parsing it again is stable
        let printed = cmd.to_string();
        let again = parse(&printed);
        assert!(again.is_valid(), "printed form does not parse: {printed:?}");
        assert_eq!(again.to_string(), printed);
    }
    let restored = Command::from_persisted(&cmd.persisted());
    if cmd.is_valid() {
        assert_eq!(restored.to_string(), cmd.to_string());
    } else {
        assert_eq!(restored.raw(), cmd.raw());
    }
});
