#![no_main]

use dbus_wire::core::signature::SignatureTree;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Signature parsing must terminate and never panic on arbitrary text
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = SignatureTree::parse(text);
    }
});
