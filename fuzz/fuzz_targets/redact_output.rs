#![no_main]

use libfuzzer_sys::fuzz_target;
use tapdeploy_process::{redact_sensitive, tail_lines};

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };
    let redacted = redact_sensitive(s);
    assert!(redacted.lines().count() <= s.lines().count());
    let tail = tail_lines(s, 5);
    assert!(tail.lines().count() <= 5);
});
