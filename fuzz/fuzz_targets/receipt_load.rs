#![no_main]

use libfuzzer_sys::fuzz_target;
use tapdeploy::state::parse_receipt;

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(receipt) = parse_receipt(content) {
        let json = serde_json::to_string(&receipt).expect("serialize");
        let again = parse_receipt(&json).expect("reparse");
        assert_eq!(again.run_id, receipt.run_id);
        assert_eq!(again.markets.len(), receipt.markets.len());
    }
});
