#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw bytes straight into the decoder; serde_json does its own UTF-8
    // validation on this path.
    let _ = serde_json::from_slice::<syncplay_client::protocol::Envelope>(data);

    // The read loop hands the decoder one &str line at a time, so cover
    // that entry point too when the input is valid UTF-8.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<syncplay_client::protocol::Envelope>(s);
    }
});
