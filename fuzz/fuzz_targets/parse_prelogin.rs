#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::PreLogin;

fuzz_target!(|data: &[u8]| {
    if let Ok(prelogin) = PreLogin::decode(data) {
        let _ = prelogin.server_version();
        let _ = PreLogin::decode(&prelogin.encode());
    }
});
