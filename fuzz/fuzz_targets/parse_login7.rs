#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_protocol::Login7;

fuzz_target!(|data: &[u8]| {
    let _ = Login7::decode(data);
});
