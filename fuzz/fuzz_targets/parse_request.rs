#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::{RpcRequest, decode_sql_batch};

// Client request payloads as the mock server decodes them.
fuzz_target!(|data: &[u8]| {
    let _ = decode_sql_batch(data);
    let _ = RpcRequest::decode(data);
    let _ = mssql_testing::mock_server::decode_bulk_load(Bytes::copy_from_slice(data));
});
