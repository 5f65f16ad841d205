#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tds_protocol::{TypeId, TypeInfo};

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    type_id: u8,
    max_length: u32,
    precision: u8,
    scale: u8,
    null: bool,
    data: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let Some(type_id) = TypeId::from_u8(input.type_id) else {
        return;
    };
    let info = TypeInfo::new(type_id)
        .with_max_length(input.max_length)
        .with_precision(input.precision, input.scale);
    let data = (!input.null).then_some(input.data.as_slice());
    let _ = mssql_types::decode_value(&info, data);
});
