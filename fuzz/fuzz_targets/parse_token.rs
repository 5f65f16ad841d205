#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use tds_protocol::{ColMetaData, Token, TokenParser};

fuzz_target!(|data: &[u8]| {
    let mut parser = TokenParser::new(Bytes::copy_from_slice(data));
    let mut metadata: Option<ColMetaData> = None;

    // Rows need the latest COLMETADATA, as in a real response.
    while let Ok(Some(token)) = parser.next_token_with_metadata(metadata.as_ref()) {
        if let Token::ColMetaData(meta) = token {
            metadata = Some(meta);
        }
    }
});
