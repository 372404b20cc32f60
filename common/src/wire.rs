use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Encodes a queue payload in CBOR.
pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer).with_context(|| "encoding cbor payload")?;
    Ok(buffer)
}

/// Decodes a queue payload from CBOR.
pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).with_context(|| "decoding cbor payload")
}
