//! Metadata block encodings
//!
//! Version records and catalog snapshots are CBOR behind a four-byte magic
//! and a format byte, so a decrypted block can be told apart from raw file
//! content without any out-of-band type information.

use serde::{de::DeserializeOwned, Serialize};

use super::PipelineError;
use crate::model::{BlockId, CatalogSnapshot, VersionRecord};

const VERSION_MAGIC: &[u8; 4] = b"PKVR";
const CATALOG_MAGIC: &[u8; 4] = b"PKCS";
const FORMAT_V1: u8 = 1;
const HEADER_LEN: usize = 5;

/// What a decrypted block turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockContent {
    Catalog,
    Version(VersionRecord),
    Data,
}

pub fn encode_version(record: &VersionRecord) -> Result<Vec<u8>, PipelineError> {
    encode(VERSION_MAGIC, record)
}

pub fn decode_version(data: &[u8]) -> Result<VersionRecord, PipelineError> {
    decode(VERSION_MAGIC, "version", data)
}

pub fn encode_catalog(snapshot: &CatalogSnapshot) -> Result<Vec<u8>, PipelineError> {
    encode(CATALOG_MAGIC, snapshot)
}

pub fn decode_catalog(data: &[u8]) -> Result<CatalogSnapshot, PipelineError> {
    decode(CATALOG_MAGIC, "catalog", data)
}

/// Catalog IDs are recognised by prefix alone; anything else that parses as
/// a version record is one, and the rest is file content.
pub fn classify(id: &BlockId, plaintext: &[u8]) -> BlockContent {
    if id.is_catalog() {
        return BlockContent::Catalog;
    }
    match decode_version(plaintext) {
        Ok(record) => BlockContent::Version(record),
        Err(_) => BlockContent::Data,
    }
}

fn encode<T: Serialize>(magic: &[u8; 4], value: &T) -> Result<Vec<u8>, PipelineError> {
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(magic);
    buf.push(FORMAT_V1);
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| PipelineError::SerializationError(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(
    magic: &[u8; 4],
    expected: &'static str,
    data: &[u8],
) -> Result<T, PipelineError> {
    if data.len() < HEADER_LEN || &data[..4] != magic {
        return Err(PipelineError::WrongRecordType { expected });
    }
    if data[4] != FORMAT_V1 {
        return Err(PipelineError::UnsupportedFormat(data[4]));
    }
    ciborium::from_reader(&data[HEADER_LEN..])
        .map_err(|e| PipelineError::SerializationError(e.to_string()))
}
