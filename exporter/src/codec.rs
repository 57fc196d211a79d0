//! Wire format of the objects stored in the datalake.
//!
//! Each object is a gzip-compressed [`LedgerBatchData`] frame. The ledger
//! payload itself is opaque to the exporter; only the sequence number is
//! inspected.

use std::io::{Read, Write};

use error_stack::{Result, ResultExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use crate::error::ExportError;

/// A single ledger as received from the source.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ledger {
    /// Monotonically increasing sequence number.
    #[prost(uint32, tag = "1")]
    pub sequence: u32,
    /// Opaque encoded ledger payload.
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// The frame stored in every datalake object.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LedgerBatchData {
    /// First sequence admissible in this object, inclusive.
    #[prost(uint32, tag = "1")]
    pub start_sequence: u32,
    /// Last sequence admissible in this object, inclusive.
    #[prost(uint32, tag = "2")]
    pub end_sequence: u32,
    #[prost(message, repeated, tag = "3")]
    pub ledgers: ::prost::alloc::vec::Vec<Ledger>,
}

impl Ledger {
    pub fn new(sequence: u32, data: Vec<u8>) -> Self {
        Self { sequence, data }
    }
}

/// Encode a batch frame to its wire representation.
pub fn encode(frame: &LedgerBatchData) -> Vec<u8> {
    frame.encode_to_vec()
}

/// Decode a batch frame from its wire representation.
pub fn decode(data: &[u8]) -> Result<LedgerBatchData, ExportError> {
    LedgerBatchData::decode(data)
        .change_context(ExportError::Serialize)
        .attach_printable("failed to decode batch frame")
}

/// Gzip-compress `data` at the default compression level.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .change_context(ExportError::Compress)
        .attach_printable("failed to write compressed data")?;
    encoder.finish().change_context(ExportError::Compress)
}

/// Decompress a gzip blob produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .change_context(ExportError::Compress)
        .attach_printable("failed to read compressed data")?;
    Ok(decompressed)
}
