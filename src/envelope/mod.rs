//! ALFA Photos Sync - Encrypted Envelope
//!
//! One envelope wraps one resolution (thumbnail or original) of a file: a
//! small plaintext prefix, a header sealed to the owner's public key, then
//! independently authenticated chunks.

pub mod codec;
pub mod header;

pub use codec::{EnvelopeCodec, EnvelopeMeta};
pub use header::{
    Header, DEFAULT_CHUNK_SIZE, FILE_ID_LEN, MAX_CHUNK_SIZE, MIN_HEADER_LEN,
};
