//! Envelope header layout
//!
//! ```text
//! [MARKER 2B]["SP"]
//! [FILE VERSION 1B][0x01]
//! [FILE ID 32B][random, shared by all resolutions of one photo]
//! [SEALED HEADER LEN 4B][u32 BE]
//! [SEALED HEADER][sealed to the owner's public key]
//!
//! sealed header plaintext:
//! [HEADER VERSION 1B][CHUNK SIZE u32][DATA SIZE u64][FILE KEY 32B]
//! [FILE TYPE 1B][FILENAME LEN u32][FILENAME][VIDEO DURATION u32]
//! ```

use std::fmt;

use crate::crypto::{SymmetricKey, KEY_LEN, SEAL_OVERHEAD};
use crate::error::{HeaderError, VaultResult};
use crate::model::FileType;

/// Leading marker bytes
pub const MARKER: &[u8; 2] = b"SP";

/// Current outer format version
pub const FILE_VERSION: u8 = 1;

/// Current sealed header version
pub const HEADER_VERSION: u8 = 1;

/// File id length
pub const FILE_ID_LEN: usize = 32;

/// Marker + version + file id + sealed header length
pub const MIN_HEADER_LEN: usize = MARKER.len() + 1 + FILE_ID_LEN + 4;

/// Default plaintext bytes per chunk
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Largest chunk size a header may declare
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Longest original filename stored in a header
pub const MAX_FILENAME_LEN: usize = 4096;

/// Sealed header plaintext without the filename
const INNER_FIXED_LEN: usize = 1 + 4 + 8 + KEY_LEN + 1 + 4 + 4;

/// Upper bound on the sealed header length field
pub const MAX_SEALED_HEADER_LEN: usize = INNER_FIXED_LEN + MAX_FILENAME_LEN + SEAL_OVERHEAD;

/// Decoded envelope header
#[derive(Clone)]
pub struct Header {
    pub file_version: u8,
    pub file_id: [u8; FILE_ID_LEN],
    pub header_version: u8,
    pub chunk_size: u32,
    pub data_size: u64,
    pub symmetric_key: SymmetricKey,
    pub file_type: FileType,
    pub filename: String,
    pub video_duration: u32,
    /// Bytes occupied by the header on disk; chunks start here
    pub header_len: usize,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("file_version", &self.file_version)
            .field("file_id", &hex::encode(self.file_id))
            .field("header_version", &self.header_version)
            .field("chunk_size", &self.chunk_size)
            .field("data_size", &self.data_size)
            .field("file_type", &self.file_type)
            .field("filename", &self.filename)
            .field("video_duration", &self.video_duration)
            .finish_non_exhaustive()
    }
}

impl Header {
    /// Number of chunks the body must contain
    pub fn chunk_count(&self) -> u64 {
        if self.data_size == 0 {
            0
        } else {
            self.data_size.div_ceil(self.chunk_size as u64)
        }
    }

    /// Plaintext length of chunk `index` (1-based)
    pub fn chunk_plain_len(&self, index: u64) -> usize {
        let start = (index - 1) * self.chunk_size as u64;
        (self.data_size - start).min(self.chunk_size as u64) as usize
    }
}

/// Fixed-width prefix in front of the sealed header
pub(crate) struct Prefix {
    pub file_version: u8,
    pub file_id: [u8; FILE_ID_LEN],
    pub sealed_len: usize,
}

/// Validate the fixed prefix: marker, version, file id, sealed length
pub(crate) fn parse_prefix(bytes: &[u8]) -> VaultResult<Prefix> {
    if bytes.len() < MIN_HEADER_LEN {
        return Err(HeaderError::IncorrectHeaderSize.into());
    }
    if &bytes[..MARKER.len()] != MARKER {
        return Err(HeaderError::IncorrectFileBeginning.into());
    }

    let mut pos = MARKER.len();
    let file_version = bytes[pos];
    if file_version != FILE_VERSION {
        return Err(HeaderError::IncorrectFileVersion.into());
    }
    pos += 1;

    let file_id: [u8; FILE_ID_LEN] = bytes[pos..pos + FILE_ID_LEN]
        .try_into()
        .map_err(|_| HeaderError::IncorrectFileIdSize)?;
    pos += FILE_ID_LEN;

    let sealed_len = u32::from_be_bytes(
        bytes[pos..pos + 4]
            .try_into()
            .map_err(|_| HeaderError::IncorrectHeaderSize)?,
    ) as usize;
    if sealed_len <= SEAL_OVERHEAD || sealed_len > MAX_SEALED_HEADER_LEN {
        return Err(HeaderError::IncorrectHeaderSize.into());
    }

    Ok(Prefix {
        file_version,
        file_id,
        sealed_len,
    })
}

/// Serialize the fixed prefix
pub(crate) fn write_prefix(file_id: &[u8; FILE_ID_LEN], sealed_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_HEADER_LEN);
    out.extend_from_slice(MARKER);
    out.push(FILE_VERSION);
    out.extend_from_slice(file_id);
    out.extend_from_slice(&(sealed_len as u32).to_be_bytes());
    out
}

/// Fields carried inside the sealed header
pub(crate) struct Inner {
    pub header_version: u8,
    pub chunk_size: u32,
    pub data_size: u64,
    pub symmetric_key: SymmetricKey,
    pub file_type: FileType,
    pub filename: String,
    pub video_duration: u32,
}

pub(crate) fn encode_inner(inner: &Inner) -> Vec<u8> {
    let name = inner.filename.as_bytes();
    let mut out = Vec::with_capacity(INNER_FIXED_LEN + name.len());
    out.push(inner.header_version);
    out.extend_from_slice(&inner.chunk_size.to_be_bytes());
    out.extend_from_slice(&inner.data_size.to_be_bytes());
    out.extend_from_slice(inner.symmetric_key.expose());
    out.push(inner.file_type as u8);
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&inner.video_duration.to_be_bytes());
    out
}

pub(crate) fn decode_inner(bytes: &[u8]) -> VaultResult<Inner> {
    let mut reader = FieldReader { bytes, pos: 0 };

    let header_version = reader.u8()?;
    if header_version != HEADER_VERSION {
        return Err(HeaderError::IncorrectFileVersion.into());
    }

    let chunk_size = u32::from_be_bytes(reader.array()?);
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(HeaderError::IncorrectChunkSize.into());
    }

    let data_size = u64::from_be_bytes(reader.array()?);
    let symmetric_key = SymmetricKey::new(reader.array()?);
    let file_type = FileType::try_from(reader.u8()?)
        .map_err(|_| HeaderError::IncorrectFileVersion)?;

    let name_len = u32::from_be_bytes(reader.array()?) as usize;
    if name_len > MAX_FILENAME_LEN {
        return Err(HeaderError::IncorrectHeaderSize.into());
    }
    let filename = String::from_utf8_lossy(reader.take(name_len)?).into_owned();
    let video_duration = u32::from_be_bytes(reader.array()?);

    if reader.pos != bytes.len() {
        return Err(HeaderError::IncorrectHeaderSize.into());
    }

    Ok(Inner {
        header_version,
        chunk_size,
        data_size,
        symmetric_key,
        file_type,
        filename,
        video_duration,
    })
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn take(&mut self, n: usize) -> VaultResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(HeaderError::IncorrectHeaderSize)?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> VaultResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> VaultResult<[u8; N]> {
        self.take(N)?
            .try_into()
            .map_err(|_| HeaderError::IncorrectHeaderSize.into())
    }
}
