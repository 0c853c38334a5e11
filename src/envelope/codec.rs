//! Envelope encoder / decoder
//!
//! The body is a sequence of independently authenticated chunks. Chunk `i`
//! (1-based) is encrypted under a key derived from the file key and `i`, and
//! its AAD binds the index and whether it is the final chunk, so swapped,
//! dropped or appended chunks fail to open.

use std::io::{self, Read, Write};
use std::sync::Arc;

use super::header::{
    decode_inner, encode_inner, parse_prefix, write_prefix, Header, Inner, DEFAULT_CHUNK_SIZE,
    FILE_ID_LEN, HEADER_VERSION, MAX_CHUNK_SIZE, MAX_FILENAME_LEN, MIN_HEADER_LEN,
};
use crate::crypto::{KeyPair, PrimitiveSuite, PublicKey, StandardSuite, SymmetricKey, AEAD_OVERHEAD};
use crate::error::{GeneralError, HeaderError, VaultError, VaultResult};
use crate::model::FileType;

/// KDF context for chunk keys
const CHUNK_CONTEXT: &[u8; 8] = b"__data__";

/// Per-file parameters supplied at encode time
#[derive(Debug, Clone)]
pub struct EnvelopeMeta {
    pub file_id: Vec<u8>,
    pub filename: String,
    pub file_type: FileType,
    /// Exact plaintext length the input stream will yield
    pub data_size: u64,
    pub video_duration: u32,
}

/// Encrypted file container codec
#[derive(Clone)]
pub struct EnvelopeCodec {
    suite: Arc<dyn PrimitiveSuite>,
    chunk_size: u32,
}

impl EnvelopeCodec {
    /// Create a codec writing `chunk_size`-byte chunks
    pub fn new(suite: Arc<dyn PrimitiveSuite>, chunk_size: u32) -> VaultResult<Self> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(HeaderError::IncorrectChunkSize.into());
        }
        Ok(Self { suite, chunk_size })
    }

    pub fn suite(&self) -> &Arc<dyn PrimitiveSuite> {
        &self.suite
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Generate a new random file id
    pub fn new_file_id() -> VaultResult<[u8; FILE_ID_LEN]> {
        crate::crypto::random_array::<FILE_ID_LEN>()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ENCODE
    // ═══════════════════════════════════════════════════════════════════════

    /// Encrypt `input` into `output`, sealing the file key to `recipient`
    pub fn encode<R: Read, W: Write>(
        &self,
        mut input: R,
        mut output: W,
        meta: &EnvelopeMeta,
        recipient: &PublicKey,
    ) -> VaultResult<Header> {
        // Parameter checks come before any cryptographic work
        let file_id: [u8; FILE_ID_LEN] = meta
            .file_id
            .as_slice()
            .try_into()
            .map_err(|_| HeaderError::IncorrectFileIdSize)?;
        if meta.filename.len() > MAX_FILENAME_LEN {
            return Err(GeneralError::IncorrectParameterSize.into());
        }

        let inner = Inner {
            header_version: HEADER_VERSION,
            chunk_size: self.chunk_size,
            data_size: meta.data_size,
            symmetric_key: SymmetricKey::generate()?,
            file_type: meta.file_type,
            filename: meta.filename.clone(),
            video_duration: meta.video_duration,
        };

        let sealed = self.suite.seal(&encode_inner(&inner), recipient)?;
        let prefix = write_prefix(&file_id, sealed.len());
        output.write_all(&prefix).map_err(VaultError::write)?;
        output.write_all(&sealed).map_err(VaultError::write)?;

        let header = Header {
            file_version: super::header::FILE_VERSION,
            file_id,
            header_version: inner.header_version,
            chunk_size: inner.chunk_size,
            data_size: inner.data_size,
            symmetric_key: inner.symmetric_key.clone(),
            file_type: inner.file_type,
            filename: inner.filename.clone(),
            video_duration: inner.video_duration,
            header_len: prefix.len() + sealed.len(),
        };

        let mut buf = vec![0u8; self.chunk_size as usize];
        for index in 1..=header.chunk_count() {
            let len = header.chunk_plain_len(index);
            input.read_exact(&mut buf[..len]).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    VaultError::General(GeneralError::IncorrectParameterSize)
                } else {
                    VaultError::read(e)
                }
            })?;

            let key = self.chunk_key(&header.symmetric_key, index)?;
            let aad = chunk_aad(index, index == header.chunk_count());
            let chunk = self.suite.encrypt(&key, &buf[..len], &aad)?;
            output.write_all(&chunk).map_err(VaultError::write)?;
        }

        // The declared size must account for the whole stream
        let mut extra = [0u8; 1];
        if read_some(&mut input, &mut extra)? != 0 {
            return Err(GeneralError::IncorrectParameterSize.into());
        }

        output.flush().map_err(VaultError::write)?;
        Ok(header)
    }

    /// Encrypt an in-memory buffer
    pub fn encode_bytes(
        &self,
        plaintext: &[u8],
        meta: &EnvelopeMeta,
        recipient: &PublicKey,
    ) -> VaultResult<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + MIN_HEADER_LEN + 256);
        self.encode(plaintext, &mut out, meta, recipient)?;
        Ok(out)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DECODE
    // ═══════════════════════════════════════════════════════════════════════

    /// Read the raw header bytes (prefix + sealed header) without opening them
    pub fn read_header_bytes<R: Read>(&self, mut input: R) -> VaultResult<Vec<u8>> {
        let mut prefix = [0u8; MIN_HEADER_LEN];
        read_header_exact(&mut input, &mut prefix)?;
        let parsed = parse_prefix(&prefix)?;

        let mut out = Vec::with_capacity(MIN_HEADER_LEN + parsed.sealed_len);
        out.extend_from_slice(&prefix);
        out.resize(MIN_HEADER_LEN + parsed.sealed_len, 0);
        read_header_exact(&mut input, &mut out[MIN_HEADER_LEN..])?;
        Ok(out)
    }

    /// Validate and open the header; leaves `input` positioned at chunk 1
    pub fn decode_header<R: Read>(&self, mut input: R, keypair: &KeyPair) -> VaultResult<Header> {
        let mut prefix_bytes = [0u8; MIN_HEADER_LEN];
        read_header_exact(&mut input, &mut prefix_bytes)?;
        let prefix = parse_prefix(&prefix_bytes)?;

        let mut sealed = vec![0u8; prefix.sealed_len];
        read_header_exact(&mut input, &mut sealed)?;

        let inner = decode_inner(&self.suite.open(&sealed, keypair)?)?;

        Ok(Header {
            file_version: prefix.file_version,
            file_id: prefix.file_id,
            header_version: inner.header_version,
            chunk_size: inner.chunk_size,
            data_size: inner.data_size,
            symmetric_key: inner.symmetric_key,
            file_type: inner.file_type,
            filename: inner.filename,
            video_duration: inner.video_duration,
            header_len: MIN_HEADER_LEN + prefix.sealed_len,
        })
    }

    /// Decrypt the chunk body that follows a decoded header
    pub fn decode_chunks<R: Read, W: Write>(
        &self,
        mut input: R,
        mut output: W,
        header: &Header,
    ) -> VaultResult<u64> {
        let count = header.chunk_count();
        let mut buf = vec![0u8; header.chunk_size as usize + AEAD_OVERHEAD];
        let mut written = 0u64;

        for index in 1..=count {
            let len = header.chunk_plain_len(index) + AEAD_OVERHEAD;
            input.read_exact(&mut buf[..len]).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    VaultError::Header(HeaderError::IncorrectChunkSize)
                } else {
                    VaultError::read(e)
                }
            })?;

            let key = self.chunk_key(&header.symmetric_key, index)?;
            let aad = chunk_aad(index, index == count);
            let plain = self.suite.decrypt(&key, &buf[..len], &aad)?;
            output.write_all(&plain).map_err(VaultError::write)?;
            written += plain.len() as u64;
        }

        // Anything past the last chunk means the layout does not match the header
        let mut extra = [0u8; 1];
        if read_some(&mut input, &mut extra)? != 0 {
            return Err(HeaderError::IncorrectChunkSize.into());
        }

        output.flush().map_err(VaultError::write)?;
        Ok(written)
    }

    /// Decode header and body from one stream
    pub fn decode<R: Read, W: Write>(
        &self,
        mut input: R,
        output: W,
        keypair: &KeyPair,
    ) -> VaultResult<Header> {
        let header = self.decode_header(&mut input, keypair)?;
        self.decode_chunks(&mut input, output, &header)?;
        Ok(header)
    }

    /// Decrypt an in-memory envelope
    pub fn decode_bytes(&self, data: &[u8], keypair: &KeyPair) -> VaultResult<(Header, Vec<u8>)> {
        let mut out = Vec::with_capacity(data.len());
        let header = self.decode(data, &mut out, keypair)?;
        Ok((header, out))
    }

    fn chunk_key(&self, file_key: &SymmetricKey, index: u64) -> VaultResult<SymmetricKey> {
        self.suite.derive(file_key, index, CHUNK_CONTEXT)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self {
            suite: Arc::new(StandardSuite),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

fn chunk_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

/// Short header reads are a size error, not an IO error
fn read_header_exact<R: Read>(input: &mut R, buf: &mut [u8]) -> VaultResult<()> {
    input.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            VaultError::Header(HeaderError::IncorrectHeaderSize)
        } else {
            VaultError::read(e)
        }
    })
}

fn read_some<R: Read>(input: &mut R, buf: &mut [u8]) -> VaultResult<usize> {
    loop {
        match input.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(VaultError::read(e)),
        }
    }
}
