//! ALFA Photos Sync - Error Types

use thiserror::Error;

/// Result type for sync and crypto operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Envelope format errors - malformed or tampered file
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("incorrect file id size")]
    IncorrectFileIdSize,

    #[error("incorrect header size")]
    IncorrectHeaderSize,

    #[error("unsupported file version")]
    IncorrectFileVersion,

    #[error("incorrect file beginning marker")]
    IncorrectFileBeginning,

    #[error("incorrect chunk size")]
    IncorrectChunkSize,
}

/// Primitive failures - never downgraded to a default value
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalError {
    #[error("key pair generation failed")]
    KeyPairGenerationFailure,

    #[error("key derivation failed")]
    KeyDerivationFailure,

    #[error("decryption failed")]
    DecryptFailure,

    #[error("random bytes generation failed")]
    RandomBytesGenerationFailure,

    #[error("hash generation failed")]
    HashGenerationFailure,

    #[error("seal failed")]
    SealFailure,

    #[error("open failed")]
    OpenFailure,
}

/// Stream failures, carrying the underlying error unchanged
#[derive(Error, Debug)]
pub enum IoError {
    #[error("write failure: {0}")]
    WriteFailure(#[source] std::io::Error),

    #[error("read failure: {0}")]
    ReadFailure(#[source] std::io::Error),
}

/// Caller supplied a parameter of the wrong size or shape
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneralError {
    #[error("incorrect key size")]
    IncorrectKeySize,

    #[error("incorrect parameter size")]
    IncorrectParameterSize,
}

/// Key bundle storage errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateFileError {
    #[error("invalid path")]
    InvalidPath,

    #[error("invalid data")]
    InvalidData,
}

/// Top-level error type
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    #[error("Internal crypto error: {0}")]
    Internal(#[from] InternalError),

    #[error("IO error: {0}")]
    Io(#[from] IoError),

    #[error("Invalid parameter: {0}")]
    General(#[from] GeneralError),

    #[error("Private file error: {0}")]
    PrivateFile(#[from] PrivateFileError),

    // ═══════════════════════════════════════════════════════════════
    // SESSION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("No active session - sign in first")]
    NoActiveSession,

    #[error("Key material not loaded")]
    KeysNotLoaded,

    // ═══════════════════════════════════════════════════════════════
    // REMOTE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server rejected {request}: status '{status}'")]
    RemoteRejected { request: &'static str, status: String },

    #[error("Unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    // ═══════════════════════════════════════════════════════════════
    // LOCAL STATE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Store error: {0}")]
    Store(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Unsupported move from {from} to {to}")]
    UnsupportedMove { from: String, to: String },

    #[error("Cache IO error: {0}")]
    Cache(#[source] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl VaultError {
    /// Malformed or tampered envelope; fatal to a single file only
    pub fn is_format_error(&self) -> bool {
        matches!(self, VaultError::Header(_))
    }

    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Transport(_))
    }

    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            VaultError::Header(_)
                | VaultError::Internal(InternalError::OpenFailure)
                | VaultError::Internal(InternalError::DecryptFailure)
        )
    }

    pub(crate) fn read(e: std::io::Error) -> Self {
        VaultError::Io(IoError::ReadFailure(e))
    }

    pub(crate) fn write(e: std::io::Error) -> Self {
        VaultError::Io(IoError::WriteFailure(e))
    }
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

impl From<image::ImageError> for VaultError {
    fn from(e: image::ImageError) -> Self {
        VaultError::Image(e.to_string())
    }
}

impl From<base64::DecodeError> for VaultError {
    fn from(_: base64::DecodeError) -> Self {
        VaultError::PrivateFile(PrivateFileError::InvalidData)
    }
}
