//! ALFA Photos Sync - Cryptographic Core

pub mod keys;
pub mod kdf;
pub mod primitives;

pub use keys::*;
pub use kdf::{KdfParams, PasswordHash};
pub use primitives::{PrimitiveSuite, StandardSuite, AEAD_OVERHEAD, SEAL_OVERHEAD};
