//! ALFA Photos Sync - Key Types
//!
//! Zeroizing wrappers for symmetric keys and the user's X25519 key pair.

use secrecy::{ExposeSecret, Secret};
use zeroize::ZeroizeOnDrop;

use crate::error::{GeneralError, InternalError, VaultResult};

/// Symmetric key length
pub const KEY_LEN: usize = 32;

/// X25519 public/secret key length
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce length
pub const XCHACHA_NONCE_LEN: usize = 24;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// Secure key wrapper with automatic zeroization
#[derive(Clone, ZeroizeOnDrop)]
pub struct SymmetricKey {
    #[zeroize(skip)]
    inner: Secret<[u8; KEY_LEN]>,
}

impl SymmetricKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Build from a slice, rejecting wrong lengths
    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| GeneralError::IncorrectKeySize)?;
        Ok(Self::new(arr))
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key
    pub fn generate() -> VaultResult<Self> {
        Ok(Self::new(random_array::<KEY_LEN>()?))
    }
}

/// X25519 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| GeneralError::IncorrectKeySize)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

/// X25519 secret key
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecretKey {
    #[zeroize(skip)]
    inner: Secret<[u8; SECRET_KEY_LEN]>,
}

impl SecretKey {
    pub fn new(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        let arr: [u8; SECRET_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| GeneralError::IncorrectKeySize)?;
        Ok(Self::new(arr))
    }

    pub fn expose(&self) -> &[u8; SECRET_KEY_LEN] {
        self.inner.expose_secret()
    }
}

/// The user's asymmetric key pair
#[derive(Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

/// Fill a fixed array from the OS RNG
pub fn random_array<const N: usize>() -> VaultResult<[u8; N]> {
    use rand::RngCore;
    let mut out = [0u8; N];
    rand::rngs::OsRng
        .try_fill_bytes(&mut out)
        .map_err(|_| InternalError::RandomBytesGenerationFailure)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;

    #[test]
    fn test_random_keys_differ() {
        let k1 = SymmetricKey::generate().unwrap();
        let k2 = SymmetricKey::generate().unwrap();
        assert_ne!(k1.expose(), k2.expose());
    }

    #[test]
    fn test_wrong_key_size_rejected() {
        let err = SymmetricKey::from_slice(&[0u8; 31]).err().unwrap();
        assert!(matches!(err, VaultError::General(GeneralError::IncorrectKeySize)));
        assert!(PublicKey::from_slice(&[0u8; 33]).is_err());
        assert!(SecretKey::from_slice(&[1u8; 32]).is_ok());
    }
}
