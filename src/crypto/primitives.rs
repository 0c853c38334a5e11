//! ALFA Photos Sync - Primitive Suite
//!
//! The black-box primitives the envelope codec and key manager build on:
//! key pairs, anonymous sealing to a public key, subkey derivation and
//! symmetric AEAD. `StandardSuite` is X25519 + HKDF-SHA256 + XChaCha20-Poly1305.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, StaticSecret};

use super::keys::{
    random_array, KeyPair, PublicKey, SecretKey, SymmetricKey, KEY_LEN, PUBLIC_KEY_LEN, TAG_LEN,
    XCHACHA_NONCE_LEN,
};
use crate::error::{InternalError, VaultResult};

/// Bytes added by `seal`: ephemeral public key + nonce + tag
pub const SEAL_OVERHEAD: usize = PUBLIC_KEY_LEN + XCHACHA_NONCE_LEN + TAG_LEN;

/// Bytes added by `encrypt`: nonce + tag
pub const AEAD_OVERHEAD: usize = XCHACHA_NONCE_LEN + TAG_LEN;

/// HKDF info for sealed boxes
const SEAL_INFO: &[u8] = b"ALFA:SEAL:v1";

/// Cryptographic primitives used by the codec and key manager
pub trait PrimitiveSuite: Send + Sync {
    /// Generate a fresh key pair
    fn keypair(&self) -> VaultResult<KeyPair>;

    /// Recompute the key pair for an existing secret key
    fn keypair_from_secret(&self, secret: &SecretKey) -> KeyPair;

    /// Anonymously seal `plaintext` so only `recipient` can open it
    fn seal(&self, plaintext: &[u8], recipient: &PublicKey) -> VaultResult<Vec<u8>>;

    /// Open a sealed box with the recipient key pair
    fn open(&self, sealed: &[u8], keypair: &KeyPair) -> VaultResult<Vec<u8>>;

    /// Derive the `index`-th subkey of `master` under an 8-byte context
    fn derive(&self, master: &SymmetricKey, index: u64, context: &[u8; 8])
        -> VaultResult<SymmetricKey>;

    /// AEAD encrypt; output is `nonce || ciphertext || tag`
    fn encrypt(&self, key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>>;

    /// AEAD decrypt of `nonce || ciphertext || tag`
    fn decrypt(&self, key: &SymmetricKey, data: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>>;
}

/// X25519 / HKDF-SHA256 / XChaCha20-Poly1305
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardSuite;

impl StandardSuite {
    fn seal_key(shared: &[u8], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> VaultResult<SymmetricKey> {
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(ephemeral);
        salt[32..].copy_from_slice(recipient);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
        let mut okm = [0u8; KEY_LEN];
        hk.expand(SEAL_INFO, &mut okm)
            .map_err(|_| InternalError::KeyDerivationFailure)?;
        Ok(SymmetricKey::new(okm))
    }
}

impl PrimitiveSuite for StandardSuite {
    fn keypair(&self) -> VaultResult<KeyPair> {
        let bytes = random_array::<32>().map_err(|_| InternalError::KeyPairGenerationFailure)?;
        Ok(self.keypair_from_secret(&SecretKey::new(bytes)))
    }

    fn keypair_from_secret(&self, secret: &SecretKey) -> KeyPair {
        let static_secret = StaticSecret::from(*secret.expose());
        let public = x25519_dalek::PublicKey::from(&static_secret);
        KeyPair {
            public: PublicKey(public.to_bytes()),
            secret: SecretKey::new(static_secret.to_bytes()),
        }
    }

    fn seal(&self, plaintext: &[u8], recipient: &PublicKey) -> VaultResult<Vec<u8>> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pk = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(recipient.0));
        if !shared.was_contributory() {
            return Err(InternalError::SealFailure.into());
        }

        let key = Self::seal_key(shared.as_bytes(), ephemeral_pk.as_bytes(), recipient.as_bytes())?;
        let boxed = self
            .encrypt(&key, plaintext, ephemeral_pk.as_bytes())
            .map_err(|_| InternalError::SealFailure)?;

        let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + boxed.len());
        out.extend_from_slice(ephemeral_pk.as_bytes());
        out.extend_from_slice(&boxed);
        Ok(out)
    }

    fn open(&self, sealed: &[u8], keypair: &KeyPair) -> VaultResult<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(InternalError::OpenFailure.into());
        }
        let ephemeral: [u8; PUBLIC_KEY_LEN] = sealed[..PUBLIC_KEY_LEN]
            .try_into()
            .map_err(|_| InternalError::OpenFailure)?;

        let secret = StaticSecret::from(*keypair.secret.expose());
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral));
        if !shared.was_contributory() {
            return Err(InternalError::OpenFailure.into());
        }

        let key = Self::seal_key(shared.as_bytes(), &ephemeral, keypair.public.as_bytes())?;
        self.decrypt(&key, &sealed[PUBLIC_KEY_LEN..], &ephemeral)
            .map_err(|_| InternalError::OpenFailure.into())
    }

    fn derive(
        &self,
        master: &SymmetricKey,
        index: u64,
        context: &[u8; 8],
    ) -> VaultResult<SymmetricKey> {
        let hk = Hkdf::<Sha256>::new(Some(context), master.expose());
        let mut info = [0u8; 16];
        info[..8].copy_from_slice(context);
        info[8..].copy_from_slice(&index.to_be_bytes());

        let mut okm = [0u8; KEY_LEN];
        hk.expand(&info, &mut okm)
            .map_err(|_| InternalError::KeyDerivationFailure)?;
        Ok(SymmetricKey::new(okm))
    }

    fn encrypt(&self, key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(key.expose())
            .map_err(|_| InternalError::SealFailure)?;

        let nonce_bytes = random_array::<XCHACHA_NONCE_LEN>()?;
        let nonce = XNonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|_| InternalError::SealFailure)?;

        let mut out = Vec::with_capacity(XCHACHA_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &SymmetricKey, data: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
        if data.len() < AEAD_OVERHEAD {
            return Err(InternalError::OpenFailure.into());
        }
        let cipher = XChaCha20Poly1305::new_from_slice(key.expose())
            .map_err(|_| InternalError::OpenFailure)?;

        let nonce = XNonce::from_slice(&data[..XCHACHA_NONCE_LEN]);
        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &data[XCHACHA_NONCE_LEN..],
                    aad,
                },
            )
            .map_err(|_| InternalError::OpenFailure.into())
    }
}
