//! ALFA Photos Sync - Key Manager
//!
//! Holds the session's key material: the user's X25519 key pair, the
//! password-wrapped copy of the private key that is backed up to the server,
//! and the server's public key. Everything lives in memory only and is
//! cleared on sign-out.
//!
//! Key bundle layout:
//!
//! ```text
//! ["SPK" 3B][VERSION 1B][TYPE 1B][PUBLIC KEY 32B]
//! TYPE = PrivatePlusPublic adds:
//! [WRAPPED PRIVATE KEY: nonce 24B || ciphertext 32B || tag 16B][WRAP SALT 16B]
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::RwLock;
use secrecy::SecretString;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::kdf::{self, PasswordHash, SALT_LEN};
use crate::crypto::{
    KdfParams, KeyPair, PrimitiveSuite, PublicKey, SecretKey, AEAD_OVERHEAD, PUBLIC_KEY_LEN,
    SECRET_KEY_LEN,
};
use crate::error::{InternalError, PrivateFileError, VaultError, VaultResult};

/// Key bundle marker
const BUNDLE_MARKER: &[u8; 3] = b"SPK";

/// Current key bundle version
const BUNDLE_VERSION: u8 = 1;

/// Wrapped private key length
pub const WRAPPED_KEY_LEN: usize = SECRET_KEY_LEN + AEAD_OVERHEAD;

const BUNDLE_FIXED_LEN: usize = 3 + 2 + PUBLIC_KEY_LEN;

const WRAP_AAD_LEN: usize = 3 + PUBLIC_KEY_LEN;

/// What a key bundle carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BundleType {
    PublicOnly = 0,
    PrivatePlusPublic = 1,
}

/// Private key wrapped under a password-derived key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub salt: [u8; SALT_LEN],
}

/// Public key plus, optionally, the wrapped private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    pub public: PublicKey,
    pub wrapped: Option<WrappedKey>,
}

impl KeyBundle {
    pub fn bundle_type(&self) -> BundleType {
        if self.wrapped.is_some() {
            BundleType::PrivatePlusPublic
        } else {
            BundleType::PublicOnly
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BUNDLE_FIXED_LEN + WRAPPED_KEY_LEN + SALT_LEN);
        out.extend_from_slice(BUNDLE_MARKER);
        out.push(BUNDLE_VERSION);
        out.push(self.bundle_type() as u8);
        out.extend_from_slice(self.public.as_bytes());
        if let Some(wrapped) = &self.wrapped {
            out.extend_from_slice(&wrapped.ciphertext);
            out.extend_from_slice(&wrapped.salt);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < BUNDLE_FIXED_LEN || &bytes[..BUNDLE_MARKER.len()] != BUNDLE_MARKER {
            return Err(PrivateFileError::InvalidData.into());
        }
        if bytes[3] != BUNDLE_VERSION {
            return Err(PrivateFileError::InvalidData.into());
        }

        let public = PublicKey::from_slice(&bytes[5..BUNDLE_FIXED_LEN])?;
        let rest = &bytes[BUNDLE_FIXED_LEN..];

        let wrapped = match bytes[4] {
            t if t == BundleType::PublicOnly as u8 => {
                if !rest.is_empty() {
                    return Err(PrivateFileError::InvalidData.into());
                }
                None
            }
            t if t == BundleType::PrivatePlusPublic as u8 => {
                if rest.len() != WRAPPED_KEY_LEN + SALT_LEN {
                    return Err(PrivateFileError::InvalidData.into());
                }
                let (ciphertext, salt) = rest.split_at(WRAPPED_KEY_LEN);
                Some(WrappedKey {
                    ciphertext: ciphertext.to_vec(),
                    salt: salt
                        .try_into()
                        .map_err(|_| PrivateFileError::InvalidData)?,
                })
            }
            _ => return Err(PrivateFileError::InvalidData.into()),
        };

        Ok(Self { public, wrapped })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> VaultResult<Self> {
        Self::from_bytes(&STANDARD.decode(s.trim())?)
    }

    /// Write the bundle as base64 text
    pub fn save(&self, path: &Path) -> VaultResult<()> {
        if path.as_os_str().is_empty() || path.is_dir() {
            return Err(PrivateFileError::InvalidPath.into());
        }
        crate::local_files::atomic_write(path, self.to_base64().as_bytes())
    }

    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.is_file() {
            return Err(PrivateFileError::InvalidPath.into());
        }
        let text = fs::read_to_string(path).map_err(VaultError::read)?;
        Self::from_base64(&text)
    }
}

#[derive(Default)]
struct KeyState {
    keypair: Option<KeyPair>,
    wrapped: Option<WrappedKey>,
    server_public: Option<PublicKey>,
}

/// Session key material
pub struct KeyManager {
    suite: Arc<dyn PrimitiveSuite>,
    wrap_params: KdfParams,
    storage_params: KdfParams,
    state: RwLock<KeyState>,
}

impl KeyManager {
    pub fn new(suite: Arc<dyn PrimitiveSuite>, wrap_params: KdfParams, storage_params: KdfParams) -> Self {
        Self {
            suite,
            wrap_params,
            storage_params,
            state: RwLock::new(KeyState::default()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // KEY LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Generate and install a new key pair, wrapped under `password`
    pub fn generate_keypair(&self, password: &SecretString) -> VaultResult<KeyBundle> {
        let keypair = self.suite.keypair()?;
        let wrapped = self.wrap(&keypair, password)?;

        let bundle = KeyBundle {
            public: keypair.public,
            wrapped: Some(wrapped.clone()),
        };

        let mut state = self.state.write();
        state.keypair = Some(keypair);
        state.wrapped = Some(wrapped);
        info!("Generated new key pair");
        Ok(bundle)
    }

    /// Base64 bundle for upload; the private key is re-wrapped with a fresh salt
    pub fn export_upload_bundle(
        &self,
        password: &SecretString,
        include_private_key: bool,
    ) -> VaultResult<String> {
        let keypair = self.keypair()?;
        let wrapped = if include_private_key {
            Some(self.wrap(&keypair, password)?)
        } else {
            None
        };
        Ok(KeyBundle {
            public: keypair.public,
            wrapped,
        }
        .to_base64())
    }

    /// Decode, unwrap and verify a bundle, then install it. Any failure
    /// leaves the current key material untouched.
    pub fn import_bundle(&self, bundle: &str, password: &SecretString) -> VaultResult<()> {
        let bundle = KeyBundle::from_base64(bundle)?;
        let wrapped = bundle.wrapped.ok_or(PrivateFileError::InvalidData)?;

        let secret = self.unwrap_with(&wrapped, &bundle.public, password)?;
        let keypair = self.suite.keypair_from_secret(&secret);
        if keypair.public != bundle.public {
            warn!("Imported private key does not match bundled public key");
            return Err(InternalError::DecryptFailure.into());
        }

        let mut state = self.state.write();
        state.keypair = Some(keypair);
        state.wrapped = Some(wrapped);
        debug!("Key bundle imported");
        Ok(())
    }

    /// Install the account bundle received at sign-in. Returns `false` when
    /// the matching key pair was already loaded and nothing was imported.
    /// A bundle without the private key is only accepted against a loaded
    /// key pair with the same public key.
    pub fn adopt_account_bundle(
        &self,
        bundle: &str,
        password: &SecretString,
        key_backed_up: bool,
    ) -> VaultResult<bool> {
        let parsed = KeyBundle::from_base64(bundle)?;
        if self.public_key().ok() == Some(parsed.public) {
            debug!("Account key pair already loaded");
            return Ok(false);
        }
        if parsed.wrapped.is_none() {
            warn!(key_backed_up, "Account bundle carries no private key");
            return Err(if key_backed_up {
                PrivateFileError::InvalidData.into()
            } else {
                VaultError::KeysNotLoaded
            });
        }
        self.import_bundle(bundle, password)?;
        Ok(true)
    }

    /// Trust the server's public key for this session
    pub fn import_server_public_key(&self, bytes: &[u8]) -> VaultResult<()> {
        let key = PublicKey::from_slice(bytes)?;
        self.state.write().server_public = Some(key);
        Ok(())
    }

    /// Recover the private key from the stored wrapped copy
    pub fn unwrap_private_key(&self, password: &SecretString) -> VaultResult<SecretKey> {
        let (wrapped, public) = {
            let state = self.state.read();
            match (&state.wrapped, &state.keypair) {
                (Some(w), Some(kp)) => (w.clone(), kp.public),
                _ => return Err(VaultError::KeysNotLoaded),
            }
        };
        self.unwrap_with(&wrapped, &public, password)
    }

    /// Hash sent to the server for authentication
    pub fn password_hash_for_storage(
        &self,
        password: &SecretString,
        salt: Option<&[u8]>,
    ) -> VaultResult<PasswordHash> {
        kdf::password_hash_for_storage(password, salt, &self.storage_params)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ACCESSORS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn public_key(&self) -> VaultResult<PublicKey> {
        self.state
            .read()
            .keypair
            .as_ref()
            .map(|kp| kp.public)
            .ok_or(VaultError::KeysNotLoaded)
    }

    pub fn keypair(&self) -> VaultResult<KeyPair> {
        self.state
            .read()
            .keypair
            .clone()
            .ok_or(VaultError::KeysNotLoaded)
    }

    pub fn server_public_key(&self) -> Option<PublicKey> {
        self.state.read().server_public
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().keypair.is_some()
    }

    /// Drop all key material
    pub fn clear(&self) {
        *self.state.write() = KeyState::default();
        debug!("Key material cleared");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // WRAPPING
    // ═══════════════════════════════════════════════════════════════════════

    fn wrap(&self, keypair: &KeyPair, password: &SecretString) -> VaultResult<WrappedKey> {
        let salt = kdf::generate_salt()?;
        let wrapping_key = kdf::derive_wrapping_key(password, &salt, &self.wrap_params)?;
        let ciphertext = self.suite.encrypt(
            &wrapping_key,
            keypair.secret.expose(),
            &wrap_aad(&keypair.public),
        )?;
        Ok(WrappedKey { ciphertext, salt })
    }

    fn unwrap_with(
        &self,
        wrapped: &WrappedKey,
        public: &PublicKey,
        password: &SecretString,
    ) -> VaultResult<SecretKey> {
        let wrapping_key = kdf::derive_wrapping_key(password, &wrapped.salt, &self.wrap_params)?;
        let plain = Zeroizing::new(
            self.suite
                .decrypt(&wrapping_key, &wrapped.ciphertext, &wrap_aad(public))
                .map_err(|_| InternalError::DecryptFailure)?,
        );
        SecretKey::from_slice(&plain)
    }
}

/// Binds the wrapped private key to its public half
fn wrap_aad(public: &PublicKey) -> [u8; WRAP_AAD_LEN] {
    let mut aad = [0u8; WRAP_AAD_LEN];
    aad[..3].copy_from_slice(BUNDLE_MARKER);
    aad[3..].copy_from_slice(public.as_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StandardSuite;
    use tempfile::tempdir;

    fn manager() -> KeyManager {
        KeyManager::new(Arc::new(StandardSuite), KdfParams::fast(), KdfParams::fast())
    }

    fn pw(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    #[test]
    fn test_bundle_layout() {
        let km = manager();
        let bundle = km.generate_keypair(&pw("correct horse")).unwrap();
        let bytes = bundle.to_bytes();
        assert_eq!(&bytes[..3], b"SPK");
        assert_eq!(bytes.len(), BUNDLE_FIXED_LEN + 24 + 32 + 16 + SALT_LEN);
        assert_eq!(KeyBundle::from_bytes(&bytes).unwrap(), bundle);
    }

    #[test]
    fn test_export_import_between_devices() {
        let phone = manager();
        phone.generate_keypair(&pw("correct horse")).unwrap();
        let exported = phone.export_upload_bundle(&pw("correct horse"), true).unwrap();

        let laptop = manager();
        laptop.import_bundle(&exported, &pw("correct horse")).unwrap();
        assert_eq!(laptop.public_key().unwrap(), phone.public_key().unwrap());
        assert_eq!(
            laptop.keypair().unwrap().secret.expose(),
            phone.keypair().unwrap().secret.expose()
        );
    }

    #[test]
    fn test_import_fails_closed() {
        let phone = manager();
        phone.generate_keypair(&pw("right")).unwrap();
        let exported = phone.export_upload_bundle(&pw("right"), true).unwrap();

        let laptop = manager();
        let existing = laptop.generate_keypair(&pw("mine")).unwrap();

        let err = laptop.import_bundle(&exported, &pw("wrong")).unwrap_err();
        assert!(matches!(err, VaultError::Internal(InternalError::DecryptFailure)));
        assert_eq!(laptop.public_key().unwrap(), existing.public);

        assert!(laptop.import_bundle("not base64!!", &pw("right")).is_err());
        assert_eq!(laptop.public_key().unwrap(), existing.public);
    }

    #[test]
    fn test_import_rejects_mismatched_public_key() {
        let phone = manager();
        let bundle = phone.generate_keypair(&pw("pw")).unwrap();
        let other = manager().generate_keypair(&pw("pw")).unwrap();

        let forged = KeyBundle {
            public: other.public,
            wrapped: bundle.wrapped,
        };
        let laptop = manager();
        assert!(laptop.import_bundle(&forged.to_base64(), &pw("pw")).is_err());
        assert!(!laptop.is_loaded());
    }

    #[test]
    fn test_public_only_bundle_not_importable() {
        let phone = manager();
        phone.generate_keypair(&pw("pw")).unwrap();
        let public_only = phone.export_upload_bundle(&pw("pw"), false).unwrap();
        assert_eq!(
            KeyBundle::from_base64(&public_only).unwrap().bundle_type(),
            BundleType::PublicOnly
        );

        let laptop = manager();
        let err = laptop.import_bundle(&public_only, &pw("pw")).unwrap_err();
        assert!(matches!(err, VaultError::PrivateFile(PrivateFileError::InvalidData)));
    }

    #[test]
    fn test_account_bundle_kept_when_already_loaded() {
        let phone = manager();
        let bundle = phone.generate_keypair(&pw("pw")).unwrap();
        let public_only = phone.export_upload_bundle(&pw("pw"), false).unwrap();

        assert!(!phone.adopt_account_bundle(&public_only, &pw("pw"), false).unwrap());
        assert!(!phone
            .adopt_account_bundle(&bundle.to_base64(), &pw("ignored"), true)
            .unwrap());
        assert_eq!(phone.public_key().unwrap(), bundle.public);
    }

    #[test]
    fn test_account_bundle_without_private_key() {
        let phone = manager();
        phone.generate_keypair(&pw("pw")).unwrap();
        let public_only = phone.export_upload_bundle(&pw("pw"), false).unwrap();

        let laptop = manager();
        let err = laptop.adopt_account_bundle(&public_only, &pw("pw"), false).unwrap_err();
        assert!(matches!(err, VaultError::KeysNotLoaded));
        let err = laptop.adopt_account_bundle(&public_only, &pw("pw"), true).unwrap_err();
        assert!(matches!(err, VaultError::PrivateFile(PrivateFileError::InvalidData)));
        assert!(!laptop.is_loaded());

        let full = phone.export_upload_bundle(&pw("pw"), true).unwrap();
        assert!(laptop.adopt_account_bundle(&full, &pw("pw"), true).unwrap());
        assert_eq!(laptop.public_key().unwrap(), phone.public_key().unwrap());
    }

    #[test]
    fn test_unwrap_and_clear() {
        let km = manager();
        km.generate_keypair(&pw("pw")).unwrap();
        km.import_server_public_key(&[3u8; 32]).unwrap();

        let secret = km.unwrap_private_key(&pw("pw")).unwrap();
        assert_eq!(secret.expose(), km.keypair().unwrap().secret.expose());
        assert!(km.unwrap_private_key(&pw("nope")).is_err());

        km.clear();
        assert!(!km.is_loaded());
        assert!(km.server_public_key().is_none());
        assert!(matches!(km.unwrap_private_key(&pw("pw")), Err(VaultError::KeysNotLoaded)));
    }

    #[test]
    fn test_server_key_size_checked() {
        let km = manager();
        assert!(km.import_server_public_key(&[1u8; 31]).is_err());
        assert!(km.server_public_key().is_none());
    }

    #[test]
    fn test_bundle_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.spk");
        let bundle = manager().generate_keypair(&pw("pw")).unwrap();

        bundle.save(&path).unwrap();
        assert_eq!(KeyBundle::load(&path).unwrap(), bundle);
        assert!(matches!(
            KeyBundle::load(&dir.path().join("missing")),
            Err(VaultError::PrivateFile(PrivateFileError::InvalidPath))
        ));
        assert!(matches!(
            bundle.save(dir.path()),
            Err(VaultError::PrivateFile(PrivateFileError::InvalidPath))
        ));
    }
}
