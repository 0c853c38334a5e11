//! Argon2id password derivations
//!
//! Two independent uses: the password hash sent to the server for storage,
//! and the key that wraps the private key for server-side backup. Each uses
//! its own salt and its own secret context, so one never reveals the other.

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::keys::{random_array, SymmetricKey, KEY_LEN};
use crate::error::{GeneralError, InternalError, VaultResult};

/// Salt length for both derivations
pub const SALT_LEN: usize = 16;

/// Domain separation for the storage hash
const STORAGE_CONTEXT: &[u8] = b"ALFA:PWHASH:STORAGE:v1";

/// Domain separation for the private-key wrapping key
const WRAP_CONTEXT: &[u8] = b"ALFA:PWHASH:KEYWRAP:v1";

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Iterations (time cost)
    pub time_cost: u32,
    /// Memory in KiB
    pub memory_cost_kib: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::moderate()
    }
}

impl KdfParams {
    /// Used for the storage hash, computed on every sign-in
    pub fn interactive() -> Self {
        Self {
            time_cost: 2,
            memory_cost_kib: 64 * 1024,
            parallelism: 1,
        }
    }

    /// Used for wrapping the private key
    pub fn moderate() -> Self {
        Self {
            time_cost: 3,
            memory_cost_kib: 256 * 1024,
            parallelism: 1,
        }
    }

    /// Cheapest parameters Argon2 accepts; tests only
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            time_cost: 1,
            memory_cost_kib: 64,
            parallelism: 1,
        }
    }

    fn build(&self) -> VaultResult<Params> {
        Params::new(
            self.memory_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|_| InternalError::KeyDerivationFailure.into())
    }
}

/// Password hash plus the salt it was computed with, hex encoded for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub hash: String,
    pub salt: String,
}

/// Generate a fresh random salt
pub fn generate_salt() -> VaultResult<[u8; SALT_LEN]> {
    random_array::<SALT_LEN>()
}

fn derive(
    password: &SecretString,
    salt: &[u8],
    context: &[u8],
    params: &KdfParams,
) -> VaultResult<[u8; KEY_LEN]> {
    if salt.len() != SALT_LEN {
        return Err(GeneralError::IncorrectParameterSize.into());
    }

    let argon2 = Argon2::new_with_secret(context, Algorithm::Argon2id, Version::V0x13, params.build()?)
        .map_err(|_| InternalError::KeyDerivationFailure)?;

    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut out)
        .map_err(|_| InternalError::HashGenerationFailure)?;
    Ok(out)
}

/// Storage hash. A missing salt means sign-up: a fresh one is generated.
pub fn password_hash_for_storage(
    password: &SecretString,
    salt: Option<&[u8]>,
    params: &KdfParams,
) -> VaultResult<PasswordHash> {
    let salt = match salt {
        Some(s) => s.to_vec(),
        None => generate_salt()?.to_vec(),
    };
    let hash = derive(password, &salt, STORAGE_CONTEXT, params)?;
    Ok(PasswordHash {
        hash: hex::encode(hash),
        salt: hex::encode(salt),
    })
}

/// Key that wraps the private key
pub fn derive_wrapping_key(
    password: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> VaultResult<SymmetricKey> {
    Ok(SymmetricKey::new(derive(password, salt, WRAP_CONTEXT, params)?))
}
