//! ALFA Photos Sync - Transport Seam
//!
//! Typed request/response pairs for the backup server plus raw envelope
//! download and upload. No HTTP client ships with the crate; callers plug in
//! their own `Transport`. Bounded retry with exponential backoff wraps any
//! call whose error is transient.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{VaultError, VaultResult};
use crate::model::{Delta, SpaceUsage};

/// Status string the server uses for success
pub const STATUS_OK: &str = "ok";

/// Request to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SignUp {
        email: String,
        password_hash: String,
        salt: String,
        key_bundle: String,
        is_backup: bool,
    },
    PreSignIn {
        email: String,
    },
    SignIn {
        email: String,
        password_hash: String,
    },
    GetUpdate {
        token: String,
        last_seen: u64,
        last_del_seen: u64,
    },
    Trash {
        token: String,
        names: Vec<String>,
    },
    Restore {
        token: String,
        names: Vec<String>,
    },
    Delete {
        token: String,
        names: Vec<String>,
    },
    EmptyTrash {
        token: String,
        time: u64,
    },
    SignOut {
        token: String,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::SignUp { .. } => "sign_up",
            Request::PreSignIn { .. } => "pre_sign_in",
            Request::SignIn { .. } => "sign_in",
            Request::GetUpdate { .. } => "get_update",
            Request::Trash { .. } => "trash",
            Request::Restore { .. } => "restore",
            Request::Delete { .. } => "delete",
            Request::EmptyTrash { .. } => "empty_trash",
            Request::SignOut { .. } => "sign_out",
        }
    }
}

/// Credentials and key material returned by a successful sign-in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInPayload {
    pub token: String,
    pub user_id: String,
    /// Base64 key bundle with the wrapped private key
    pub key_bundle: String,
    /// Base64 server public key
    pub server_public_key: String,
    pub home_folder: String,
    pub is_key_backed_up: bool,
}

/// Response body, by request kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Salt(String),
    SignIn(SignInPayload),
    Update(Delta),
}

/// Server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: String,
    pub payload: Payload,
}

impl Response {
    pub fn ok(payload: Payload) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            payload,
        }
    }

    pub fn rejected(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            payload: Payload::Empty,
        }
    }

    /// Payload of an `"ok"` response, otherwise `RemoteRejected`
    pub fn into_payload(self, request: &'static str) -> VaultResult<Payload> {
        if self.status != STATUS_OK {
            return Err(VaultError::RemoteRejected {
                request,
                status: self.status,
            });
        }
        Ok(self.payload)
    }
}

/// Fetch one resolution of one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub token: String,
    pub name: String,
    pub is_thumb: bool,
    pub folder: u8,
}

/// Upload both envelopes of a newly imported file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub token: String,
    pub name: String,
    pub folder: u8,
    pub thumb: Vec<u8>,
    pub original: Vec<u8>,
    pub headers: String,
    pub version: u64,
    pub date_created: String,
    pub date_modified: String,
}

/// Network collaborator
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> VaultResult<Response>;

    async fn download(&self, request: DownloadRequest) -> VaultResult<Vec<u8>>;

    async fn upload(&self, request: UploadRequest) -> VaultResult<SpaceUsage>;
}

// ═══════════════════════════════════════════════════════════════════════════
// RETRY
// ═══════════════════════════════════════════════════════════════════════════

/// Backoff policy for transient transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before retry number `retry` (0-based), doubling up to the cap
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts
    /// or `cancel` fires
    pub async fn run<T, F, Fut>(
        &self,
        what: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> VaultResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VaultResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    warn!(call = what, attempt = attempt + 1, ?delay, error = %e, "Transient failure, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(VaultError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    debug!(call = what, attempts = attempt + 1, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}
