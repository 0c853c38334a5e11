//! Account flows: sign-up, sign-in, sign-out
//!
//! Sign-in installs key material only after the server accepted the
//! password hash and the returned bundle unwrapped and verified. A key pair
//! already loaded with the account's public key is kept as is, which is how
//! accounts without a key backup sign in. Any failure on the way leaves the
//! context signed out with no key material.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{run_blocking, Session, SyncContext};
use crate::error::{PrivateFileError, VaultError, VaultResult};
use crate::transport::{Payload, Request};

impl SyncContext {
    /// Create an account with a fresh key pair, then sign in
    #[instrument(skip(self, password, cancel))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &SecretString,
        cancel: &CancellationToken,
    ) -> VaultResult<Session> {
        if let Err(e) = self.register(email, password, cancel).await {
            warn!(error = %e, "Sign-up failed");
            self.clear_session();
            return Err(e);
        }
        self.sign_in(email, password, cancel).await
    }

    async fn register(
        &self,
        email: &str,
        password: &SecretString,
        cancel: &CancellationToken,
    ) -> VaultResult<()> {
        let keys = Arc::clone(&self.keys);
        let pw = copy_secret(password);
        let (hash, bundle) = run_blocking(move || {
            let bundle = keys.generate_keypair(&pw)?;
            let hash = keys.password_hash_for_storage(&pw, None)?;
            Ok((hash, bundle.to_base64()))
        })
        .await?;

        let request = Request::SignUp {
            email: email.to_string(),
            password_hash: hash.hash,
            salt: hash.salt,
            key_bundle: bundle,
            is_backup: true,
        };
        self.retry
            .run("sign_up", cancel, || self.transport.send(request.clone()))
            .await?
            .into_payload("sign_up")?;
        info!("Account registered");
        Ok(())
    }

    /// Authenticate and load the account's key material
    #[instrument(skip(self, password, cancel))]
    pub async fn sign_in(
        &self,
        email: &str,
        password: &SecretString,
        cancel: &CancellationToken,
    ) -> VaultResult<Session> {
        match self.authenticate(email, password, cancel).await {
            Ok(session) => {
                *self.session.write() = Some(session.clone());
                info!(user_id = %session.user_id, "Signed in");
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                self.clear_session();
                Err(e)
            }
        }
    }

    async fn authenticate(
        &self,
        email: &str,
        password: &SecretString,
        cancel: &CancellationToken,
    ) -> VaultResult<Session> {
        let request = Request::PreSignIn {
            email: email.to_string(),
        };
        let salt = match self
            .retry
            .run("pre_sign_in", cancel, || self.transport.send(request.clone()))
            .await?
            .into_payload("pre_sign_in")?
        {
            Payload::Salt(salt) => hex::decode(salt).map_err(|_| PrivateFileError::InvalidData)?,
            _ => return Err(VaultError::UnexpectedResponse("pre_sign_in")),
        };

        let keys = Arc::clone(&self.keys);
        let pw = copy_secret(password);
        let hash =
            run_blocking(move || keys.password_hash_for_storage(&pw, Some(salt.as_slice()))).await?;

        let request = Request::SignIn {
            email: email.to_string(),
            password_hash: hash.hash,
        };
        let payload = match self
            .retry
            .run("sign_in", cancel, || self.transport.send(request.clone()))
            .await?
            .into_payload("sign_in")?
        {
            Payload::SignIn(payload) => payload,
            _ => return Err(VaultError::UnexpectedResponse("sign_in")),
        };

        let keys = Arc::clone(&self.keys);
        let pw = copy_secret(password);
        let bundle = payload.key_bundle.clone();
        let backed_up = payload.is_key_backed_up;
        let imported =
            run_blocking(move || keys.adopt_account_bundle(&bundle, &pw, backed_up)).await?;
        debug!(imported, backed_up, "Account keys ready");

        let server_key = STANDARD.decode(&payload.server_public_key)?;
        self.keys.import_server_public_key(&server_key)?;

        Ok(Session {
            token: payload.token,
            user_id: payload.user_id,
            email: email.to_string(),
            home_folder: payload.home_folder,
            is_key_backed_up: payload.is_key_backed_up,
        })
    }

    /// End the session. Local state is cleared even when the server call
    /// fails; the server's answer is still reported.
    #[instrument(skip_all)]
    pub async fn sign_out(&self, cancel: &CancellationToken) -> VaultResult<()> {
        let token = self.token()?;
        let request = Request::SignOut { token };
        let result = self
            .retry
            .run("sign_out", cancel, || self.transport.send(request.clone()))
            .await
            .and_then(|response| response.into_payload("sign_out"));

        self.clear_session();
        info!("Signed out");
        result.map(|_| ())
    }
}

/// Owned copy for a blocking task; zeroized when dropped
fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::new(secret.expose_secret().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PublicKey;
    use crate::sync::test_support::{harness, key_manager, pw, signed_out, PASSWORD};
    use crate::transport::{Response, SignInPayload};

    const SALT: [u8; 16] = [7u8; 16];
    const SERVER_KEY: [u8; 32] = [9u8; 32];

    fn sign_in_payload(bundle: String) -> Payload {
        Payload::SignIn(SignInPayload {
            token: "tok-9".into(),
            user_id: "u9".into(),
            key_bundle: bundle,
            server_public_key: STANDARD.encode(SERVER_KEY),
            home_folder: "home9".into(),
            is_key_backed_up: true,
        })
    }

    /// Bundle made on "another device" with the same password
    fn remote_bundle() -> (String, PublicKey) {
        let other = key_manager();
        let bundle = other.generate_keypair(&pw(PASSWORD)).unwrap();
        (bundle.to_base64(), bundle.public)
    }

    #[tokio::test]
    async fn test_sign_in_loads_keys() {
        let h = signed_out();
        let (bundle, public) = remote_bundle();
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::ok(sign_in_payload(bundle)));

        let session = h
            .ctx
            .sign_in("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.token, "tok-9");
        assert_eq!(h.ctx.session().unwrap(), session);
        assert_eq!(h.ctx.keys().public_key().unwrap(), public);
        assert_eq!(h.ctx.keys().server_public_key(), Some(PublicKey(SERVER_KEY)));

        let expected = key_manager()
            .password_hash_for_storage(&pw(PASSWORD), Some(&SALT[..]))
            .unwrap();
        let sent = h.transport.sent();
        assert!(matches!(sent[0], Request::PreSignIn { .. }));
        assert!(matches!(&sent[1], Request::SignIn { password_hash, .. } if *password_hash == expected.hash));
    }

    #[tokio::test]
    async fn test_wrong_password_fails_closed() {
        let h = signed_out();
        let (bundle, _) = remote_bundle();
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::ok(sign_in_payload(bundle)));

        let result = h
            .ctx
            .sign_in("a@example.com", &pw("wrong"), &CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert!(!h.ctx.is_signed_in());
        assert!(!h.ctx.keys().is_loaded());
        assert!(h.ctx.keys().server_public_key().is_none());
    }

    fn not_backed_up(bundle: String) -> Payload {
        let mut payload = sign_in_payload(bundle);
        if let Payload::SignIn(p) = &mut payload {
            p.is_key_backed_up = false;
        }
        payload
    }

    #[tokio::test]
    async fn test_sign_in_keeps_loaded_keys_without_backup() {
        let h = harness();
        let public = h.ctx.keys().public_key().unwrap();
        let public_only = h
            .ctx
            .keys()
            .export_upload_bundle(&pw(PASSWORD), false)
            .unwrap();
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::ok(not_backed_up(public_only)));

        let session = h
            .ctx
            .sign_in("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!session.is_key_backed_up);
        assert!(h.ctx.keys().is_loaded());
        assert_eq!(h.ctx.keys().public_key().unwrap(), public);
        assert_eq!(h.ctx.keys().server_public_key(), Some(PublicKey(SERVER_KEY)));
    }

    #[tokio::test]
    async fn test_sign_in_skips_import_when_keys_match() {
        let h = harness();
        let before = h.ctx.keys().keypair().unwrap();
        let bundle = h
            .ctx
            .keys()
            .export_upload_bundle(&pw(PASSWORD), true)
            .unwrap();
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::ok(sign_in_payload(bundle)));

        // Not the wrapping password; only succeeds without a re-import
        h.ctx
            .sign_in("a@example.com", &pw("server accepted"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            h.ctx.keys().keypair().unwrap().secret.expose(),
            before.secret.expose()
        );
    }

    #[tokio::test]
    async fn test_sign_in_without_backup_needs_local_keys() {
        let h = signed_out();
        let other = key_manager();
        other.generate_keypair(&pw(PASSWORD)).unwrap();
        let public_only = other.export_upload_bundle(&pw(PASSWORD), false).unwrap();
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::ok(not_backed_up(public_only)));

        let err = h
            .ctx
            .sign_in("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::KeysNotLoaded));
        assert!(!h.ctx.is_signed_in());
    }

    #[tokio::test]
    async fn test_rejected_sign_in_clears_previous_session() {
        let h = harness();
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::rejected("bad_credentials"));

        let err = h
            .ctx
            .sign_in("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::RemoteRejected { request: "sign_in", .. }));
        assert!(!h.ctx.is_signed_in());
        assert!(!h.ctx.keys().is_loaded());
    }

    #[tokio::test]
    async fn test_bad_salt_and_server_key_rejected() {
        let h = signed_out();
        h.transport.push(Response::ok(Payload::Salt("zz".into())));
        let err = h
            .ctx
            .sign_in("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::PrivateFile(PrivateFileError::InvalidData)));

        let (bundle, _) = remote_bundle();
        let mut payload = sign_in_payload(bundle);
        if let Payload::SignIn(p) = &mut payload {
            p.server_public_key = STANDARD.encode([1u8; 5]);
        }
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::ok(payload));
        assert!(h
            .ctx
            .sign_in("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .is_err());
        assert!(!h.ctx.keys().is_loaded());
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let h = signed_out();
        let (bundle, _) = remote_bundle();
        h.transport.push_err(VaultError::Transport("connection reset".into()));
        h.transport.push(Response::ok(Payload::Salt(hex::encode(SALT))));
        h.transport.push(Response::ok(sign_in_payload(bundle)));

        h.ctx
            .sign_in("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(h.transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_sign_up_round_trip() {
        let h = signed_out();
        // Emulates the server: remembers what sign-up stored
        *h.transport.responder.lock() = Some(Box::new(|log: &[Request]| {
            let (hash, salt, bundle) = log.iter().find_map(|r| match r {
                Request::SignUp {
                    password_hash,
                    salt,
                    key_bundle,
                    ..
                } => Some((password_hash.clone(), salt.clone(), key_bundle.clone())),
                _ => None,
            })?;
            Some(match log.last()? {
                Request::SignUp { .. } => Response::ok(Payload::Empty),
                Request::PreSignIn { .. } => Response::ok(Payload::Salt(salt)),
                Request::SignIn { password_hash, .. } if *password_hash == hash => {
                    Response::ok(sign_in_payload(bundle))
                }
                _ => Response::rejected("bad_credentials"),
            })
        }));

        let session = h
            .ctx
            .sign_up("new@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.email, "new@example.com");
        assert!(h.ctx.keys().is_loaded());
        let sent = h.transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[0], Request::SignUp { salt, is_backup: true, .. } if salt.len() == 32));
    }

    #[tokio::test]
    async fn test_failed_sign_up_clears_keys() {
        let h = signed_out();
        h.transport.push(Response::rejected("email_taken"));

        let err = h
            .ctx
            .sign_up("a@example.com", &pw(PASSWORD), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::RemoteRejected { request: "sign_up", .. }));
        assert!(!h.ctx.keys().is_loaded());
    }

    #[tokio::test]
    async fn test_sign_out_clears_even_when_rejected() {
        let h = harness();
        h.transport.push(Response::rejected("expired"));

        let err = h.ctx.sign_out(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VaultError::RemoteRejected { request: "sign_out", .. }));
        assert!(!h.ctx.is_signed_in());
        assert!(!h.ctx.keys().is_loaded());
        assert!(matches!(h.ctx.session(), Err(VaultError::NoActiveSession)));
    }

    #[tokio::test]
    async fn test_sign_out() {
        let h = harness();
        h.transport.push(Response::ok(Payload::Empty));
        h.ctx.sign_out(&CancellationToken::new()).await.unwrap();
        assert!(!h.ctx.is_signed_in());

        let err = h.ctx.sign_out(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VaultError::NoActiveSession));
    }
}
