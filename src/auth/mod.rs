//! Credential check, signed cookie mint/verify, lockout, and the shared
//! Basic-or-cookie resolution used by both the HTTP middleware and the
//! WebSocket upgrade check (design notes §4.B).

pub mod cookie;
pub mod lockout;

use std::sync::Arc;

use crate::error::{RelayError, RelayResult};

pub use cookie::csrf_matches;
pub use lockout::LockoutTracker;

/// Out-of-scope session store lookup, narrowed to what auth needs: a
/// username's passphrase and whether the account is disabled.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, username: &str) -> Option<UserRecord>;
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub passphrase: String,
    pub disabled: bool,
}

pub struct AuthGate {
    pub directory: Arc<dyn UserDirectory>,
    pub lockout: Arc<LockoutTracker>,
    pub cookie_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Authenticated {
    pub username: String,
    /// A freshly-minted 4-part cookie value, present only when the incoming
    /// cookie was the legacy 3-part form; the caller should set it on the
    /// outgoing response.
    pub upgrade_cookie: Option<String>,
}

/// Default cookie lifetime assigned when silently upgrading a legacy
/// cookie or minting one from a successful HTML login.
pub const SESSION_LIFETIME_SECS: i64 = 30 * 24 * 3600;

/// Whether `path` is exempt from auth: only the PWA manifest, and only when
/// the `Referer` host matches the request host (design notes §4.B).
pub fn manifest_exempt(path: &str, referer_host: Option<&str>, request_host: &str) -> bool {
    path == "/manifest.json" && referer_host.is_some_and(|h| h.eq_ignore_ascii_case(request_host))
}

impl AuthGate {
    /// Runs the shared Basic-or-cookie resolution. `source_key` identifies
    /// the caller for lockout purposes (typically the remote IP). Returns
    /// the resolved, enabled user, or the specific failure per §4.B's
    /// failure-mode table.
    pub async fn resolve(
        &self,
        source_key: &str,
        basic_header: Option<&str>,
        cookie_value: Option<&str>,
        now_unix_secs: i64,
    ) -> RelayResult<Authenticated> {
        if let Some(retry_after) = self.lockout.check(source_key) {
            return Err(RelayError::LockedOut {
                retry_after_secs: retry_after,
            });
        }

        if let Some(header) = basic_header {
            if let Some((user, pass)) = lockout::parse_basic_auth(header) {
                return self.resolve_basic(source_key, &user, &pass).await;
            }
            // Malformed header: unauthenticated, not an error.
        }

        if let Some(cookie) = cookie_value {
            if let Some(result) = self.resolve_cookie(cookie, now_unix_secs).await {
                return result;
            }
        }

        Err(RelayError::AuthRequired)
    }

    async fn resolve_basic(
        &self,
        source_key: &str,
        user: &str,
        pass: &str,
    ) -> RelayResult<Authenticated> {
        let record = self.directory.lookup(user).await;
        match record {
            Some(record) if record.passphrase == pass => {
                if record.disabled {
                    return Err(RelayError::AccountDisabled);
                }
                self.lockout.record_success(source_key);
                Ok(Authenticated {
                    username: user.to_string(),
                    upgrade_cookie: None,
                })
            }
            _ => {
                let just_locked = self.lockout.record_failure(source_key);
                if just_locked {
                    if self.lockout.maybe_notify() {
                        tracing::warn!(source = %source_key, "auth lockout notification throttle fired");
                    }
                    return Err(RelayError::LockedOut {
                        retry_after_secs: self.lockout.lock_secs(),
                    });
                }
                Err(RelayError::AuthRequired)
            }
        }
    }

    async fn resolve_cookie(
        &self,
        cookie_value: &str,
        now_unix_secs: i64,
    ) -> Option<RelayResult<Authenticated>> {
        // `verify`'s passphrase lookup is synchronous, so the directory is
        // queried up front for the embedded username before the MAC check.
        let username = peek_username(cookie_value)?;
        let record = self.directory.lookup(&username).await?;
        let verified = cookie::verify(
            cookie_value,
            now_unix_secs,
            |u| (u == username).then(|| record.passphrase.clone()),
            &self.cookie_key,
        )?;

        if record.disabled {
            return Some(Err(RelayError::AccountDisabled));
        }
        let upgrade_cookie = verified.needs_upgrade.then(|| {
            cookie::mint(
                &verified.username,
                &verified.session_id,
                now_unix_secs + SESSION_LIFETIME_SECS,
                &record.passphrase,
                &self.cookie_key,
            )
        });
        Some(Ok(Authenticated {
            username: verified.username,
            upgrade_cookie,
        }))
    }

    /// HTML-login mode: verify the passphrase directly and mint a fresh
    /// session cookie with a new random session id.
    pub async fn login(
        &self,
        source_key: &str,
        username: &str,
        passphrase: &str,
        now_unix_secs: i64,
    ) -> RelayResult<(Authenticated, String)> {
        if let Some(retry_after) = self.lockout.check(source_key) {
            return Err(RelayError::LockedOut { retry_after_secs: retry_after });
        }
        let record = self
            .directory
            .lookup(username)
            .await
            .filter(|r| r.passphrase == passphrase);
        match record {
            Some(record) => {
                if record.disabled {
                    return Err(RelayError::AccountDisabled);
                }
                self.lockout.record_success(source_key);
                let session_id = uuid::Uuid::new_v4().to_string();
                let cookie = cookie::mint(
                    username,
                    &session_id,
                    now_unix_secs + SESSION_LIFETIME_SECS,
                    passphrase,
                    &self.cookie_key,
                );
                Ok((
                    Authenticated {
                        username: username.to_string(),
                        upgrade_cookie: None,
                    },
                    cookie,
                ))
            }
            None => {
                let just_locked = self.lockout.record_failure(source_key);
                if just_locked {
                    if self.lockout.maybe_notify() {
                        tracing::warn!(source = %source_key, "auth lockout notification throttle fired");
                    }
                    return Err(RelayError::LockedOut {
                        retry_after_secs: self.lockout.lock_secs(),
                    });
                }
                Err(RelayError::AuthRequired)
            }
        }
    }
}

/// Decode just the username from a cookie value without verifying the MAC,
/// so the directory lookup can be performed before the constant-time
/// comparison runs.
fn peek_username(cookie_value: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
    use base64::Engine;
    let raw = URL_SAFE_NO_PAD.decode(cookie_value).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let user_b64 = raw.split('|').next()?;
    String::from_utf8(STANDARD.decode(user_b64).ok()?).ok()
}
