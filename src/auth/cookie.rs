//! Signed auth cookie: `base64url(userB64|sessionId|expirySec|hexHmac)`,
//! HMAC-SHA256 over `userB64|sessionId|expirySec|passphrase`. A legacy
//! 3-part form (no sessionId) is accepted and silently upgraded (design
//! notes §4.B, §9).

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCookie {
    pub username: String,
    pub session_id: String,
    /// Set when the cookie was the legacy 3-part form and should be
    /// re-minted in the 4-part form on the outgoing response.
    pub needs_upgrade: bool,
}

fn hmac_hex(user_b64: &str, session_id: &str, expiry: i64, passphrase: &str, key: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(user_b64.as_bytes());
    mac.update(b"|");
    mac.update(session_id.as_bytes());
    mac.update(b"|");
    mac.update(expiry.to_string().as_bytes());
    mac.update(b"|");
    mac.update(passphrase.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Mint a 4-part cookie value (unencoded, caller sets cookie attributes).
pub fn mint(username: &str, session_id: &str, expiry_unix_secs: i64, passphrase: &str, key: &[u8]) -> String {
    let user_b64 = STANDARD.encode(username.as_bytes());
    let mac = hmac_hex(&user_b64, session_id, expiry_unix_secs, passphrase, key);
    let raw = format!("{}|{}|{}|{}", user_b64, session_id, expiry_unix_secs, mac);
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Verify a cookie value against a passphrase lookup. `lookup` resolves a
/// username to its current passphrase (or `None` if unknown/disabled).
pub fn verify(
    cookie_value: &str,
    now_unix_secs: i64,
    lookup: impl Fn(&str) -> Option<String>,
    key: &[u8],
) -> Option<VerifiedCookie> {
    let raw = URL_SAFE_NO_PAD.decode(cookie_value).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let parts: Vec<&str> = raw.split('|').collect();

    let (user_b64, session_id, expiry_str, mac_hex, needs_upgrade) = match parts.as_slice() {
        [user_b64, session_id, expiry_str, mac_hex] => {
            (*user_b64, *session_id, *expiry_str, *mac_hex, false)
        }
        // Legacy 3-part form: no sessionId. Treat session_id as empty for
        // the HMAC computation, matching how it was originally minted.
        [user_b64, expiry_str, mac_hex] => (*user_b64, "", *expiry_str, *mac_hex, true),
        _ => return None,
    };

    let expiry: i64 = expiry_str.parse().ok()?;
    if expiry < now_unix_secs {
        return None;
    }

    let username = String::from_utf8(STANDARD.decode(user_b64).ok()?).ok()?;
    let passphrase = lookup(&username)?;
    let expected = hmac_hex(user_b64, session_id, expiry, &passphrase, key);

    if expected.as_bytes().ct_eq(mac_hex.as_bytes()).into() {
        Some(VerifiedCookie {
            username,
            session_id: session_id.to_string(),
            needs_upgrade,
        })
    } else {
        None
    }
}

/// Constant-time double-submit CSRF comparison (cookie value vs.
/// header/body-echoed value).
pub fn csrf_matches(cookie_token: &str, submitted_token: &str) -> bool {
    cookie_token.as_bytes().ct_eq(submitted_token.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"test-secret";

    #[test]
    fn mints_and_verifies_round_trip() {
        let cookie = mint("alice", "sess-1", 9_999_999_999, "hunter2", KEY);
        let verified = verify(&cookie, 1_000, |u| {
            (u == "alice").then(|| "hunter2".to_string())
        }, KEY)
        .unwrap();
        assert_eq!(verified.username, "alice");
        assert_eq!(verified.session_id, "sess-1");
        assert!(!verified.needs_upgrade);
    }

    #[test]
    fn expired_cookie_is_rejected() {
        let cookie = mint("alice", "sess-1", 100, "hunter2", KEY);
        let result = verify(&cookie, 1_000, |_| Some("hunter2".to_string()), KEY);
        assert!(result.is_none());
    }

    #[test]
    fn wrong_passphrase_fails_verification() {
        let cookie = mint("alice", "sess-1", 9_999_999_999, "hunter2", KEY);
        let result = verify(&cookie, 1_000, |_| Some("wrong".to_string()), KEY);
        assert!(result.is_none());
    }

    #[test]
    fn legacy_three_part_cookie_verifies_and_flags_upgrade() {
        let user_b64 = STANDARD.encode(b"alice");
        let mac = hmac_hex(&user_b64, "", 9_999_999_999, "hunter2", KEY);
        let raw = format!("{}|{}|{}", user_b64, 9_999_999_999i64, mac);
        let cookie = URL_SAFE_NO_PAD.encode(raw.as_bytes());

        let verified = verify(&cookie, 1_000, |_| Some("hunter2".to_string()), KEY).unwrap();
        assert!(verified.needs_upgrade);
        assert_eq!(verified.username, "alice");
    }

    #[test]
    fn csrf_constant_time_compare() {
        assert!(csrf_matches("token-abc", "token-abc"));
        assert!(!csrf_matches("token-abc", "token-xyz"));
    }
}
