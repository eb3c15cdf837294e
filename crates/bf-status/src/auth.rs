use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::hmac;
use subtle::ConstantTimeEq;

/// Gomote control-plane authentication.
///
/// Each user's password is the keyed hash of their username under the
/// coordinator's master key, so keys can be minted offline and verified
/// statelessly here. Comparison is constant-time.
pub struct GomoteAuth {
    key: hmac::Key,
}

impl GomoteAuth {
    pub fn new(master_key: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, master_key),
        }
    }

    /// The expected key for a username, lowercase hex.
    pub fn user_key(&self, user: &str) -> String {
        let tag = hmac::sign(&self.key, user.as_bytes());
        tag.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Verify a presented `user:key` pair.
    pub fn check(&self, user: &str, presented: &str) -> bool {
        if user.is_empty() {
            return false;
        }
        let expected = self.user_key(user);
        expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    /// Parse and verify an HTTP basic auth header value.
    pub fn check_basic(&self, header: &str) -> Option<String> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = STANDARD.decode(encoded).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (user, key) = text.split_once(':')?;
        if self.check(user, key) {
            Some(user.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_is_deterministic_and_per_user() {
        let auth = GomoteAuth::new(b"master-key");
        let k1 = auth.user_key("alice");
        assert_eq!(k1, auth.user_key("alice"));
        assert_ne!(k1, auth.user_key("bob"));
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn check_accepts_only_the_right_key() {
        let auth = GomoteAuth::new(b"master-key");
        let key = auth.user_key("alice");
        assert!(auth.check("alice", &key));
        assert!(!auth.check("bob", &key));
        assert!(!auth.check("alice", "wrong"));
        assert!(!auth.check("", ""));
    }

    #[test]
    fn basic_header_round_trip() {
        let auth = GomoteAuth::new(b"master-key");
        let key = auth.user_key("alice");
        let header = format!("Basic {}", STANDARD.encode(format!("alice:{key}")));
        assert_eq!(auth.check_basic(&header).as_deref(), Some("alice"));
        assert!(auth.check_basic("Basic bm9wZQ==").is_none());
        assert!(auth.check_basic("Bearer xyz").is_none());
        assert!(auth.check_basic("Basic !!!not-base64").is_none());
    }
}
