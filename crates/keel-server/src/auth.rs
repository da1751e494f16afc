use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Shared-secret check for observers.
///
/// Both sides are hashed before comparison so the check takes the same
/// time regardless of where the inputs first differ.
pub struct Authenticator {
    secret: Option<SecretString>,
}

impl Authenticator {
    pub fn new(secret: Option<SecretString>) -> Self {
        let secret = secret.filter(|s| !s.expose_secret().is_empty());
        Self { secret }
    }

    pub fn from_token(token: Option<&str>) -> Self {
        Self::new(token.map(|t| SecretString::from(t.to_string())))
    }

    /// No secret configured: every client is authenticated on connect.
    pub fn is_open(&self) -> bool {
        self.secret.is_none()
    }

    pub fn verify(&self, presented: &str) -> bool {
        match &self.secret {
            None => true,
            Some(secret) => digests_match(secret.expose_secret(), presented),
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("open", &self.is_open())
            .finish()
    }
}

fn digests_match(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
