use super::id::Id;
use crate::constants::{TOKEN_LEN, TOKEN_SECRET_LEN};
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

struct TokenSecrets {
    current: [u8; TOKEN_SECRET_LEN],
    previous: [u8; TOKEN_SECRET_LEN],
    rotated_at: Instant,
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
            rotated_at: Instant::now(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
        self.rotated_at = Instant::now();
    }
}

/// Issues and checks the anti-spoofing tokens handed out by `get_peers` and `get`.
///
/// A token is `SHA-256(ip ‖ hash ‖ secret)` truncated to [`TOKEN_LEN`] bytes.
/// Secrets rotate lazily: the first use after a rotation period has passed
/// promotes the current secret to previous and draws a fresh one. Tokens made
/// with either live secret validate, so a token stays valid for at least one
/// and at most two periods.
///
/// One issuer exists per [`Dht`](super::Dht) and is shared by handle.
pub struct TokenIssuer {
    secrets: Mutex<TokenSecrets>,
    rotation: Duration,
}

impl TokenIssuer {
    pub fn new(rotation: Duration) -> Self {
        Self {
            secrets: Mutex::new(TokenSecrets::new()),
            rotation,
        }
    }

    /// Issues a token binding `addr` to `hash` (use [`Id::zero`] for no hash).
    pub fn issue(&self, addr: &SocketAddr, hash: &Id) -> Bytes {
        let mut secrets = self.secrets.lock();
        self.maybe_rotate(&mut secrets);
        Self::derive(addr, hash, &secrets.current)
    }

    pub fn validate(&self, addr: &SocketAddr, hash: &Id, token: &[u8]) -> bool {
        let mut secrets = self.secrets.lock();
        self.maybe_rotate(&mut secrets);

        Self::derive(addr, hash, &secrets.current).as_ref() == token
            || Self::derive(addr, hash, &secrets.previous).as_ref() == token
    }

    /// Forces a rotation regardless of the elapsed time.
    pub fn rotate(&self) {
        self.secrets.lock().rotate();
        debug!("DHT token secret rotated");
    }

    fn maybe_rotate(&self, secrets: &mut TokenSecrets) {
        let elapsed = secrets.rotated_at.elapsed();
        if elapsed < self.rotation {
            return;
        }

        secrets.rotate();
        // Idle for two periods or more: the old current secret is stale too.
        if elapsed >= self.rotation * 2 {
            secrets.rotate();
        }
        debug!("DHT token secret rotated");
    }

    fn derive(addr: &SocketAddr, hash: &Id, secret: &[u8; TOKEN_SECRET_LEN]) -> Bytes {
        let mut hasher = Sha256::new();
        match addr.ip() {
            std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
            std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
        }
        hasher.update(hash.as_bytes());
        hasher.update(secret);

        let digest = hasher.finalize();
        Bytes::copy_from_slice(&digest[..TOKEN_LEN])
    }
}
