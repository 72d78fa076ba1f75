//! Write-token minting and verification for remote peer addresses.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use getrandom::getrandom;
use sha2::{Digest, Sha512};

/// Size of a minted token. SHA-512 output, taken whole.
pub const TOKEN_SIZE: usize = 64;
/// Secrets rotate on this period; a token stays acceptable for two
/// rotations, then is rejected.
pub const ROTATE_SECRETS_INTERVAL: Duration = Duration::from_secs(15 * 60);

const SECRET_SIZE: usize = 32;

#[derive(Clone)]
/// Rotating-secret token generator.
///
/// Tokens gate announce requests: a node mints one in every response
/// carrying values and requires a matching one on writes from the same
/// address. Keeping the previous secret makes tokens survive one rotation.
pub struct TokenEngine {
    curr_secret: [u8; SECRET_SIZE],
    prev_secret: [u8; SECRET_SIZE],
    last_rotation: Instant,
}

impl Debug for TokenEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TokenEngine (_)")
    }
}

impl TokenEngine {
    pub fn new(now: Instant) -> Self {
        TokenEngine {
            curr_secret: random_secret(),
            prev_secret: random_secret(),
            last_rotation: now,
        }
    }

    // === Public Methods ===

    pub fn should_rotate(&self, now: Instant) -> bool {
        now >= self.last_rotation + ROTATE_SECRETS_INTERVAL
    }

    pub fn rotate(&mut self, now: Instant) {
        self.prev_secret = self.curr_secret;
        self.curr_secret = random_secret();
        self.last_rotation = now;
    }

    /// Mint a token for a remote address with the current secret.
    pub fn make_token(&self, addr: &SocketAddr) -> Box<[u8]> {
        digest(&self.curr_secret, addr).into()
    }

    /// A token is valid if either the current or the previous secret
    /// produces it for this address.
    pub fn token_match(&self, token: &[u8], addr: &SocketAddr) -> bool {
        token == digest(&self.curr_secret, addr).as_slice()
            || token == digest(&self.prev_secret, addr).as_slice()
    }
}

fn digest(secret: &[u8; SECRET_SIZE], addr: &SocketAddr) -> [u8; TOKEN_SIZE] {
    let mut hasher = Sha512::new();

    hasher.update(secret);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => hasher.update(ip.octets()),
        std::net::IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_be_bytes());

    hasher.finalize().into()
}

fn random_secret() -> [u8; SECRET_SIZE] {
    let mut bytes = [0_u8; SECRET_SIZE];
    getrandom(&mut bytes).expect("getrandom");

    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6881))
    }

    #[test]
    fn valid_tokens() {
        let tokens = TokenEngine::new(Instant::now());

        let token = tokens.make_token(&addr());

        assert_eq!(token.len(), TOKEN_SIZE);
        assert!(tokens.token_match(&token, &addr()));
    }

    #[test]
    fn tokens_are_per_address() {
        let tokens = TokenEngine::new(Instant::now());

        let token = tokens.make_token(&addr());
        let other = SocketAddr::from(([127, 0, 0, 2], 6881));

        assert!(!tokens.token_match(&token, &other));
    }

    #[test]
    fn tokens_survive_one_rotation_only() {
        let t0 = Instant::now();
        let mut tokens = TokenEngine::new(t0);

        let token = tokens.make_token(&addr());

        assert!(!tokens.should_rotate(t0 + Duration::from_secs(60)));
        assert!(tokens.should_rotate(t0 + ROTATE_SECRETS_INTERVAL));

        tokens.rotate(t0 + ROTATE_SECRETS_INTERVAL);
        assert!(tokens.token_match(&token, &addr()));

        tokens.rotate(t0 + 2 * ROTATE_SECRETS_INTERVAL);
        assert!(!tokens.token_match(&token, &addr()));
    }
}
