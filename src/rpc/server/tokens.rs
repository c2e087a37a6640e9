//! Write tokens bound to the requester's IP.

use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use crc::{Crc, CRC_32_ISCSI};
use rand::{thread_rng, Rng};
use tracing::trace;

const SECRET_SIZE: usize = 20;
const TOKEN_SIZE: usize = 4;
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Interval after which the current secret is replaced.
///
/// A token stays valid for up to two intervals.
pub const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(60 * 5);

/// Tokens generator.
///
/// A token is the CRC32C of the requester's IP and a secret, the previous
/// secret is still accepted after a rotation.
pub struct Tokens {
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    pub fn new(now: Instant) -> Self {
        let mut rng = thread_rng();

        Tokens {
            prev_secret: rng.gen(),
            curr_secret: rng.gen(),
            last_updated: now,
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret is older than [TOKEN_ROTATE_INTERVAL].
    pub fn should_update(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) > TOKEN_ROTATE_INTERVAL
    }

    /// Validate that the token was generated for this address with either secret.
    pub fn validate(&self, address: SocketAddr, token: &[u8]) -> bool {
        let prev = generate(address.ip(), &self.prev_secret);
        let curr = generate(address.ip(), &self.curr_secret);

        token == curr || token == prev
    }

    /// Rotate the tokens secret.
    pub fn rotate(&mut self, now: Instant) {
        trace!(context = "tokens", "Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = thread_rng().gen();

        self.last_updated = now;
    }

    /// Generates a new token for a remote peer.
    pub fn generate_token(&self, address: SocketAddr) -> [u8; TOKEN_SIZE] {
        generate(address.ip(), &self.curr_secret)
    }
}

fn generate(ip: IpAddr, secret: &[u8; SECRET_SIZE]) -> [u8; TOKEN_SIZE] {
    let mut digest = CASTAGNOLI.digest();

    match ip {
        IpAddr::V4(ip) => digest.update(&ip.octets()),
        IpAddr::V6(ip) => digest.update(&ip.octets()),
    }
    digest.update(secret);

    digest.finalize().to_be_bytes()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_tokens() {
        let tokens = Tokens::new(Instant::now());

        let address = SocketAddr::from(([127, 0, 0, 1], 6881));
        let token = tokens.generate_token(address);

        assert!(tokens.validate(address, &token));
        // Same IP, any port.
        assert!(tokens.validate(SocketAddr::from(([127, 0, 0, 1], 1)), &token));
        assert!(!tokens.validate(SocketAddr::from(([127, 0, 0, 2], 6881)), &token));
    }

    #[test]
    fn survives_one_rotation() {
        let start = Instant::now();
        let mut tokens = Tokens::new(start);
        let address = SocketAddr::from(([10, 0, 0, 1], 6881));

        let token = tokens.generate_token(address);

        assert!(!tokens.should_update(start + TOKEN_ROTATE_INTERVAL));
        assert!(tokens.should_update(start + TOKEN_ROTATE_INTERVAL * 2));

        tokens.rotate(start + TOKEN_ROTATE_INTERVAL * 2);
        assert!(tokens.validate(address, &token));

        tokens.rotate(start + TOKEN_ROTATE_INTERVAL * 4);
        assert!(!tokens.validate(address, &token));
    }
}
