use std::net::IpAddr;

use bytes::Bytes;
use sha1::{Digest, Sha1};

type Secret = [u8; 20];

/// Issues and checks the write tokens handed out in `get_peers` and `get`
/// responses.
///
/// A token is `SHA1(ip || secret)`. Two secret generations are live at a
/// time, so a token stays valid until the secret it was minted under has
/// been rotated out twice. Only the IP is bound, not the port, so a NAT
/// remapping the source port between `get_peers` and `announce_peer` does
/// not invalidate the token.
pub struct TokenAuthority {
    current: Secret,
    previous: Secret,
}

impl TokenAuthority {
    pub fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    pub fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }

    pub fn generate(&self, ip: IpAddr) -> Bytes {
        Self::generate_with_secret(ip, &self.current)
    }

    fn generate_with_secret(ip: IpAddr, secret: &Secret) -> Bytes {
        let mut hasher = Sha1::new();
        match ip {
            IpAddr::V4(v4) => hasher.update(v4.octets()),
            IpAddr::V6(v6) => hasher.update(v6.octets()),
        }
        hasher.update(secret);
        Bytes::copy_from_slice(&hasher.finalize())
    }

    pub fn is_valid(&self, token: &[u8], ip: IpAddr) -> bool {
        [&self.current, &self.previous]
            .into_iter()
            .any(|secret| Self::generate_with_secret(ip, secret).as_ref() == token)
    }
}

impl Default for TokenAuthority {
    fn default() -> Self {
        Self::new()
    }
}
