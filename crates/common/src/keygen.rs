//! Peer key generation
//!
//! Uses x25519-dalek for the Curve25519 key pair.

use crate::types::PeerKeys;
use crate::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Source of fresh peer key material
pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> Result<PeerKeys>;
}

/// In-process Curve25519 key generation
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519KeyGenerator;

impl KeyGenerator for X25519KeyGenerator {
    fn generate(&self) -> Result<PeerKeys> {
        let mut rng = rand::thread_rng();

        let mut private_key_bytes = [0u8; 32];
        rng.fill_bytes(&mut private_key_bytes);

        // WireGuard clamping
        private_key_bytes[0] &= 248;
        private_key_bytes[31] &= 127;
        private_key_bytes[31] |= 64;

        let secret = StaticSecret::from(private_key_bytes);
        let public = PublicKey::from(&secret);

        let mut preshared = [0u8; 32];
        rng.fill_bytes(&mut preshared);

        Ok(PeerKeys {
            private_key: STANDARD.encode(private_key_bytes),
            public_key: STANDARD.encode(public.as_bytes()),
            preshared_key: STANDARD.encode(preshared),
        })
    }
}

/// Public key for a base64 private key, as `wg pubkey` would print it
pub fn public_key_for(private_key: &str) -> Option<String> {
    let bytes: [u8; 32] = STANDARD.decode(private_key).ok()?.try_into().ok()?;
    let secret = StaticSecret::from(bytes);
    Some(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}
