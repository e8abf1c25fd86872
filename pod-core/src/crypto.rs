//! Pod crypto primitives: X25519 keypair for pairing, AES-CMAC, raw AES block.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// X25519 keypair used once per pairing. Keep secret key private; expose only the public key.
pub struct Keypair {
    secret: StaticSecret,
    public: [u8; 32],
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng).to_bytes())
    }

    /// Rebuild a keypair from secret bytes (fixed test vectors).
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public
    }

    /// Shared secret with the peer's public key.
    pub fn shared_secret(&self, other_public: &[u8; 32]) -> [u8; 32] {
        let other = X25519PublicKey::from(*other_public);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

/// Fill an array with OS randomness (nonces, IVs).
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// AES-CMAC (RFC 4493) with a 128-bit key.
pub fn aes_cmac(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Single AES-128 block encryption, the building block of Milenage.
pub fn aes_encrypt_block(cipher: &Aes128, block: &[u8; 16]) -> [u8; 16] {
    let mut b = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut b);
    b.into()
}

pub fn aes_cipher(key: &[u8; 16]) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed: integrity check did not validate")]
    Decrypt,
    #[error("no session keys established")]
    NoSession,
}
