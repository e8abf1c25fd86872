//! Session transport encryption: AES-128-CCM keyed with CK, nonce from prefix and counter.

use aes::Aes128;
use ccm::consts::{U13, U8};
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::Ccm;
use serde::{Deserialize, Serialize};

use crate::crypto::CryptoError;
use crate::message::{Message, MessageType, TAG_LEN};

type PodCipher = Ccm<Aes128, U8, U13>;

pub const NONCE_PREFIX_LEN: usize = 8;
pub const NONCE_LEN: usize = 13;

/// Which way the packet travels, seen from the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    PodReceiving,
    PodSending,
}

/// Per-session key material from the authentication handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeys {
    #[serde(with = "crate::state::hex_bytes")]
    pub ck: [u8; 16],
    #[serde(with = "crate::state::hex_bytes")]
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Nonce = prefix (8) + low 40 bits of the counter; top bit marks pod-to-PDM.
    pub fn nonce(&self, seq: u64, direction: Direction) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(&self.nonce_prefix);
        let counter = seq.to_be_bytes();
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter[3..]);
        match direction {
            Direction::PodReceiving => nonce[NONCE_PREFIX_LEN] &= 0x7f,
            Direction::PodSending => nonce[NONCE_PREFIX_LEN] |= 0x80,
        }
        nonce
    }

    fn cipher(&self) -> PodCipher {
        PodCipher::new(ccm::aead::Key::<PodCipher>::from_slice(&self.ck))
    }

    /// Encrypt `msg.payload` in place. The header with the plaintext size is the associated data.
    pub fn encrypt_message(
        &self,
        seq: u64,
        direction: Direction,
        mut msg: Message,
    ) -> Result<Message, CryptoError> {
        msg.message_type = MessageType::Encrypted;
        let header = msg.header_with_size(msg.payload.len());
        let nonce = self.nonce(seq, direction);
        let sealed = self
            .cipher()
            .encrypt(
                ccm::aead::Nonce::<PodCipher>::from_slice(&nonce),
                Payload {
                    msg: &msg.payload,
                    aad: &header,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        msg.payload = sealed;
        Ok(msg)
    }

    /// Decrypt `msg.payload` in place. Fails closed on any integrity mismatch.
    pub fn decrypt_message(
        &self,
        seq: u64,
        direction: Direction,
        mut msg: Message,
    ) -> Result<Message, CryptoError> {
        if msg.message_type != MessageType::Encrypted || msg.payload.len() < TAG_LEN {
            return Err(CryptoError::Decrypt);
        }
        let header = msg.header_with_size(msg.payload.len() - TAG_LEN);
        let nonce = self.nonce(seq, direction);
        let opened = self
            .cipher()
            .decrypt(
                ccm::aead::Nonce::<PodCipher>::from_slice(&nonce),
                Payload {
                    msg: &msg.payload,
                    aad: &header,
                },
            )
            .map_err(|_| CryptoError::Decrypt)?;
        msg.payload = opened;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys {
            ck: [0x42; 16],
            nonce_prefix: [1, 2, 3, 4, 5, 6, 7, 8],
        }
    }

    fn command(payload: &[u8]) -> Message {
        let mut msg = Message::new(MessageType::Encrypted, 0x1092, 0x1093, payload.to_vec());
        msg.sequence_number = 7;
        msg
    }

    #[test]
    fn nonce_layout() {
        let k = keys();
        let n = k.nonce(0x01_0203_0405, Direction::PodReceiving);
        assert_eq!(&n[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&n[8..], &[1, 2, 3, 4, 5]);
        let n = k.nonce(5, Direction::PodSending);
        assert_eq!(&n[8..], &[0x80, 0, 0, 0, 5]);
    }

    #[test]
    fn roundtrip() {
        let k = keys();
        let sealed = k.encrypt_message(3, Direction::PodSending, command(b"0.0=payload")).unwrap();
        assert_eq!(sealed.payload.len(), 11 + TAG_LEN);
        assert_eq!(sealed.declared_size(), 11);
        let wire = sealed.encode().unwrap();
        let received = Message::decode(&wire).unwrap();
        let opened = k.decrypt_message(3, Direction::PodSending, received).unwrap();
        assert_eq!(opened.payload, b"0.0=payload");
    }

    #[test]
    fn empty_ack_roundtrip() {
        let k = keys();
        let sealed = k.encrypt_message(9, Direction::PodReceiving, command(&[])).unwrap();
        assert_eq!(sealed.payload.len(), TAG_LEN);
        let opened = k.decrypt_message(9, Direction::PodReceiving, sealed).unwrap();
        assert!(opened.payload.is_empty());
    }

    #[test]
    fn wrong_key_counter_or_direction_fails() {
        let k = keys();
        let sealed = k.encrypt_message(1, Direction::PodReceiving, command(b"S0.0=x")).unwrap();
        let other = SessionKeys {
            ck: [0x43; 16],
            ..keys()
        };
        assert_eq!(
            other.decrypt_message(1, Direction::PodReceiving, sealed.clone()),
            Err(CryptoError::Decrypt)
        );
        assert!(k.decrypt_message(2, Direction::PodReceiving, sealed.clone()).is_err());
        assert!(k.decrypt_message(1, Direction::PodSending, sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_or_header_fails() {
        let k = keys();
        let sealed = k.encrypt_message(1, Direction::PodReceiving, command(b"S0.0=x")).unwrap();
        let mut flipped = sealed.clone();
        flipped.payload[0] ^= 1;
        assert_eq!(
            k.decrypt_message(1, Direction::PodReceiving, flipped),
            Err(CryptoError::Decrypt)
        );
        let mut readdressed = sealed;
        readdressed.source ^= 1;
        assert!(k.decrypt_message(1, Direction::PodReceiving, readdressed).is_err());
    }
}
