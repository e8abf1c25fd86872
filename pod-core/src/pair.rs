//! Pairing handshake: X25519 exchange plus CMAC confirmations, yielding the LTK.

use tracing::{debug, info};

use crate::crypto::{aes_cmac, random_bytes, Keypair};
use crate::frame::{decode_keyed, encode_keyed, FrameError};
use crate::message::{Message, MessageType};

const SP1: &[u8] = b"SP1=";
const SP2: &[u8] = b",SP2=";
const SPS1: &[u8] = b"SPS1=";
const SPS2: &[u8] = b"SPS2=";
const SP0GP0: &[u8] = b"SP0GP0";
const P0: &[u8] = b"P0=";
const P0_VALUE: u8 = 0xa5;

const PUBLIC_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const CONF_LEN: usize = 16;

const LABEL: &[u8] = b"TWIt";
const PDM_CONF_LABEL: &[u8] = b"KC_2_U";
const POD_CONF_LABEL: &[u8] = b"KC_2_V";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Sp1Sp2,
    Sps1,
    Sps1Reply,
    Sps2,
    Sps2Reply,
    Sp0Gp0,
    P0,
    Done,
}

/// Public values of one pairing plus the keys derived from them.
pub struct PairingMaterial {
    pub pdm_public: [u8; PUBLIC_KEY_LEN],
    pub pod_nonce: [u8; NONCE_LEN],
    pub pdm_nonce: [u8; NONCE_LEN],
    conf_key: [u8; 16],
    ltk: [u8; 16],
}

impl PairingMaterial {
    /// Derive from the shared secret. Either side can call this with the same inputs.
    pub fn derive(
        shared: &[u8; 32],
        pod_public: &[u8; PUBLIC_KEY_LEN],
        pdm_public: &[u8; PUBLIC_KEY_LEN],
        pod_nonce: &[u8; NONCE_LEN],
        pdm_nonce: &[u8; NONCE_LEN],
    ) -> Self {
        let mut first = [0u8; 16];
        first[..4].copy_from_slice(&pod_public[28..]);
        first[4..8].copy_from_slice(&pdm_public[28..]);
        first[8..12].copy_from_slice(&pod_nonce[12..]);
        first[12..].copy_from_slice(&pdm_nonce[12..]);
        let intermediate = aes_cmac(&first, shared);

        let derive_key = |tag: u8| {
            let mut data = Vec::with_capacity(1 + LABEL.len() + 2 * NONCE_LEN + 2);
            data.push(tag);
            data.extend_from_slice(LABEL);
            data.extend_from_slice(pod_nonce);
            data.extend_from_slice(pdm_nonce);
            data.extend_from_slice(&[0x00, 0x01]);
            aes_cmac(&intermediate, &data)
        };

        Self {
            pdm_public: *pdm_public,
            pod_nonce: *pod_nonce,
            pdm_nonce: *pdm_nonce,
            conf_key: derive_key(0x01),
            ltk: derive_key(0x02),
        }
    }

    pub fn pdm_conf(&self) -> [u8; CONF_LEN] {
        self.conf(PDM_CONF_LABEL, &self.pdm_nonce, &self.pod_nonce)
    }

    pub fn pod_conf(&self) -> [u8; CONF_LEN] {
        self.conf(POD_CONF_LABEL, &self.pod_nonce, &self.pdm_nonce)
    }

    pub fn ltk(&self) -> [u8; 16] {
        self.ltk
    }

    fn conf(&self, label: &[u8], a: &[u8; NONCE_LEN], b: &[u8; NONCE_LEN]) -> [u8; CONF_LEN] {
        let mut data = Vec::with_capacity(label.len() + 2 * NONCE_LEN);
        data.extend_from_slice(label);
        data.extend_from_slice(a);
        data.extend_from_slice(b);
        aes_cmac(&self.conf_key, &data)
    }
}

/// Pod side of the pairing exchange. Each step must arrive in order.
pub struct Pairing {
    step: Step,
    keypair: Keypair,
    pod_nonce: [u8; NONCE_LEN],
    material: Option<PairingMaterial>,
    next_seq: u8,
}

impl Default for Pairing {
    fn default() -> Self {
        Self::new()
    }
}

impl Pairing {
    pub fn new() -> Self {
        Self::with_secret(Keypair::generate(), random_bytes())
    }

    /// Pairing with a fixed keypair and nonce.
    pub fn with_secret(keypair: Keypair, pod_nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            step: Step::Sp1Sp2,
            keypair,
            pod_nonce,
            material: None,
            next_seq: 1,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn parse_sp1_sp2(&mut self, msg: &Message) -> Result<(), PairingError> {
        self.expect(Step::Sp1Sp2, msg)?;
        let (_, rest) = decode_keyed(SP1, &msg.payload)?;
        decode_keyed(SP2, rest)?;
        self.step = Step::Sps1;
        Ok(())
    }

    pub fn parse_sps1(&mut self, msg: &Message) -> Result<(), PairingError> {
        self.expect(Step::Sps1, msg)?;
        let (value, _) = decode_keyed(SPS1, &msg.payload)?;
        let (pdm_public, pdm_nonce) = split_key_and_nonce(value)?;
        let shared = self.keypair.shared_secret(&pdm_public);
        let material = PairingMaterial::derive(
            &shared,
            self.keypair.public_key(),
            &pdm_public,
            &self.pod_nonce,
            &pdm_nonce,
        );
        self.material = Some(material);
        self.step = Step::Sps1Reply;
        Ok(())
    }

    /// Pod public key and nonce.
    pub fn generate_sps1(&mut self, request: &Message) -> Result<Message, PairingError> {
        self.advance(Step::Sps1Reply, Step::Sps2)?;
        let mut value = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN);
        value.extend_from_slice(self.keypair.public_key());
        value.extend_from_slice(&self.pod_nonce);
        let payload = encode_keyed(SPS1, &value)?;
        Ok(self.reply(request, payload))
    }

    pub fn parse_sps2(&mut self, msg: &Message) -> Result<(), PairingError> {
        self.expect(Step::Sps2, msg)?;
        let (value, _) = decode_keyed(SPS2, &msg.payload)?;
        if value.len() != CONF_LEN {
            return Err(PairingError::BadLength {
                field: "SPS2",
                expected: CONF_LEN,
                actual: value.len(),
            });
        }
        let expected = self.material()?.pdm_conf();
        if value != expected {
            return Err(PairingError::ConfirmationMismatch);
        }
        self.step = Step::Sps2Reply;
        Ok(())
    }

    /// Pod confirmation value.
    pub fn generate_sps2(&mut self, request: &Message) -> Result<Message, PairingError> {
        self.advance(Step::Sps2Reply, Step::Sp0Gp0)?;
        let conf = self.material()?.pod_conf();
        let payload = encode_keyed(SPS2, &conf)?;
        Ok(self.reply(request, payload))
    }

    pub fn parse_sp0gp0(&mut self, msg: &Message) -> Result<(), PairingError> {
        self.expect(Step::Sp0Gp0, msg)?;
        if msg.payload != SP0GP0 {
            return Err(PairingError::BadConstant("SP0GP0"));
        }
        self.step = Step::P0;
        Ok(())
    }

    pub fn generate_p0(&mut self, request: &Message) -> Result<Message, PairingError> {
        self.advance(Step::P0, Step::Done)?;
        let ltk = self.material()?.ltk();
        info!("pairing complete");
        debug!(ltk = %hex::encode(ltk), "derived LTK");
        let payload = encode_keyed(P0, &[P0_VALUE])?;
        Ok(self.reply(request, payload))
    }

    /// The long-term key, available once the exchange is done.
    pub fn ltk(&self) -> Result<[u8; 16], PairingError> {
        if self.step != Step::Done {
            return Err(PairingError::NotComplete);
        }
        Ok(self.material()?.ltk())
    }

    fn material(&self) -> Result<&PairingMaterial, PairingError> {
        self.material.as_ref().ok_or(PairingError::NotComplete)
    }

    fn expect(&self, step: Step, msg: &Message) -> Result<(), PairingError> {
        if msg.message_type != MessageType::Pairing {
            return Err(PairingError::WrongType(msg.message_type));
        }
        if self.step != step {
            return Err(PairingError::UnexpectedStep {
                expected: self.step,
                got: step,
            });
        }
        Ok(())
    }

    fn advance(&mut self, step: Step, next: Step) -> Result<(), PairingError> {
        if self.step != step {
            return Err(PairingError::UnexpectedStep {
                expected: self.step,
                got: step,
            });
        }
        self.step = next;
        Ok(())
    }

    fn reply(&mut self, request: &Message, payload: Vec<u8>) -> Message {
        let msg = request.reply(MessageType::Pairing, self.next_seq, payload);
        self.next_seq = self.next_seq.wrapping_add(1);
        msg
    }
}

fn split_key_and_nonce(
    value: &[u8],
) -> Result<([u8; PUBLIC_KEY_LEN], [u8; NONCE_LEN]), PairingError> {
    if value.len() != PUBLIC_KEY_LEN + NONCE_LEN {
        return Err(PairingError::BadLength {
            field: "SPS1",
            expected: PUBLIC_KEY_LEN + NONCE_LEN,
            actual: value.len(),
        });
    }
    let mut public = [0u8; PUBLIC_KEY_LEN];
    public.copy_from_slice(&value[..PUBLIC_KEY_LEN]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&value[PUBLIC_KEY_LEN..]);
    Ok((public, nonce))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PairingError {
    #[error("pairing message: {0}")]
    Frame(#[from] FrameError),
    #[error("{field} carries {actual} bytes, expected {expected}")]
    BadLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("pairing step out of order: at {expected:?}, got {got:?}")]
    UnexpectedStep { expected: Step, got: Step },
    #[error("pairing message has packet type {0:?}")]
    WrongType(MessageType),
    #[error("PDM confirmation value does not match")]
    ConfirmationMismatch,
    #[error("expected constant {0}")]
    BadConstant(&'static str),
    #[error("pairing not complete")]
    NotComplete,
}
