//! EAP-AKA session establishment: verify the PDM challenge with Milenage, derive CK and the nonce prefix.

use tracing::{debug, info};

use crate::crypto::random_bytes;
use crate::encrypt::SessionKeys;
use crate::message::{Message, MessageType};
use crate::milenage::Milenage;

const EAP_HEADER_LEN: usize = 4;
const AKA_HEADER_LEN: usize = 4;
const EAP_TYPE_AKA: u8 = 0x17;
const SUBTYPE_CHALLENGE: u8 = 0x01;

const AT_RAND: u8 = 1;
const AT_AUTN: u8 = 2;
const AT_RES: u8 = 3;
const AT_CUSTOM_IV: u8 = 126;

const SQN_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl EapCode {
    fn from_byte(b: u8) -> Result<Self, EapError> {
        match b {
            1 => Ok(EapCode::Request),
            2 => Ok(EapCode::Response),
            3 => Ok(EapCode::Success),
            4 => Ok(EapCode::Failure),
            other => Err(EapError::UnknownCode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Rand([u8; 16]),
    Autn([u8; 16]),
    Res([u8; 8]),
    CustomIv([u8; 4]),
    Other { kind: u8, value: Vec<u8> },
}

impl Attribute {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Attribute::Rand(v) => push_attribute(out, AT_RAND, &[0, 0], v),
            Attribute::Autn(v) => push_attribute(out, AT_AUTN, &[0, 0], v),
            // RES length in bits
            Attribute::Res(v) => push_attribute(out, AT_RES, &[0x00, 0x40], v),
            Attribute::CustomIv(v) => push_attribute(out, AT_CUSTOM_IV, &[0, 0], v),
            Attribute::Other { kind, value } => push_attribute(out, *kind, &[], value),
        }
    }

    fn decode(kind: u8, value: &[u8]) -> Result<Self, EapError> {
        let attr = match kind {
            AT_RAND => Attribute::Rand(to_array(field(value, 16)?)),
            AT_AUTN => Attribute::Autn(to_array(field(value, 16)?)),
            AT_RES => Attribute::Res(to_array(field(value, 8)?)),
            AT_CUSTOM_IV => Attribute::CustomIv(to_array(field(value, 4)?)),
            other => Attribute::Other {
                kind: other,
                value: value.to_vec(),
            },
        };
        Ok(attr)
    }
}

/// Fixed-size value after the two reserved bytes.
fn field(value: &[u8], len: usize) -> Result<&[u8], EapError> {
    value.get(2..2 + len).ok_or(EapError::Short {
        needed: 2 + len,
        actual: value.len(),
    })
}

fn push_attribute(out: &mut Vec<u8>, kind: u8, reserved: &[u8], value: &[u8]) {
    let len = 2 + reserved.len() + value.len();
    out.push(kind);
    out.push(((len + 3) / 4) as u8);
    out.extend_from_slice(reserved);
    out.extend_from_slice(value);
    out.resize(out.len() + (4 - len % 4) % 4, 0);
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// One EAP packet. Success and failure packets carry no AKA header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPacket {
    pub code: EapCode,
    pub identifier: u8,
    pub attributes: Vec<Attribute>,
}

impl EapPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.code as u8, self.identifier, 0, 0];
        if matches!(self.code, EapCode::Request | EapCode::Response) {
            out.extend_from_slice(&[EAP_TYPE_AKA, SUBTYPE_CHALLENGE, 0, 0]);
            for attr in &self.attributes {
                attr.encode(&mut out);
            }
        }
        let len = out.len() as u16;
        out[2..4].copy_from_slice(&len.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EapError> {
        if bytes.len() < EAP_HEADER_LEN {
            return Err(EapError::Short {
                needed: EAP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let code = EapCode::from_byte(bytes[0])?;
        let identifier = bytes[1];
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if len < EAP_HEADER_LEN || bytes.len() < len {
            return Err(EapError::Short {
                needed: len.max(EAP_HEADER_LEN),
                actual: bytes.len(),
            });
        }
        let mut attributes = Vec::new();
        if len > EAP_HEADER_LEN {
            if len < EAP_HEADER_LEN + AKA_HEADER_LEN {
                return Err(EapError::Short {
                    needed: EAP_HEADER_LEN + AKA_HEADER_LEN,
                    actual: len,
                });
            }
            if bytes[4] != EAP_TYPE_AKA || bytes[5] != SUBTYPE_CHALLENGE {
                return Err(EapError::UnsupportedType {
                    eap_type: bytes[4],
                    subtype: bytes[5],
                });
            }
            let mut rest = &bytes[EAP_HEADER_LEN + AKA_HEADER_LEN..len];
            while !rest.is_empty() {
                if rest.len() < 2 {
                    return Err(EapError::Short { needed: 2, actual: rest.len() });
                }
                let attr_len = rest[1] as usize * 4;
                if attr_len < 2 || rest.len() < attr_len {
                    return Err(EapError::Short {
                        needed: attr_len.max(2),
                        actual: rest.len(),
                    });
                }
                attributes.push(Attribute::decode(rest[0], &rest[2..attr_len])?);
                rest = &rest[attr_len..];
            }
        }
        Ok(Self {
            code,
            identifier,
            attributes,
        })
    }
}

/// Pod side of one EAP-AKA exchange, keyed with the LTK.
pub struct EapAkaChallenge {
    milenage: Milenage,
    stored_sqn: u64,
    pod_iv: [u8; 4],
    identifier: Option<u8>,
    pdm_iv: Option<[u8; 4]>,
    res: Option<[u8; 8]>,
    ck: Option<[u8; 16]>,
    sqn: Option<u64>,
    keys: Option<SessionKeys>,
    next_seq: u8,
}

impl EapAkaChallenge {
    pub fn new(ltk: &[u8; 16], stored_sqn: u64) -> Self {
        Self::with_iv(ltk, stored_sqn, random_bytes())
    }

    pub fn with_iv(ltk: &[u8; 16], stored_sqn: u64, pod_iv: [u8; 4]) -> Self {
        Self {
            milenage: Milenage::new(ltk),
            stored_sqn,
            pod_iv,
            identifier: None,
            pdm_iv: None,
            res: None,
            ck: None,
            sqn: None,
            keys: None,
            next_seq: 1,
        }
    }

    /// Validate AUTN against RAND and remember the values the response needs.
    pub fn parse_challenge(&mut self, msg: &Message) -> Result<(), EapError> {
        let packet = session_packet(msg)?;
        if packet.code != EapCode::Request {
            return Err(EapError::UnexpectedCode(packet.code));
        }
        let mut rand = None;
        let mut autn = None;
        let mut iv = None;
        for attr in packet.attributes {
            match attr {
                Attribute::Rand(v) => rand = Some(v),
                Attribute::Autn(v) => autn = Some(v),
                Attribute::CustomIv(v) => iv = Some(v),
                other => debug!(?other, "ignoring EAP attribute"),
            }
        }
        let rand = rand.ok_or(EapError::MissingAttribute("AT_RAND"))?;
        let autn = autn.ok_or(EapError::MissingAttribute("AT_AUTN"))?;
        let iv = iv.ok_or(EapError::MissingAttribute("AT_CUSTOM_IV"))?;

        let vectors = self.milenage.f2345(&rand);
        let mut sqn_bytes = [0u8; SQN_LEN];
        for i in 0..SQN_LEN {
            sqn_bytes[i] = autn[i] ^ vectors.ak[i];
        }
        let amf = [autn[6], autn[7]];
        let mac = self.milenage.f1(&rand, &sqn_bytes, &amf);
        if mac[..] != autn[8..] {
            return Err(EapError::MacMismatch);
        }
        let sqn = sqn_to_u64(&sqn_bytes);
        if sqn < self.stored_sqn {
            return Err(EapError::SqnBehind {
                received: sqn,
                stored: self.stored_sqn,
            });
        }
        debug!(sqn, "EAP-AKA challenge accepted");
        self.identifier = Some(packet.identifier);
        self.pdm_iv = Some(iv);
        self.res = Some(vectors.res);
        self.ck = Some(vectors.ck);
        self.sqn = Some(sqn);
        Ok(())
    }

    pub fn generate_challenge_response(&mut self, request: &Message) -> Result<Message, EapError> {
        let (identifier, res) = match (self.identifier, self.res) {
            (Some(id), Some(res)) => (id, res),
            _ => return Err(EapError::NotComplete),
        };
        let packet = EapPacket {
            code: EapCode::Response,
            identifier,
            attributes: vec![Attribute::Res(res), Attribute::CustomIv(self.pod_iv)],
        };
        let msg = request.reply(MessageType::SessionEstablishment, self.next_seq, packet.encode());
        self.next_seq = self.next_seq.wrapping_add(1);
        Ok(msg)
    }

    pub fn parse_success(&mut self, msg: &Message) -> Result<(), EapError> {
        let packet = session_packet(msg)?;
        let (identifier, pdm_iv, ck) = match (self.identifier, self.pdm_iv, self.ck) {
            (Some(id), Some(iv), Some(ck)) => (id, iv, ck),
            _ => return Err(EapError::NotComplete),
        };
        match packet.code {
            EapCode::Success => {}
            EapCode::Failure => return Err(EapError::Rejected),
            other => return Err(EapError::UnexpectedCode(other)),
        }
        if packet.identifier != identifier {
            return Err(EapError::IdentifierMismatch {
                expected: identifier,
                got: packet.identifier,
            });
        }
        let mut nonce_prefix = [0u8; 8];
        nonce_prefix[..4].copy_from_slice(&pdm_iv);
        nonce_prefix[4..].copy_from_slice(&self.pod_iv);
        info!(sqn = self.sqn, "EAP-AKA session established");
        debug!(ck = %hex::encode(ck), nonce_prefix = %hex::encode(nonce_prefix), "session keys");
        self.keys = Some(SessionKeys { ck, nonce_prefix });
        Ok(())
    }

    /// CK and nonce prefix, once the success packet has been seen.
    pub fn session_keys(&self) -> Result<SessionKeys, EapError> {
        self.keys.clone().ok_or(EapError::NotComplete)
    }

    /// SQN recovered from the challenge; becomes the persisted EAP-AKA sequence.
    pub fn sqn(&self) -> Result<u64, EapError> {
        self.sqn.ok_or(EapError::NotComplete)
    }
}

fn session_packet(msg: &Message) -> Result<EapPacket, EapError> {
    if msg.message_type != MessageType::SessionEstablishment {
        return Err(EapError::WrongType(msg.message_type));
    }
    EapPacket::decode(&msg.payload)
}

pub fn sqn_to_u64(bytes: &[u8; SQN_LEN]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| acc << 8 | b as u64)
}

pub fn sqn_to_bytes(sqn: u64) -> [u8; SQN_LEN] {
    let be = sqn.to_be_bytes();
    to_array(&be[2..])
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EapError {
    #[error("EAP packet too short: need {needed} bytes, got {actual}")]
    Short { needed: usize, actual: usize },
    #[error("unknown EAP code {0}")]
    UnknownCode(u8),
    #[error("unsupported EAP type {eap_type:#04x} subtype {subtype:#04x}")]
    UnsupportedType { eap_type: u8, subtype: u8 },
    #[error("unexpected EAP code {0:?}")]
    UnexpectedCode(EapCode),
    #[error("session establishment message has packet type {0:?}")]
    WrongType(MessageType),
    #[error("EAP-AKA challenge is missing {0}")]
    MissingAttribute(&'static str),
    #[error("AUTN MAC does not verify")]
    MacMismatch,
    #[error("SQN {received} is behind the stored {stored}")]
    SqnBehind { received: u64, stored: u64 },
    #[error("EAP identifier mismatch: expected {expected}, got {got}")]
    IdentifierMismatch { expected: u8, got: u8 },
    #[error("PDM sent EAP failure")]
    Rejected,
    #[error("EAP-AKA exchange not complete")]
    NotComplete,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::milenage::POD_AMF;

    /// PDM side of EAP-AKA for tests: builds challenges for a given LTK and SQN.
    pub(crate) struct TestPdm {
        milenage: Milenage,
        pub(crate) rand: [u8; 16],
        pub(crate) iv: [u8; 4],
        pub(crate) identifier: u8,
    }

    impl TestPdm {
        pub(crate) fn new(ltk: &[u8; 16]) -> Self {
            Self {
                milenage: Milenage::new(ltk),
                rand: random_bytes(),
                iv: random_bytes(),
                identifier: 0x42,
            }
        }

        fn packet(&self, payload: Vec<u8>) -> Message {
            Message::new(MessageType::SessionEstablishment, 0x1092, 0x1093, payload)
        }

        pub(crate) fn challenge(&self, sqn: u64) -> Message {
            let vectors = self.milenage.f2345(&self.rand);
            let sqn_bytes = sqn_to_bytes(sqn);
            let mac = self.milenage.f1(&self.rand, &sqn_bytes, &POD_AMF);
            let mut autn = [0u8; 16];
            for i in 0..SQN_LEN {
                autn[i] = sqn_bytes[i] ^ vectors.ak[i];
            }
            autn[6..8].copy_from_slice(&POD_AMF);
            autn[8..].copy_from_slice(&mac);
            let packet = EapPacket {
                code: EapCode::Request,
                identifier: self.identifier,
                attributes: vec![
                    Attribute::Rand(self.rand),
                    Attribute::Autn(autn),
                    Attribute::CustomIv(self.iv),
                ],
            };
            self.packet(packet.encode())
        }

        pub(crate) fn success(&self) -> Message {
            let packet = EapPacket {
                code: EapCode::Success,
                identifier: self.identifier,
                attributes: vec![],
            };
            self.packet(packet.encode())
        }

        /// Checks the pod's RES and returns the keys the pod should have derived.
        pub(crate) fn expected_keys(&self, response: &Message) -> SessionKeys {
            let vectors = self.milenage.f2345(&self.rand);
            let packet = EapPacket::decode(&response.payload).unwrap();
            assert_eq!(packet.code, EapCode::Response);
            assert!(packet.attributes.contains(&Attribute::Res(vectors.res)));
            let pod_iv = packet
                .attributes
                .iter()
                .find_map(|a| match a {
                    Attribute::CustomIv(v) => Some(*v),
                    _ => None,
                })
                .unwrap();
            let mut nonce_prefix = [0u8; 8];
            nonce_prefix[..4].copy_from_slice(&self.iv);
            nonce_prefix[4..].copy_from_slice(&pod_iv);
            SessionKeys {
                ck: vectors.ck,
                nonce_prefix,
            }
        }
    }

    const LTK: [u8; 16] = [0x5a; 16];

    #[test]
    fn attribute_layout() {
        let packet = EapPacket {
            code: EapCode::Response,
            identifier: 7,
            attributes: vec![Attribute::Res([9; 8]), Attribute::CustomIv([1, 2, 3, 4])],
        };
        let bytes = packet.encode();
        assert_eq!(&bytes[..8], &[2, 7, 0, 28, 0x17, 0x01, 0, 0]);
        assert_eq!(&bytes[8..12], &[3, 3, 0x00, 0x40]);
        assert_eq!(&bytes[20..24], &[126, 2, 0, 0]);
        assert_eq!(&bytes[24..], &[1, 2, 3, 4]);
        assert_eq!(EapPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn success_packet_is_header_only() {
        let bytes = EapPacket {
            code: EapCode::Success,
            identifier: 3,
            attributes: vec![],
        }
        .encode();
        assert_eq!(bytes, vec![3, 3, 0, 4]);
    }

    #[test]
    fn challenge_then_success_derives_keys() {
        let pdm = TestPdm::new(&LTK);
        let mut pod = EapAkaChallenge::new(&LTK, 1);
        let challenge = pdm.challenge(33);
        pod.parse_challenge(&challenge).unwrap();
        let response = pod.generate_challenge_response(&challenge).unwrap();
        assert_eq!(response.message_type, MessageType::SessionEstablishment);
        let expected = pdm.expected_keys(&response);
        pod.parse_success(&pdm.success()).unwrap();
        assert_eq!(pod.session_keys().unwrap(), expected);
        assert_eq!(pod.sqn().unwrap(), 33);
    }

    #[test]
    fn wrong_ltk_fails_mac() {
        let pdm = TestPdm::new(&[0x11; 16]);
        let mut pod = EapAkaChallenge::new(&LTK, 1);
        assert_eq!(pod.parse_challenge(&pdm.challenge(5)), Err(EapError::MacMismatch));
    }

    #[test]
    fn sqn_behind_stored_is_rejected() {
        let pdm = TestPdm::new(&LTK);
        let mut pod = EapAkaChallenge::new(&LTK, 10);
        assert_eq!(
            pod.parse_challenge(&pdm.challenge(9)),
            Err(EapError::SqnBehind { received: 9, stored: 10 })
        );
        let mut pod = EapAkaChallenge::new(&LTK, 10);
        assert!(pod.parse_challenge(&pdm.challenge(10)).is_ok());
    }

    #[test]
    fn failure_packet_rejects_session() {
        let pdm = TestPdm::new(&LTK);
        let mut pod = EapAkaChallenge::new(&LTK, 1);
        pod.parse_challenge(&pdm.challenge(2)).unwrap();
        let failure = pdm.packet(
            EapPacket {
                code: EapCode::Failure,
                identifier: pdm.identifier,
                attributes: vec![],
            }
            .encode(),
        );
        assert_eq!(pod.parse_success(&failure), Err(EapError::Rejected));
        assert_eq!(pod.session_keys(), Err(EapError::NotComplete));
    }

    #[test]
    fn success_before_challenge_is_refused() {
        let pdm = TestPdm::new(&LTK);
        let mut pod = EapAkaChallenge::new(&LTK, 1);
        assert_eq!(pod.parse_success(&pdm.success()), Err(EapError::NotComplete));
    }

    #[test]
    fn missing_attribute() {
        let pdm = TestPdm::new(&LTK);
        let mut pod = EapAkaChallenge::new(&LTK, 1);
        let packet = EapPacket {
            code: EapCode::Request,
            identifier: 1,
            attributes: vec![Attribute::Rand([0; 16])],
        };
        assert_eq!(
            pod.parse_challenge(&pdm.packet(packet.encode())),
            Err(EapError::MissingAttribute("AT_AUTN"))
        );
    }

    #[test]
    fn sqn_byte_conversion() {
        assert_eq!(sqn_to_bytes(0x0102_0304_0506), [1, 2, 3, 4, 5, 6]);
        assert_eq!(sqn_to_u64(&[0, 0, 0, 0, 1, 0]), 256);
    }
}
