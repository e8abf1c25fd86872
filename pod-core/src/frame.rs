//! Inner envelopes: string-length-prefix encoding, pod messages and their CRC.

const COMMAND_PREFIX: &[u8] = b"S0.0=";
const COMMAND_SUFFIX: &[u8] = b",G0.0";
const RESPONSE_PREFIX: &[u8] = b"0.0=";

/// Unique id (4) + sequence/length (2).
const POD_HEADER_LEN: usize = 6;
const CRC_LEN: usize = 2;
const MAX_BODY_LEN: usize = 0x3ff;

/// Unique id of a pod before SetUniqueID.
pub const UNASSIGNED_ID: [u8; 4] = [0xff; 4];

/// One addressed pod message: id, 4-bit sequence, body, CRC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMessage {
    pub unique_id: [u8; 4],
    pub seq: u8,
    pub body: Vec<u8>,
}

impl PodMessage {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let len = self.body.len();
        if len > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLong(len));
        }
        let mut out = Vec::with_capacity(POD_HEADER_LEN + len + CRC_LEN);
        out.extend_from_slice(&self.unique_id);
        out.push((self.seq & 0x0f) << 2 | (len >> 8) as u8);
        out.push((len & 0xff) as u8);
        out.extend_from_slice(&self.body);
        let crc = crc16(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < POD_HEADER_LEN + CRC_LEN {
            return Err(FrameError::Short {
                needed: POD_HEADER_LEN + CRC_LEN,
                actual: bytes.len(),
            });
        }
        let len = ((bytes[4] & 0x03) as usize) << 8 | bytes[5] as usize;
        let end = POD_HEADER_LEN + len;
        if bytes.len() < end + CRC_LEN {
            return Err(FrameError::Short {
                needed: end + CRC_LEN,
                actual: bytes.len(),
            });
        }
        let expected = crc16(&bytes[..end]);
        let actual = u16::from_be_bytes([bytes[end], bytes[end + 1]]);
        if expected != actual {
            return Err(FrameError::Crc { expected, actual });
        }
        let mut unique_id = [0u8; 4];
        unique_id.copy_from_slice(&bytes[..4]);
        Ok(Self {
            unique_id,
            seq: (bytes[4] >> 2) & 0x0f,
            body: bytes[POD_HEADER_LEN..end].to_vec(),
        })
    }
}

/// `S0.0=` + pod message + `,G0.0`: the plaintext of an encrypted command.
pub fn wrap_command(pod_message: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = encode_keyed(COMMAND_PREFIX, pod_message)?;
    out.extend_from_slice(COMMAND_SUFFIX);
    Ok(out)
}

/// Extract the pod message from a decrypted command.
pub fn unwrap_command(plaintext: &[u8]) -> Result<&[u8], FrameError> {
    let (value, rest) = decode_keyed(COMMAND_PREFIX, plaintext)?;
    if rest != COMMAND_SUFFIX {
        return Err(FrameError::Trailing(rest.len()));
    }
    Ok(value)
}

/// `0.0=` + pod message: the plaintext of an encrypted response.
pub fn wrap_response(pod_message: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_keyed(RESPONSE_PREFIX, pod_message)
}

pub fn unwrap_response(plaintext: &[u8]) -> Result<&[u8], FrameError> {
    let (value, rest) = decode_keyed(RESPONSE_PREFIX, plaintext)?;
    if !rest.is_empty() {
        return Err(FrameError::Trailing(rest.len()));
    }
    Ok(value)
}

/// `key` + u16 BE length + `value`.
pub fn encode_keyed(key: &[u8], value: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = u16::try_from(value.len()).map_err(|_| FrameError::BodyTooLong(value.len()))?;
    let mut out = Vec::with_capacity(key.len() + 2 + value.len());
    out.extend_from_slice(key);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(out)
}

/// Split `key` + length + value off the front of `bytes`; returns value and the remainder.
pub fn decode_keyed<'a>(key: &[u8], bytes: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), FrameError> {
    if !bytes.starts_with(key) {
        return Err(FrameError::MissingKey(String::from_utf8_lossy(key).into_owned()));
    }
    let rest = &bytes[key.len()..];
    if rest.len() < 2 {
        return Err(FrameError::Short {
            needed: key.len() + 2,
            actual: bytes.len(),
        });
    }
    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    if rest.len() < 2 + len {
        return Err(FrameError::Short {
            needed: key.len() + 2 + len,
            actual: bytes.len(),
        });
    }
    Ok((&rest[2..2 + len], &rest[2 + len..]))
}

/// CRC-16/BUYPASS: poly 0x8005, init 0, no reflection, no final xor.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[((crc >> 8) as u8 ^ b) as usize]
    })
}

const CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8005
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("envelope too short: need {needed} bytes, got {actual}")]
    Short { needed: usize, actual: usize },
    #[error("missing envelope key {0:?}")]
    MissingKey(String),
    #[error("{0} unexpected trailing bytes")]
    Trailing(usize),
    #[error("pod message CRC mismatch: expected {expected:04x}, got {actual:04x}")]
    Crc { expected: u16, actual: u16 },
    #[error("body of {0} bytes does not fit")]
    BodyTooLong(usize),
}
