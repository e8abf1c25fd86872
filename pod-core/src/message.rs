//! Pod transport packet: 16-byte header followed by the payload.

/// Length of the packet header. The header doubles as associated data for encryption.
pub const HEADER_LEN: usize = 16;

/// Authentication tag appended to encrypted payloads.
pub const TAG_LEN: usize = 8;

const MAGIC: [u8; 2] = *b"TW";
const MAX_SIZE: usize = 0x7ff;

/// Packet type carried in the low nibble of the second flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Clear = 0,
    Encrypted = 1,
    SessionEstablishment = 2,
    Pairing = 3,
}

impl MessageType {
    fn from_bits(bits: u8) -> Result<Self, MessageError> {
        match bits {
            0 => Ok(MessageType::Clear),
            1 => Ok(MessageType::Encrypted),
            2 => Ok(MessageType::SessionEstablishment),
            3 => Ok(MessageType::Pairing),
            other => Err(MessageError::UnknownType(other)),
        }
    }
}

/// One transport packet. For encrypted packets `payload` holds ciphertext plus tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub source: u32,
    pub destination: u32,
    pub sequence_number: u8,
    pub ack_number: u8,
    pub ack: bool,
    pub version: u8,
    pub sas: bool,
    pub tfs: bool,
    pub eqos: u8,
    pub priority: bool,
    pub last_message: bool,
    pub gateway: bool,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(message_type: MessageType, source: u32, destination: u32, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            source,
            destination,
            sequence_number: 0,
            ack_number: 0,
            ack: false,
            version: 0,
            sas: false,
            tfs: false,
            eqos: 0,
            priority: false,
            last_message: false,
            gateway: false,
            payload,
        }
    }

    /// Answer addressed back to the sender, acknowledging its sequence number.
    pub fn reply(&self, message_type: MessageType, sequence_number: u8, payload: Vec<u8>) -> Self {
        let mut msg = Self::new(message_type, self.destination, self.source, payload);
        msg.sequence_number = sequence_number;
        msg.ack_number = self.sequence_number.wrapping_add(1);
        msg
    }

    /// Size written into the header: the plaintext size, tag excluded.
    pub fn declared_size(&self) -> usize {
        match self.message_type {
            MessageType::Encrypted => self.payload.len().saturating_sub(TAG_LEN),
            _ => self.payload.len(),
        }
    }

    /// Header bytes with an explicit size field.
    pub fn header_with_size(&self, size: usize) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];
        h[..2].copy_from_slice(&MAGIC);
        h[2] = (self.version & 0b111) << 5
            | (self.sas as u8) << 4
            | (self.tfs as u8) << 3
            | (self.eqos & 0b111);
        h[3] = (self.ack as u8) << 7
            | (self.priority as u8) << 6
            | (self.last_message as u8) << 5
            | (self.gateway as u8) << 4
            | (self.message_type as u8 & 0x0f);
        h[4] = self.sequence_number;
        h[5] = self.ack_number;
        h[6] = (size >> 3) as u8;
        h[7] = ((size << 5) & 0xff) as u8;
        h[8..12].copy_from_slice(&self.source.to_be_bytes());
        h[12..16].copy_from_slice(&self.destination.to_be_bytes());
        h
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let size = self.declared_size();
        if size > MAX_SIZE {
            return Err(MessageError::TooLarge(size));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header_with_size(size));
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < HEADER_LEN {
            return Err(MessageError::Short(bytes.len()));
        }
        if bytes[..2] != MAGIC {
            return Err(MessageError::BadMagic([bytes[0], bytes[1]]));
        }
        let message_type = MessageType::from_bits(bytes[3] & 0x0f)?;
        let size = (bytes[6] as usize) << 3 | (bytes[7] as usize) >> 5;
        let payload_len = match message_type {
            MessageType::Encrypted => size + TAG_LEN,
            _ => size,
        };
        let available = bytes.len() - HEADER_LEN;
        if available < payload_len {
            return Err(MessageError::Truncated {
                declared: payload_len,
                actual: available,
            });
        }
        Ok(Self {
            message_type,
            source: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            destination: u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            sequence_number: bytes[4],
            ack_number: bytes[5],
            ack: bytes[3] & 0x80 != 0,
            version: bytes[2] >> 5,
            sas: bytes[2] & 0x10 != 0,
            tfs: bytes[2] & 0x08 != 0,
            eqos: bytes[2] & 0b111,
            priority: bytes[3] & 0x40 != 0,
            last_message: bytes[3] & 0x20 != 0,
            gateway: bytes[3] & 0x10 != 0,
            payload: bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("packet too short: {0} bytes")]
    Short(usize),
    #[error("bad packet magic {0:02x?}")]
    BadMagic([u8; 2]),
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("packet payload truncated: declared {declared}, got {actual}")]
    Truncated { declared: usize, actual: usize },
    #[error("payload of {0} bytes does not fit the size field")]
    TooLarge(usize),
}
