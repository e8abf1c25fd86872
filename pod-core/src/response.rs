//! Pod responses: byte templates patched with live state, plus the packet they travel in.

use serde::{Deserialize, Serialize};

use crate::frame::{wrap_response, FrameError, PodMessage};
use crate::message::{Message, MessageType};

/// Lifecycle stage reported in every status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum PodProgress {
    #[default]
    Uninitiated = 0,
    MemoryInitialized = 1,
    ReminderInitialized = 2,
    PairingCompleted = 3,
    Priming = 4,
    PrimingCompleted = 5,
    BasalInitialized = 6,
    InsertingCannula = 7,
    RunningAbove50U = 8,
    RunningBelow50U = 9,
    ActivationTimeExceeded = 14,
    Deactivated = 15,
}

impl PodProgress {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Progress byte reported while a fault is active.
pub const PROGRESS_FAULT: u8 = 13;

/// Reservoir readings above 50 U (in 0.05 U pulses) are reported as the sentinel.
pub const RESERVOIR_MAX_REPORTED: u16 = 1000;
pub const RESERVOIR_SENTINEL: u16 = 0x3ff;

/// Live values shared by GeneralStatus and DetailedStatus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub progress: PodProgress,
    pub last_prog_seq_num: u8,
    pub reservoir: u16,
    pub alerts: u8,
    pub bolus_active: bool,
    pub temp_basal_active: bool,
    pub basal_active: bool,
    pub extended_bolus_active: bool,
    pub delivered: u16,
    pub bolus_remaining: u16,
    pub minutes_active: u16,
    pub fault_event: u8,
    pub fault_time: u16,
}

impl StatusSnapshot {
    /// Extended bolus masks bolus; temp basal masks basal.
    pub fn delivery_bits(&self) -> u8 {
        let mut bits = 0;
        if self.extended_bolus_active {
            bits |= 0b1000;
        } else if self.bolus_active {
            bits |= 0b0100;
        }
        if self.temp_basal_active {
            bits |= 0b0010;
        } else if self.basal_active {
            bits |= 0b0001;
        }
        bits
    }

    pub fn progress_byte(&self) -> u8 {
        if self.fault_event == 0 {
            self.progress.as_byte()
        } else {
            PROGRESS_FAULT
        }
    }

    pub fn reported_reservoir(&self) -> u16 {
        if self.reservoir <= RESERVOIR_MAX_REPORTED {
            self.reservoir
        } else {
            RESERVOIR_SENTINEL
        }
    }
}

/// Activation date as reported by the type 5 status (local wall clock fields).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivationStamp {
    pub month: u8,
    pub day: u8,
    pub year: u8,
    pub hour: u8,
    pub minute: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    GeneralStatus(StatusSnapshot),
    DetailedStatus(StatusSnapshot),
    Type1Status {
        trigger_times: [u16; 8],
    },
    Type3Status {
        fault_event: u8,
        fault_time: u16,
        minutes_active: u16,
    },
    Type5Status {
        fault_event: u8,
        fault_time: u16,
        activation: ActivationStamp,
    },
    Version {
        progress: PodProgress,
        unique_id: [u8; 4],
    },
    SetupVersion {
        progress: PodProgress,
        unique_id: [u8; 4],
    },
}

// GeneralStatus: 1d SS w1 w2
const GENERAL_TYPE: u8 = 0x1d;
const GENERAL_LEN: usize = 10;

// DetailedStatus: 02 16 02 0J 0K LLLL MM NNNN PP QQQQ RRRR SSSS TT UU VV WW XX YYYY
const DETAILED_TEMPLATE: [u8; 24] = [
    0x02, 0x16, 0x02, 0x08, 0x02, 0x00, 0x00, 0x00, 0x01, 0xb2, 0x00, 0x00, 0x00, 0x03, 0xff, 0x01,
    0xcc, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
const DETAILED_PROGRESS: usize = 3;
const DETAILED_DELIVERY: usize = 4;
const DETAILED_BOLUS_REMAINING: usize = 5;
const DETAILED_LAST_PROG_SEQ: usize = 7;
const DETAILED_DELIVERED: usize = 8;
const DETAILED_FAULT_EVENT: usize = 10;
const DETAILED_FAULT_TIME: usize = 11;
const DETAILED_RESERVOIR: usize = 13;
const DETAILED_MINUTES: usize = 15;
const DETAILED_ALERTS: usize = 17;
const DETAILED_PREVIOUS_PROGRESS: usize = 19;

// Type1: 02 13 01 XXXX then eight trigger times
const TYPE1_TEMPLATE: [u8; 21] = [
    0x02, 0x13, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];
const TYPE1_TRIGGER_TIMES: usize = 5;

// Type3: 02 LL 03 PP QQQQ SSSS then an opaque pulse log
const TYPE3_TEMPLATE: [u8; 250] = [
    0x02, 0xf8, 0x03, 0x00, 0x00, 0x00, 0x0d, 0x4c, 0x04, 0x3c, 0x28, 0x73, 0x31, 0x00, 0x2d, 0x73,
    0x3b, 0x00, 0x30, 0x72, 0x32, 0x00, 0x35, 0x73, 0x3b, 0x00, 0x38, 0x72, 0x32, 0x00, 0x3d, 0x73,
    0x3b, 0x00, 0x40, 0x72, 0x32, 0x00, 0x45, 0x72, 0x3d, 0x00, 0x48, 0x72, 0x32, 0x00, 0x4d, 0x72,
    0x3c, 0x00, 0x50, 0x72, 0x33, 0x00, 0x55, 0x72, 0x3e, 0x00, 0x58, 0x72, 0x35, 0x80, 0x5d, 0x73,
    0x3d, 0x80, 0x60, 0x73, 0x34, 0x80, 0x01, 0x71, 0x3e, 0x80, 0x04, 0x50, 0x33, 0x80, 0x09, 0x50,
    0x3c, 0x80, 0x0c, 0x50, 0x33, 0x80, 0x11, 0x51, 0x3b, 0x80, 0x14, 0x75, 0x32, 0x80, 0x19, 0x72,
    0x3a, 0x80, 0x1c, 0x72, 0x32, 0x80, 0x21, 0x72, 0x3b, 0x00, 0x24, 0x72, 0x33, 0x00, 0x29, 0x73,
    0x3f, 0x00, 0x2c, 0x73, 0x34, 0x00, 0x31, 0x72, 0x40, 0x00, 0x34, 0x72, 0x35, 0x00, 0x39, 0x72,
    0x40, 0x00, 0x3c, 0x73, 0x34, 0x00, 0x41, 0x72, 0x41, 0x00, 0x44, 0x73, 0x34, 0x00, 0x49, 0x73,
    0x3e, 0x00, 0x4c, 0x73, 0x33, 0x00, 0x51, 0x73, 0x3d, 0x00, 0x54, 0x73, 0x33, 0x00, 0x59, 0x73,
    0x3f, 0x80, 0x5c, 0x73, 0x34, 0x80, 0x61, 0x71, 0x3e, 0x80, 0x00, 0x74, 0x33, 0x80, 0x05, 0x72,
    0x3d, 0x80, 0x08, 0x72, 0x33, 0x80, 0x0d, 0x72, 0x3d, 0x80, 0x10, 0x73, 0x33, 0x80, 0x15, 0x73,
    0x3c, 0x80, 0x18, 0x73, 0x34, 0x80, 0x1d, 0x72, 0x3d, 0x80, 0x20, 0x73, 0x34, 0x00, 0x25, 0x72,
    0x40, 0x00, 0x28, 0x73, 0x36, 0x00, 0x2d, 0x72, 0x41, 0x00, 0x30, 0x72, 0x37, 0x00, 0x35, 0x73,
    0x41, 0x00, 0x38, 0x73, 0x37, 0x00, 0x3d, 0x72, 0x43, 0x00, 0x40, 0x72, 0x38, 0x00, 0x45, 0x72,
    0x44, 0x00, 0x48, 0x72, 0x38, 0x00, 0x4d, 0x71, 0x43, 0x00,];
const TYPE3_FAULT_EVENT: usize = 3;
const TYPE3_FAULT_TIME: usize = 4;
const TYPE3_MINUTES: usize = 6;

// Type5: 02 11 05 PP QQQQ 00000000 00000000 MMDDYYHHMM
const TYPE5_TEMPLATE: [u8; 19] = [
    0x02, 0x11, 0x05, 0x1c, 0x12, 0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0b, 0x19,
    0x17, 0x10, 0x0c,
];
const TYPE5_FAULT_EVENT: usize = 3;
const TYPE5_FAULT_TIME: usize = 4;
const TYPE5_ACTIVATION: usize = 14;

// Version: 01 15 MXMYMZ IXIYIZ ID 0J LLLLLLLL TTTTTTTT GS IIIIIIII
const VERSION_TEMPLATE: [u8; 23] = [
    0x01, 0x15, 0x04, 0x0a, 0x00, 0x01, 0x03, 0x00, 0x04, 0x02, 0x08, 0x14, 0x6d, 0xb1, 0x00, 0x06,
    0xe4, 0x51, 0x00, 0xff, 0xff, 0xff, 0xff,
];
const VERSION_PROGRESS: usize = 9;
const VERSION_UNIQUE_ID: usize = 19;

// SetupVersion: 01 1b 13881008340a50 MXMYMZ IXIYIZ ID 0J LLLLLLLL TTTTTTTT IIIIIIII
const SETUP_TEMPLATE: [u8; 29] = [
    0x01, 0x1b, 0x13, 0x88, 0x10, 0x08, 0x34, 0x0a, 0x50, 0x04, 0x0a, 0x00, 0x01, 0x03, 0x00, 0x04,
    0x03, 0x08, 0x14, 0x6d, 0xb1, 0x00, 0x06, 0xe4, 0x51, 0xff, 0xff, 0xff, 0xff,
];
const SETUP_PROGRESS: usize = 16;
const SETUP_UNIQUE_ID: usize = 25;

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

impl Response {
    /// Response body bytes. Total over valid field values.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::GeneralStatus(s) => encode_general(s),
            Response::DetailedStatus(s) => encode_detailed(s),
            Response::Type1Status { trigger_times } => {
                let mut out = TYPE1_TEMPLATE.to_vec();
                for (i, t) in trigger_times.iter().enumerate() {
                    put_u16(&mut out, TYPE1_TRIGGER_TIMES + 2 * i, *t);
                }
                out
            }
            Response::Type3Status {
                fault_event,
                fault_time,
                minutes_active,
            } => {
                let mut out = TYPE3_TEMPLATE.to_vec();
                out[TYPE3_FAULT_EVENT] = *fault_event;
                put_u16(&mut out, TYPE3_FAULT_TIME, *fault_time);
                put_u16(&mut out, TYPE3_MINUTES, *minutes_active);
                out
            }
            Response::Type5Status {
                fault_event,
                fault_time,
                activation,
            } => {
                let mut out = TYPE5_TEMPLATE.to_vec();
                out[TYPE5_FAULT_EVENT] = *fault_event;
                put_u16(&mut out, TYPE5_FAULT_TIME, *fault_time);
                out[TYPE5_ACTIVATION..TYPE5_ACTIVATION + 5].copy_from_slice(&[
                    activation.month,
                    activation.day,
                    activation.year,
                    activation.hour,
                    activation.minute,
                ]);
                out
            }
            Response::Version {
                progress,
                unique_id,
            } => {
                let mut out = VERSION_TEMPLATE.to_vec();
                out[VERSION_PROGRESS] = progress.as_byte();
                out[VERSION_UNIQUE_ID..VERSION_UNIQUE_ID + 4].copy_from_slice(unique_id);
                out
            }
            Response::SetupVersion {
                progress,
                unique_id,
            } => {
                let mut out = SETUP_TEMPLATE.to_vec();
                out[SETUP_PROGRESS] = progress.as_byte();
                out[SETUP_UNIQUE_ID..SETUP_UNIQUE_ID + 4].copy_from_slice(unique_id);
                out
            }
        }
    }

    /// Wrap the encoded body in a pod message and an (unencrypted) transport packet.
    pub fn marshal(&self, meta: &ResponseMetadata) -> Result<Message, FrameError> {
        let pod_message = PodMessage {
            unique_id: meta.request_id,
            seq: meta.cmd_seq,
            body: self.encode(),
        }
        .encode()?;
        let mut msg = Message::new(
            MessageType::Encrypted,
            meta.source,
            meta.destination,
            wrap_response(&pod_message)?,
        );
        msg.sequence_number = meta.msg_seq;
        msg.ack_number = meta.ack_seq;
        Ok(msg)
    }
}

fn encode_general(s: &StatusSnapshot) -> Vec<u8> {
    let w1 = (s.delivered as u32 & 0x1fff) << 15
        | (s.last_prog_seq_num as u32 & 0x0f) << 11
        | (s.bolus_remaining as u32 & 0x07ff);
    let w2 = (s.alerts as u32) << 23
        | (s.minutes_active as u32 & 0x1fff) << 10
        | (s.reported_reservoir() as u32 & 0x03ff);
    let mut out = Vec::with_capacity(GENERAL_LEN);
    out.push(GENERAL_TYPE);
    out.push(s.delivery_bits() << 4 | (s.progress_byte() & 0x0f));
    out.extend_from_slice(&w1.to_be_bytes());
    out.extend_from_slice(&w2.to_be_bytes());
    out
}

fn encode_detailed(s: &StatusSnapshot) -> Vec<u8> {
    let mut out = DETAILED_TEMPLATE.to_vec();
    out[DETAILED_PROGRESS] = s.progress_byte();
    out[DETAILED_DELIVERY] = s.delivery_bits();
    put_u16(&mut out, DETAILED_BOLUS_REMAINING, s.bolus_remaining);
    out[DETAILED_LAST_PROG_SEQ] = s.last_prog_seq_num;
    put_u16(&mut out, DETAILED_DELIVERED, s.delivered);
    out[DETAILED_FAULT_EVENT] = s.fault_event;
    put_u16(&mut out, DETAILED_FAULT_TIME, s.fault_time);
    put_u16(&mut out, DETAILED_RESERVOIR, s.reported_reservoir());
    put_u16(&mut out, DETAILED_MINUTES, s.minutes_active);
    out[DETAILED_ALERTS] = s.alerts;
    if s.fault_event != 0 {
        out[DETAILED_PREVIOUS_PROGRESS] = s.progress.as_byte() & 0x0f;
        if s.bolus_active {
            out[DETAILED_PREVIOUS_PROGRESS] |= 0b0001_0000;
        }
    }
    out
}

/// Addressing and sequence numbers for one response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMetadata {
    pub source: u32,
    pub destination: u32,
    pub msg_seq: u8,
    pub ack_seq: u8,
    pub cmd_seq: u8,
    pub request_id: [u8; 4],
}
