//! Pod commands: decode the first block of a pod message body into a typed command.

use tracing::debug;

use crate::frame::{PodMessage, UNASSIGNED_ID};
use crate::response::{PodProgress, Response};

pub const GET_VERSION: u8 = 0x07;
pub const SET_UNIQUE_ID: u8 = 0x03;
pub const GET_STATUS: u8 = 0x0e;
pub const SILENCE_ALERTS: u8 = 0x11;
pub const PROGRAM_ALERTS: u8 = 0x19;
pub const PROGRAM_INSULIN: u8 = 0x1a;
pub const DEACTIVATE: u8 = 0x1c;
pub const PROGRAM_BEEPS: u8 = 0x1e;
pub const STOP_DELIVERY: u8 = 0x1f;
pub const FAULT_CONFIG: u8 = 0x08;

/// Insulin table selected by ProgramInsulin.
pub const TABLE_BASAL: u8 = 0;
pub const TABLE_TEMP_BASAL: u8 = 1;
pub const TABLE_BOLUS: u8 = 2;

/// Alert groups in ProgramAlerts: 6 bytes each, first one at offset 5.
const ALERT_GROUP_LEN: usize = 6;
const ALERT_GROUP_OFFSET: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    GetVersion { id: [u8; 4] },
    SetUniqueId { id: [u8; 4] },
    GetStatus { request_type: u8 },
    SilenceAlerts { alert_mask: u8 },
    ProgramAlerts { alert_mask: u8 },
    ProgramInsulin { table_num: u8, duration: u8, pulses: u16 },
    StopDelivery { stop_bolus: bool, stop_temp_basal: bool, stop_basal: bool },
    Deactivate,
    FaultConfig,
    ProgramBeeps,
}

/// A decoded command together with the header of the pod message that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub seq: u8,
    pub request_id: [u8; 4],
    pub kind: CommandKind,
}

impl Command {
    /// Decode the command in the first block of `msg.body`.
    pub fn from_pod_message(msg: &PodMessage) -> Result<Self, CommandError> {
        let (&command_type, data) = msg.body.split_first().ok_or(CommandError::Empty)?;
        let kind = CommandKind::decode(command_type, data)?;
        debug!(command_type, seq = msg.seq, ?kind, "decoded command");
        Ok(Self {
            seq: msg.seq,
            request_id: msg.unique_id,
            kind,
        })
    }

    pub fn command_type(&self) -> u8 {
        self.kind.command_type()
    }

    pub fn mutates_state(&self) -> bool {
        self.kind.mutates_state()
    }

    /// Extra bytes the host acts on; the assigned id for SetUniqueID.
    pub fn payload(&self) -> Option<&[u8]> {
        match &self.kind {
            CommandKind::SetUniqueId { id } => Some(id),
            _ => None,
        }
    }

    /// Commands answered with a fixed response instead of a status built from pod state.
    pub fn hardcoded_response(&self) -> Option<Response> {
        match self.kind {
            CommandKind::GetVersion { .. } => Some(Response::Version {
                progress: PodProgress::ReminderInitialized,
                unique_id: UNASSIGNED_ID,
            }),
            CommandKind::SetUniqueId { id } => Some(Response::SetupVersion {
                progress: PodProgress::PairingCompleted,
                unique_id: id,
            }),
            _ => None,
        }
    }
}

impl CommandKind {
    /// `data` is everything after the type byte; `data[0]` is the block length.
    pub fn decode(command_type: u8, data: &[u8]) -> Result<Self, CommandError> {
        let kind = match command_type {
            GET_VERSION => {
                need(command_type, data, 5)?;
                CommandKind::GetVersion { id: id_at(data, 1) }
            }
            SET_UNIQUE_ID => {
                need(command_type, data, 5)?;
                CommandKind::SetUniqueId { id: id_at(data, 1) }
            }
            GET_STATUS => {
                need(command_type, data, 1)?;
                let request_type = if data[0] == 0 {
                    0
                } else {
                    need(command_type, data, 2)?;
                    data[1]
                };
                CommandKind::GetStatus { request_type }
            }
            SILENCE_ALERTS => {
                need(command_type, data, 6)?;
                CommandKind::SilenceAlerts { alert_mask: data[5] }
            }
            PROGRAM_ALERTS => CommandKind::ProgramAlerts {
                alert_mask: decode_alert_mask(data)?,
            },
            PROGRAM_INSULIN => {
                need(command_type, data, 13)?;
                CommandKind::ProgramInsulin {
                    table_num: data[5],
                    duration: data[8],
                    pulses: u16::from_be_bytes([data[11], data[12]]),
                }
            }
            STOP_DELIVERY => {
                need(command_type, data, 6)?;
                let bits = data[5];
                CommandKind::StopDelivery {
                    stop_bolus: bits & 0b100 != 0,
                    stop_temp_basal: bits & 0b010 != 0,
                    stop_basal: bits & 0b001 != 0,
                }
            }
            DEACTIVATE => {
                need(command_type, data, 5)?;
                CommandKind::Deactivate
            }
            FAULT_CONFIG => CommandKind::FaultConfig,
            PROGRAM_BEEPS => CommandKind::ProgramBeeps,
            other => return Err(CommandError::UnknownType(other)),
        };
        Ok(kind)
    }

    pub fn command_type(&self) -> u8 {
        match self {
            CommandKind::GetVersion { .. } => GET_VERSION,
            CommandKind::SetUniqueId { .. } => SET_UNIQUE_ID,
            CommandKind::GetStatus { .. } => GET_STATUS,
            CommandKind::SilenceAlerts { .. } => SILENCE_ALERTS,
            CommandKind::ProgramAlerts { .. } => PROGRAM_ALERTS,
            CommandKind::ProgramInsulin { .. } => PROGRAM_INSULIN,
            CommandKind::StopDelivery { .. } => STOP_DELIVERY,
            CommandKind::Deactivate => DEACTIVATE,
            CommandKind::FaultConfig => FAULT_CONFIG,
            CommandKind::ProgramBeeps => PROGRAM_BEEPS,
        }
    }

    pub fn mutates_state(&self) -> bool {
        !matches!(
            self,
            CommandKind::GetVersion { .. } | CommandKind::SetUniqueId { .. } | CommandKind::GetStatus { .. }
        )
    }
}

/// Slot index is bits 6..4 of the first byte of each alert group.
fn decode_alert_mask(data: &[u8]) -> Result<u8, CommandError> {
    need(PROGRAM_ALERTS, data, 1)?;
    let declared = data[0] as usize + 1;
    need(PROGRAM_ALERTS, data, declared)?;
    let groups = declared.saturating_sub(ALERT_GROUP_OFFSET) / ALERT_GROUP_LEN;
    let mask = (0..groups)
        .map(|i| (data[ALERT_GROUP_OFFSET + i * ALERT_GROUP_LEN] & 0x70) >> 4)
        .fold(0u8, |mask, slot| mask | 1 << slot);
    Ok(mask)
}

fn need(command: u8, data: &[u8], expected: usize) -> Result<(), CommandError> {
    if data.len() < expected {
        return Err(CommandError::Malformed {
            command,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn id_at(data: &[u8], offset: usize) -> [u8; 4] {
    [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command {command:#04x} too short: expected {expected} bytes, got {actual}")]
    Malformed {
        command: u8,
        expected: usize,
        actual: usize,
    },
    #[error("unknown command type {0:#04x}")]
    UnknownType(u8),
    #[error("empty pod message body")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_hex(command_type: u8, data: &str) -> Result<CommandKind, CommandError> {
        CommandKind::decode(command_type, &hex::decode(data).unwrap())
    }

    #[test]
    fn program_alerts_mask() {
        let kind = decode_hex(
            PROGRAM_ALERTS,
            "1c494e532e2800125e060f38000b56030f4c0001ea010f79a410ba050f",
        )
        .unwrap();
        assert_eq!(kind, CommandKind::ProgramAlerts { alert_mask: 0x9c });
    }

    #[test]
    fn program_alerts_duplicate_slots_collapse() {
        // two groups, both slot 5
        let kind = decode_hex(PROGRAM_ALERTS, "1000000000500000000000500000000000").unwrap();
        assert_eq!(kind, CommandKind::ProgramAlerts { alert_mask: 0x20 });
    }

    #[test]
    fn program_alerts_shorter_than_declared() {
        let err = decode_hex(PROGRAM_ALERTS, "1c494e532e28").unwrap_err();
        assert_eq!(
            err,
            CommandError::Malformed {
                command: PROGRAM_ALERTS,
                expected: 29,
                actual: 6
            }
        );
    }

    #[test]
    fn program_insulin_fields() {
        // bolus of 0x0064 pulses
        let kind = decode_hex(PROGRAM_INSULIN, "0e494e532e02010a01006400640064").unwrap();
        assert_eq!(
            kind,
            CommandKind::ProgramInsulin {
                table_num: TABLE_BOLUS,
                duration: 0x01,
                pulses: 0x64
            }
        );
        assert!(matches!(
            decode_hex(PROGRAM_INSULIN, "0e494e532e02"),
            Err(CommandError::Malformed { expected: 13, actual: 6, .. })
        ));
    }

    #[test]
    fn get_status_request_type() {
        assert_eq!(
            decode_hex(GET_STATUS, "0103").unwrap(),
            CommandKind::GetStatus { request_type: 3 }
        );
        assert_eq!(
            decode_hex(GET_STATUS, "00").unwrap(),
            CommandKind::GetStatus { request_type: 0 }
        );
        assert!(decode_hex(GET_STATUS, "").is_err());
    }

    #[test]
    fn stop_delivery_bits() {
        assert_eq!(
            decode_hex(STOP_DELIVERY, "05494e532e65").unwrap(),
            CommandKind::StopDelivery {
                stop_bolus: true,
                stop_temp_basal: false,
                stop_basal: true
            }
        );
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert_eq!(decode_hex(0x42, "00"), Err(CommandError::UnknownType(0x42)));
    }

    #[test]
    fn set_unique_id_payload_and_response() {
        let msg = PodMessage {
            unique_id: UNASSIGNED_ID,
            seq: 2,
            body: hex::decode("031300000abc1404").unwrap(),
        };
        let cmd = Command::from_pod_message(&msg).unwrap();
        assert_eq!(cmd.seq, 2);
        assert_eq!(cmd.payload(), Some(&[0x00, 0x00, 0x0a, 0xbc][..]));
        assert!(!cmd.mutates_state());
        assert_eq!(
            cmd.hardcoded_response(),
            Some(Response::SetupVersion {
                progress: PodProgress::PairingCompleted,
                unique_id: [0x00, 0x00, 0x0a, 0xbc]
            })
        );
    }

    #[test]
    fn mutation_flags() {
        assert!(!CommandKind::GetStatus { request_type: 0 }.mutates_state());
        assert!(CommandKind::Deactivate.mutates_state());
        assert!(CommandKind::ProgramBeeps.mutates_state());
        assert!(CommandKind::SilenceAlerts { alert_mask: 1 }.mutates_state());
    }
}
