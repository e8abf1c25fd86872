//! Device state machine: command effects on [`PodState`] and response selection.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::command::{Command, CommandKind, TABLE_BASAL, TABLE_BOLUS, TABLE_TEMP_BASAL};
use crate::response::{PodProgress, Response};
use crate::state::PodState;

/// Seconds per pulse while the pod is being set up, and once it is running.
const SETUP_PULSE_SECS: u32 = 1;
const RUNNING_PULSE_SECS: u32 = 2;

/// Temp basal duration unit.
const HALF_HOUR_MINUTES: i64 = 30;

/// One-shot crash injection for exercising recovery after an abrupt stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionControl {
    crash_before: bool,
    crash_after: bool,
}

impl SessionControl {
    /// Arm a crash on the next state-mutating command, before or after it is applied.
    pub fn crash_next_command(&mut self, before: bool) {
        if before {
            self.crash_before = true;
        } else {
            self.crash_after = true;
        }
    }

    pub fn armed(&self) -> bool {
        self.crash_before || self.crash_after
    }
}

/// What the session must do once the response has been built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Followup {
    None,
    RefreshAdvertising([u8; 4]),
    Deactivated,
}

/// The pod: persistent state plus the crash-injection context passed into dispatch.
#[derive(Debug, Clone)]
pub struct Device {
    pub state: PodState,
    pub control: SessionControl,
}

impl Device {
    pub fn new(state: PodState) -> Self {
        Self {
            state,
            control: SessionControl::default(),
        }
    }

    /// Apply a command's effect on pod state.
    pub fn handle_command(&mut self, cmd: &Command, now: DateTime<Utc>) -> Result<(), DeviceError> {
        if cmd.mutates_state() && self.control.crash_before {
            self.control.crash_before = false;
            warn!(seq = cmd.seq, "crashing before processing command");
            return Err(DeviceError::InjectedCrash {
                seq: cmd.seq,
                after: false,
            });
        }

        let state = &mut self.state;
        match cmd.kind {
            CommandKind::GetVersion { .. } => advance_to(state, PodProgress::ReminderInitialized),
            CommandKind::SetUniqueId { .. } => advance_to(state, PodProgress::PairingCompleted),
            CommandKind::GetStatus { .. } => {
                if state.progress == PodProgress::Priming && !state.bolus_active(now) {
                    info!("prime bolus has ended");
                    state.progress = PodProgress::PrimingCompleted;
                }
                if state.progress == PodProgress::InsertingCannula && !state.bolus_active(now) {
                    info!("cannula insert bolus has ended");
                    state.progress = PodProgress::RunningAbove50U;
                }
            }
            CommandKind::SilenceAlerts { alert_mask } | CommandKind::ProgramAlerts { alert_mask } => {
                state.clear_alerts(alert_mask);
            }
            CommandKind::ProgramInsulin {
                table_num,
                duration,
                pulses,
            } => {
                debug!(progress = ?state.progress, table_num, "program insulin");
                state.progress = if state.progress < PodProgress::Priming {
                    PodProgress::Priming
                } else if state.progress < PodProgress::BasalInitialized {
                    PodProgress::BasalInitialized
                } else if state.progress < PodProgress::InsertingCannula {
                    PodProgress::InsertingCannula
                } else if state.progress < PodProgress::RunningAbove50U {
                    PodProgress::RunningAbove50U
                } else {
                    state.progress
                };
                match table_num {
                    TABLE_BASAL => state.basal_active = true,
                    TABLE_TEMP_BASAL => {
                        state.temp_basal_end =
                            Some(now + Duration::minutes(duration as i64 * HALF_HOUR_MINUTES));
                    }
                    TABLE_BOLUS => {
                        state.delivered = state.delivered.saturating_add(pulses);
                        state.reservoir = state.reservoir.saturating_sub(pulses);
                        let interval = if state.progress > PodProgress::InsertingCannula {
                            RUNNING_PULSE_SECS
                        } else {
                            SETUP_PULSE_SECS
                        };
                        state.bolus_pulses = pulses;
                        state.bolus_interval_secs = interval;
                        state.bolus_end =
                            Some(now + Duration::seconds(pulses as i64 * interval as i64));
                    }
                    other => debug!(table_num = other, "unknown insulin table"),
                }
            }
            CommandKind::StopDelivery {
                stop_bolus,
                stop_temp_basal,
                stop_basal,
            } => {
                if stop_bolus {
                    state.extended_bolus_active = false;
                }
                if stop_temp_basal {
                    state.temp_basal_end = None;
                }
                if stop_basal {
                    state.basal_active = false;
                }
            }
            CommandKind::Deactivate | CommandKind::FaultConfig | CommandKind::ProgramBeeps => {}
        }

        if cmd.mutates_state() {
            debug!(seq = cmd.seq, "updating last programmed sequence number");
            self.state.last_prog_seq_num = cmd.seq;
            if self.control.crash_after {
                self.control.crash_after = false;
                warn!(seq = cmd.seq, "crashing after processing command");
                return Err(DeviceError::InjectedCrash {
                    seq: cmd.seq,
                    after: true,
                });
            }
        }
        Ok(())
    }

    /// Select and fill the response for `cmd` from the current state.
    pub fn response_for(&self, cmd: &Command, now: DateTime<Utc>) -> Result<Response, DeviceError> {
        if let Some(rsp) = cmd.hardcoded_response() {
            return Ok(rsp);
        }
        let request_type = match cmd.kind {
            CommandKind::GetStatus { request_type } => request_type,
            _ => 0,
        };
        let s = &self.state;
        let rsp = match request_type {
            0 if s.fault_event == 0 => Response::GeneralStatus(s.snapshot(now)),
            0 | 2 => Response::DetailedStatus(s.snapshot(now)),
            1 => Response::Type1Status {
                trigger_times: s.trigger_times,
            },
            3 => Response::Type3Status {
                fault_event: s.fault_event,
                fault_time: s.fault_time,
                minutes_active: s.minutes_active(now),
            },
            5 => Response::Type5Status {
                fault_event: s.fault_event,
                fault_time: s.fault_time,
                activation: s.activation_stamp(),
            },
            other => return Err(DeviceError::UnsupportedStatusType(other)),
        };
        Ok(rsp)
    }

    /// Effects that must not show in the response they follow.
    pub fn after_response(&mut self, cmd: &Command) -> Followup {
        match cmd.kind {
            CommandKind::SetUniqueId { id } => {
                self.state.unique_id = Some(id);
                Followup::RefreshAdvertising(id)
            }
            CommandKind::StopDelivery {
                stop_bolus: true, ..
            } => {
                self.state.bolus_end = None;
                self.state.bolus_pulses = 0;
                Followup::None
            }
            CommandKind::Deactivate => Followup::Deactivated,
            _ => Followup::None,
        }
    }

    /// Final state once the Deactivate cycle has been acknowledged.
    pub fn deactivate(&mut self) {
        info!("pod deactivated");
        self.state.progress = PodProgress::Deactivated;
    }

    /// Reservoir level in units; stored as 0.05 U pulses.
    pub fn set_reservoir(&mut self, units: f32) {
        let pulses = (units * 20.0).round().clamp(0.0, u16::MAX as f32);
        self.state.reservoir = pulses as u16;
    }

    /// Replace the active alert set; newly set slots trigger now.
    pub fn set_alerts(&mut self, mask: u8, now: DateTime<Utc>) {
        let minutes = self.state.minutes_active(now);
        self.state.active_alert_slots = mask;
        for (slot, time) in self.state.trigger_times.iter_mut().enumerate() {
            if mask & (1 << slot) != 0 {
                *time = minutes;
            }
        }
    }

    pub fn set_fault(&mut self, code: u8, now: DateTime<Utc>) {
        self.state.fault_event = code;
        self.state.fault_time = self.state.minutes_active(now);
    }

    /// Pretend the pod was activated `minutes` ago.
    pub fn set_active_time(&mut self, minutes: i64, now: DateTime<Utc>) {
        self.state.activation_time = now - Duration::minutes(minutes);
    }
}

fn advance_to(state: &mut PodState, progress: PodProgress) {
    state.progress = state.progress.max(progress);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unsupported status request type {0:#04x}")]
    UnsupportedStatusType(u8),
    #[error("injected crash at command {seq} (after processing: {after})")]
    InjectedCrash { seq: u8, after: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn cmd(seq: u8, kind: CommandKind) -> Command {
        Command {
            seq,
            request_id: [0, 0, 0x0a, 0xbc],
            kind,
        }
    }

    fn bolus(pulses: u16) -> CommandKind {
        CommandKind::ProgramInsulin {
            table_num: TABLE_BOLUS,
            duration: 0,
            pulses,
        }
    }

    fn device_at(progress: PodProgress) -> Device {
        let mut state = PodState::fresh(t0());
        state.progress = progress;
        Device::new(state)
    }

    #[test]
    fn setup_sequence_advances_progress() {
        let mut d = device_at(PodProgress::Uninitiated);
        d.handle_command(&cmd(0, CommandKind::GetVersion { id: [0xff; 4] }), t0()).unwrap();
        assert_eq!(d.state.progress, PodProgress::ReminderInitialized);
        d.handle_command(&cmd(1, CommandKind::SetUniqueId { id: [1, 2, 3, 4] }), t0()).unwrap();
        assert_eq!(d.state.progress, PodProgress::PairingCompleted);

        // prime: 52 pulses at one second each
        d.handle_command(&cmd(2, bolus(52)), t0()).unwrap();
        assert_eq!(d.state.progress, PodProgress::Priming);
        assert_eq!(d.state.bolus_end, Some(t0() + Duration::seconds(52)));
        assert_eq!(d.state.last_prog_seq_num, 2);

        let status = CommandKind::GetStatus { request_type: 0 };
        d.handle_command(&cmd(3, status.clone()), t0() + Duration::seconds(30)).unwrap();
        assert_eq!(d.state.progress, PodProgress::Priming);
        d.handle_command(&cmd(4, status.clone()), t0() + Duration::seconds(60)).unwrap();
        assert_eq!(d.state.progress, PodProgress::PrimingCompleted);
        // GetStatus does not record a programming sequence
        assert_eq!(d.state.last_prog_seq_num, 2);

        let basal = CommandKind::ProgramInsulin {
            table_num: TABLE_BASAL,
            duration: 0,
            pulses: 0,
        };
        d.handle_command(&cmd(5, basal), t0()).unwrap();
        assert_eq!(d.state.progress, PodProgress::BasalInitialized);
        assert!(d.state.basal_active);

        d.handle_command(&cmd(6, bolus(10)), t0()).unwrap();
        assert_eq!(d.state.progress, PodProgress::InsertingCannula);
        assert_eq!(d.state.bolus_interval_secs, SETUP_PULSE_SECS);

        d.handle_command(&cmd(7, status), t0() + Duration::seconds(11)).unwrap();
        assert_eq!(d.state.progress, PodProgress::RunningAbove50U);

        d.handle_command(&cmd(8, bolus(20)), t0()).unwrap();
        assert_eq!(d.state.progress, PodProgress::RunningAbove50U);
        assert_eq!(d.state.bolus_interval_secs, RUNNING_PULSE_SECS);
        assert_eq!(d.state.bolus_end, Some(t0() + Duration::seconds(40)));
        assert_eq!(d.state.delivered, 82);
        assert_eq!(d.state.reservoir, 3000 - 82);
    }

    #[test]
    fn program_insulin_is_monotonic_and_single_step() {
        let stages = [
            PodProgress::Uninitiated,
            PodProgress::ReminderInitialized,
            PodProgress::PairingCompleted,
            PodProgress::Priming,
            PodProgress::PrimingCompleted,
            PodProgress::BasalInitialized,
            PodProgress::InsertingCannula,
            PodProgress::RunningAbove50U,
            PodProgress::RunningBelow50U,
            PodProgress::Deactivated,
        ];
        for start in stages {
            for table_num in [TABLE_BASAL, TABLE_TEMP_BASAL, TABLE_BOLUS] {
                let mut d = device_at(start);
                let kind = CommandKind::ProgramInsulin {
                    table_num,
                    duration: 1,
                    pulses: 5,
                };
                d.handle_command(&cmd(1, kind), t0()).unwrap();
                let end = d.state.progress;
                assert!(end >= start, "{start:?} -> {end:?}");
                let checkpoints = [
                    PodProgress::Priming,
                    PodProgress::BasalInitialized,
                    PodProgress::InsertingCannula,
                    PodProgress::RunningAbove50U,
                ];
                let crossed = checkpoints.iter().filter(|c| start < **c && **c <= end).count();
                assert!(crossed <= 1, "{start:?} -> {end:?} crossed {crossed}");
            }
        }
    }

    #[test]
    fn version_commands_never_move_backwards() {
        let mut d = device_at(PodProgress::RunningAbove50U);
        d.handle_command(&cmd(0, CommandKind::GetVersion { id: [0xff; 4] }), t0()).unwrap();
        d.handle_command(&cmd(1, CommandKind::SetUniqueId { id: [1; 4] }), t0()).unwrap();
        assert_eq!(d.state.progress, PodProgress::RunningAbove50U);
    }

    #[test]
    fn temp_basal_duration_in_half_hours() {
        let mut d = device_at(PodProgress::RunningAbove50U);
        let kind = CommandKind::ProgramInsulin {
            table_num: TABLE_TEMP_BASAL,
            duration: 3,
            pulses: 0,
        };
        d.handle_command(&cmd(1, kind), t0()).unwrap();
        assert_eq!(d.state.temp_basal_end, Some(t0() + Duration::minutes(90)));
    }

    #[test]
    fn alerts_cleared_by_silence_and_program() {
        let mut d = device_at(PodProgress::RunningAbove50U);
        d.set_alerts(0b1001_1100, t0() + Duration::minutes(7));
        assert_eq!(d.state.trigger_times[2], 7);
        d.handle_command(&cmd(1, CommandKind::SilenceAlerts { alert_mask: 0b0000_0100 }), t0())
            .unwrap();
        assert_eq!(d.state.active_alert_slots, 0b1001_1000);
        assert_eq!(d.state.trigger_times[2], 0);
        assert_eq!(d.state.trigger_times[3], 7);
        d.handle_command(&cmd(2, CommandKind::ProgramAlerts { alert_mask: 0x9c }), t0())
            .unwrap();
        assert_eq!(d.state.active_alert_slots, 0);
        assert_eq!(d.state.trigger_times, [0; 8]);
    }

    #[test]
    fn stop_delivery_clears_bolus_after_response() {
        let mut d = device_at(PodProgress::RunningAbove50U);
        d.handle_command(&cmd(1, bolus(30)), t0()).unwrap();
        let stop = cmd(
            2,
            CommandKind::StopDelivery {
                stop_bolus: true,
                stop_temp_basal: false,
                stop_basal: true,
            },
        );
        d.handle_command(&stop, t0()).unwrap();
        assert!(!d.state.basal_active);
        let rsp = d.response_for(&stop, t0()).unwrap();
        match rsp {
            Response::GeneralStatus(s) => {
                assert!(s.bolus_active);
                assert_eq!(s.bolus_remaining, 30);
                assert_eq!(s.last_prog_seq_num, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(d.after_response(&stop), Followup::None);
        assert!(!d.state.bolus_active(t0()));
    }

    #[test]
    fn status_type_selection() {
        let mut d = device_at(PodProgress::RunningAbove50U);
        let get = |t| cmd(1, CommandKind::GetStatus { request_type: t });
        assert!(matches!(d.response_for(&get(0), t0()), Ok(Response::GeneralStatus(_))));
        assert!(matches!(d.response_for(&get(2), t0()), Ok(Response::DetailedStatus(_))));
        assert!(matches!(d.response_for(&get(1), t0()), Ok(Response::Type1Status { .. })));
        assert!(matches!(d.response_for(&get(3), t0()), Ok(Response::Type3Status { .. })));
        assert!(matches!(d.response_for(&get(5), t0()), Ok(Response::Type5Status { .. })));
        assert_eq!(
            d.response_for(&get(0x46), t0()),
            Err(DeviceError::UnsupportedStatusType(0x46))
        );
        d.set_fault(0x14, t0() + Duration::minutes(3));
        assert_eq!(d.state.fault_time, 3);
        assert!(matches!(d.response_for(&get(0), t0()), Ok(Response::DetailedStatus(_))));
        let beeps = cmd(2, CommandKind::ProgramBeeps);
        assert!(matches!(d.response_for(&beeps, t0()), Ok(Response::DetailedStatus(_))));
    }

    #[test]
    fn set_unique_id_and_deactivate_followups() {
        let mut d = device_at(PodProgress::ReminderInitialized);
        let set = cmd(1, CommandKind::SetUniqueId { id: [9, 8, 7, 6] });
        assert_eq!(d.after_response(&set), Followup::RefreshAdvertising([9, 8, 7, 6]));
        assert_eq!(d.state.unique_id, Some([9, 8, 7, 6]));
        assert_eq!(d.after_response(&cmd(2, CommandKind::Deactivate)), Followup::Deactivated);
        assert_eq!(d.state.progress, PodProgress::ReminderInitialized);
        d.deactivate();
        assert_eq!(d.state.progress, PodProgress::Deactivated);
    }

    #[test]
    fn crash_injection_is_one_shot_and_skips_read_only_commands() {
        let mut d = device_at(PodProgress::RunningAbove50U);
        d.control.crash_next_command(true);
        d.handle_command(&cmd(1, CommandKind::GetStatus { request_type: 0 }), t0()).unwrap();
        assert!(d.control.armed());
        assert_eq!(
            d.handle_command(&cmd(2, CommandKind::Deactivate), t0()),
            Err(DeviceError::InjectedCrash { seq: 2, after: false })
        );
        assert_eq!(d.state.last_prog_seq_num, 0);
        assert!(!d.control.armed());

        d.control.crash_next_command(false);
        assert_eq!(
            d.handle_command(&cmd(3, CommandKind::SilenceAlerts { alert_mask: 1 }), t0()),
            Err(DeviceError::InjectedCrash { seq: 3, after: true })
        );
        assert_eq!(d.state.last_prog_seq_num, 3);
        d.handle_command(&cmd(4, CommandKind::FaultConfig), t0()).unwrap();
    }

    #[test]
    fn setters() {
        let mut d = device_at(PodProgress::RunningAbove50U);
        d.set_reservoir(42.5);
        assert_eq!(d.state.reservoir, 850);
        d.set_reservoir(-1.0);
        assert_eq!(d.state.reservoir, 0);
        d.set_active_time(120, t0());
        assert_eq!(d.state.minutes_active(t0()), 120);
    }
}
