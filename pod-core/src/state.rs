//! Persistent pod record and the storage capability the session saves it through.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::encrypt::SessionKeys;
use crate::response::{ActivationStamp, PodProgress, StatusSnapshot};

/// 150 U in 0.05 U pulses.
pub const DEFAULT_RESERVOIR: u16 = 3000;

/// Everything the pod remembers across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodState {
    #[serde(with = "hex_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<[u8; 4]>,
    #[serde(with = "hex_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub ltk: Option<[u8; 16]>,
    pub eap_aka_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionKeys>,
    pub nonce_seq: u64,
    pub msg_seq: u8,
    pub cmd_seq: u8,
    pub last_prog_seq_num: u8,

    pub progress: PodProgress,
    pub reservoir: u16,
    pub delivered: u16,
    pub active_alert_slots: u8,
    pub trigger_times: [u16; 8],
    pub fault_event: u8,
    pub fault_time: u16,

    pub activation_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bolus_end: Option<DateTime<Utc>>,
    pub bolus_pulses: u16,
    pub bolus_interval_secs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_basal_end: Option<DateTime<Utc>>,
    pub basal_active: bool,
    pub extended_bolus_active: bool,
}

impl Default for PodState {
    fn default() -> Self {
        Self::fresh(Utc::now())
    }
}

impl PodState {
    /// A new, unpaired pod activated at `now`.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            unique_id: None,
            ltk: None,
            eap_aka_seq: 0,
            session: None,
            nonce_seq: 0,
            msg_seq: 0,
            cmd_seq: 0,
            last_prog_seq_num: 0,
            progress: PodProgress::Uninitiated,
            reservoir: DEFAULT_RESERVOIR,
            delivered: 0,
            active_alert_slots: 0,
            trigger_times: [0; 8],
            fault_event: 0,
            fault_time: 0,
            activation_time: now,
            bolus_end: None,
            bolus_pulses: 0,
            bolus_interval_secs: 0,
            temp_basal_end: None,
            basal_active: false,
            extended_bolus_active: false,
        }
    }

    pub fn minutes_active(&self, now: DateTime<Utc>) -> u16 {
        let minutes = (now - self.activation_time).num_minutes();
        minutes.clamp(0, u16::MAX as i64) as u16
    }

    pub fn bolus_active(&self, now: DateTime<Utc>) -> bool {
        self.bolus_end.is_some_and(|end| end > now)
    }

    pub fn temp_basal_active(&self, now: DateTime<Utc>) -> bool {
        self.temp_basal_end.is_some_and(|end| end > now)
    }

    /// Pulses not yet delivered, estimated from the time left on the bolus.
    pub fn bolus_remaining(&self, now: DateTime<Utc>) -> u16 {
        let Some(end) = self.bolus_end else {
            return 0;
        };
        if end <= now || self.bolus_interval_secs == 0 {
            return 0;
        }
        let left_ms = (end - now).num_milliseconds().max(0) as u64;
        let interval_ms = self.bolus_interval_secs as u64 * 1000;
        let pulses = (left_ms + interval_ms - 1) / interval_ms;
        pulses.min(self.bolus_pulses as u64) as u16
    }

    /// Clear the masked alert slots and their trigger times.
    pub fn clear_alerts(&mut self, mask: u8) {
        self.active_alert_slots &= !mask;
        for (slot, time) in self.trigger_times.iter_mut().enumerate() {
            if mask & (1 << slot) != 0 {
                *time = 0;
            }
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> StatusSnapshot {
        StatusSnapshot {
            progress: self.progress,
            last_prog_seq_num: self.last_prog_seq_num,
            reservoir: self.reservoir,
            alerts: self.active_alert_slots,
            bolus_active: self.bolus_active(now),
            temp_basal_active: self.temp_basal_active(now),
            basal_active: self.basal_active,
            extended_bolus_active: self.extended_bolus_active,
            delivered: self.delivered,
            bolus_remaining: self.bolus_remaining(now),
            minutes_active: self.minutes_active(now),
            fault_event: self.fault_event,
            fault_time: self.fault_time,
        }
    }

    /// Activation time on the local wall clock.
    pub fn activation_stamp(&self) -> ActivationStamp {
        stamp(&self.activation_time.with_timezone(&Local))
    }
}

fn stamp<Tz: TimeZone>(t: &DateTime<Tz>) -> ActivationStamp {
    ActivationStamp {
        month: t.month() as u8,
        day: t.day() as u8,
        year: (t.year() - 2000).clamp(0, 255) as u8,
        hour: t.hour() as u8,
        minute: t.minute() as u8,
    }
}

/// Load/save capability for [`PodState`].
pub trait Store: Send + Sync {
    fn save(&self, state: &PodState) -> Result<(), StoreError>;
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<PodState>, StoreError>;
}

/// In-memory store for tests and embedders.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<PodState>>,
    saves: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PodState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following save fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn last_saved(&self) -> Option<PodState> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

impl Store for MemoryStore {
    fn save(&self, state: &PodState) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("save disabled".into()));
        }
        let mut slot = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        *slot = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load(&self) -> Result<Option<PodState>, StoreError> {
        let slot = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        Ok(slot.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode pod state: {0}")]
    Encode(String),
    #[error("could not decode pod state: {0}")]
    Decode(String),
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

/// Fixed-size byte arrays as lowercase hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))
    }
}

pub(crate) mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(
        opt: &Option<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match opt {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<Option<[u8; N]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; N] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom(format!("expected {} bytes", N)))?;
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}
