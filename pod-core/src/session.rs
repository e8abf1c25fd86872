//! Session engine: connection handshake, the serialized command/response/ack loop and its supervisor.
//!
//! One [`Pod`] owns the device behind a single async mutex. The command loop holds that lock for a
//! whole decrypt, dispatch, encrypt, transmit and ack cycle, so setters issued from the host wait
//! for the cycle in flight. State is saved after every step that changes it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::command::{Command, CommandError};
use crate::crypto::CryptoError;
use crate::device::{Device, DeviceError, Followup};
use crate::eap::{EapAkaChallenge, EapError};
use crate::encrypt::Direction;
use crate::frame::{unwrap_command, FrameError, PodMessage};
use crate::message::{Message, MessageError};
use crate::pair::{Pairing, PairingError};
use crate::response::{PodProgress, ResponseMetadata};
use crate::state::{PodState, Store, StoreError};
use crate::wire::{FrameDecodeError, FrameEncodeError};

/// How long the pod waits for the next command before dropping the connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Pause after the first failed accept; doubles per consecutive failure.
pub const RETRY_BASE: Duration = Duration::from_millis(100);
pub const RETRY_MAX: Duration = Duration::from_secs(5);

fn retry_delay(failures: u32) -> Duration {
    RETRY_BASE
        .checked_mul(1u32 << failures.min(16))
        .map_or(RETRY_MAX, |d| d.min(RETRY_MAX))
}

/// Radio link to the PDM, supplied by the host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for a new connection and return the bridge's opening command.
    async fn read_first_command(&self) -> Result<Vec<u8>, TransportError>;

    async fn start_message_loop(&self) -> Result<(), TransportError>;

    async fn read_message(&self) -> Result<Message, TransportError>;

    /// `Ok(None)` when nothing arrived within `timeout`.
    async fn read_message_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError> {
        match tokio::time::timeout(timeout, self.read_message()).await {
            Ok(msg) => msg.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn write_message(&self, msg: &Message) -> Result<(), TransportError>;

    async fn shutdown_connection(&self);

    /// Advertise under the id assigned by SetUniqueID.
    async fn refresh_advertising(&self, id: &[u8]) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Receives the JSON state snapshot after every completed command cycle.
pub type StateHook = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    IdleTimeout,
    Deactivated,
}

/// The emulated pod: device state, its store and the link it talks over.
#[derive(Clone)]
pub struct Pod {
    device: Arc<Mutex<Device>>,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    hook: Option<StateHook>,
}

impl Pod {
    /// Restore the saved pod, or start a fresh one when `fresh` is set or nothing was saved.
    /// With `fresh` the old state is never read, so a corrupt file can be replaced.
    pub fn open(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        fresh: bool,
    ) -> Result<Self, SessionError> {
        let saved = if fresh { None } else { store.load()? };
        let state = match saved {
            Some(state) => {
                info!(progress = ?state.progress, paired = state.ltk.is_some(), "restored pod state");
                state
            }
            None => {
                info!("starting a fresh pod");
                let state = PodState::fresh(Utc::now());
                store.save(&state)?;
                state
            }
        };
        Ok(Self {
            device: Arc::new(Mutex::new(Device::new(state))),
            store,
            transport,
            config,
            hook: None,
        })
    }

    pub fn set_state_hook(&mut self, hook: StateHook) {
        self.hook = Some(hook);
    }

    /// Run the supervisor on its own task; the caller does not block.
    pub fn start_accepting(&self) -> JoinHandle<Result<SessionEnd, SessionError>> {
        let pod = self.clone();
        tokio::spawn(async move { pod.supervise().await })
    }

    /// Establish sessions until the pod is deactivated or hits a fatal error.
    /// Consecutive failed accepts back off from [`RETRY_BASE`] up to [`RETRY_MAX`].
    pub async fn supervise(&self) -> Result<SessionEnd, SessionError> {
        let mut failed_accepts: u32 = 0;
        loop {
            if self.device.lock().await.state.progress == PodProgress::Deactivated {
                info!("pod is deactivated, not accepting connections");
                return Ok(SessionEnd::Deactivated);
            }
            info!("listening for commands");
            let first = match self.transport.read_first_command().await {
                Ok(first) => {
                    failed_accepts = 0;
                    first
                }
                Err(e) => {
                    let delay = retry_delay(failed_accepts);
                    failed_accepts = failed_accepts.saturating_add(1);
                    warn!(error = %e, retry_in = ?delay, "could not accept a connection");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            match self.serve(&first).await {
                Ok(SessionEnd::IdleTimeout) => info!("restarting session establishment"),
                Ok(SessionEnd::Deactivated) => return Ok(SessionEnd::Deactivated),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal session error");
                    self.transport.shutdown_connection().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, kind = ?e.kind(), "session aborted");
                    self.transport.shutdown_connection().await;
                }
            }
        }
    }

    /// One connection: pair if needed, authenticate, then serve commands.
    pub async fn run_session(&self) -> Result<SessionEnd, SessionError> {
        info!("listening for commands");
        let first = self.transport.read_first_command().await?;
        self.serve(&first).await
    }

    async fn serve(&self, first: &[u8]) -> Result<SessionEnd, SessionError> {
        info!(first = %String::from_utf8_lossy(first), "got first command");
        self.transport.start_message_loop().await?;

        let stored = self.device.lock().await.state.ltk;
        let ltk = match stored {
            Some(ltk) => ltk,
            None => self.pair().await?,
        };
        self.authenticate(&ltk).await?;
        self.command_loop().await
    }

    async fn pair(&self) -> Result<[u8; 16], SessionError> {
        info!("no LTK stored, pairing");
        let mut pairing = Pairing::new();

        let msg = self.transport.read_message().await?;
        pairing.parse_sp1_sp2(&msg)?;

        let msg = self.transport.read_message().await?;
        pairing.parse_sps1(&msg)?;
        let reply = pairing.generate_sps1(&msg)?;
        self.transport.write_message(&reply).await?;

        let msg = self.transport.read_message().await?;
        pairing.parse_sps2(&msg)?;
        let reply = pairing.generate_sps2(&msg)?;
        self.transport.write_message(&reply).await?;

        let msg = self.transport.read_message().await?;
        pairing.parse_sp0gp0(&msg)?;
        let reply = pairing.generate_p0(&msg)?;
        self.transport.write_message(&reply).await?;

        let ltk = pairing.ltk()?;
        let mut device = self.device.lock().await;
        device.state.ltk = Some(ltk);
        device.state.eap_aka_seq = 1;
        self.store.save(&device.state)?;
        Ok(ltk)
    }

    async fn authenticate(&self, ltk: &[u8; 16]) -> Result<(), SessionError> {
        let stored_sqn = self.device.lock().await.state.eap_aka_seq;
        let mut eap = EapAkaChallenge::new(ltk, stored_sqn);

        let msg = self.transport.read_message().await?;
        eap.parse_challenge(&msg)?;
        let reply = eap.generate_challenge_response(&msg)?;
        self.transport.write_message(&reply).await?;

        let msg = self.transport.read_message().await?;
        eap.parse_success(&msg)?;
        let keys = eap.session_keys()?;
        let sqn = eap.sqn()?;

        let mut device = self.device.lock().await;
        let state = &mut device.state;
        state.session = Some(keys);
        state.nonce_seq = 1;
        state.msg_seq = 1;
        state.eap_aka_seq = sqn;
        info!(sqn, nonce_seq = state.nonce_seq, "session keys installed");
        self.store.save(state)?;
        Ok(())
    }

    async fn command_loop(&self) -> Result<SessionEnd, SessionError> {
        let mut last_seq: Option<u8> = None;
        loop {
            info!("waiting for the next command");
            let msg = match self
                .transport
                .read_message_with_timeout(self.config.idle_timeout)
                .await?
            {
                Some(msg) => msg,
                None => {
                    info!(timeout = ?self.config.idle_timeout, "no command before the idle timeout");
                    self.transport.shutdown_connection().await;
                    return Ok(SessionEnd::IdleTimeout);
                }
            };
            if last_seq == Some(msg.sequence_number) {
                trace!(seq = msg.sequence_number, "dropping retransmitted command");
                continue;
            }
            last_seq = Some(msg.sequence_number);

            let followup = self.process(msg).await?;
            self.notify_state_change().await;
            if followup == Followup::Deactivated {
                info!("pod deactivated, ending session");
                return Ok(SessionEnd::Deactivated);
            }
        }
    }

    /// One full command cycle under the device lock.
    async fn process(&self, msg: Message) -> Result<Followup, SessionError> {
        let mut device = self.device.lock().await;
        let now = Utc::now();
        let keys = device.state.session.clone().ok_or(CryptoError::NoSession)?;

        let inbound = keys.decrypt_message(device.state.nonce_seq, Direction::PodReceiving, msg)?;
        device.state.nonce_seq += 1;
        self.store.save(&device.state)?;

        let pod_message = PodMessage::decode(unwrap_command(&inbound.payload)?)?;
        let cmd = Command::from_pod_message(&pod_message)?;
        device.state.cmd_seq = cmd.seq;

        match device.handle_command(&cmd, now) {
            Ok(()) => {}
            Err(e @ DeviceError::InjectedCrash { after: true, .. }) => {
                self.store.save(&device.state)?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
        self.store.save(&device.state)?;

        let response = device.response_for(&cmd, now)?;
        let followup = device.after_response(&cmd);
        if let Followup::RefreshAdvertising(id) = &followup {
            self.transport.refresh_advertising(id).await?;
        }
        device.state.msg_seq = device.state.msg_seq.wrapping_add(1);
        device.state.cmd_seq = device.state.cmd_seq.wrapping_add(1);
        self.store.save(&device.state)?;

        let meta = ResponseMetadata {
            source: inbound.destination,
            destination: inbound.source,
            msg_seq: device.state.msg_seq,
            ack_seq: inbound.sequence_number.wrapping_add(1),
            cmd_seq: device.state.cmd_seq,
            request_id: cmd.request_id,
        };
        let outbound = keys.encrypt_message(
            device.state.nonce_seq,
            Direction::PodSending,
            response.marshal(&meta)?,
        )?;
        device.state.nonce_seq += 1;
        self.store.save(&device.state)?;

        debug!(seq = outbound.sequence_number, nonce_seq = device.state.nonce_seq, "sending response");
        self.transport.write_message(&outbound).await?;

        let ack = self.transport.read_message().await?;
        let ack = keys.decrypt_message(device.state.nonce_seq, Direction::PodReceiving, ack)?;
        device.state.nonce_seq += 1;
        if !ack.payload.is_empty() {
            return Err(SessionError::NonEmptyAck(ack.payload.len()));
        }
        if followup == Followup::Deactivated {
            device.deactivate();
        }
        self.store.save(&device.state)?;
        Ok(followup)
    }

    async fn notify_state_change(&self) {
        let Some(hook) = &self.hook else {
            debug!("no state hook registered");
            return;
        };
        match self.state_json().await {
            Ok(bytes) => hook(bytes),
            Err(e) => error!(error = %e, "could not serialize pod state"),
        }
    }

    /// Current pod state as JSON.
    pub async fn state_json(&self) -> Result<Vec<u8>, SessionError> {
        let device = self.device.lock().await;
        Ok(serde_json::to_vec(&device.state)?)
    }

    pub async fn state(&self) -> PodState {
        self.device.lock().await.state.clone()
    }

    pub async fn set_reservoir(&self, units: f32) -> Result<(), SessionError> {
        self.update(|d| d.set_reservoir(units)).await
    }

    pub async fn set_alerts(&self, mask: u8) -> Result<(), SessionError> {
        self.update(|d| d.set_alerts(mask, Utc::now())).await
    }

    pub async fn set_fault(&self, code: u8) -> Result<(), SessionError> {
        self.update(|d| d.set_fault(code, Utc::now())).await
    }

    pub async fn set_active_time(&self, minutes: i64) -> Result<(), SessionError> {
        self.update(|d| d.set_active_time(minutes, Utc::now())).await
    }

    pub async fn crash_next_command(&self, before: bool) {
        info!(before, "crash armed for the next state-changing command");
        self.device.lock().await.control.crash_next_command(before);
    }

    async fn update<F>(&self, f: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut Device),
    {
        let mut device = self.device.lock().await;
        f(&mut device);
        self.store.save(&device.state)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("could not frame packet: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("unexpected input: {0}")]
    Unexpected(&'static str),
}

/// Failure classes the host reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedCommand,
    UnsupportedRequestVariant,
    AuthenticationFailure,
    ProtocolViolation,
    PersistenceFailure,
    Transport,
    InjectedCrash,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("packet: {0}")]
    Message(#[from] MessageError),
    #[error("pod message: {0}")]
    Frame(#[from] FrameError),
    #[error("command: {0}")]
    Command(#[from] CommandError),
    #[error("device: {0}")]
    Device(#[from] DeviceError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("pairing: {0}")]
    Pairing(#[from] PairingError),
    #[error("EAP-AKA: {0}")]
    Eap(#[from] EapError),
    #[error("state store: {0}")]
    Store(#[from] StoreError),
    #[error("state snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("acknowledgement carried {0} payload bytes")]
    NonEmptyAck(usize),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Transport(_) => ErrorKind::Transport,
            SessionError::Message(_) | SessionError::Frame(_) | SessionError::Command(_) => {
                ErrorKind::MalformedCommand
            }
            SessionError::Device(DeviceError::UnsupportedStatusType(_)) => {
                ErrorKind::UnsupportedRequestVariant
            }
            SessionError::Device(DeviceError::InjectedCrash { .. }) => ErrorKind::InjectedCrash,
            SessionError::Pairing(PairingError::UnexpectedStep { .. })
            | SessionError::Pairing(PairingError::WrongType(_))
            | SessionError::Eap(EapError::WrongType(_))
            | SessionError::NonEmptyAck(_) => ErrorKind::ProtocolViolation,
            SessionError::Crypto(_) | SessionError::Pairing(_) | SessionError::Eap(_) => {
                ErrorKind::AuthenticationFailure
            }
            SessionError::Store(_) | SessionError::Snapshot(_) => ErrorKind::PersistenceFailure,
        }
    }

    /// Only persistence failures stop the pod; everything else drops back to session establishment.
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::PersistenceFailure
    }
}
