//! Pod emulator protocol engine.
//! Host-driven: no socket or file I/O; the host supplies a [`Transport`] and a [`Store`].

pub mod command;
pub mod crypto;
pub mod device;
pub mod eap;
pub mod encrypt;
pub mod frame;
pub mod message;
pub mod milenage;
pub mod pair;
pub mod response;
pub mod session;
pub mod state;
pub mod wire;

pub use command::{Command, CommandError, CommandKind};
pub use crypto::{CryptoError, Keypair};
pub use device::{Device, DeviceError, SessionControl};
pub use encrypt::{Direction, SessionKeys};
pub use message::{Message, MessageError, MessageType};
pub use response::{PodProgress, Response};
pub use session::{
    ErrorKind, Pod, SessionConfig, SessionEnd, SessionError, StateHook, Transport, TransportError,
};
pub use state::{MemoryStore, PodState, Store, StoreError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
