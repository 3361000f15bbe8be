use thiserror::Error;

use crate::{monitor::EngineFatal, pad_name::PadNameError, port::PortId};

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Malformed topology or unknown stage type. Fatal to that graph only.
    #[error("invalid descriptor: {reason}")]
    Descriptor { reason: String },

    #[error("port not found: {port}")]
    PortNotFound { port: PortId },

    #[error("unsupported payload type {payload_type} from ssrc {ssrc}")]
    UnsupportedPayloadType { ssrc: u32, payload_type: u8 },

    #[error("engine fatal: {0}")]
    EngineFatal(#[from] EngineFatal),

    /// Non-fatal engine failure (linking, state change, push rejected).
    #[error("engine error: {reason}")]
    Engine { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error(transparent)]
    PadName(#[from] PadNameError),

    #[error("scheduler error: {reason}")]
    Scheduler { reason: String },

    #[error("config error: {reason}")]
    Config { reason: String },
}

impl RelayError {
    pub fn descriptor(reason: impl Into<String>) -> Self {
        Self::Descriptor {
            reason: reason.into(),
        }
    }

    pub fn engine(reason: impl Into<String>) -> Self {
        Self::Engine {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}
