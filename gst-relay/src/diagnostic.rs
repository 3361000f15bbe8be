use std::{fmt, pin::Pin};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{pad_name::PadNameError, port::PortId};

/// Conditions the relay recovered from. Each one is also logged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    UnparsedPad { pad: String, error: PadNameError },
    UnsupportedPayloadType { ssrc: u32, payload_type: u8 },
    BranchFailed { port: PortId, reason: String },
    /// A sink port produced a frame nobody listens to.
    Unhandled { port: PortId },
    PortNotFound { port: PortId },
    PushRejected { port: PortId, reason: String },
    EngineWarning { source: String, message: String },
    StopFailed { reason: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnparsedPad { pad, error } => {
                write!(f, "ignoring pad {}: {}", pad, error)
            }
            Diagnostic::UnsupportedPayloadType { ssrc, payload_type } => write!(
                f,
                "ssrc {}: unsupported payload type {}",
                ssrc, payload_type
            ),
            Diagnostic::BranchFailed { port, reason } => {
                write!(f, "branch for {} failed: {}", port, reason)
            }
            Diagnostic::Unhandled { port } => write!(f, "no handler on port {}", port),
            Diagnostic::PortNotFound { port } => write!(f, "port not found: {}", port),
            Diagnostic::PushRejected { port, reason } => {
                write!(f, "push to {} rejected: {}", port, reason)
            }
            Diagnostic::EngineWarning { source, message } => {
                write!(f, "engine warning from {}: {}", source, message)
            }
            Diagnostic::StopFailed { reason } => write!(f, "stop failed: {}", reason),
        }
    }
}

pub type DiagnosticStream = Pin<Box<dyn Stream<Item = Diagnostic> + Send>>;

#[derive(Clone)]
pub(crate) struct Diagnostics {
    tx: broadcast::Sender<Diagnostic>,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        log::warn!("{}", diagnostic);
        // no subscribers is fine
        let _ = self.tx.send(diagnostic);
    }

    pub fn subscribe(&self) -> DiagnosticStream {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|r| async move {
            match r {
                Ok(d) => Some(d),
                Err(e) => {
                    log::warn!("diagnostics subscriber lagged: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }
}
