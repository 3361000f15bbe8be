//! Turns engine bus traffic into a typed, once-only fatal signal.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use tokio::sync::watch;

use crate::{
    diagnostic::{Diagnostic, Diagnostics},
    engine::BusMessage,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FatalKind {
    Eos,
    Error {
        message: String,
        debug: Option<String>,
        source: String,
    },
}

/// End of stream or an engine error. The session is unusable afterwards;
/// the host decides whether that ends the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineFatal {
    pub kind: FatalKind,
}

impl EngineFatal {
    pub fn eos() -> Self {
        Self {
            kind: FatalKind::Eos,
        }
    }

    pub fn error(source: &str, message: &str, debug: Option<&str>) -> Self {
        Self {
            kind: FatalKind::Error {
                message: message.to_string(),
                debug: debug.map(str::to_string),
                source: source.to_string(),
            },
        }
    }

    pub fn is_eos(&self) -> bool {
        matches!(self.kind, FatalKind::Eos)
    }
}

impl fmt::Display for EngineFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FatalKind::Eos => f.write_str("end of stream"),
            FatalKind::Error {
                message,
                debug,
                source,
            } => {
                write!(f, "error from {}: {}", source, message)?;
                if let Some(debug) = debug {
                    write!(f, " ({})", debug)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for EngineFatal {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorState {
    Monitoring,
    Fatal,
}

pub type ShutdownHook = Arc<dyn Fn(&EngineFatal) + Send + Sync>;

pub struct BusMonitor {
    fatal: watch::Sender<Option<EngineFatal>>,
    diagnostics: Diagnostics,
    hook: RwLock<Option<ShutdownHook>>,
}

impl BusMonitor {
    pub(crate) fn new(diagnostics: Diagnostics) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            fatal,
            diagnostics,
            hook: RwLock::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        if self.fatal.borrow().is_some() {
            MonitorState::Fatal
        } else {
            MonitorState::Monitoring
        }
    }

    /// Called once, on whichever thread raises the fatal condition.
    pub fn set_shutdown_hook(&self, hook: ShutdownHook) {
        if let Ok(mut guard) = self.hook.write() {
            *guard = Some(hook);
        }
    }

    pub(crate) fn handle(&self, message: &BusMessage) {
        match message {
            BusMessage::Eos { source } => {
                log::info!("end of stream from {}", source);
                self.raise(EngineFatal::eos());
            }
            BusMessage::Error {
                source,
                message,
                debug,
            } => {
                log::error!("error from {}: {} ({:?})", source, message, debug);
                self.raise(EngineFatal::error(source, message, debug.as_deref()));
            }
            BusMessage::Warning { source, message } => {
                self.diagnostics.emit(Diagnostic::EngineWarning {
                    source: source.clone(),
                    message: message.clone(),
                });
            }
            BusMessage::StateChanged { source, old, new } => {
                log::debug!("{} changed state {} -> {}", source, old, new);
            }
            BusMessage::Other { .. } => {}
        }
    }

    fn raise(&self, fatal: EngineFatal) {
        let first = self.fatal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(fatal.clone());
            true
        });
        if !first {
            return;
        }

        let hook = self.hook.read().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(&fatal);
        }
    }

    pub fn fatal(&self) -> Option<EngineFatal> {
        self.fatal.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<EngineFatal>> {
        self.fatal.subscribe()
    }

    pub async fn wait_fatal(&self) -> EngineFatal {
        let mut rx = self.fatal.subscribe();
        loop {
            if let Some(fatal) = rx.borrow_and_update().clone() {
                return fatal;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}
