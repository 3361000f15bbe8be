use std::sync::Arc;

use crate::{
    config::RelayConfig,
    diagnostic::Diagnostic,
    engine::{Engine, SampleHandler, SampleRef},
    error::Result,
    frame::Frame,
    port::PortId,
    scheduler::Scheduler,
    session::{Session, SessionInner},
};

/// Entry point for hosts: owns the process scheduler and compiles sessions
/// against one engine.
pub struct Relay {
    scheduler: Scheduler,
    config: RelayConfig,
}

impl Relay {
    pub fn new(engine: Arc<dyn Engine>, config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::new(engine)?;
        Ok(Self { scheduler, config })
    }

    pub fn run(&self) -> Result<()> {
        self.scheduler.run()
    }

    pub fn compile(&self, descriptor: &str) -> Result<Session> {
        Session::compile(self.scheduler.engine(), descriptor, &self.config)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        self.scheduler.engine()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

pub(crate) fn sample_handler(session: Arc<SessionInner>, port: PortId) -> SampleHandler {
    Box::new(move |sample| dispatch(&session, &port, sample))
}

/// Copies the sample out, then hands it to the port's handler with no lock
/// held. Runs on the engine's streaming thread.
pub(crate) fn dispatch(session: &SessionInner, port: &PortId, sample: SampleRef<'_>) {
    if session.is_stopped() {
        return;
    }
    let mut frame = Frame::copy_from(sample, port.clone(), None);

    let (handler, report) = {
        let Ok(mut registry) = session.registry.lock() else {
            return;
        };
        let fallback = registry.source_handler.clone();
        let Some(entry) = registry.get_mut(port) else {
            drop(registry);
            session.diagnostics.emit(Diagnostic::PortNotFound { port: port.clone() });
            return;
        };
        entry.stats.frames += 1;
        entry.stats.bytes += frame.len() as u64;
        frame.source_key = entry.key.source;

        let handler = match &entry.handler {
            Some(handler) => Some(Arc::clone(handler)),
            None if entry.dynamic => fallback,
            None => None,
        };
        let report = handler.is_none() && !entry.unhandled_reported;
        if report {
            entry.unhandled_reported = true;
        }
        (handler, report)
    };

    match handler {
        Some(handler) => handler(frame),
        None if report => session
            .diagnostics
            .emit(Diagnostic::Unhandled { port: port.clone() }),
        None => log::trace!("dropping frame on {}", port),
    }
}
