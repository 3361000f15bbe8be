//! One compiled graph with its ports, handlers and lifecycle.

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio::sync::watch;

use crate::{
    config::RelayConfig,
    demux::{DemuxWiring, SourceInfo},
    diagnostic::{Diagnostic, DiagnosticStream, Diagnostics},
    engine::{Engine, EngineGraph, EngineState, PtMapHandler},
    error::{RelayError, Result},
    frame::Frame,
    monitor::{BusMonitor, EngineFatal, ShutdownHook},
    packet::{PacketKind, classify},
    pad_name::PadNameLayout,
    payload::PayloadTypeMap,
    port::{
        FrameHandler, PortDirection, PortEntry, PortId, PortKey, PortRef, PortRegistry, PortStats,
        SourceKey,
    },
    relay,
    rtx::RtxStageBuilder,
    transport::{self, AuthDecision, TransportEvent, TransportHandler},
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    /// The engine is on its way to PLAYING; callbacks already run.
    Starting,
    Playing,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    PortNotFound,
    /// The session is stopped; nothing was queued.
    Stopped,
    /// The engine refused the buffer, or the port is not an ingress port.
    Rejected,
}

pub type NewSourceHandler = Arc<dyn Fn(&SourceInfo) + Send + Sync>;

/// State shared with engine callbacks. Never holds the graph.
pub(crate) struct SessionInner {
    pub id: u64,
    pub registry: Mutex<PortRegistry>,
    state: RwLock<SessionState>,
    pub diagnostics: Diagnostics,
    pub monitor: BusMonitor,
    watching: AtomicBool,
    pub new_source: RwLock<Option<NewSourceHandler>>,
    transport: RwLock<Option<Arc<dyn TransportHandler>>>,
}

impl SessionInner {
    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(SessionState::Stopped)
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == SessionState::Stopped
    }
}

pub struct Session {
    inner: Arc<SessionInner>,
    graph: Arc<dyn EngineGraph>,
}

impl Session {
    /// Compiles `descriptor` and binds the ports `config` declares. The
    /// session starts out READY.
    pub fn compile(
        engine: &Arc<dyn Engine>,
        descriptor: &str,
        config: &RelayConfig,
    ) -> Result<Session> {
        let graph = engine.compile(descriptor)?;
        let diagnostics = Diagnostics::new(config.diagnostics_capacity);
        let inner = Arc::new(SessionInner {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            registry: Mutex::new(PortRegistry::new()),
            state: RwLock::new(SessionState::Ready),
            monitor: BusMonitor::new(diagnostics.clone()),
            diagnostics,
            watching: AtomicBool::new(false),
            new_source: RwLock::new(None),
            transport: RwLock::new(None),
        });

        let session = Session { inner, graph };
        session.bind_ports(config)?;

        let payloads = config.payload_map();
        let demux = config.demux.element.as_str();
        if session.graph.has_element(demux) {
            let wiring = DemuxWiring {
                layout: PadNameLayout::for_version(config.demux.pad_layout),
                policy: config.demux.reappear,
                payloads: payloads.clone(),
                graph: Arc::downgrade(&session.graph),
                session: Arc::clone(&session.inner),
            };
            if !wiring.install(&session.graph, demux) {
                log::debug!("{} exposes no dynamic pads", demux);
            }
            if config.rtx.enabled
                && !RtxStageBuilder::new(Arc::clone(engine)).install(
                    &session.graph,
                    demux,
                    config.rtx.map.clone(),
                )
            {
                log::debug!("{} does not request aux receivers", demux);
            }
        }

        // rtpbin asks its own pt-map; a standalone jitter buffer asks separately
        for element in [demux, config.jitter_buffer.as_str()] {
            if session.graph.has_element(element)
                && !session
                    .graph
                    .on_request_pt_map(element, pt_map_handler(payloads.clone()))
            {
                log::debug!("{} does not request pt maps", element);
            }
        }

        log::info!(
            "session {} compiled on {} engine",
            session.inner.id,
            engine.name()
        );
        Ok(session)
    }

    fn bind_ports(&self, config: &RelayConfig) -> Result<()> {
        for binding in &config.ports {
            if !self.graph.has_element(&binding.element) {
                log::debug!(
                    "session {}: no element {} for port {}",
                    self.inner.id,
                    binding.element,
                    binding.port
                );
                continue;
            }

            let key = PortKey {
                id: binding.port.clone(),
                source: binding.source_key,
            };
            let entry = match binding.direction {
                PortDirection::Source => {
                    let endpoint = self.graph.source(&binding.element).ok_or_else(|| {
                        RelayError::descriptor(format!(
                            "{} bound to port {} cannot accept buffers",
                            binding.element, binding.port
                        ))
                    })?;
                    PortEntry::source(key.clone(), endpoint)
                }
                PortDirection::Sink => {
                    let endpoint = self.graph.sink(&binding.element).ok_or_else(|| {
                        RelayError::descriptor(format!(
                            "{} bound to port {} does not emit buffers",
                            binding.element, binding.port
                        ))
                    })?;
                    endpoint.on_sample(relay::sample_handler(
                        Arc::clone(&self.inner),
                        binding.port.clone(),
                    ));
                    PortEntry::sink(key.clone(), false)
                }
            };

            let mut registry = self.lock_registry()?;
            registry.register(entry)?;
            if let Some(source) = binding.source_key {
                registry.bind_source(source, key);
            }
        }
        Ok(())
    }

    fn lock_registry(&self) -> Result<std::sync::MutexGuard<'_, PortRegistry>> {
        self.inner
            .registry
            .lock()
            .map_err(|_| RelayError::invalid_state("port registry poisoned"))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn engine_state(&self) -> EngineState {
        self.graph.state()
    }

    /// READY -> PLAYING. Starts watching the engine bus. The state lock is
    /// not held across the engine transition, so samples and new pads that
    /// arrive while the engine prerolls are delivered.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.write_state()?;
            match *state {
                SessionState::Starting | SessionState::Playing => return Ok(()),
                SessionState::Stopped => {
                    return Err(RelayError::invalid_state(format!(
                        "session {} is stopped",
                        self.inner.id
                    )));
                }
                SessionState::Ready => *state = SessionState::Starting,
            }
        }

        if !self.inner.watching.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            self.graph
                .on_bus_message(Box::new(move |msg| inner.monitor.handle(msg)))?;
        }

        let transition = self.graph.set_state(EngineState::Playing);
        let mut state = self.write_state()?;
        match (*state, transition) {
            (SessionState::Starting, Ok(())) => {
                *state = SessionState::Playing;
                log::info!("session {} playing", self.inner.id);
                Ok(())
            }
            (SessionState::Starting, Err(e)) => {
                *state = SessionState::Ready;
                Err(e)
            }
            _ => {
                // stopped while the engine was starting
                drop(state);
                if let Err(e) = self.graph.set_state(EngineState::Null) {
                    self.inner.diagnostics.emit(Diagnostic::StopFailed {
                        reason: e.to_string(),
                    });
                }
                Err(RelayError::invalid_state(format!(
                    "session {} stopped while starting",
                    self.inner.id
                )))
            }
        }
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, SessionState>> {
        self.inner
            .state
            .write()
            .map_err(|_| RelayError::invalid_state("session state poisoned"))
    }

    /// Idempotent. Blocks until the engine reached NULL; an engine failure
    /// is reported as a diagnostic and the session still ends up stopped.
    pub fn stop(&self) {
        {
            let Ok(mut state) = self.inner.state.write() else {
                return;
            };
            if *state == SessionState::Stopped {
                return;
            }
            *state = SessionState::Stopped;
        }

        if let Err(e) = self.graph.set_state(EngineState::Null) {
            self.inner.diagnostics.emit(Diagnostic::StopFailed {
                reason: e.to_string(),
            });
        }
        log::info!("session {} stopped", self.inner.id);
    }

    pub fn ports(&self) -> Vec<PortId> {
        self.inner
            .registry
            .lock()
            .map(|r| r.ids())
            .unwrap_or_default()
    }

    pub fn port_stats(&self, port: &PortId) -> Option<PortStats> {
        self.inner.registry.lock().ok()?.get(port).map(|e| e.stats)
    }

    pub fn source_port(&self, key: SourceKey) -> Option<PortKey> {
        self.inner
            .registry
            .lock()
            .ok()?
            .port_for_source(key)
            .cloned()
    }

    /// Replaces the handler of an existing port.
    pub fn on_frame<F>(&self, port: impl Into<PortId>, handler: F) -> Result<()>
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        let port = port.into();
        let handler: FrameHandler = Arc::new(handler);
        self.lock_registry()?.set_handler(&port, handler)
    }

    /// Handler for dynamic source ports that have none of their own.
    pub fn on_source_frame<F>(&self, handler: F)
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        if let Ok(mut registry) = self.inner.registry.lock() {
            registry.source_handler = Some(Arc::new(handler));
        }
    }

    pub fn on_new_source<F>(&self, handler: F)
    where
        F: Fn(&SourceInfo) + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.inner.new_source.write() {
            *guard = Some(Arc::new(handler));
        }
    }

    pub fn on_transport(&self, handler: Arc<dyn TransportHandler>) {
        if let Ok(mut guard) = self.inner.transport.write() {
            *guard = Some(handler);
        }
    }

    pub fn dispatch_transport(&self, event: TransportEvent) -> AuthDecision {
        let handler = self.inner.transport.read().ok().and_then(|h| h.clone());
        match handler {
            Some(handler) => transport::dispatch(handler.as_ref(), event),
            None => {
                log::debug!("session {}: no transport handler", self.inner.id);
                AuthDecision::Accept
            }
        }
    }

    /// Copies `data` into the engine at an ingress port.
    pub fn push(&self, port: impl Into<PortRef>, data: &[u8]) -> PushOutcome {
        if self.inner.is_stopped() {
            return PushOutcome::Stopped;
        }
        let port = port.into();

        let endpoint = {
            let Ok(registry) = self.inner.registry.lock() else {
                return PushOutcome::Rejected;
            };
            let entry = registry.get(port.id()).filter(|entry| match &port {
                PortRef::Named(_) => true,
                PortRef::Keyed(_, key) => entry.key.source == Some(*key),
            });
            match entry {
                Some(entry) if entry.direction == PortDirection::Source => entry.source.clone(),
                Some(_) => None,
                None => {
                    drop(registry);
                    self.inner.diagnostics.emit(Diagnostic::PortNotFound {
                        port: port.id().clone(),
                    });
                    return PushOutcome::PortNotFound;
                }
            }
        };

        let Some(endpoint) = endpoint else {
            self.inner.diagnostics.emit(Diagnostic::PushRejected {
                port: port.id().clone(),
                reason: "not an ingress port".to_string(),
            });
            return PushOutcome::Rejected;
        };

        match endpoint.push(data) {
            Ok(()) => {
                if let Ok(mut registry) = self.inner.registry.lock() {
                    if let Some(entry) = registry.get_mut(port.id()) {
                        entry.stats.frames += 1;
                        entry.stats.bytes += data.len() as u64;
                    }
                }
                PushOutcome::Queued
            }
            Err(_) if self.inner.is_stopped() => PushOutcome::Stopped,
            Err(e) => {
                self.inner.diagnostics.emit(Diagnostic::PushRejected {
                    port: port.id().clone(),
                    reason: e.to_string(),
                });
                PushOutcome::Rejected
            }
        }
    }

    /// Routes a datagram carrying RTP or RTCP to `rtp-in` or `rtcp-in`.
    pub fn push_packet(&self, data: &[u8]) -> PushOutcome {
        match classify(data) {
            Some(PacketKind::Rtp) => self.push("rtp-in", data),
            Some(PacketKind::Rtcp) => self.push("rtcp-in", data),
            None => {
                log::debug!("session {}: dropping non-rtp datagram", self.inner.id);
                PushOutcome::Rejected
            }
        }
    }

    pub fn end_of_stream(&self, port: impl Into<PortId>) -> Result<()> {
        let port = port.into();
        let endpoint = self
            .lock_registry()?
            .get(&port)
            .and_then(|entry| entry.source.clone())
            .ok_or_else(|| RelayError::PortNotFound { port: port.clone() })?;
        endpoint.end_of_stream()
    }

    pub fn fatal(&self) -> Option<EngineFatal> {
        self.inner.monitor.fatal()
    }

    /// `Err(RelayError::EngineFatal)` once the engine reached EOS or failed.
    pub fn check(&self) -> Result<()> {
        match self.inner.monitor.fatal() {
            Some(fatal) => Err(fatal.into()),
            None => Ok(()),
        }
    }

    pub async fn wait_fatal(&self) -> EngineFatal {
        self.inner.monitor.wait_fatal().await
    }

    pub fn fatal_receiver(&self) -> watch::Receiver<Option<EngineFatal>> {
        self.inner.monitor.subscribe()
    }

    pub fn set_shutdown_hook(&self, hook: ShutdownHook) {
        self.inner.monitor.set_shutdown_hook(hook);
    }

    pub fn diagnostics(&self) -> DiagnosticStream {
        self.inner.diagnostics.subscribe()
    }
}

fn pt_map_handler(payloads: PayloadTypeMap) -> PtMapHandler {
    Box::new(move |pt| {
        let caps = payloads.caps(pt);
        if caps.is_none() {
            log::debug!("no caps for payload type {}", pt);
        }
        caps
    })
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
