//! Wiring of per-source branches as the engine discovers new streams.
//!
//! Every new pad on the demultiplexer goes through the same steps: parse the
//! pad name, look the payload type up, build a depayloader branch ending in
//! an appsink, register a port for the source, link, and sync state. Nothing
//! here panics; a stream that cannot be wired becomes a diagnostic.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::{
    diagnostic::Diagnostic,
    engine::{EngineGraph, PadInfo},
    error::{RelayError, Result},
    pad_name::{PadNameLayout, StreamName},
    payload::{Codec, PayloadTypeMap},
    port::{PortEntry, PortId, PortKey, SourceKey},
    relay,
    session::SessionInner,
};

/// What to do when a source key shows up again on a new pad.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReappearPolicy {
    /// Keep the existing port and its handler.
    #[default]
    Reuse,
    /// Register `ssrc-<ssrc>.<generation>` and repoint the source key.
    Replace,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub key: SourceKey,
    pub session: u32,
    pub payload_type: u8,
    pub codec: Codec,
    pub port: PortId,
    /// Caps the engine negotiated for the pad, when it reports them.
    pub caps: Option<String>,
}

pub fn branch_descriptor(codec: Codec, sink: &str) -> String {
    format!("queue ! {} ! appsink name={}", codec.depayloader(), sink)
}

fn branch_sink_name(stream: &StreamName) -> String {
    format!(
        "demux_{}_{}_{}",
        stream.session, stream.ssrc, stream.payload_type
    )
}

/// Outcome of reserving a port for a new pad.
struct Reservation {
    port: PortId,
    created: bool,
    /// Port the source key pointed at before, restored on rollback.
    previous: Option<PortKey>,
}

pub(crate) struct DemuxWiring {
    pub layout: PadNameLayout,
    pub policy: ReappearPolicy,
    pub payloads: PayloadTypeMap,
    pub graph: Weak<dyn EngineGraph>,
    pub session: Arc<SessionInner>,
}

impl DemuxWiring {
    /// Returns false when `element` does not expose dynamic pads.
    pub fn install(self, graph: &Arc<dyn EngineGraph>, element: &str) -> bool {
        graph.on_pad_added(element, Box::new(move |pad| self.on_pad_added(pad)))
    }

    /// Pad name and payload type of a new pad.
    fn resolve(&self, pad: &PadInfo) -> Result<(StreamName, Codec)> {
        let stream = self.layout.parse(&pad.name)?;
        let info = self
            .payloads
            .get(stream.payload_type)
            .ok_or(RelayError::UnsupportedPayloadType {
                ssrc: stream.ssrc,
                payload_type: stream.payload_type,
            })?;
        Ok((stream, info.codec))
    }

    fn on_pad_added(&self, pad: &PadInfo) {
        if self.session.is_stopped() {
            return;
        }

        let (stream, codec) = match self.resolve(pad) {
            Ok(resolved) => resolved,
            Err(RelayError::PadName(error)) => {
                self.session.diagnostics.emit(Diagnostic::UnparsedPad {
                    pad: pad.name.clone(),
                    error,
                });
                return;
            }
            Err(RelayError::UnsupportedPayloadType { ssrc, payload_type }) => {
                self.session
                    .diagnostics
                    .emit(Diagnostic::UnsupportedPayloadType { ssrc, payload_type });
                return;
            }
            Err(e) => {
                log::error!("session {}: pad {}: {}", self.session.id, pad.name, e);
                return;
            }
        };

        let Some(graph) = self.graph.upgrade() else {
            return;
        };

        let sink_name = branch_sink_name(&stream);
        let key = SourceKey::from_ssrc(stream.ssrc);

        let reservation = match self.reserve(key, &stream) {
            Ok(reservation) => reservation,
            Err(e) => {
                self.branch_failed(&PortId::for_source(stream.ssrc, 0), e.to_string());
                return;
            }
        };
        let port = reservation.port.clone();

        let branch = match graph.add_branch(&branch_descriptor(codec, &sink_name)) {
            Ok(branch) => branch,
            Err(e) => {
                self.release(key, reservation);
                self.branch_failed(&port, e.to_string());
                return;
            }
        };
        let Some(sink) = branch.sink(&sink_name) else {
            self.release(key, reservation);
            self.branch_failed(&port, format!("branch has no sink {}", sink_name));
            return;
        };
        sink.on_sample(relay::sample_handler(
            Arc::clone(&self.session),
            port.clone(),
        ));

        if let Err(e) = branch.link_from(pad) {
            self.branch_failed(&port, e.to_string());
            return;
        }
        if let Err(e) = branch.sync_state_with_parent() {
            self.branch_failed(&port, e.to_string());
            return;
        }

        log::info!(
            "session {}: ssrc {} pt {} ({}) on port {}",
            self.session.id,
            stream.ssrc,
            stream.payload_type,
            codec,
            port
        );

        if reservation.created {
            let handler = self.session.new_source.read().ok().and_then(|h| h.clone());
            if let Some(handler) = handler {
                handler(&SourceInfo {
                    key,
                    session: stream.session,
                    payload_type: stream.payload_type,
                    codec,
                    port,
                    caps: pad.caps.clone(),
                });
            }
        }
    }

    /// Resolves the port for `key` under the registry lock, registering a
    /// new one unless the policy reuses the existing port.
    fn reserve(&self, key: SourceKey, stream: &StreamName) -> Result<Reservation> {
        let mut registry = self
            .session
            .registry
            .lock()
            .map_err(|_| RelayError::invalid_state("port registry poisoned"))?;

        let previous = registry.port_for_source(key).cloned();
        let generation = match (&previous, self.policy) {
            (Some(existing), ReappearPolicy::Reuse) => {
                return Ok(Reservation {
                    port: existing.id.clone(),
                    created: false,
                    previous: None,
                });
            }
            (Some(_), ReappearPolicy::Replace) => registry.next_generation(key),
            (None, _) => 0,
        };

        let port = PortKey {
            id: PortId::for_source(stream.ssrc, generation),
            source: Some(key),
        };
        registry.register(PortEntry::sink(port.clone(), true))?;
        registry.bind_source(key, port.clone());
        Ok(Reservation {
            port: port.id,
            created: true,
            previous,
        })
    }

    /// Undoes a reservation whose branch could not be built.
    fn release(&self, key: SourceKey, reservation: Reservation) {
        if !reservation.created {
            return;
        }
        let Ok(mut registry) = self.session.registry.lock() else {
            return;
        };
        registry.remove(&reservation.port);
        match reservation.previous {
            Some(previous) => registry.bind_source(key, previous),
            None => registry.unbind_source(key),
        }
    }

    fn branch_failed(&self, port: &PortId, reason: String) {
        self.session.diagnostics.emit(Diagnostic::BranchFailed {
            port: port.clone(),
            reason,
        });
    }
}
