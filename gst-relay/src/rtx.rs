//! Retransmission receive stage, handed to the engine when it asks for an
//! auxiliary receiver for an RTP session.

use std::sync::Arc;

use crate::{
    engine::{Engine, EngineGraph, GhostPort, Subgraph, SubgraphSpec},
    error::{RelayError, Result},
    payload::RtxMap,
};

pub struct AuxReceiver {
    session: u32,
    subgraph: Box<dyn Subgraph>,
}

impl AuxReceiver {
    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn name(&self) -> &str {
        self.subgraph.name()
    }

    pub fn ports(&self) -> Vec<String> {
        self.subgraph.ports()
    }

    pub fn into_subgraph(self) -> Box<dyn Subgraph> {
        self.subgraph
    }
}

#[derive(Clone)]
pub struct RtxStageBuilder {
    engine: Arc<dyn Engine>,
}

impl RtxStageBuilder {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// `rtprtxreceive` exposed through `src_<id>` and `sink_<id>`.
    pub fn spec(session_id: u32, map: &RtxMap) -> SubgraphSpec {
        let element = format!("rtx_{}", session_id);
        SubgraphSpec {
            name: format!("rtxaux_{}", session_id),
            descriptor: format!(
                "rtprtxreceive name={} payload-type-map=\"{}\"",
                element,
                map.to_caps_string()
            ),
            ports: vec![
                GhostPort {
                    name: format!("src_{}", session_id),
                    element: element.clone(),
                    target: "src".to_string(),
                },
                GhostPort {
                    name: format!("sink_{}", session_id),
                    element,
                    target: "sink".to_string(),
                },
            ],
        }
    }

    pub fn build_aux_receiver(&self, session_id: u32, map: &RtxMap) -> Result<AuxReceiver> {
        if map.is_empty() {
            return Err(RelayError::Config {
                reason: "retransmission map is empty".to_string(),
            });
        }

        let subgraph = self.engine.build_subgraph(&Self::spec(session_id, map))?;
        let mut ports = subgraph.ports();
        ports.sort();
        let expected = vec![format!("sink_{}", session_id), format!("src_{}", session_id)];
        if ports != expected {
            return Err(RelayError::engine(format!(
                "aux receiver for session {} exposes {:?}",
                session_id, ports
            )));
        }

        Ok(AuxReceiver {
            session: session_id,
            subgraph,
        })
    }

    /// Answers the engine's aux-receiver requests on `element`. A build
    /// failure leaves that session without retransmission handling.
    pub(crate) fn install(self, graph: &Arc<dyn EngineGraph>, element: &str, map: RtxMap) -> bool {
        graph.on_request_aux_receiver(
            element,
            Box::new(move |session| match self.build_aux_receiver(session, &map) {
                Ok(aux) => {
                    log::debug!("aux receiver {} for session {}", aux.name(), session);
                    Some(aux.into_subgraph())
                }
                Err(e) => {
                    log::error!("aux receiver for session {}: {}", session, e);
                    None
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::memory::MemoryEngine;

    use super::*;

    #[test]
    fn aux_receiver_exposes_exactly_two_ports() {
        let builder = RtxStageBuilder::new(Arc::new(MemoryEngine::new()));
        let aux = builder.build_aux_receiver(3, &RtxMap::video_audio()).unwrap();
        assert_eq!(aux.session(), 3);
        let mut ports = aux.ports();
        ports.sort();
        assert_eq!(ports, vec!["sink_3".to_string(), "src_3".to_string()]);
    }

    #[test]
    fn spec_carries_the_pt_map() {
        let spec = RtxStageBuilder::spec(0, &RtxMap::audio_only());
        assert_eq!(
            spec.descriptor,
            "rtprtxreceive name=rtx_0 payload-type-map=\"application/x-rtp-pt-map,96=(uint)97\""
        );
    }

    #[test]
    fn empty_map_is_a_config_error() {
        let builder = RtxStageBuilder::new(Arc::new(MemoryEngine::new()));
        let err = builder.build_aux_receiver(0, &RtxMap::new()).err().unwrap();
        assert!(matches!(err, RelayError::Config { .. }));
    }
}
