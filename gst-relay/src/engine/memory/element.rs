use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::{
    engine::{
        AuxReceiverFactory, BusMessage, PadAddedHandler, PadInfo, PtMapHandler, SampleHandler,
        SampleRef,
    },
    error::{RelayError, Result},
    packet::{RtpHeader, set_payload_type, set_sequence},
    pad_name::{PadNameLayout, StreamName},
    payload::{Codec, RtxMap},
};

use super::{GraphCore, MemorySubgraph, parse::ElementSpec};

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Meta {
    pub duration: Option<u64>,
    pub pts: Option<u64>,
}

pub(crate) enum SrcItem {
    Buffer(Vec<u8>),
    Eos,
}

pub(crate) struct AppSrc {
    pub tx: Mutex<Option<UnboundedSender<SrcItem>>>,
    pub rx: Mutex<Option<UnboundedReceiver<SrcItem>>>,
}

#[derive(Default)]
pub(crate) struct AppSink {
    handler: RwLock<Option<Arc<SampleHandler>>>,
}

impl AppSink {
    pub fn set_handler(&self, handler: SampleHandler) {
        if let Ok(mut guard) = self.handler.write() {
            *guard = Some(Arc::new(handler));
        }
    }

    fn deliver(&self, data: &[u8], meta: Meta) {
        let handler = self.handler.read().ok().and_then(|h| h.clone());
        if let Some(handler) = handler {
            handler(SampleRef {
                data,
                duration: meta.duration,
                pts: meta.pts,
            });
        }
    }
}

/// Per-branch state shared between a dynamic pad and the graph.
pub(crate) struct BranchCore {
    pub chain: Vec<Arc<Element>>,
    pub active: AtomicBool,
}

enum AuxState {
    Unrequested,
    Absent,
    Present(Vec<Arc<Element>>),
}

struct DemuxInner {
    streams: HashMap<(u32, u8), Option<Arc<BranchCore>>>,
    pads: HashMap<String, (u32, u8)>,
    pad_added: Option<Arc<PadAddedHandler>>,
    pt_map: Option<Arc<PtMapHandler>>,
    aux_factory: Option<Arc<AuxReceiverFactory>>,
    aux: AuxState,
}

/// Splits RTP by (ssrc, payload type) and exposes one pad per pair, named
/// the way rtpbin names its receive pads.
pub(crate) struct Demux {
    session: u32,
    layout: PadNameLayout,
    inner: Mutex<DemuxInner>,
}

impl Demux {
    fn new(session: u32) -> Self {
        Self {
            session,
            layout: PadNameLayout::v1(),
            inner: Mutex::new(DemuxInner {
                streams: HashMap::new(),
                pads: HashMap::new(),
                pad_added: None,
                pt_map: None,
                aux_factory: None,
                aux: AuxState::Unrequested,
            }),
        }
    }

    pub fn set_pad_added(&self, handler: PadAddedHandler) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pad_added = Some(Arc::new(handler));
        }
    }

    pub fn set_pt_map(&self, handler: PtMapHandler) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pt_map = Some(Arc::new(handler));
        }
    }

    pub fn set_aux_factory(&self, factory: AuxReceiverFactory) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.aux_factory = Some(Arc::new(factory));
            inner.aux = AuxState::Unrequested;
        }
    }

    pub fn link(&self, pad: &str, branch: Arc<BranchCore>) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| RelayError::engine("demux lock poisoned"))?;
        let key = *inner
            .pads
            .get(pad)
            .ok_or_else(|| RelayError::engine(format!("no pad {}", pad)))?;
        match inner.streams.get_mut(&key) {
            Some(slot) if slot.is_none() => {
                *slot = Some(branch);
                Ok(())
            }
            Some(_) => Err(RelayError::engine(format!("pad {} already linked", pad))),
            None => Err(RelayError::engine(format!("no stream for pad {}", pad))),
        }
    }

    fn aux_chain(&self) -> Option<Vec<Arc<Element>>> {
        let factory = {
            let mut inner = self.inner.lock().ok()?;
            match &inner.aux {
                AuxState::Present(chain) => return Some(chain.clone()),
                AuxState::Absent => return None,
                AuxState::Unrequested => {}
            }
            let factory = inner.aux_factory.clone();
            if factory.is_none() {
                inner.aux = AuxState::Absent;
            }
            factory?
        };

        let chain = factory(self.session).and_then(|sub| {
            sub.as_any()
                .downcast_ref::<MemorySubgraph>()
                .map(|s| s.chain.clone())
        });
        let mut inner = self.inner.lock().ok()?;
        inner.aux = match &chain {
            Some(chain) => AuxState::Present(chain.clone()),
            None => AuxState::Absent,
        };
        chain
    }

    fn route(&self, core: &GraphCore, name: &str, buf: Vec<u8>, meta: Meta) {
        let (buf, meta) = match self.aux_chain() {
            Some(chain) => match core.run_chain(&chain, buf, meta) {
                Some(out) => out,
                None => return,
            },
            None => (buf, meta),
        };

        let header = match RtpHeader::parse(&buf) {
            Ok(h) => h,
            Err(e) => {
                core.post(BusMessage::Warning {
                    source: name.to_string(),
                    message: format!("dropping non-rtp buffer: {}", e),
                });
                return;
            }
        };
        let key = (header.ssrc, header.payload_type);

        let (mut branch, new_pad) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            match inner.streams.get(&key) {
                Some(branch) => (branch.clone(), None),
                None => {
                    let pad = self.layout.format(&StreamName {
                        session: self.session,
                        ssrc: header.ssrc,
                        payload_type: header.payload_type,
                    });
                    inner.streams.insert(key, None);
                    inner.pads.insert(pad.clone(), key);
                    (
                        None,
                        Some((pad, inner.pad_added.clone(), inner.pt_map.clone())),
                    )
                }
            }
        };

        // Handlers run unlocked: they link the pad from this thread.
        if let Some((pad, pad_added, pt_map)) = new_pad {
            let caps = pt_map
                .and_then(|h| h(header.payload_type))
                .map(|c| c.to_string());
            if let Some(handler) = pad_added {
                handler(&PadInfo {
                    element: name.to_string(),
                    name: pad,
                    caps,
                });
            }
            branch = self
                .inner
                .lock()
                .ok()
                .and_then(|inner| inner.streams.get(&key).cloned().flatten());
        }

        if let Some(branch) = branch {
            if branch.active.load(Ordering::Acquire) {
                core.run_chain(&branch.chain, buf, meta);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct Jitter {
    known: Mutex<HashSet<u8>>,
    /// Payload types already warned about.
    rejected: Mutex<HashSet<u8>>,
    pt_map: Mutex<Option<Arc<PtMapHandler>>>,
}

impl Jitter {
    pub fn set_pt_map(&self, handler: PtMapHandler) {
        if let Ok(mut guard) = self.pt_map.lock() {
            *guard = Some(Arc::new(handler));
        }
    }

    /// Packets whose payload type has no caps are dropped, as the real
    /// jitter buffer does when `request-pt-map` answers nothing. The warning
    /// is posted once per payload type.
    fn accept(&self, core: &GraphCore, name: &str, buf: &[u8]) -> bool {
        let Some(handler) = self.pt_map.lock().ok().and_then(|h| h.clone()) else {
            return true;
        };
        let Ok(header) = RtpHeader::parse(buf) else {
            return false;
        };
        let pt = header.payload_type;
        if self.known.lock().map(|k| k.contains(&pt)).unwrap_or(false) {
            return true;
        }
        match handler(pt) {
            Some(_) => {
                if let Ok(mut known) = self.known.lock() {
                    known.insert(pt);
                }
                true
            }
            None => {
                let first = self
                    .rejected
                    .lock()
                    .map(|mut rejected| rejected.insert(pt))
                    .unwrap_or(false);
                if first {
                    core.post(BusMessage::Warning {
                        source: name.to_string(),
                        message: format!("no caps for payload type {}", pt),
                    });
                }
                false
            }
        }
    }
}

pub(crate) enum Behavior {
    AppSrc(AppSrc),
    AppSink(AppSink),
    Pass,
    Discard,
    Demux(Demux),
    Rtx(RtxMap),
    Jitter(Jitter),
    Depay { codec: Codec, clock_rate: u32 },
}

pub(crate) struct Element {
    pub name: String,
    pub kind: String,
    pub behavior: Behavior,
}

impl Element {
    pub fn from_spec(spec: &ElementSpec, auto_name: impl FnOnce(&str) -> String) -> Result<Self> {
        let kind = spec.kind.as_str();
        let behavior = match kind {
            "appsrc" => {
                let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
                Behavior::AppSrc(AppSrc {
                    tx: Mutex::new(Some(tx)),
                    rx: Mutex::new(Some(rx)),
                })
            }
            "appsink" => Behavior::AppSink(AppSink::default()),
            "queue" | "identity" | "rtpstorage" => Behavior::Pass,
            "fakesink" => Behavior::Discard,
            "rtpjitterbuffer" => Behavior::Jitter(Jitter::default()),
            "rtprtxreceive" => match spec.prop("payload-type-map") {
                Some(value) => Behavior::Rtx(value.parse()?),
                None => Behavior::Rtx(RtxMap::new()),
            },
            "rtpdemux" => {
                let session = match spec.prop("session") {
                    Some(v) => v.parse::<u32>().map_err(|e| {
                        RelayError::descriptor(format!("rtpdemux session {:?}: {}", v, e))
                    })?,
                    None => 0,
                };
                Behavior::Demux(Demux::new(session))
            }
            other => match Codec::from_depayloader(other) {
                Some(codec) => {
                    let clock_rate = match spec.prop("clock-rate") {
                        Some(v) => v.parse::<u32>().map_err(|e| {
                            RelayError::descriptor(format!("{} clock-rate {:?}: {}", other, v, e))
                        })?,
                        None => codec.default_clock_rate(),
                    };
                    Behavior::Depay { codec, clock_rate }
                }
                None => {
                    return Err(RelayError::descriptor(format!(
                        "no element type {:?}",
                        other
                    )));
                }
            },
        };

        let name = match spec.prop("name") {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => auto_name(kind),
        };

        Ok(Self {
            name,
            kind: kind.to_string(),
            behavior,
        })
    }

    /// Elements with no src pad; nothing can be linked after them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.behavior,
            Behavior::AppSink(_) | Behavior::Discard | Behavior::Demux(_)
        )
    }

    pub fn is_source(&self) -> bool {
        matches!(self.behavior, Behavior::AppSrc(_))
    }
}

/// RFC 4588 receive side: a packet on a mapped rtx payload type gets its
/// original payload type back and the OSN as sequence number. Everything
/// else passes through untouched.
pub(crate) fn rtx_receive(map: &RtxMap, buf: Vec<u8>) -> Option<Vec<u8>> {
    let Ok(header) = RtpHeader::parse(&buf) else {
        return Some(buf);
    };
    let Some(original) = map.original_for(header.payload_type) else {
        return Some(buf);
    };
    let payload = header.payload(&buf);
    if payload.len() < 2 {
        return None;
    }
    let osn = u16::from_be_bytes([payload[0], payload[1]]);

    let mut out = Vec::with_capacity(buf.len() - 2);
    out.extend_from_slice(&buf[..header.payload_offset]);
    out.extend_from_slice(&payload[2..]);
    out[0] &= !0x20;
    set_payload_type(&mut out, original);
    set_sequence(&mut out, osn);
    Some(out)
}

impl GraphCore {
    /// Pushes one buffer through `chain`. Returns the buffer when it falls
    /// off the end of a chain without a terminal element.
    pub(crate) fn run_chain(
        &self,
        chain: &[Arc<Element>],
        mut buf: Vec<u8>,
        mut meta: Meta,
    ) -> Option<(Vec<u8>, Meta)> {
        for element in chain {
            match &element.behavior {
                Behavior::AppSrc(_) | Behavior::Pass => {}
                Behavior::Discard => return None,
                Behavior::AppSink(sink) => {
                    sink.deliver(&buf, meta);
                    return None;
                }
                Behavior::Rtx(map) => buf = rtx_receive(map, buf)?,
                Behavior::Jitter(jitter) => {
                    if !jitter.accept(self, &element.name, &buf) {
                        return None;
                    }
                }
                Behavior::Depay { codec, clock_rate } => match RtpHeader::parse(&buf) {
                    Ok(header) => {
                        meta.pts = Some(
                            header.timestamp as u64 * 1_000_000_000 / (*clock_rate).max(1) as u64,
                        );
                        buf = header.payload(&buf).to_vec();
                    }
                    Err(e) => {
                        self.post(BusMessage::Error {
                            source: element.name.clone(),
                            message: format!("{} could not depayload buffer", codec),
                            debug: Some(e.to_string()),
                        });
                        return None;
                    }
                },
                Behavior::Demux(demux) => {
                    demux.route(self, &element.name, buf, meta);
                    return None;
                }
            }
        }
        Some((buf, meta))
    }
}
