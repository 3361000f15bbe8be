//! Capability interface of the media engine.
//!
//! The relay never touches engine internals: it compiles a descriptor into
//! an [`EngineGraph`], looks endpoints up by element name and registers one
//! handler per event kind (samples, new pads, bus messages, pt-map and
//! aux-receiver requests).

use std::{any::Any, fmt, sync::Arc};

use crate::{error::Result, payload::RtpCaps};

#[cfg(feature = "gstreamer")]
pub mod gstreamer;
pub mod memory;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EngineState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Null => "NULL",
            EngineState::Ready => "READY",
            EngineState::Paused => "PAUSED",
            EngineState::Playing => "PLAYING",
        };
        f.write_str(s)
    }
}

/// A completed output unit, borrowed from the engine for the duration of one
/// callback. The lifetime keeps engine memory from escaping the callback;
/// anything the host keeps must be copied out.
#[derive(Clone, Copy, Debug)]
pub struct SampleRef<'a> {
    pub data: &'a [u8],
    /// Nanoseconds.
    pub duration: Option<u64>,
    /// Nanoseconds.
    pub pts: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PadInfo {
    /// Element that exposed the pad.
    pub element: String,
    pub name: String,
    pub caps: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusMessage {
    Eos {
        source: String,
    },
    Error {
        source: String,
        message: String,
        debug: Option<String>,
    },
    Warning {
        source: String,
        message: String,
    },
    StateChanged {
        source: String,
        old: EngineState,
        new: EngineState,
    },
    Other {
        source: String,
        kind: String,
    },
}

pub type SampleHandler = Box<dyn Fn(SampleRef<'_>) + Send + Sync>;
pub type PadAddedHandler = Box<dyn Fn(&PadInfo) + Send + Sync>;
pub type BusHandler = Box<dyn Fn(&BusMessage) + Send + Sync>;
pub type PtMapHandler = Box<dyn Fn(u8) -> Option<RtpCaps> + Send + Sync>;
pub type AuxReceiverFactory = Box<dyn Fn(u32) -> Option<Box<dyn Subgraph>> + Send + Sync>;

pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-time engine initialisation, idempotent.
    fn init(&self) -> Result<()>;

    /// Parses `descriptor` into a graph left in READY.
    fn compile(&self, descriptor: &str) -> Result<Arc<dyn EngineGraph>>;

    fn build_subgraph(&self, spec: &SubgraphSpec) -> Result<Box<dyn Subgraph>>;

    /// Event pump the engine needs driven on a dedicated thread, if any.
    fn event_loop(&self) -> Option<Arc<dyn EventLoop>>;
}

pub trait EventLoop: Send + Sync {
    /// Blocks until [`quit`](Self::quit) is called.
    fn run(&self);
    fn quit(&self);
}

pub trait EngineGraph: Send + Sync {
    fn state(&self) -> EngineState;

    /// Blocks until the engine's elements settle in `state`.
    fn set_state(&self, state: EngineState) -> Result<()>;

    fn has_element(&self, element: &str) -> bool;

    fn source(&self, element: &str) -> Option<Arc<dyn SourceEndpoint>>;

    fn sink(&self, element: &str) -> Option<Arc<dyn SinkEndpoint>>;

    /// Adds an unlinked chain described by `descriptor` to the graph.
    fn add_branch(&self, descriptor: &str) -> Result<Arc<dyn Branch>>;

    /// Returns false when `element` does not exist or never exposes pads.
    fn on_pad_added(&self, element: &str, handler: PadAddedHandler) -> bool;

    fn on_bus_message(&self, handler: BusHandler) -> Result<()>;

    fn on_request_pt_map(&self, element: &str, handler: PtMapHandler) -> bool;

    fn on_request_aux_receiver(&self, element: &str, factory: AuxReceiverFactory) -> bool;
}

pub trait Branch: Send + Sync {
    fn sink(&self, element: &str) -> Option<Arc<dyn SinkEndpoint>>;

    fn link_from(&self, pad: &PadInfo) -> Result<()>;

    fn sync_state_with_parent(&self) -> Result<()>;
}

pub trait SinkEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Replaces any previous handler. Called on the engine's streaming thread.
    fn on_sample(&self, handler: SampleHandler);
}

pub trait SourceEndpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Copies `data` into an engine-owned buffer and queues it.
    fn push(&self, data: &[u8]) -> Result<()>;

    fn end_of_stream(&self) -> Result<()>;
}

/// A self-contained sub-graph spliced into a parent as a black box.
pub trait Subgraph: Send + Sync {
    fn name(&self) -> &str;

    fn ports(&self) -> Vec<String>;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GhostPort {
    pub name: String,
    pub element: String,
    /// Pad on `element` the ghost port targets ("src" or "sink").
    pub target: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubgraphSpec {
    pub name: String,
    pub descriptor: String,
    pub ports: Vec<GhostPort>,
}
