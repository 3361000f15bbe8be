//! In-process engine for loopback relaying and tests.
//!
//! Understands a small subset of the launch syntax: linear chains of
//! `appsrc`, `appsink`, `queue`, `identity`, `fakesink`, `rtpdemux`,
//! `rtprtxreceive`, `rtpjitterbuffer`, `rtpstorage` and the rtp
//! depayloaders. Every `appsrc` gets its own streaming thread, started on
//! PLAYING and joined on NULL.

use std::{
    any::Any,
    collections::HashMap,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use crate::{
    engine::{
        AuxReceiverFactory, Branch, BusHandler, BusMessage, Engine, EngineGraph, EngineState,
        EventLoop, PadAddedHandler, PadInfo, PtMapHandler, SampleHandler, SinkEndpoint,
        SourceEndpoint, Subgraph, SubgraphSpec,
    },
    error::{RelayError, Result},
};

mod element;
mod parse;

use element::{Behavior, BranchCore, Element, Meta, SrcItem};
use parse::ChainSpec;

#[derive(Clone, Copy, Debug, Default)]
pub struct MemoryEngine;

impl MemoryEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn compile(&self, descriptor: &str) -> Result<Arc<dyn EngineGraph>> {
        Ok(Arc::new(MemoryGraph::build(descriptor)?))
    }

    fn build_subgraph(&self, spec: &SubgraphSpec) -> Result<Box<dyn Subgraph>> {
        let chains = parse::parse(&spec.descriptor)?;
        let [chain] = chains.as_slice() else {
            return Err(RelayError::descriptor(format!(
                "subgraph {} must be a single chain",
                spec.name
            )));
        };
        let counter = AtomicUsize::new(0);
        let chain = build_chain(chain, &counter)?;
        validate(&chain, Role::Subgraph)?;

        for port in &spec.ports {
            if !chain.iter().any(|e| e.name == port.element) {
                return Err(RelayError::descriptor(format!(
                    "ghost port {} targets missing element {}",
                    port.name, port.element
                )));
            }
        }

        Ok(Box::new(MemorySubgraph {
            name: spec.name.clone(),
            chain,
            ports: spec.ports.iter().map(|p| p.name.clone()).collect(),
        }))
    }

    fn event_loop(&self) -> Option<Arc<dyn EventLoop>> {
        None
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Static,
    Branch,
    Subgraph,
}

fn build_chain(spec: &ChainSpec, counter: &AtomicUsize) -> Result<Vec<Arc<Element>>> {
    spec.iter()
        .map(|e| {
            Element::from_spec(e, |kind| {
                format!("{}{}", kind, counter.fetch_add(1, Ordering::Relaxed))
            })
            .map(Arc::new)
        })
        .collect()
}

fn validate(chain: &[Arc<Element>], role: Role) -> Result<()> {
    let last = chain.len().saturating_sub(1);
    for (i, element) in chain.iter().enumerate() {
        if element.is_source() && (role != Role::Static || i != 0) {
            return Err(RelayError::descriptor(format!(
                "{} ({}) must start a top-level chain",
                element.name, element.kind
            )));
        }
        if element.is_terminal() && i != last {
            return Err(RelayError::descriptor(format!(
                "cannot link from {} ({}): it has no src pad",
                element.name, element.kind
            )));
        }
    }

    let (Some(first), Some(tail)) = (chain.first(), chain.last()) else {
        return Err(RelayError::descriptor("empty chain"));
    };
    match role {
        Role::Static if !first.is_source() => Err(RelayError::descriptor(format!(
            "chain starting at {} has no source",
            first.name
        ))),
        Role::Static | Role::Branch if !tail.is_terminal() => Err(RelayError::descriptor(
            format!("{} ({}) has an unlinked src pad", tail.name, tail.kind),
        )),
        Role::Subgraph if tail.is_terminal() => Err(RelayError::descriptor(format!(
            "subgraph ends in {} which has no src pad",
            tail.name
        ))),
        _ => Ok(()),
    }
}

pub(crate) struct GraphCore {
    elements: RwLock<HashMap<String, Arc<Element>>>,
    chains: Vec<Vec<Arc<Element>>>,
    state: RwLock<EngineState>,
    bus: RwLock<Vec<Arc<BusHandler>>>,
    branches: Mutex<Vec<Arc<BranchCore>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    eos_remaining: AtomicUsize,
    counter: AtomicUsize,
}

impl GraphCore {
    fn state(&self) -> EngineState {
        self.state.read().map(|s| *s).unwrap_or(EngineState::Null)
    }

    fn set(&self, state: EngineState) -> EngineState {
        match self.state.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, state),
            Err(_) => EngineState::Null,
        }
    }

    fn element(&self, name: &str) -> Option<Arc<Element>> {
        self.elements.read().ok()?.get(name).cloned()
    }

    pub(crate) fn post(&self, message: BusMessage) {
        let handlers = match self.bus.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(&message);
        }
    }

    fn start_streaming(self: &Arc<Self>) -> Result<()> {
        for chain in &self.chains {
            let Some(head) = chain.first() else { continue };
            let Behavior::AppSrc(src) = &head.behavior else {
                continue;
            };
            let Some(mut rx) = src.rx.lock().ok().and_then(|mut rx| rx.take()) else {
                continue;
            };

            let core = Arc::clone(self);
            let chain = chain.clone();
            let handle = std::thread::Builder::new()
                .name(format!("memsrc-{}", head.name))
                .spawn(move || {
                    while let Some(item) = rx.blocking_recv() {
                        if core.state() == EngineState::Null {
                            break;
                        }
                        match item {
                            SrcItem::Buffer(buf) => {
                                core.run_chain(&chain[1..], buf, Meta::default());
                            }
                            SrcItem::Eos => {
                                if core.eos_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                                    core.post(BusMessage::Eos {
                                        source: "pipeline".to_string(),
                                    });
                                }
                                break;
                            }
                        }
                    }
                    log::debug!("memory engine: streaming thread for {} done", chain[0].name);
                })
                .map_err(|e| RelayError::engine(format!("spawn streaming thread: {}", e)))?;

            if let Ok(mut threads) = self.threads.lock() {
                threads.push(handle);
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        for chain in &self.chains {
            if let Some(Behavior::AppSrc(src)) = chain.first().map(|e| &e.behavior) {
                if let Ok(mut tx) = src.tx.lock() {
                    tx.take();
                }
                if let Ok(mut rx) = src.rx.lock() {
                    rx.take();
                }
            }
        }

        let handles: Vec<_> = match self.threads.lock() {
            Ok(mut threads) => threads.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let current = std::thread::current().id();
        for handle in handles {
            // a handler may stop the graph from its own streaming thread
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("memory engine: streaming thread panicked");
            }
        }

        if let Ok(branches) = self.branches.lock() {
            for branch in branches.iter() {
                branch.active.store(false, Ordering::Release);
            }
        }
    }
}

pub struct MemoryGraph {
    core: Arc<GraphCore>,
}

impl MemoryGraph {
    fn build(descriptor: &str) -> Result<Self> {
        let specs = parse::parse(descriptor)?;
        let counter = AtomicUsize::new(0);
        let mut elements: HashMap<String, Arc<Element>> = HashMap::new();
        let mut chains = Vec::with_capacity(specs.len());

        for spec in &specs {
            let chain = build_chain(spec, &counter)?;
            validate(&chain, Role::Static)?;
            for element in &chain {
                if elements
                    .insert(element.name.clone(), Arc::clone(element))
                    .is_some()
                {
                    return Err(RelayError::descriptor(format!(
                        "duplicate element name {}",
                        element.name
                    )));
                }
            }
            chains.push(chain);
        }

        let sources = chains.len();
        Ok(Self {
            core: Arc::new(GraphCore {
                elements: RwLock::new(elements),
                chains,
                state: RwLock::new(EngineState::Ready),
                bus: RwLock::new(Vec::new()),
                branches: Mutex::new(Vec::new()),
                threads: Mutex::new(Vec::new()),
                eos_remaining: AtomicUsize::new(sources),
                counter,
            }),
        })
    }
}

impl EngineGraph for MemoryGraph {
    fn state(&self) -> EngineState {
        self.core.state()
    }

    fn set_state(&self, state: EngineState) -> Result<()> {
        let current = self.core.state();
        if current == state {
            return Ok(());
        }

        match state {
            EngineState::Playing => {
                if current == EngineState::Null {
                    return Err(RelayError::engine("memory graph cannot restart after NULL"));
                }
                self.core.set(EngineState::Playing);
                if let Ok(branches) = self.core.branches.lock() {
                    for branch in branches.iter() {
                        branch.active.store(true, Ordering::Release);
                    }
                }
                self.core.start_streaming()?;
            }
            EngineState::Ready | EngineState::Paused => {
                if current != EngineState::Ready && current != EngineState::Paused {
                    return Err(RelayError::engine(format!(
                        "memory graph cannot go from {} to {}",
                        current, state
                    )));
                }
                self.core.set(state);
            }
            EngineState::Null => {
                self.core.set(EngineState::Null);
                self.core.shutdown();
            }
        }

        self.core.post(BusMessage::StateChanged {
            source: "pipeline".to_string(),
            old: current,
            new: state,
        });
        Ok(())
    }

    fn has_element(&self, element: &str) -> bool {
        self.core.element(element).is_some()
    }

    fn source(&self, element: &str) -> Option<Arc<dyn SourceEndpoint>> {
        let element = self.core.element(element)?;
        match element.behavior {
            Behavior::AppSrc(_) => Some(Arc::new(MemorySource { element })),
            _ => None,
        }
    }

    fn sink(&self, element: &str) -> Option<Arc<dyn SinkEndpoint>> {
        let element = self.core.element(element)?;
        match element.behavior {
            Behavior::AppSink(_) => Some(Arc::new(MemorySink { element })),
            _ => None,
        }
    }

    fn add_branch(&self, descriptor: &str) -> Result<Arc<dyn Branch>> {
        let chains = parse::parse(descriptor)?;
        let [spec] = chains.as_slice() else {
            return Err(RelayError::descriptor("branch must be a single chain"));
        };
        let chain = build_chain(spec, &self.core.counter)?;
        validate(&chain, Role::Branch)?;

        {
            let mut elements = self
                .core
                .elements
                .write()
                .map_err(|_| RelayError::engine("element table poisoned"))?;
            if let Some(dup) = chain.iter().find(|e| elements.contains_key(&e.name)) {
                return Err(RelayError::descriptor(format!(
                    "duplicate element name {}",
                    dup.name
                )));
            }
            for element in &chain {
                elements.insert(element.name.clone(), Arc::clone(element));
            }
        }

        Ok(Arc::new(MemoryBranch {
            core: Arc::new(BranchCore {
                chain,
                active: AtomicBool::new(false),
            }),
            graph: Arc::downgrade(&self.core),
        }))
    }

    fn on_pad_added(&self, element: &str, handler: PadAddedHandler) -> bool {
        match self.core.element(element).as_deref().map(|e| &e.behavior) {
            Some(Behavior::Demux(demux)) => {
                demux.set_pad_added(handler);
                true
            }
            _ => false,
        }
    }

    fn on_bus_message(&self, handler: BusHandler) -> Result<()> {
        self.core
            .bus
            .write()
            .map_err(|_| RelayError::engine("bus handlers poisoned"))?
            .push(Arc::new(handler));
        Ok(())
    }

    fn on_request_pt_map(&self, element: &str, handler: PtMapHandler) -> bool {
        match self.core.element(element).as_deref().map(|e| &e.behavior) {
            Some(Behavior::Demux(demux)) => {
                demux.set_pt_map(handler);
                true
            }
            Some(Behavior::Jitter(jitter)) => {
                jitter.set_pt_map(handler);
                true
            }
            _ => false,
        }
    }

    fn on_request_aux_receiver(&self, element: &str, factory: AuxReceiverFactory) -> bool {
        match self.core.element(element).as_deref().map(|e| &e.behavior) {
            Some(Behavior::Demux(demux)) => {
                demux.set_aux_factory(factory);
                true
            }
            _ => false,
        }
    }
}

impl Drop for MemoryGraph {
    fn drop(&mut self) {
        if self.core.state() != EngineState::Null {
            self.core.set(EngineState::Null);
            self.core.shutdown();
        }
    }
}

struct MemoryBranch {
    core: Arc<BranchCore>,
    graph: Weak<GraphCore>,
}

impl Branch for MemoryBranch {
    fn sink(&self, element: &str) -> Option<Arc<dyn SinkEndpoint>> {
        let element = self.core.chain.iter().find(|e| e.name == element)?;
        match element.behavior {
            Behavior::AppSink(_) => Some(Arc::new(MemorySink {
                element: Arc::clone(element),
            })),
            _ => None,
        }
    }

    fn link_from(&self, pad: &PadInfo) -> Result<()> {
        let graph = self
            .graph
            .upgrade()
            .ok_or_else(|| RelayError::engine("graph is gone"))?;
        let element = graph
            .element(&pad.element)
            .ok_or_else(|| RelayError::engine(format!("no element {}", pad.element)))?;
        match &element.behavior {
            Behavior::Demux(demux) => demux.link(&pad.name, Arc::clone(&self.core)),
            _ => Err(RelayError::engine(format!(
                "{} has no dynamic pad {}",
                pad.element, pad.name
            ))),
        }
    }

    fn sync_state_with_parent(&self) -> Result<()> {
        let graph = self
            .graph
            .upgrade()
            .ok_or_else(|| RelayError::engine("graph is gone"))?;
        match graph.state() {
            EngineState::Null => Err(RelayError::engine("parent graph is NULL")),
            state => {
                if let Ok(mut branches) = graph.branches.lock() {
                    branches.push(Arc::clone(&self.core));
                }
                self.core
                    .active
                    .store(state == EngineState::Playing, Ordering::Release);
                Ok(())
            }
        }
    }
}

struct MemorySink {
    element: Arc<Element>,
}

impl SinkEndpoint for MemorySink {
    fn name(&self) -> &str {
        &self.element.name
    }

    fn on_sample(&self, handler: SampleHandler) {
        if let Behavior::AppSink(sink) = &self.element.behavior {
            sink.set_handler(handler);
        }
    }
}

struct MemorySource {
    element: Arc<Element>,
}

impl MemorySource {
    fn send(&self, item: SrcItem) -> Result<()> {
        let Behavior::AppSrc(src) = &self.element.behavior else {
            return Err(RelayError::engine(format!("{} is not a source", self.element.name)));
        };
        let tx = src
            .tx
            .lock()
            .map_err(|_| RelayError::engine("appsrc poisoned"))?;
        match tx.as_ref() {
            Some(tx) => tx
                .send(item)
                .map_err(|_| RelayError::engine(format!("{} is flushing", self.element.name))),
            None => Err(RelayError::engine(format!(
                "{} is flushing",
                self.element.name
            ))),
        }
    }
}

impl SourceEndpoint for MemorySource {
    fn name(&self) -> &str {
        &self.element.name
    }

    fn push(&self, data: &[u8]) -> Result<()> {
        self.send(SrcItem::Buffer(data.to_vec()))
    }

    fn end_of_stream(&self) -> Result<()> {
        self.send(SrcItem::Eos)
    }
}

pub(crate) struct MemorySubgraph {
    name: String,
    pub(crate) chain: Vec<Arc<Element>>,
    ports: Vec<String>,
}

impl Subgraph for MemorySubgraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<String> {
        self.ports.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
