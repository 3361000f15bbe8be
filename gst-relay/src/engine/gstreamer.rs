//! GStreamer backend.

use std::{
    any::Any,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use gst::{glib, prelude::*};

use crate::{
    engine::{
        AuxReceiverFactory, Branch, BusHandler, BusMessage, Engine, EngineGraph, EngineState,
        EventLoop, PadAddedHandler, PadInfo, PtMapHandler, SampleHandler, SampleRef, SinkEndpoint,
        SourceEndpoint, Subgraph, SubgraphSpec,
    },
    error::{RelayError, Result},
};

const STATE_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(5);

fn engine_err(context: &str, e: impl std::fmt::Display) -> RelayError {
    RelayError::engine(format!("{}: {}", context, e))
}

fn to_gst(state: EngineState) -> gst::State {
    match state {
        EngineState::Null => gst::State::Null,
        EngineState::Ready => gst::State::Ready,
        EngineState::Paused => gst::State::Paused,
        EngineState::Playing => gst::State::Playing,
    }
}

fn from_gst(state: gst::State) -> EngineState {
    match state {
        gst::State::Ready => EngineState::Ready,
        gst::State::Paused => EngineState::Paused,
        gst::State::Playing => EngineState::Playing,
        _ => EngineState::Null,
    }
}

#[derive(Default)]
pub struct GstEngine {
    main_loop: std::sync::OnceLock<Arc<GstMainLoop>>,
}

impl GstEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for GstEngine {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn init(&self) -> Result<()> {
        gst::init().map_err(|e| engine_err("gst init", e))
    }

    fn compile(&self, descriptor: &str) -> Result<Arc<dyn EngineGraph>> {
        let element =
            gst::parse::launch(descriptor).map_err(|e| RelayError::descriptor(e.to_string()))?;
        let pipeline = match element.downcast::<gst::Pipeline>() {
            Ok(pipeline) => pipeline,
            Err(element) => {
                let pipeline = gst::Pipeline::new();
                pipeline
                    .add(&element)
                    .map_err(|e| RelayError::descriptor(e.to_string()))?;
                pipeline
            }
        };
        pipeline
            .set_state(gst::State::Ready)
            .map_err(|e| engine_err("set READY", e))?;
        Ok(Arc::new(GstGraph::new(pipeline)?))
    }

    fn build_subgraph(&self, spec: &SubgraphSpec) -> Result<Box<dyn Subgraph>> {
        let bin = gst::parse::bin_from_description_with_name(&spec.descriptor, false, &spec.name)
            .map_err(|e| RelayError::descriptor(e.to_string()))?;
        for port in &spec.ports {
            let target = bin
                .by_name(&port.element)
                .and_then(|element| element.static_pad(&port.target))
                .ok_or_else(|| {
                    RelayError::descriptor(format!(
                        "ghost port {} targets missing pad {}.{}",
                        port.name, port.element, port.target
                    ))
                })?;
            let ghost = gst::GhostPad::builder_with_target(&target)
                .map_err(|e| engine_err("ghost pad", e))?
                .name(port.name.as_str())
                .build();
            bin.add_pad(&ghost).map_err(|e| engine_err("add ghost pad", e))?;
        }
        Ok(Box::new(GstSubgraph {
            name: spec.name.clone(),
            bin,
        }))
    }

    fn event_loop(&self) -> Option<Arc<dyn EventLoop>> {
        let main_loop = self
            .main_loop
            .get_or_init(|| Arc::new(GstMainLoop::new()));
        Some(Arc::clone(main_loop) as Arc<dyn EventLoop>)
    }
}

struct GstMainLoop {
    main_loop: glib::MainLoop,
    quit: Arc<AtomicBool>,
}

impl GstMainLoop {
    fn new() -> Self {
        Self {
            main_loop: glib::MainLoop::new(None, false),
            quit: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl EventLoop for GstMainLoop {
    fn run(&self) {
        // a quit that lands before run() would otherwise be lost
        let quit = Arc::clone(&self.quit);
        let main_loop = self.main_loop.clone();
        glib::timeout_add(Duration::from_millis(100), move || {
            if quit.load(Ordering::Acquire) {
                main_loop.quit();
                glib::ControlFlow::Break
            } else {
                glib::ControlFlow::Continue
            }
        });
        self.main_loop.run();
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.main_loop.quit();
    }
}

pub struct GstGraph {
    pipeline: gst::Pipeline,
    bus_handlers: Arc<RwLock<Vec<Arc<BusHandler>>>>,
}

impl GstGraph {
    fn new(pipeline: gst::Pipeline) -> Result<Self> {
        let bus_handlers: Arc<RwLock<Vec<Arc<BusHandler>>>> = Arc::new(RwLock::new(Vec::new()));
        let bus = pipeline
            .bus()
            .ok_or_else(|| RelayError::engine("pipeline has no bus"))?;
        let handlers = Arc::clone(&bus_handlers);
        bus.set_sync_handler(move |_, msg| {
            let message = convert(msg);
            let handlers = handlers.read().map(|h| h.clone()).unwrap_or_default();
            for handler in handlers {
                handler(&message);
            }
            gst::BusSyncReply::Drop
        });
        Ok(Self {
            pipeline,
            bus_handlers,
        })
    }
}

fn has_signal(element: &gst::Element, signal: &str) -> bool {
    glib::subclass::SignalId::lookup(signal, element.type_()).is_some()
}

fn source_name(msg: &gst::Message) -> String {
    msg.src()
        .map(|s| s.path_string().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn convert(msg: &gst::Message) -> BusMessage {
    use gst::MessageView;

    let source = source_name(msg);
    match msg.view() {
        MessageView::Eos(..) => BusMessage::Eos { source },
        MessageView::Error(err) => BusMessage::Error {
            source,
            message: err.error().to_string(),
            debug: err.debug().map(|d| d.to_string()),
        },
        MessageView::Warning(warning) => BusMessage::Warning {
            source,
            message: warning.error().to_string(),
        },
        MessageView::StateChanged(changed) => BusMessage::StateChanged {
            source,
            old: from_gst(changed.old()),
            new: from_gst(changed.current()),
        },
        _ => BusMessage::Other {
            source,
            kind: format!("{:?}", msg.type_()),
        },
    }
}

impl EngineGraph for GstGraph {
    fn state(&self) -> EngineState {
        from_gst(self.pipeline.current_state())
    }

    fn set_state(&self, state: EngineState) -> Result<()> {
        self.pipeline
            .set_state(to_gst(state))
            .map_err(|e| engine_err(&format!("set {}", state), e))?;
        let (result, _, _) = self.pipeline.state(STATE_TIMEOUT);
        result.map_err(|e| engine_err(&format!("wait for {}", state), e))?;
        Ok(())
    }

    fn has_element(&self, element: &str) -> bool {
        self.pipeline.by_name(element).is_some()
    }

    fn source(&self, element: &str) -> Option<Arc<dyn SourceEndpoint>> {
        let appsrc = self
            .pipeline
            .by_name(element)?
            .downcast::<gst_app::AppSrc>()
            .ok()?;
        Some(Arc::new(GstSource {
            name: appsrc.name().to_string(),
            appsrc,
        }))
    }

    fn sink(&self, element: &str) -> Option<Arc<dyn SinkEndpoint>> {
        let appsink = self
            .pipeline
            .by_name(element)?
            .downcast::<gst_app::AppSink>()
            .ok()?;
        Some(Arc::new(GstSink {
            name: appsink.name().to_string(),
            appsink,
        }))
    }

    fn add_branch(&self, descriptor: &str) -> Result<Arc<dyn Branch>> {
        let bin = gst::parse::bin_from_description(descriptor, true)
            .map_err(|e| RelayError::descriptor(e.to_string()))?;
        self.pipeline
            .add(&bin)
            .map_err(|e| engine_err("add branch", e))?;
        Ok(Arc::new(GstBranch {
            pipeline: self.pipeline.clone(),
            bin,
        }))
    }

    fn on_pad_added(&self, element: &str, handler: PadAddedHandler) -> bool {
        let Some(element) = self.pipeline.by_name(element) else {
            return false;
        };
        element.connect_pad_added(move |element, pad| {
            handler(&PadInfo {
                element: element.name().to_string(),
                name: pad.name().to_string(),
                caps: pad.current_caps().map(|caps| caps.to_string()),
            });
        });
        true
    }

    fn on_bus_message(&self, handler: BusHandler) -> Result<()> {
        self.bus_handlers
            .write()
            .map_err(|_| RelayError::engine("bus handlers poisoned"))?
            .push(Arc::new(handler));
        Ok(())
    }

    fn on_request_pt_map(&self, element: &str, handler: PtMapHandler) -> bool {
        let Some(element) = self.pipeline.by_name(element) else {
            return false;
        };
        if !has_signal(&element, "request-pt-map") {
            return false;
        }
        // jitterbuffer passes (pt), rtpbin passes (session, pt)
        element.connect("request-pt-map", false, move |values| {
            let pt = values.last()?.get::<u32>().ok()?;
            let pt = u8::try_from(pt).ok()?;
            let caps = handler(pt)?.to_string().parse::<gst::Caps>().ok()?;
            Some(caps.to_value())
        });
        true
    }

    fn on_request_aux_receiver(&self, element: &str, factory: AuxReceiverFactory) -> bool {
        let Some(element) = self.pipeline.by_name(element) else {
            return false;
        };
        if !has_signal(&element, "request-aux-receiver") {
            return false;
        }
        element.connect("request-aux-receiver", false, move |values| {
            let session = values.get(1)?.get::<u32>().ok()?;
            let subgraph = factory(session)?;
            let bin = subgraph.as_any().downcast_ref::<GstSubgraph>()?.bin.clone();
            Some(bin.upcast::<gst::Element>().to_value())
        });
        true
    }
}

impl Drop for GstGraph {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            log::error!("pipeline to NULL on drop: {}", e);
        }
    }
}

struct GstBranch {
    pipeline: gst::Pipeline,
    bin: gst::Bin,
}

impl Branch for GstBranch {
    fn sink(&self, element: &str) -> Option<Arc<dyn SinkEndpoint>> {
        let appsink = self
            .bin
            .by_name(element)?
            .downcast::<gst_app::AppSink>()
            .ok()?;
        Some(Arc::new(GstSink {
            name: appsink.name().to_string(),
            appsink,
        }))
    }

    fn link_from(&self, pad: &PadInfo) -> Result<()> {
        let src = self
            .pipeline
            .by_name(&pad.element)
            .and_then(|element| element.pads().into_iter().find(|p| p.name() == pad.name.as_str()))
            .ok_or_else(|| RelayError::engine(format!("no pad {}.{}", pad.element, pad.name)))?;
        let sink = self
            .bin
            .static_pad("sink")
            .ok_or_else(|| RelayError::engine("branch has no sink pad"))?;
        src.link(&sink)
            .map(|_| ())
            .map_err(|e| engine_err(&format!("link {}", pad.name), e))
    }

    fn sync_state_with_parent(&self) -> Result<()> {
        self.bin
            .sync_state_with_parent()
            .map_err(|e| engine_err("sync branch state", e))
    }
}

struct GstSink {
    name: String,
    appsink: gst_app::AppSink,
}

impl SinkEndpoint for GstSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_sample(&self, handler: SampleHandler) {
        self.appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    handler(SampleRef {
                        data: map.as_slice(),
                        duration: buffer.duration().map(|d| d.nseconds()),
                        pts: buffer.pts().map(|t| t.nseconds()),
                    });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }
}

struct GstSource {
    name: String,
    appsrc: gst_app::AppSrc,
}

impl SourceEndpoint for GstSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn push(&self, data: &[u8]) -> Result<()> {
        let buffer = gst::Buffer::from_slice(data.to_vec());
        self.appsrc
            .push_buffer(buffer)
            .map(|_| ())
            .map_err(|e| engine_err("push", e))
    }

    fn end_of_stream(&self) -> Result<()> {
        self.appsrc
            .end_of_stream()
            .map(|_| ())
            .map_err(|e| engine_err("end of stream", e))
    }
}

struct GstSubgraph {
    name: String,
    bin: gst::Bin,
}

impl Subgraph for GstSubgraph {
    fn name(&self) -> &str {
        &self.name
    }

    fn ports(&self) -> Vec<String> {
        self.bin
            .pads()
            .iter()
            .map(|pad| pad.name().to_string())
            .collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
