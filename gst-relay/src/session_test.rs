use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    time::{Duration, Instant},
};

use futures::StreamExt;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use crate::{
    config::RelayConfig,
    demux::{ReappearPolicy, SourceInfo},
    diagnostic::{Diagnostic, DiagnosticStream},
    engine::{
        AuxReceiverFactory, Branch, BusHandler, Engine, EngineGraph, EngineState, EventLoop,
        PadAddedHandler, PtMapHandler, SinkEndpoint, SourceEndpoint, Subgraph, SubgraphSpec,
        memory::MemoryEngine,
    },
    error::RelayError,
    frame::Frame,
    monitor::FatalKind,
    packet::RtpHeader,
    payload::Codec,
    port::{PortId, PortRef, SourceKey},
    session::{PushOutcome, Session, SessionState},
};

const WAIT: Duration = Duration::from_secs(2);

const LOOPBACK: &str = "appsrc name=rtpappsrc ! queue ! appsink name=bufferappsink \
                        appsrc name=rtcpappsrc ! appsink name=rtcpappsink";

const DEMUX: &str = "appsrc name=rtpappsrc ! rtpdemux name=demux";

fn memory() -> Arc<dyn Engine> {
    Arc::new(MemoryEngine::new())
}

fn rtp(pt: u8, seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    RtpHeader::new(pt, seq, 0, ssrc).to_bytes(payload).to_vec()
}

async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> anyhow::Result<T> {
    tokio::time::timeout(WAIT, rx.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("channel closed"))
}

async fn wait_diagnostic(
    stream: &mut DiagnosticStream,
    matches: impl Fn(&Diagnostic) -> bool,
) -> anyhow::Result<Diagnostic> {
    loop {
        let d = tokio::time::timeout(WAIT, stream.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("diagnostics closed"))?;
        if matches(&d) {
            return Ok(d);
        }
    }
}

#[tokio::test]
async fn test_frames_are_independent_copies() -> anyhow::Result<()> {
    let session = Session::compile(&memory(), LOOPBACK, &RelayConfig::default())?;
    assert_eq!(session.state(), SessionState::Ready);

    let (tx, mut rx) = unbounded_channel::<Frame>();
    session.on_frame("media-out", move |frame| {
        let _ = tx.send(frame);
    })?;
    session.start()?;

    let mut payload = vec![0x80, 96, 0, 1, 1, 2, 3, 4, 5, 6, 7, 8, 42];
    assert_eq!(session.push("rtp-in", &payload), PushOutcome::Queued);
    // the engine copied on push
    payload[12] = 0;

    let frame = recv(&mut rx).await?;
    assert_eq!(frame.port, PortId::from("media-out"));
    assert_eq!(frame.data.len(), 13);
    assert_eq!(frame.data[12], 42);
    assert_eq!(frame.source_key, None);

    let stats = session
        .port_stats(&PortId::from("media-out"))
        .ok_or_else(|| anyhow::anyhow!("no stats"))?;
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.bytes, 13);
    Ok(())
}

#[tokio::test]
async fn test_push_packet_splits_rtp_and_rtcp() -> anyhow::Result<()> {
    let session = Session::compile(&memory(), LOOPBACK, &RelayConfig::default())?;
    let (tx, mut rx) = unbounded_channel::<(String, usize)>();
    for port in ["media-out", "rtcp-out"] {
        let tx = tx.clone();
        session.on_frame(port, move |frame| {
            let _ = tx.send((frame.port.to_string(), frame.len()));
        })?;
    }
    session.start()?;

    // receiver report, PT 201
    let rtcp = [0x81, 201, 0, 1, 0, 0, 0, 9];
    assert_eq!(session.push_packet(&rtcp), PushOutcome::Queued);
    assert_eq!(recv(&mut rx).await?, ("rtcp-out".to_string(), 8));

    assert_eq!(session.push_packet(&rtp(96, 1, 5, b"abc")), PushOutcome::Queued);
    assert_eq!(recv(&mut rx).await?, ("media-out".to_string(), 15));

    assert_eq!(session.push_packet(&[0x00, 0x01]), PushOutcome::Rejected);
    Ok(())
}

#[tokio::test]
async fn test_missing_ports_do_not_panic() -> anyhow::Result<()> {
    let session = Session::compile(&memory(), LOOPBACK, &RelayConfig::default())?;
    let mut diagnostics = session.diagnostics();
    session.start()?;

    assert_eq!(session.push("nope", b"x"), PushOutcome::PortNotFound);
    let d = wait_diagnostic(&mut diagnostics, |d| {
        matches!(d, Diagnostic::PortNotFound { .. })
    })
    .await?;
    assert_eq!(
        d,
        Diagnostic::PortNotFound {
            port: PortId::from("nope")
        }
    );

    let err = session.on_frame("nope", |_| {}).unwrap_err();
    assert!(matches!(err, RelayError::PortNotFound { .. }));

    // sink ports do not take buffers
    assert_eq!(session.push("media-out", b"x"), PushOutcome::Rejected);
    // a key the port was not bound with
    let keyed = PortRef::Keyed(PortId::from("rtp-in"), SourceKey(9));
    assert_eq!(session.push(keyed, b"x"), PushOutcome::PortNotFound);
    Ok(())
}

#[tokio::test]
async fn test_unhandled_port_reported_once() -> anyhow::Result<()> {
    let session = Session::compile(&memory(), LOOPBACK, &RelayConfig::default())?;
    let mut diagnostics = session.diagnostics();
    session.start()?;

    session.push("rtp-in", b"one");
    session.push("rtp-in", b"two");
    let d = wait_diagnostic(&mut diagnostics, |d| matches!(d, Diagnostic::Unhandled { .. }))
        .await?;
    assert_eq!(
        d,
        Diagnostic::Unhandled {
            port: PortId::from("media-out")
        }
    );

    let again = tokio::time::timeout(
        Duration::from_millis(200),
        wait_diagnostic(&mut diagnostics, |d| matches!(d, Diagnostic::Unhandled { .. })),
    )
    .await;
    assert!(again.is_err());
    Ok(())
}

#[tokio::test]
async fn test_stop_is_idempotent() -> anyhow::Result<()> {
    let session = Session::compile(&memory(), LOOPBACK, &RelayConfig::default())?;
    // queued while READY
    assert_eq!(session.push("rtp-in", b"early"), PushOutcome::Queued);
    session.start()?;
    session.start()?;

    session.stop();
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.push("rtp-in", b"late"), PushOutcome::Stopped);
    assert!(matches!(
        session.start(),
        Err(RelayError::InvalidState { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_compile_errors_are_synchronous() -> anyhow::Result<()> {
    for bad in ["appsrc ! nosuchelement ! appsink", "appsrc !", ""] {
        let err = Session::compile(&memory(), bad, &RelayConfig::default())
            .err()
            .ok_or_else(|| anyhow::anyhow!("{:?} compiled", bad))?;
        assert!(matches!(err, RelayError::Descriptor { .. }), "{:?}", err);
    }

    // an appsink bound as an ingress port
    let mut config = RelayConfig::default();
    config.ports[0].element = "bufferappsink".to_string();
    assert!(Session::compile(&memory(), LOOPBACK, &config).is_err());
    Ok(())
}

#[tokio::test]
async fn test_eos_is_a_typed_fatal() -> anyhow::Result<()> {
    let session = Session::compile(
        &memory(),
        "appsrc name=rtpappsrc ! appsink name=bufferappsink",
        &RelayConfig::default(),
    )?;
    let (tx, mut rx) = unbounded_channel();
    session.set_shutdown_hook(Arc::new(move |fatal| {
        let _ = tx.send(fatal.clone());
    }));
    session.start()?;
    assert!(session.fatal().is_none());

    session.end_of_stream("rtp-in")?;
    let fatal = tokio::time::timeout(WAIT, session.wait_fatal()).await?;
    assert!(fatal.is_eos());
    assert_eq!(recv(&mut rx).await?, fatal);
    assert_eq!(session.fatal(), Some(fatal.clone()));
    match session.check() {
        Err(RelayError::EngineFatal(reported)) => assert_eq!(reported, fatal),
        other => anyhow::bail!("unexpected {:?}", other),
    }

    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_engine_error_is_a_typed_fatal() -> anyhow::Result<()> {
    let session = Session::compile(
        &memory(),
        "appsrc name=rtpappsrc ! rtpvp8depay name=depay ! appsink name=bufferappsink",
        &RelayConfig::default(),
    )?;
    session.start()?;
    session.push("rtp-in", b"not rtp");

    let fatal = tokio::time::timeout(WAIT, session.wait_fatal()).await?;
    match fatal.kind {
        FatalKind::Error { source, .. } => assert_eq!(source, "depay"),
        other => anyhow::bail!("unexpected {:?}", other),
    }

    // the failed engine still ends up stopped
    session.stop();
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(session.engine_state(), EngineState::Null);
    assert_eq!(session.push("rtp-in", b"late"), PushOutcome::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_demux_creates_ports_for_known_payload_types() -> anyhow::Result<()> {
    let session = Session::compile(&memory(), DEMUX, &RelayConfig::default())?;
    let mut diagnostics = session.diagnostics();
    let (source_tx, mut sources) = unbounded_channel::<SourceInfo>();
    session.on_new_source(move |info| {
        let _ = source_tx.send(info.clone());
    });
    let (frame_tx, mut frames) = unbounded_channel::<Frame>();
    session.on_source_frame(move |frame| {
        let _ = frame_tx.send(frame);
    });
    session.start()?;

    session.push("rtp-in", &rtp(96, 1, 1234, b"vp8"));
    let info = recv(&mut sources).await?;
    assert_eq!(info.key, SourceKey(1234));
    assert_eq!(info.payload_type, 96);
    assert_eq!(info.codec, Codec::Vp8);
    assert_eq!(info.port, PortId::from("ssrc-1234"));
    let caps = info
        .caps
        .ok_or_else(|| anyhow::anyhow!("demux pad has no caps"))?;
    assert!(caps.contains("encoding-name=(string)VP8"), "{}", caps);
    assert!(caps.contains("payload=(int)96"), "{}", caps);

    let frame = recv(&mut frames).await?;
    assert_eq!(&frame.data[..], b"vp8");
    assert_eq!(frame.source_key, Some(SourceKey(1234)));
    assert_eq!(frame.port, PortId::from("ssrc-1234"));

    session.push("rtp-in", &rtp(111, 1, 99, b"opus"));
    assert_eq!(recv(&mut sources).await?.codec, Codec::Opus);
    assert_eq!(&recv(&mut frames).await?.data[..], b"opus");

    // 97 is not in the payload table
    session.push("rtp-in", &rtp(97, 1, 55, b"?"));
    let d = wait_diagnostic(&mut diagnostics, |d| {
        matches!(d, Diagnostic::UnsupportedPayloadType { .. })
    })
    .await?;
    assert_eq!(
        d,
        Diagnostic::UnsupportedPayloadType {
            ssrc: 55,
            payload_type: 97
        }
    );
    assert!(session.source_port(SourceKey(55)).is_none());
    let dynamic: Vec<PortId> = session
        .ports()
        .into_iter()
        .filter(|port| port.as_str().starts_with("ssrc-"))
        .collect();
    assert_eq!(
        dynamic,
        vec![PortId::from("ssrc-1234"), PortId::from("ssrc-99")]
    );
    Ok(())
}

#[tokio::test]
async fn test_port_handler_overrides_source_handler() -> anyhow::Result<()> {
    let session = Session::compile(&memory(), DEMUX, &RelayConfig::default())?;
    let (source_tx, mut sources) = unbounded_channel::<SourceInfo>();
    session.on_new_source(move |info| {
        let _ = source_tx.send(info.clone());
    });
    let (default_tx, mut defaults) = unbounded_channel::<Frame>();
    session.on_source_frame(move |frame| {
        let _ = default_tx.send(frame);
    });
    session.start()?;

    session.push("rtp-in", &rtp(96, 1, 8, b"first"));
    let info = recv(&mut sources).await?;
    recv(&mut defaults).await?;

    let (port_tx, mut dedicated) = unbounded_channel::<Frame>();
    session.on_frame(info.port, move |frame| {
        let _ = port_tx.send(frame);
    })?;
    session.push("rtp-in", &rtp(96, 2, 8, b"second"));
    assert_eq!(&recv(&mut dedicated).await?.data[..], b"second");
    assert!(defaults.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_concurrent_sources_keep_their_frames() -> anyhow::Result<()> {
    let session = Arc::new(Session::compile(&memory(), DEMUX, &RelayConfig::default())?);
    let (tx, mut rx) = unbounded_channel::<Frame>();
    session.on_source_frame(move |frame| {
        let _ = tx.send(frame);
    });
    session.start()?;

    const PER_SOURCE: u16 = 50;
    let mut pushers = Vec::new();
    for ssrc in [1u32, 2, 3, 4] {
        let session = Arc::clone(&session);
        pushers.push(tokio::task::spawn_blocking(move || {
            for seq in 0..PER_SOURCE {
                let payload = [ssrc as u8, seq as u8];
                session.push("rtp-in", &rtp(96, seq, ssrc, &payload));
            }
        }));
    }
    for pusher in pushers {
        pusher.await?;
    }

    let mut next = std::collections::HashMap::new();
    for _ in 0..(4 * PER_SOURCE as usize) {
        let frame = recv(&mut rx).await?;
        let ssrc = frame
            .source_key
            .and_then(|k| k.ssrc())
            .ok_or_else(|| anyhow::anyhow!("frame without source"))?;
        assert_eq!(frame.data[0] as u32, ssrc, "frame routed to the wrong source");
        assert_eq!(frame.port, PortId::for_source(ssrc, 0));
        let expected = next.entry(ssrc).or_insert(0u8);
        assert_eq!(frame.data[1], *expected, "reordered within ssrc {}", ssrc);
        *expected += 1;
    }
    assert_eq!(next.len(), 4);
    Ok(())
}

async fn reappear(policy: ReappearPolicy) -> anyhow::Result<(Vec<SourceInfo>, Vec<PortId>, Session)> {
    let mut config = RelayConfig::default();
    config.demux.reappear = policy;
    let session = Session::compile(&memory(), DEMUX, &config)?;
    let (tx, mut rx) = unbounded_channel::<SourceInfo>();
    session.on_new_source(move |info| {
        let _ = tx.send(info.clone());
    });
    let (frame_tx, mut frames) = unbounded_channel::<Frame>();
    session.on_source_frame(move |frame| {
        let _ = frame_tx.send(frame);
    });
    session.start()?;

    // same ssrc, new payload type: a second pad for the same source key
    session.push("rtp-in", &rtp(96, 1, 7, b"v"));
    recv(&mut frames).await?;
    session.push("rtp-in", &rtp(111, 2, 7, b"a"));
    let second = recv(&mut frames).await?;

    let mut infos = Vec::new();
    while let Ok(info) = rx.try_recv() {
        infos.push(info);
    }
    Ok((infos, vec![second.port], session))
}

#[tokio::test]
async fn test_reappear_reuse_keeps_the_port() -> anyhow::Result<()> {
    let (infos, ports, session) = reappear(ReappearPolicy::Reuse).await?;
    assert_eq!(infos.len(), 1);
    assert_eq!(ports, vec![PortId::from("ssrc-7")]);
    assert_eq!(
        session.source_port(SourceKey(7)).map(|k| k.id),
        Some(PortId::from("ssrc-7"))
    );
    Ok(())
}

#[tokio::test]
async fn test_reappear_replace_adds_a_generation() -> anyhow::Result<()> {
    let (infos, ports, session) = reappear(ReappearPolicy::Replace).await?;
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[1].port, PortId::from("ssrc-7.1"));
    assert_eq!(ports, vec![PortId::from("ssrc-7.1")]);
    assert_eq!(
        session.source_port(SourceKey(7)).map(|k| k.id),
        Some(PortId::from("ssrc-7.1"))
    );
    // the first generation stays registered
    assert!(session.ports().contains(&PortId::from("ssrc-7")));
    Ok(())
}

#[tokio::test]
async fn test_rtx_restores_original_stream() -> anyhow::Result<()> {
    let mut config = RelayConfig::default();
    config.rtx.enabled = true;
    let session = Session::compile(&memory(), DEMUX, &config)?;
    let (tx, mut rx) = unbounded_channel::<Frame>();
    session.on_source_frame(move |frame| {
        let _ = tx.send(frame);
    });
    session.start()?;

    // retransmission of seq 40 on pt 97, OSN prefix then payload
    session.push("rtp-in", &rtp(97, 900, 21, &[0, 40, b'r']));
    let frame = recv(&mut rx).await?;
    assert_eq!(frame.port, PortId::from("ssrc-21"));
    assert_eq!(&frame.data[..], b"r");
    Ok(())
}

#[tokio::test]
async fn test_failed_branch_leaves_no_port() -> anyhow::Result<()> {
    // the static appsink takes the name the demux branch for ssrc 5 / pt 96 wants
    let session = Session::compile(
        &memory(),
        "appsrc name=rtpappsrc ! rtpdemux name=demux \
         appsrc name=spare ! appsink name=demux_0_5_96",
        &RelayConfig::default(),
    )?;
    let mut diagnostics = session.diagnostics();
    let created = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&created);
    session.on_new_source(move |_| flag.store(true, Ordering::SeqCst));
    session.start()?;

    session.push("rtp-in", &rtp(96, 1, 5, b"v"));
    let d = wait_diagnostic(&mut diagnostics, |d| {
        matches!(d, Diagnostic::BranchFailed { .. })
    })
    .await?;
    assert!(matches!(
        &d,
        Diagnostic::BranchFailed { port, .. } if *port == PortId::from("ssrc-5")
    ));
    assert!(!session.ports().contains(&PortId::from("ssrc-5")));
    assert!(session.source_port(SourceKey(5)).is_none());
    assert!(!created.load(Ordering::SeqCst));
    Ok(())
}

/// Wraps a memory graph whose PLAYING transition only completes once the
/// first sample reached the host, the way a prerolling pipeline behaves.
struct PrerollGraph {
    inner: Arc<dyn EngineGraph>,
    delivered: Mutex<Option<mpsc::Receiver<()>>>,
    prerolled: Arc<AtomicBool>,
}

impl EngineGraph for PrerollGraph {
    fn state(&self) -> EngineState {
        self.inner.state()
    }

    fn set_state(&self, state: EngineState) -> crate::Result<()> {
        self.inner.set_state(state)?;
        if state == EngineState::Playing {
            if let Some(rx) = self.delivered.lock().unwrap().take() {
                self.prerolled
                    .store(rx.recv_timeout(WAIT).is_ok(), Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn has_element(&self, element: &str) -> bool {
        self.inner.has_element(element)
    }

    fn source(&self, element: &str) -> Option<Arc<dyn SourceEndpoint>> {
        self.inner.source(element)
    }

    fn sink(&self, element: &str) -> Option<Arc<dyn SinkEndpoint>> {
        self.inner.sink(element)
    }

    fn add_branch(&self, descriptor: &str) -> crate::Result<Arc<dyn Branch>> {
        self.inner.add_branch(descriptor)
    }

    fn on_pad_added(&self, element: &str, handler: PadAddedHandler) -> bool {
        self.inner.on_pad_added(element, handler)
    }

    fn on_bus_message(&self, handler: BusHandler) -> crate::Result<()> {
        self.inner.on_bus_message(handler)
    }

    fn on_request_pt_map(&self, element: &str, handler: PtMapHandler) -> bool {
        self.inner.on_request_pt_map(element, handler)
    }

    fn on_request_aux_receiver(&self, element: &str, factory: AuxReceiverFactory) -> bool {
        self.inner.on_request_aux_receiver(element, factory)
    }
}

struct PrerollEngine {
    delivered: Mutex<Option<mpsc::Receiver<()>>>,
    prerolled: Arc<AtomicBool>,
}

impl Engine for PrerollEngine {
    fn name(&self) -> &'static str {
        "preroll"
    }

    fn init(&self) -> crate::Result<()> {
        Ok(())
    }

    fn compile(&self, descriptor: &str) -> crate::Result<Arc<dyn EngineGraph>> {
        Ok(Arc::new(PrerollGraph {
            inner: MemoryEngine::new().compile(descriptor)?,
            delivered: Mutex::new(self.delivered.lock().unwrap().take()),
            prerolled: Arc::clone(&self.prerolled),
        }))
    }

    fn build_subgraph(&self, spec: &SubgraphSpec) -> crate::Result<Box<dyn Subgraph>> {
        MemoryEngine::new().build_subgraph(spec)
    }

    fn event_loop(&self) -> Option<Arc<dyn EventLoop>> {
        None
    }
}

#[tokio::test]
async fn test_samples_flow_while_the_engine_starts() -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel();
    let prerolled = Arc::new(AtomicBool::new(false));
    let engine: Arc<dyn Engine> = Arc::new(PrerollEngine {
        delivered: Mutex::new(Some(rx)),
        prerolled: Arc::clone(&prerolled),
    });
    let session = Session::compile(
        &engine,
        "appsrc name=rtpappsrc ! appsink name=bufferappsink",
        &RelayConfig::default(),
    )?;
    session.on_frame("media-out", move |_| {
        let _ = tx.send(());
    })?;
    assert_eq!(session.push("rtp-in", b"preroll"), PushOutcome::Queued);

    let started = Instant::now();
    session.start()?;
    assert!(prerolled.load(Ordering::SeqCst));
    assert!(started.elapsed() < WAIT);
    assert_eq!(session.state(), SessionState::Playing);
    Ok(())
}
