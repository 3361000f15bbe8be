//! Binding layer between a host process and a pipeline-based media engine.
//!
//! A [`Relay`] compiles graph descriptors into [`Session`]s. Each session
//! exposes named ports: the host pushes byte buffers into source ports and
//! receives copied [`Frame`]s from sink ports, including the per-source
//! ports created while the engine demultiplexes RTP.

pub mod config;
pub mod demux;
pub mod diagnostic;
pub mod engine;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod packet;
pub mod pad_name;
pub mod payload;
pub mod port;
pub mod presets;
pub mod relay;
pub mod rtx;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use frame::Frame;
pub use relay::Relay;
pub use session::{PushOutcome, Session, SessionState};

use std::sync::Arc;

use engine::Engine;

/// The engine this build prefers: GStreamer with the `gstreamer` feature,
/// the in-process engine otherwise.
pub fn default_engine() -> Arc<dyn Engine> {
    #[cfg(feature = "gstreamer")]
    {
        Arc::new(engine::gstreamer::GstEngine::new())
    }
    #[cfg(not(feature = "gstreamer"))]
    {
        Arc::new(engine::memory::MemoryEngine::new())
    }
}
