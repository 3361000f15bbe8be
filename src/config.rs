use std::sync::LazyLock;

use gst_relay::{
    payload::{MediaKind, PayloadTypeMap},
    presets, RelayConfig,
};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// What the default engine of this build can run.
    #[default]
    Auto,
    MemoryDemux,
    RtpbinDemux,
    Video,
    Audio,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    listen: String,
    descriptor: Option<String>,
    preset: Preset,
    latency_ms: u32,
    relay: RelayConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5004".to_string(),
            descriptor: None,
            preset: Preset::Auto,
            latency_ms: 200,
            relay: RelayConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path, e))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parse config {}: {}", path, e))?;
        config.relay.validate()?;
        Ok(config)
    }

    pub fn listen(&self) -> &str {
        &self.listen
    }

    pub fn relay(&self) -> &RelayConfig {
        &self.relay
    }

    /// The explicit descriptor if one is configured, otherwise the preset's.
    pub fn descriptor(&self) -> anyhow::Result<String> {
        if let Some(descriptor) = &self.descriptor {
            return Ok(descriptor.clone());
        }
        let payloads: PayloadTypeMap = self.relay.payload_map();
        let receive = |kind| {
            presets::rtp_receive(kind, &payloads, &self.relay.rtx.map)
                .ok_or_else(|| anyhow::anyhow!("no {:?} payload type configured", kind))
        };
        match self.preset {
            Preset::Auto if cfg!(feature = "gstreamer") => {
                Ok(presets::rtpbin_demux(self.latency_ms))
            }
            Preset::Auto | Preset::MemoryDemux => Ok(presets::memory_demux()),
            Preset::RtpbinDemux => Ok(presets::rtpbin_demux(self.latency_ms)),
            Preset::Video => receive(MediaKind::Video),
            Preset::Audio => receive(MediaKind::Audio),
        }
    }
}

pub fn config() -> &'static AppConfig {
    static CONFIG: LazyLock<AppConfig> = LazyLock::new(|| {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("RELAY_CONFIG").ok());
        AppConfig::load(path.as_deref()).unwrap_or_else(|e| {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        })
    });
    &CONFIG
}
