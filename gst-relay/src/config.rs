use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    demux::ReappearPolicy,
    error::{RelayError, Result},
    pad_name::PadNameVersion,
    payload::{PayloadInfo, PayloadTypeMap, RtxMap},
    port::PortBinding,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// Element whose pads announce new sources. Skipped when absent.
    pub element: String,
    pub pad_layout: PadNameVersion,
    pub reappear: ReappearPolicy,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            element: "demux".to_string(),
            pad_layout: PadNameVersion::V1,
            reappear: ReappearPolicy::Reuse,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtxConfig {
    pub enabled: bool,
    pub map: RtxMap,
}

impl Default for RtxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            map: RtxMap::video_audio(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadTypeEntry {
    pub payload_type: u8,
    #[serde(flatten)]
    pub info: PayloadInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub ports: Vec<PortBinding>,
    pub demux: DemuxConfig,
    /// Element answering `request-pt-map` from the payload table.
    pub jitter_buffer: String,
    pub rtx: RtxConfig,
    /// Added to, or overriding, the default payload table.
    pub payload_types: Vec<PayloadTypeEntry>,
    pub diagnostics_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ports: PortBinding::defaults(),
            demux: DemuxConfig::default(),
            jitter_buffer: "rtpjitterbuffer".to_string(),
            rtx: RtxConfig::default(),
            payload_types: Vec::new(),
            diagnostics_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| RelayError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for binding in &self.ports {
            if !seen.insert(&binding.port) {
                return Err(RelayError::Config {
                    reason: format!("port {} bound twice", binding.port),
                });
            }
        }

        let payloads = self.payload_map();
        for (pt, rtx) in self.rtx.map.iter() {
            if payloads.contains(rtx) {
                return Err(RelayError::Config {
                    reason: format!("rtx payload type {} for {} is a media payload type", rtx, pt),
                });
            }
        }
        if self.rtx.enabled && self.rtx.map.is_empty() {
            return Err(RelayError::Config {
                reason: "rtx enabled with an empty map".to_string(),
            });
        }
        Ok(())
    }

    pub fn payload_map(&self) -> PayloadTypeMap {
        let mut map = PayloadTypeMap::default();
        for entry in &self.payload_types {
            map.insert(entry.payload_type, entry.info.clone());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use crate::payload::Codec;

    use super::*;

    #[test]
    fn empty_json_is_the_default() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.ports.len(), 4);
        assert_eq!(config.demux.reappear, ReappearPolicy::Reuse);
        assert!(!config.rtx.enabled);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = RelayConfig::from_json(
            r#"{
                "demux": {"reappear": "replace"},
                "rtx": {"enabled": true, "map": {"120": 121}},
                "payload_types": [
                    {"payload_type": 120, "media": "video", "clock_rate": 90000, "codec": "h265"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.demux.element, "demux");
        assert_eq!(config.demux.reappear, ReappearPolicy::Replace);
        assert_eq!(config.rtx.map.rtx_for(120), Some(121));

        let payloads = config.payload_map();
        assert_eq!(payloads.get(120).map(|i| i.codec), Some(Codec::H265));
        assert!(payloads.contains(96));
    }

    #[test]
    fn rejects_inconsistent_config() {
        assert!(RelayConfig::from_json("{\"ports\": 3}").is_err());
        assert!(RelayConfig::from_json(
            r#"{"ports": [
                {"port": "a", "element": "x", "direction": "sink"},
                {"port": "a", "element": "y", "direction": "sink"}
            ]}"#
        )
        .is_err());
        assert!(RelayConfig::from_json(r#"{"rtx": {"map": {"96": 111}}}"#).is_err());
        assert!(RelayConfig::from_json(r#"{"rtx": {"enabled": true, "map": {}}}"#).is_err());
    }
}
