use std::{collections::BTreeMap, collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Codecs the demultiplexer knows how to depacketize. Adding a codec means
/// adding a row to the tables below, nothing else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Vp8,
    Opus,
    H264,
    H265,
}

impl Codec {
    pub fn encoding_name(&self) -> &'static str {
        match self {
            Codec::Vp8 => "VP8",
            Codec::Opus => "OPUS",
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }

    pub fn depayloader(&self) -> &'static str {
        match self {
            Codec::Vp8 => "rtpvp8depay",
            Codec::Opus => "rtpopusdepay",
            Codec::H264 => "rtph264depay",
            Codec::H265 => "rtph265depay",
        }
    }

    pub fn default_clock_rate(&self) -> u32 {
        match self {
            Codec::Opus => 48000,
            Codec::Vp8 | Codec::H264 | Codec::H265 => 90000,
        }
    }

    /// Every codec with a depayloader, in table order.
    pub fn all() -> [Codec; 4] {
        [Codec::Vp8, Codec::Opus, Codec::H264, Codec::H265]
    }

    pub fn from_depayloader(element: &str) -> Option<Codec> {
        Self::all().into_iter().find(|c| c.depayloader() == element)
    }

    pub fn media(&self) -> MediaKind {
        match self {
            Codec::Opus => MediaKind::Audio,
            Codec::Vp8 | Codec::H264 | Codec::H265 => MediaKind::Video,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadInfo {
    pub media: MediaKind,
    pub clock_rate: u32,
    pub codec: Codec,
    /// RTP header extension URIs, indexed from 1 in negotiated caps.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl PayloadInfo {
    pub fn new(codec: Codec, clock_rate: u32) -> Self {
        Self {
            media: codec.media(),
            clock_rate,
            codec,
            extensions: Vec::new(),
        }
    }

    pub fn with_extension(mut self, uri: impl Into<String>) -> Self {
        self.extensions.push(uri.into());
        self
    }
}

/// Static payload type table consulted by caps negotiation and the demuxer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadTypeMap {
    entries: HashMap<u8, PayloadInfo>,
}

impl PayloadTypeMap {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, payload_type: u8, info: PayloadInfo) -> Option<PayloadInfo> {
        self.entries.insert(payload_type, info)
    }

    pub fn get(&self, payload_type: u8) -> Option<&PayloadInfo> {
        self.entries.get(&payload_type)
    }

    pub fn contains(&self, payload_type: u8) -> bool {
        self.entries.contains_key(&payload_type)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Caps for the jitter buffer's pt-map request; `None` means unsupported.
    pub fn caps(&self, payload_type: u8) -> Option<RtpCaps> {
        self.get(payload_type).map(|info| RtpCaps {
            media: info.media,
            clock_rate: info.clock_rate,
            encoding_name: info.codec.encoding_name().to_string(),
            payload: payload_type,
            extensions: info.extensions.clone(),
        })
    }
}

impl Default for PayloadTypeMap {
    fn default() -> Self {
        let mut map = Self::empty();
        map.insert(96, PayloadInfo::new(Codec::Vp8, 90000));
        map.insert(111, PayloadInfo::new(Codec::Opus, 48000));
        map
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtpCaps {
    pub media: MediaKind,
    pub clock_rate: u32,
    pub encoding_name: String,
    pub payload: u8,
    pub extensions: Vec<String>,
}

impl fmt::Display for RtpCaps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "application/x-rtp,media=(string){},clock-rate=(int){},encoding-name=(string){},payload=(int){}",
            self.media.as_str(),
            self.clock_rate,
            self.encoding_name,
            self.payload
        )?;
        for (i, uri) in self.extensions.iter().enumerate() {
            write!(f, ",extmap-{}=(string){}", i + 1, uri)?;
        }
        Ok(())
    }
}

/// Original payload type -> retransmission payload type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtxMap {
    map: BTreeMap<u8, u8>,
}

impl RtxMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 96 -> 97 and 111 -> 112, for sessions carrying both video and audio.
    pub fn video_audio() -> Self {
        Self::from_iter([(96, 97), (111, 112)])
    }

    /// Single-stream audio sessions negotiate opus on 96.
    pub fn audio_only() -> Self {
        Self::from_iter([(96, 97)])
    }

    pub fn insert(&mut self, payload_type: u8, rtx_payload_type: u8) {
        self.map.insert(payload_type, rtx_payload_type);
    }

    pub fn rtx_for(&self, payload_type: u8) -> Option<u8> {
        self.map.get(&payload_type).copied()
    }

    /// Reverse lookup used when a retransmitted packet is received.
    pub fn original_for(&self, rtx_payload_type: u8) -> Option<u8> {
        self.map
            .iter()
            .find(|(_, rtx)| **rtx == rtx_payload_type)
            .map(|(pt, _)| *pt)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.map.iter().map(|(k, v)| (*k, *v))
    }

    /// Renders the `payload-type-map` property value of `rtprtxreceive`.
    pub fn to_caps_string(&self) -> String {
        let mut s = String::from("application/x-rtp-pt-map");
        for (pt, rtx) in self.iter() {
            s.push_str(&format!(",{}=(uint){}", pt, rtx));
        }
        s
    }
}

impl FromIterator<(u8, u8)> for RtxMap {
    fn from_iter<I: IntoIterator<Item = (u8, u8)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

impl FromStr for RtxMap {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches('"');
        let mut fields = s.split(',');
        match fields.next() {
            Some("application/x-rtp-pt-map") => {}
            other => {
                return Err(RelayError::descriptor(format!(
                    "expected application/x-rtp-pt-map, got {:?}",
                    other
                )));
            }
        }

        let mut map = RtxMap::new();
        for field in fields {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| RelayError::descriptor(format!("bad pt-map field {:?}", field)))?;
            let value = value.strip_prefix("(uint)").unwrap_or(value);
            let pt = key
                .trim()
                .parse::<u8>()
                .map_err(|e| RelayError::descriptor(format!("bad pt {:?}: {}", key, e)))?;
            let rtx = value
                .trim()
                .parse::<u8>()
                .map_err(|e| RelayError::descriptor(format!("bad rtx pt {:?}: {}", value, e)))?;
            map.insert(pt, rtx);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_has_vp8_and_opus() {
        let map = PayloadTypeMap::default();
        let vp8 = map.get(96).unwrap();
        assert_eq!(vp8.codec, Codec::Vp8);
        assert_eq!(vp8.clock_rate, 90000);
        assert_eq!(vp8.media, MediaKind::Video);

        let opus = map.get(111).unwrap();
        assert_eq!(opus.codec, Codec::Opus);
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.media, MediaKind::Audio);

        assert!(map.get(97).is_none());
        assert!(map.caps(97).is_none());
    }

    #[test]
    fn caps_render_like_the_engine_expects() {
        let mut map = PayloadTypeMap::default();
        map.insert(
            120,
            PayloadInfo::new(Codec::H265, 90000).with_extension(
                "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01",
            ),
        );

        assert_eq!(
            map.caps(96).unwrap().to_string(),
            "application/x-rtp,media=(string)video,clock-rate=(int)90000,encoding-name=(string)VP8,payload=(int)96"
        );
        assert_eq!(
            map.caps(120).unwrap().to_string(),
            "application/x-rtp,media=(string)video,clock-rate=(int)90000,encoding-name=(string)H265,payload=(int)120,extmap-1=(string)http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01"
        );
    }

    #[test]
    fn rtx_map_caps_string_parses_back() {
        let map = RtxMap::video_audio();
        let s = map.to_caps_string();
        assert_eq!(s, "application/x-rtp-pt-map,96=(uint)97,111=(uint)112");
        assert_eq!(s.parse::<RtxMap>().unwrap(), map);
        assert_eq!(map.original_for(112), Some(111));
        assert_eq!(map.original_for(96), None);
    }

    #[test]
    fn rtx_map_rejects_other_structures() {
        assert!("application/x-rtp,96=(uint)97".parse::<RtxMap>().is_err());
        assert!("application/x-rtp-pt-map,96".parse::<RtxMap>().is_err());
        assert!("application/x-rtp-pt-map,300=(uint)97".parse::<RtxMap>().is_err());
    }
}
