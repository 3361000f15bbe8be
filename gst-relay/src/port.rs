//! Named endpoints of a session and the source-key table.

use std::{collections::HashMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    engine::SourceEndpoint,
    error::{RelayError, Result},
    frame::Frame,
};

pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `ssrc-<ssrc>` for the first generation, `ssrc-<ssrc>.<n>` after.
    pub fn for_source(ssrc: u32, generation: u32) -> Self {
        if generation == 0 {
            Self(format!("ssrc-{}", ssrc))
        } else {
            Self(format!("ssrc-{}.{}", ssrc, generation))
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PortId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PortId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies one media source inside a session. Holds an SSRC today.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceKey(pub u64);

impl SourceKey {
    pub fn from_ssrc(ssrc: u32) -> Self {
        Self(ssrc as u64)
    }

    pub fn ssrc(&self) -> Option<u32> {
        u32::try_from(self.0).ok()
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    /// Engine to host.
    Sink,
    /// Host to engine.
    Source,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortKey {
    pub id: PortId,
    pub source: Option<SourceKey>,
}

/// Address of a push: a port name, optionally with the source it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortRef {
    Named(PortId),
    Keyed(PortId, SourceKey),
}

impl PortRef {
    pub fn id(&self) -> &PortId {
        match self {
            PortRef::Named(id) | PortRef::Keyed(id, _) => id,
        }
    }
}

impl From<&str> for PortRef {
    fn from(s: &str) -> Self {
        PortRef::Named(PortId::from(s))
    }
}

impl From<PortId> for PortRef {
    fn from(id: PortId) -> Self {
        PortRef::Named(id)
    }
}

impl From<&PortId> for PortRef {
    fn from(id: &PortId) -> Self {
        PortRef::Named(id.clone())
    }
}

impl From<(PortId, SourceKey)> for PortRef {
    fn from((id, key): (PortId, SourceKey)) -> Self {
        PortRef::Keyed(id, key)
    }
}

/// Static port declared in config and resolved against the compiled graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub port: PortId,
    pub element: String,
    pub direction: PortDirection,
    #[serde(default)]
    pub source_key: Option<SourceKey>,
}

impl PortBinding {
    pub fn new(port: &str, element: &str, direction: PortDirection) -> Self {
        Self {
            port: PortId::from(port),
            element: element.to_string(),
            direction,
            source_key: None,
        }
    }

    pub fn defaults() -> Vec<PortBinding> {
        vec![
            PortBinding::new("rtp-in", "rtpappsrc", PortDirection::Source),
            PortBinding::new("rtcp-in", "rtcpappsrc", PortDirection::Source),
            PortBinding::new("media-out", "bufferappsink", PortDirection::Sink),
            PortBinding::new("rtcp-out", "rtcpappsink", PortDirection::Sink),
        ]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStats {
    pub frames: u64,
    pub bytes: u64,
}

pub(crate) struct PortEntry {
    pub key: PortKey,
    pub direction: PortDirection,
    /// Created by the demultiplexer rather than declared.
    pub dynamic: bool,
    pub source: Option<Arc<dyn SourceEndpoint>>,
    pub handler: Option<FrameHandler>,
    pub stats: PortStats,
    pub unhandled_reported: bool,
}

impl PortEntry {
    pub fn sink(key: PortKey, dynamic: bool) -> Self {
        Self {
            key,
            direction: PortDirection::Sink,
            dynamic,
            source: None,
            handler: None,
            stats: PortStats::default(),
            unhandled_reported: false,
        }
    }

    pub fn source(key: PortKey, endpoint: Arc<dyn SourceEndpoint>) -> Self {
        Self {
            key,
            direction: PortDirection::Source,
            dynamic: false,
            source: Some(endpoint),
            handler: None,
            stats: PortStats::default(),
            unhandled_reported: false,
        }
    }
}

/// Ports plus the source-key table. Entries live as long as the session.
#[derive(Default)]
pub(crate) struct PortRegistry {
    ports: HashMap<PortId, PortEntry>,
    sources: HashMap<SourceKey, PortKey>,
    generations: HashMap<SourceKey, u32>,
    /// Fallback for dynamic ports with no handler of their own.
    pub source_handler: Option<FrameHandler>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: PortEntry) -> Result<()> {
        let id = entry.key.id.clone();
        if self.ports.contains_key(&id) {
            return Err(RelayError::invalid_state(format!(
                "port {} already registered",
                id
            )));
        }
        self.ports.insert(id, entry);
        Ok(())
    }

    pub fn get(&self, id: &PortId) -> Option<&PortEntry> {
        self.ports.get(id)
    }

    pub fn get_mut(&mut self, id: &PortId) -> Option<&mut PortEntry> {
        self.ports.get_mut(id)
    }

    pub fn contains(&self, id: &PortId) -> bool {
        self.ports.contains_key(id)
    }

    pub fn set_handler(&mut self, id: &PortId, handler: FrameHandler) -> Result<()> {
        let entry = self
            .ports
            .get_mut(id)
            .ok_or_else(|| RelayError::PortNotFound { port: id.clone() })?;
        entry.handler = Some(handler);
        entry.unhandled_reported = false;
        Ok(())
    }

    pub fn bind_source(&mut self, key: SourceKey, port: PortKey) {
        self.sources.insert(key, port);
    }

    pub fn unbind_source(&mut self, key: SourceKey) {
        self.sources.remove(&key);
    }

    pub fn remove(&mut self, id: &PortId) -> Option<PortEntry> {
        self.ports.remove(id)
    }

    pub fn port_for_source(&self, key: SourceKey) -> Option<&PortKey> {
        self.sources.get(&key)
    }

    /// Bumps and returns the generation counter of `key`, starting at 1.
    pub fn next_generation(&mut self, key: SourceKey) -> u32 {
        let generation = self.generations.entry(key).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn ids(&self) -> Vec<PortId> {
        let mut ids: Vec<_> = self.ports.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_port_names() {
        assert_eq!(PortId::for_source(1234, 0).as_str(), "ssrc-1234");
        assert_eq!(PortId::for_source(1234, 2).as_str(), "ssrc-1234.2");
    }

    #[test]
    fn registry_rejects_duplicates_and_unknown_handlers() {
        let mut registry = PortRegistry::new();
        let key = PortKey {
            id: PortId::from("media-out"),
            source: None,
        };
        registry
            .register(PortEntry::sink(key.clone(), false))
            .unwrap();
        assert!(registry
            .register(PortEntry::sink(key, false))
            .is_err());

        let err = registry
            .set_handler(&PortId::from("nope"), Arc::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, RelayError::PortNotFound { .. }));
        assert!(registry
            .set_handler(&PortId::from("media-out"), Arc::new(|_| {}))
            .is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removing_a_port_unbinds_its_source() {
        let mut registry = PortRegistry::new();
        let key = SourceKey::from_ssrc(9);
        let port = PortKey {
            id: PortId::for_source(9, 0),
            source: Some(key),
        };
        registry.register(PortEntry::sink(port.clone(), true)).unwrap();
        registry.bind_source(key, port.clone());

        assert!(registry.remove(&port.id).is_some());
        registry.unbind_source(key);
        assert!(!registry.contains(&port.id));
        assert!(registry.port_for_source(key).is_none());
        assert!(registry.remove(&port.id).is_none());
    }

    #[test]
    fn generations_count_from_one() {
        let mut registry = PortRegistry::new();
        let key = SourceKey::from_ssrc(5);
        assert_eq!(registry.next_generation(key), 1);
        assert_eq!(registry.next_generation(key), 2);
        assert_eq!(registry.next_generation(SourceKey(6)), 1);
    }

    #[test]
    fn bindings_deserialize_without_source_key() {
        let binding: PortBinding = serde_json::from_str(
            r#"{"port":"rtp-in","element":"rtpappsrc","direction":"source"}"#,
        )
        .unwrap();
        assert_eq!(binding, PortBinding::defaults()[0]);
    }
}
