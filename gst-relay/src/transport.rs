//! Callback surface of the reliable transport in front of the relay: peer
//! authentication, connection status, out-of-band blocks and periodic stats.

use std::{collections::HashMap, sync::RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectInfo {
    pub peer: PeerId,
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_ip: String,
    pub local_port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Established,
    TimedOut,
    ClientConnected,
    ClientTimedOut,
}

impl ConnectionStatus {
    /// Maps the transport library's status codes.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Established),
            1 => Some(Self::TimedOut),
            2 => Some(Self::ClientConnected),
            3 => Some(Self::ClientTimedOut),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthDecision {
    #[default]
    Accept,
    Reject,
}

impl AuthDecision {
    /// Return value expected by the transport's auth callback.
    pub fn code(&self) -> i32 {
        match self {
            AuthDecision::Accept => 0,
            AuthDecision::Reject => -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    AuthConnect(ConnectInfo),
    AuthDisconnect(PeerId),
    ConnectionStatus(PeerId, ConnectionStatus),
    Oob(Bytes),
    /// Raw stats JSON as produced by the transport.
    Stats(String),
}

pub trait TransportHandler: Send + Sync {
    fn on_auth_connect(&self, _info: &ConnectInfo) -> AuthDecision {
        AuthDecision::Accept
    }

    fn on_auth_disconnect(&self, _peer: PeerId) {}

    fn on_connection_status(&self, _peer: PeerId, _status: ConnectionStatus) {}

    fn on_oob(&self, _payload: &Bytes) {}

    fn on_stats(&self, _stats: &serde_json::Value) {}
}

/// Forwards `event` to `handler`. Only auth connects can be rejected.
pub fn dispatch(handler: &dyn TransportHandler, event: TransportEvent) -> AuthDecision {
    match event {
        TransportEvent::AuthConnect(info) => {
            let decision = handler.on_auth_connect(&info);
            log::info!(
                "peer {:?} from {}:{} {:?}",
                info.peer,
                info.remote_ip,
                info.remote_port,
                decision
            );
            return decision;
        }
        TransportEvent::AuthDisconnect(peer) => {
            log::info!("peer {:?} disconnected", peer);
            handler.on_auth_disconnect(peer);
        }
        TransportEvent::ConnectionStatus(peer, status) => {
            log::debug!("peer {:?} status {:?}", peer, status);
            handler.on_connection_status(peer, status);
        }
        TransportEvent::Oob(payload) => handler.on_oob(&payload),
        TransportEvent::Stats(json) => match serde_json::from_str::<serde_json::Value>(&json) {
            Ok(stats) => handler.on_stats(&stats),
            Err(e) => log::warn!("dropping malformed transport stats: {}", e),
        },
    }
    AuthDecision::Accept
}

/// Out-of-band block a sender uses to name the stream on a virtual port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobAnnouncement {
    pub virt_dst_port: u16,
    pub cname: String,
}

impl OobAnnouncement {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

/// Virtual destination port -> cname, learned from out-of-band blocks.
#[derive(Default)]
pub struct CnameDirectory {
    names: RwLock<HashMap<u16, String>>,
}

impl CnameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cname_for(&self, virt_dst_port: u16) -> Option<String> {
        self.names.read().ok()?.get(&virt_dst_port).cloned()
    }
}

impl TransportHandler for CnameDirectory {
    fn on_oob(&self, payload: &Bytes) {
        let Some(announcement) = OobAnnouncement::parse(payload) else {
            log::debug!("ignoring oob block of {} bytes", payload.len());
            return;
        };
        if let Ok(mut names) = self.names.write() {
            names.insert(announcement.virt_dst_port, announcement.cname);
        }
    }
}
