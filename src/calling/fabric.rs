//! Signaling fabric contract.
//!
//! The fabric allocates identities and relays call negotiation between two
//! registered endpoints. The call core only depends on the operations and
//! events defined here; the transport behind them is opaque.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use super::media::{LocalMediaStream, RemoteMediaStream};

/// Identity issued by the fabric to one registration. Meaningless once that
/// registration is destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one media call between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw fabric failure. Translated to `CallError::SignalingError` before it
/// reaches the user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signaling fabric: {0}")]
pub struct FabricError(pub String);

/// Settings passed when registering with the fabric.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    pub ice_servers: Vec<String>,
    pub debug_level: u8,
}

impl From<&crate::config::SignalingConfig> for RegistrationOptions {
    fn from(config: &crate::config::SignalingConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            debug_level: config.debug_level,
        }
    }
}

/// Events raised on a registration.
pub enum FabricEvent {
    /// Registration completed; this is our identity.
    Open(PeerIdentity),
    /// Someone is calling us.
    Call(InboundCall),
    /// The fabric reported an error (raw text, for logging).
    Error(String),
    /// Lost the connection to the fabric.
    Disconnected,
}

impl fmt::Debug for FabricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FabricEvent::Open(id) => write!(f, "Open({})", id),
            FabricEvent::Call(call) => write!(f, "Call({} from {})", call.id(), call.peer()),
            FabricEvent::Error(e) => write!(f, "Error({})", e),
            FabricEvent::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Events raised on a media call.
#[derive(Debug)]
pub enum MediaCallEvent {
    /// Remote media arrived.
    Stream(RemoteMediaStream),
    /// The call was closed (by either side).
    Close,
}

/// The fabric itself.
#[async_trait]
pub trait SignalingFabric: Send + Sync {
    /// Register a new endpoint. Its identity arrives later as `FabricEvent::Open`.
    async fn register(&self, options: &RegistrationOptions) -> Result<Registration, FabricError>;
}

/// A live registration: the endpoint to act on and its event stream.
pub struct Registration {
    pub endpoint: Box<dyn Endpoint>,
    pub events: mpsc::UnboundedReceiver<FabricEvent>,
}

/// One registered endpoint.
pub trait Endpoint: Send + Sync {
    /// Place an outbound call carrying `local`.
    fn call(&self, remote: &PeerIdentity, local: &LocalMediaStream)
        -> Result<MediaCall, FabricError>;

    /// Tear down the registration and every call on it.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

/// Closes a media call.
pub trait CallControl: Send + Sync {
    fn close(&self);
}

/// Accepts an inbound call.
pub trait CallAnswerer: Send {
    fn answer(self: Box<Self>, local: &LocalMediaStream) -> Result<MediaCall, FabricError>;
}

/// A call being offered to us. Dropping it without answering rejects it.
pub struct InboundCall {
    id: CallId,
    peer: PeerIdentity,
    answerer: Box<dyn CallAnswerer>,
}

impl InboundCall {
    pub fn new(id: CallId, peer: PeerIdentity, answerer: Box<dyn CallAnswerer>) -> Self {
        Self { id, peer, answerer }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Answer with our local stream.
    pub fn answer(self, local: &LocalMediaStream) -> Result<MediaCall, FabricError> {
        self.answerer.answer(local)
    }
}

/// A placed or answered call.
pub struct MediaCall {
    pub id: CallId,
    pub peer: PeerIdentity,
    pub events: mpsc::UnboundedReceiver<MediaCallEvent>,
    pub control: Box<dyn CallControl>,
}
