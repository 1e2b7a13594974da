//! Collaborator interfaces
//!
//! The engine drives two external capabilities: a message channel to the
//! intermediary (a WebSocket in practice) and a direct peer transport (a
//! WebRTC peer connection). Both are consumed through the narrow traits below
//! so the negotiation logic stays independent of the concrete stacks.

use std::time::Instant;

use url::Url;

use crate::error::Result;
use crate::model::message::{IceCandidate, IceServer, SessionDescription};
use crate::model::stream::{ChannelOptions, StreamId, StreamInfo};

pub mod rtc;
pub mod websocket;

#[cfg(test)]
pub(crate) mod fake;

/// Identifies one message-channel connection. Events carry the id of the
/// connection that produced them.
pub type ConnectionId = u64;

/// Lifecycle and traffic events reported by a message-channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Message(String),
    Error(String),
    Closed,
}

/// One message-channel connection, owned by whoever opened it.
pub trait Connection {
    fn id(&self) -> ConnectionId;

    fn send(&mut self, text: String) -> Result<()>;

    /// Closes without flushing queued traffic. Closing twice is harmless.
    fn close(&mut self);
}

/// Opens message-channel connections.
///
/// `connect` never fails synchronously: unreachable or refused targets are
/// reported later as [`LinkEvent::Error`] followed by [`LinkEvent::Closed`].
pub trait Connector {
    type Connection: Connection;

    fn connect(&mut self, url: &Url, protocol: &str) -> Self::Connection;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceTransportPolicy {
    All,
    Relay,
}

/// Descriptor used when allocating a new transport handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub ice_candidate_pool_size: u8,
}

impl PeerConfig {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self {
            ice_servers,
            ice_transport_policy: IceTransportPolicy::All,
            ice_candidate_pool_size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events produced by a transport handle, drained with
/// [`PeerTransport::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A locally discovered candidate, `None` once gathering is complete.
    LocalCandidate(Option<IceCandidate>),
    /// Local changes (e.g. a new data channel) need an offer.
    NegotiationNeeded,
    IceState(IceState),
    SignalingState(SignalingState),
    ConnectionState(ConnectionState),
    /// A data channel opened by the remote side.
    DataStream(StreamInfo),
    /// A media stream announced by the remote side.
    MediaStream(StreamInfo),
    StreamOpen(StreamId),
    StreamData(StreamId, Vec<u8>),
    StreamClosed(StreamId),
}

/// A direct peer transport handle.
///
/// Modelled on the browser peer connection. Stream teardown capabilities have
/// no-op defaults because not every transport can stop media or close a
/// single channel.
pub trait PeerTransport {
    fn create_offer(&mut self) -> Result<SessionDescription>;

    fn create_answer(&mut self) -> Result<SessionDescription>;

    fn set_local_description(&mut self, description: &SessionDescription) -> Result<()>;

    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()>;

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    fn create_data_channel(&mut self, label: &str, options: ChannelOptions) -> Result<StreamId>;

    fn send(&mut self, stream: StreamId, data: &[u8]) -> Result<()>;

    fn is_stream_open(&self, stream: StreamId) -> bool;

    fn close_stream(&mut self, _stream: StreamId) {}

    fn stop_stream(&mut self, _stream: StreamId) {}

    fn close(&mut self);

    /// Drops queued events and stops producing new ones.
    fn detach(&mut self);

    fn poll_event(&mut self) -> Option<PeerEvent>;

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn handle_timeout(&mut self, _now: Instant) {}
}

/// Allocates transport handles.
pub trait PeerFactory {
    type Peer: PeerTransport;

    fn create(&mut self, config: &PeerConfig) -> Result<Self::Peer>;
}
