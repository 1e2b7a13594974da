//! Session negotiator
//!
//! Drives the offer/answer and candidate exchange for one direct peer
//! transport and owns that transport end to end. The negotiator is sans-IO in
//! the same way `str0m::Rtc` is: inbound control messages are fed through
//! [`Negotiator::handle_message`], transport events are pulled with
//! [`Negotiator::process`], and everything it wants to tell the signaling peer
//! is written to an [`Outbox`].
//!
//! State machine:
//!
//! ```text
//! Idle -> Created -> Negotiating <-> Connected
//!            \            |              |
//!             `-----> Closed / Failed <--'
//! ```
//!
//! `Closed` and `Failed` end the current session. The next use allocates a
//! fresh transport handle and re-enters `Created`.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::link::Outbox;
use crate::model::message::{ControlMessage, IceServer, SdpKind, SessionDescription};
use crate::model::stream::{ChannelOptions, StreamId, StreamInfo, StreamKind};
use crate::registry::StreamRegistry;
use crate::transport::{
    ConnectionState, IceState, PeerConfig, PeerEvent, PeerFactory, PeerTransport, SignalingState,
};

/// Receives every inbound payload of one data stream.
pub type DataHandler = Box<dyn FnMut(&[u8])>;

/// Called for each data stream the remote side opens; the returned handlers
/// are attached to that stream in order.
pub type StreamCallback = Box<dyn FnMut(&StreamInfo) -> Vec<DataHandler>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Created,
    Negotiating,
    Connected,
    Closed,
    Failed,
}

/// Notifications for the application layer, drained with
/// [`Negotiator::poll_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Reachability checks succeeded.
    Connected,
    StreamOpen(StreamId),
    StreamClosed(StreamId),
    /// A data or media stream announced by the remote side.
    RemoteStream(StreamInfo),
    /// The remote side ended the session; carries its `hangup` payload.
    Hangup(Value),
    /// The transport handle was released, in the given terminal state.
    Closed(SessionState),
}

pub struct Negotiator<F: PeerFactory> {
    factory: F,
    peer: Option<F::Peer>,
    state: SessionState,
    ice_servers: Vec<IceServer>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    ice_connected: bool,
    registry: StreamRegistry,
    handlers: HashMap<StreamId, Vec<DataHandler>>,
    on_stream: Option<StreamCallback>,
    events: VecDeque<SessionEvent>,
}

impl<F: PeerFactory> Negotiator<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            peer: None,
            state: SessionState::Idle,
            ice_servers: vec![],
            local_description: None,
            remote_description: None,
            ice_connected: false,
            registry: StreamRegistry::new(),
            handlers: HashMap::new(),
            on_stream: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    /// Servers used for the next transport handle. A live handle keeps the
    /// list it was created with.
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        debug!(count = servers.len(), "adopting ice servers");
        self.ice_servers = servers;
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    pub fn set_stream_handler(&mut self, callback: StreamCallback) {
        self.on_stream = Some(callback);
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.peer.as_ref().and_then(|peer| peer.poll_timeout())
    }

    /// Allocates the transport handle unless one is live.
    pub fn ensure_peer(&mut self) -> Result<()> {
        if self.peer.is_some() {
            return Ok(());
        }
        let config = PeerConfig::new(self.ice_servers.clone());
        let peer = self.factory.create(&config)?;
        info!(ice_servers = config.ice_servers.len(), "transport handle created");
        self.peer = Some(peer);
        self.state = SessionState::Created;
        self.ice_connected = false;
        Ok(())
    }

    /// Opens a local data channel and tracks it. The transport then asks for
    /// renegotiation, which [`Negotiator::process`] answers with an offer.
    pub fn open_stream(&mut self, label: &str, options: ChannelOptions) -> Result<StreamId> {
        self.ensure_peer()?;
        let peer = self.peer_mut()?;
        let id = peer.create_data_channel(label, options)?;
        self.registry.add_stream(StreamInfo {
            id,
            label: label.to_string(),
            kind: StreamKind::Data,
            ordered: options.ordered,
        });
        info!(id = *id, label, ordered = options.ordered, "opened local stream");
        Ok(id)
    }

    pub fn send(&mut self, stream: StreamId, data: &[u8]) -> Result<()> {
        self.peer_mut()?.send(stream, data)
    }

    pub fn is_stream_open(&self, stream: StreamId) -> bool {
        self.peer
            .as_ref()
            .map(|peer| peer.is_stream_open(stream))
            .unwrap_or(false)
    }

    /// Applies the negotiation fields of an inbound control message.
    pub fn handle_message(&mut self, message: &ControlMessage, out: &mut dyn Outbox) {
        if let Some(servers) = &message.ice_servers {
            self.set_ice_servers(servers.clone());
        }

        match &message.ice {
            Some(Some(candidate)) => match self.peer.as_mut() {
                Some(peer) => match peer.add_ice_candidate(candidate) {
                    Ok(()) => debug!(candidate = %candidate.candidate, "remote candidate added"),
                    Err(e) => debug!(candidate = %candidate.candidate, "remote candidate ignored: {}", e),
                },
                None => debug!("remote candidate ignored, no transport handle"),
            },
            Some(None) => debug!("remote candidate gathering complete"),
            None => {}
        }

        if let Some(description) = &message.sdp {
            match description.kind {
                SdpKind::Offer => self.accept_offer(description, out),
                SdpKind::Answer => self.accept_answer(description),
            }
        }

        if let Some(reason) = message.hangup_signal() {
            info!(%reason, "remote hangup");
            self.events.push_back(SessionEvent::Hangup(reason.clone()));
            self.teardown();
        }
    }

    /// Drains transport events, emitting candidates and offers to `out`.
    pub fn process(&mut self, out: &mut dyn Outbox) {
        while let Some(event) = self.peer.as_mut().and_then(|peer| peer.poll_event()) {
            self.handle_peer_event(event, out);
        }
    }

    /// Drives transport timers, then processes what they produced.
    pub fn handle_timeout(&mut self, now: Instant, out: &mut dyn Outbox) {
        if let Some(peer) = self.peer.as_mut() {
            peer.handle_timeout(now);
        }
        self.process(out);
    }

    /// Sends `bye` and tears the session down. The teardown happens even when
    /// the message could not be sent.
    pub fn bye(&mut self, out: &mut dyn Outbox) -> Result<()> {
        let sent = out.send(&ControlMessage::bye());
        self.teardown();
        sent
    }

    /// Releases the transport handle and every stream on it.
    ///
    /// Returns false, and changes nothing, when no handle is live.
    pub fn teardown(&mut self) -> bool {
        self.close_with(SessionState::Closed)
    }

    fn close_with(&mut self, state: SessionState) -> bool {
        let Some(mut peer) = self.peer.take() else {
            return false;
        };

        // Detach first so nothing queued on the handle can fire during or
        // after the remaining steps.
        peer.detach();
        self.registry.close_all(&mut peer);
        peer.close();

        self.handlers.clear();
        self.ice_connected = false;
        self.local_description = None;
        self.remote_description = None;
        self.state = state;
        info!(?state, "session closed");
        self.events.push_back(SessionEvent::Closed(state));
        true
    }

    fn peer_mut(&mut self) -> Result<&mut F::Peer> {
        self.peer
            .as_mut()
            .ok_or_else(|| Error::Transport("no transport handle".to_string()))
    }

    fn settled_state(&self) -> SessionState {
        if self.ice_connected {
            SessionState::Connected
        } else {
            SessionState::Negotiating
        }
    }

    fn negotiate(&mut self, out: &mut dyn Outbox) {
        let Ok(peer) = self.peer_mut() else {
            return;
        };
        let offer = match peer
            .create_offer()
            .and_then(|offer| peer.set_local_description(&offer).map(|_| offer))
        {
            Ok(offer) => offer,
            Err(e) => {
                warn!("failed to create offer: {}", e);
                return;
            }
        };
        self.state = SessionState::Negotiating;
        info!("sending offer");
        self.local_description = Some(offer.clone());
        emit(out, ControlMessage::sdp(offer));
    }

    fn accept_offer(&mut self, offer: &SessionDescription, out: &mut dyn Outbox) {
        if let Err(e) = self.ensure_peer() {
            warn!("cannot answer offer: {}", e);
            return;
        }
        let Ok(peer) = self.peer_mut() else {
            return;
        };
        let answer = peer
            .set_remote_description(offer)
            .and_then(|_| peer.create_answer())
            .and_then(|answer| peer.set_local_description(&answer).map(|_| answer));
        match answer {
            Ok(answer) => {
                info!("answering remote offer");
                self.remote_description = Some(offer.clone());
                self.local_description = Some(answer.clone());
                self.state = self.settled_state();
                emit(out, ControlMessage::sdp(answer));
            }
            Err(e) => warn!("failed to answer remote offer: {}", e),
        }
    }

    fn accept_answer(&mut self, answer: &SessionDescription) {
        let Ok(peer) = self.peer_mut() else {
            debug!("remote answer ignored, no transport handle");
            return;
        };
        match peer.set_remote_description(answer) {
            Ok(()) => {
                info!("remote answer accepted");
                self.remote_description = Some(answer.clone());
                self.state = self.settled_state();
            }
            Err(e) => warn!("failed to accept remote answer: {}", e),
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent, out: &mut dyn Outbox) {
        match event {
            PeerEvent::LocalCandidate(candidate) => emit(out, ControlMessage::ice(candidate)),
            PeerEvent::NegotiationNeeded => self.negotiate(out),
            PeerEvent::IceState(state) => {
                info!(?state, "ice state changed");
                if matches!(state, IceState::Connected | IceState::Completed) && !self.ice_connected
                {
                    self.ice_connected = true;
                    self.state = SessionState::Connected;
                    self.events.push_back(SessionEvent::Connected);
                }
            }
            PeerEvent::SignalingState(state) => {
                debug!(?state, "signaling state changed");
                if state == SignalingState::Closed {
                    self.close_with(SessionState::Closed);
                }
            }
            PeerEvent::ConnectionState(state) => {
                info!(?state, "connection state changed");
                match state {
                    ConnectionState::Failed => {
                        self.close_with(SessionState::Failed);
                    }
                    ConnectionState::Closed | ConnectionState::Disconnected => {
                        self.close_with(SessionState::Closed);
                    }
                    _ => {}
                }
            }
            PeerEvent::DataStream(info) => {
                info!(id = *info.id, label = %info.label, "remote opened data stream");
                self.registry.add_stream(info.clone());
                let label = info.label.clone();
                let mut handlers: Vec<DataHandler> = vec![Box::new(move |data: &[u8]| {
                    debug!(stream = %label, bytes = data.len(), "stream data");
                })];
                if let Some(callback) = self.on_stream.as_mut() {
                    handlers.extend(callback(&info));
                }
                self.handlers.insert(info.id, handlers);
                self.events.push_back(SessionEvent::RemoteStream(info));
            }
            PeerEvent::MediaStream(info) => {
                info!(id = *info.id, label = %info.label, "remote added media stream");
                self.registry.add_stream(info.clone());
                self.events.push_back(SessionEvent::RemoteStream(info));
            }
            PeerEvent::StreamOpen(id) => {
                debug!(id = *id, "stream open");
                self.events.push_back(SessionEvent::StreamOpen(id));
            }
            PeerEvent::StreamData(id, data) => {
                if let Some(handlers) = self.handlers.get_mut(&id) {
                    for handler in handlers.iter_mut() {
                        handler(data.as_slice());
                    }
                }
            }
            PeerEvent::StreamClosed(id) => {
                debug!(id = *id, "stream closed");
                self.registry.remove(id);
                self.handlers.remove(&id);
                self.events.push_back(SessionEvent::StreamClosed(id));
            }
        }
    }
}

/// Negotiation output is a reaction to transport events with no caller to
/// report to, so a failed send is logged and dropped.
fn emit(out: &mut dyn Outbox, message: ControlMessage) {
    if let Err(e) = out.send(&message) {
        error!("failed to send negotiation message: {}", e);
    }
}
