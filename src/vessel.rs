//! Vessel session
//!
//! The vessel side of the protocol, composed from a [`SignalingLink`] and a
//! [`Negotiator`]. It contacts the monitoring party with a handshake, pushes
//! its status on a timer, shares telemetry over a data channel on request, and
//! hangs up gracefully.
//!
//! Like the components it is built from, the session does no I/O of its own:
//! the host feeds link events and drives time with
//! [`Vessel::poll_timeout`] / [`Vessel::handle_timeout`], and collects
//! notifications with [`Vessel::poll_event`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::link::{LinkNotice, SignalingLink};
use crate::model::message::{truthy, ControlMessage, IceServer, Request, Status};
use crate::model::stream::{ChannelOptions, StreamId, StreamInfo};
use crate::negotiator::{Negotiator, SessionEvent, SessionState, StreamCallback};
use crate::telemetry::{DrainTask, SentenceBuffer};
use crate::transport::{Connection, ConnectionId, Connector, LinkEvent, PeerFactory};

/// Sub-protocol token of the signaling link.
pub const PROTOCOL: &str = "vrgp-1.0";

/// Label of the telemetry data channel.
pub const CONNING_LABEL: &str = "conning:nmea";

/// First payload written once the telemetry channel opens.
pub const CONNING_GREETING: &str = "moimoimoi!";

const LOST_CONNECTION_ALERT: &str = "Lost connection to MOC!";

/// Timing and addressing knobs of a [`Vessel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VesselSettings {
    /// Compose `wss` rather than `ws` addresses.
    pub secure: bool,
    pub status_interval: Duration,
    pub status_initial_delay: Duration,
    pub sentence_interval: Duration,
    pub hangup_grace: Duration,
}

impl Default for VesselSettings {
    fn default() -> Self {
        Self {
            secure: true,
            status_interval: Duration::from_secs(5),
            status_initial_delay: Duration::from_millis(100),
            sentence_interval: Duration::from_secs(1),
            hangup_grace: Duration::from_millis(500),
        }
    }
}

/// Notifications for the hosting application.
#[derive(Debug, Clone, PartialEq)]
pub enum VesselEvent {
    /// The signaling link opened and the handshake went out.
    LinkOpened,
    /// The direct peer transport reached the remote side.
    PeerConnected,
    /// The signaling link is gone, expectedly or not.
    Disconnected,
    /// Operator-facing alert. Only raised on unsolicited link loss.
    Alert(String),
    RemoteHangup(Value),
    RemoteStream(StreamInfo),
    /// Every inbound control message, after the session processed it.
    Message(ControlMessage),
}

pub struct Vessel<C: Connector, F: PeerFactory> {
    identity: Option<String>,
    settings: VesselSettings,
    link: SignalingLink<C>,
    negotiator: Negotiator<F>,
    status: Status,
    sentences: SentenceBuffer,
    status_due: Option<Instant>,
    conning: Option<StreamId>,
    drain: Option<DrainTask>,
    /// Connection kept open after a hangup so the message can flush.
    lingering: Option<(C::Connection, Instant)>,
    events: VecDeque<VesselEvent>,
}

impl<C: Connector, F: PeerFactory> Vessel<C, F> {
    /// The initial status reports the first buffered sentence, which is taken
    /// out of the buffer.
    pub fn new(connector: C, factory: F, settings: VesselSettings, mut sentences: SentenceBuffer) -> Self {
        let mut status = Status::new();
        if let Some(sentence) = sentences.pop_front() {
            status.insert("nmea".to_string(), Value::String(sentence));
        }
        Self {
            identity: None,
            settings,
            link: SignalingLink::new(connector),
            negotiator: Negotiator::new(factory),
            status,
            sentences,
            status_due: None,
            conning: None,
            drain: None,
            lingering: None,
            events: VecDeque::new(),
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Changing identity starts a new relationship, so a live transport
    /// handle is torn down first.
    /// Sets the vessel identity. A blank identity leaves it unset.
    pub fn set_identity(&mut self, identity: impl Into<String>) {
        let identity = Some(identity.into()).filter(|id| !id.trim().is_empty());
        if self.negotiator.has_peer() {
            info!(identity = ?identity, "identity changed, closing current session");
            self.close_session();
        }
        self.identity = identity;
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Replaces the status payload and makes sure reports are scheduled.
    pub fn set_status(&mut self, status: Status, now: Instant) {
        self.status = status;
        self.start_status_reports(now);
    }

    pub fn link(&self) -> &SignalingLink<C> {
        &self.link
    }

    pub fn negotiator(&self) -> &Negotiator<F> {
        &self.negotiator
    }

    /// True while a signaling connection exists, including one that is
    /// still opening or lingering after a hangup.
    pub fn is_linked(&self) -> bool {
        self.link.connection_id().is_some() || self.lingering.is_some()
    }

    /// Reachability servers for the next transport handle.
    pub fn set_ice_servers(&mut self, servers: Vec<IceServer>) {
        self.negotiator.set_ice_servers(servers);
    }

    pub fn conning(&self) -> Option<StreamId> {
        self.conning
    }

    pub fn set_stream_handler(&mut self, callback: StreamCallback) {
        self.negotiator.set_stream_handler(callback);
    }

    pub fn poll_event(&mut self) -> Option<VesselEvent> {
        self.events.pop_front()
    }

    /// Turns a host name or full URL into the signaling address.
    ///
    /// `ws`/`wss` URLs are used as they are and `http`/`https` URLs get the
    /// matching WebSocket scheme. Anything else is treated as a host and
    /// composed into `<scheme>://<host>/vessels/<identity>`.
    pub fn resolve_address(&self, target: &str) -> Result<Url> {
        if let Ok(mut url) = Url::parse(target) {
            let scheme = match url.scheme() {
                "ws" | "wss" => return Ok(url),
                "http" => Some("ws"),
                "https" => Some("wss"),
                _ => None,
            };
            if let Some(scheme) = scheme {
                url.set_scheme(scheme)
                    .map_err(|_| Error::InvalidAddress(target.to_string()))?;
                return Ok(url);
            }
        }

        let identity = self.identity.as_deref().ok_or(Error::MissingIdentity)?;
        let scheme = if self.settings.secure { "wss" } else { "ws" };
        let host = target.trim_end_matches('/');
        Url::parse(&format!("{scheme}://{host}/vessels/{identity}"))
            .map_err(|e| Error::InvalidAddress(format!("{target}: {e}")))
    }

    /// Opens the signaling link and queues the handshake for when it opens.
    pub fn begin_contact(&mut self, target: &str, capabilities: Value, guidance: &str) -> Result<()> {
        if self.identity.is_none() {
            return Err(Error::MissingIdentity);
        }
        let url = self.resolve_address(target)?;
        if self.negotiator.has_peer() {
            info!("new contact, closing previous session");
            self.close_session();
        }
        self.status_due = None;
        let handshake = ControlMessage::handshake(capabilities, guidance, &self.status);
        self.link.connect(url, PROTOCOL, Some(handshake));
        Ok(())
    }

    /// Feeds one event from the message channel.
    ///
    /// Errors are about the message that was just processed (an unsupported
    /// request); the session itself keeps running.
    pub fn handle_link_event(&mut self, id: ConnectionId, event: LinkEvent, now: Instant) -> Result<()> {
        let lingering = self.lingering.as_ref().map(|(connection, _)| connection.id());
        if lingering == Some(id) {
            if event == LinkEvent::Closed {
                debug!(connection = id, "lingering connection closed");
                self.lingering = None;
                self.events.push_back(VesselEvent::Disconnected);
            }
            return Ok(());
        }

        match self.link.handle_event(id, event) {
            Some(LinkNotice::Opened) => {
                self.start_status_reports(now);
                self.events.push_back(VesselEvent::LinkOpened);
                Ok(())
            }
            Some(LinkNotice::Message(message)) => self.handle_message(message, now),
            Some(LinkNotice::Closed { was_open }) => {
                self.on_link_closed(was_open);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Processes one inbound control message.
    pub fn handle_message(&mut self, message: ControlMessage, now: Instant) -> Result<()> {
        if message.is_error() {
            warn!(raw = ?message.raw, "ignoring unparsable control message");
        }

        let mut outcome = Ok(());
        if let Some(request) = &message.request {
            outcome = self.handle_request(request, now);
            if let Err(e) = &outcome {
                warn!("{}", e);
            }
        }

        self.negotiator.handle_message(&message, &mut self.link);
        self.pump(now);
        self.events.push_back(VesselEvent::Message(message));
        outcome
    }

    fn handle_request(&mut self, value: &Value, now: Instant) -> Result<()> {
        let request = Request::from_value(value)?;
        if let Some(servers) = request.ice_servers {
            self.negotiator.set_ice_servers(servers);
        }
        match request.conning.as_ref().filter(|params| truthy(params)) {
            Some(params) => self.share_conning(params, now),
            None => Err(Error::InvalidRequest(value.to_string())),
        }
    }

    /// Opens the telemetry channel. Sentences start flowing once it opens.
    pub fn share_conning(&mut self, params: &Value, now: Instant) -> Result<()> {
        info!(%params, ice_servers = self.negotiator.ice_servers().len(), "sharing conning");
        self.negotiator.ensure_peer()?;
        let id = self
            .negotiator
            .open_stream(CONNING_LABEL, ChannelOptions::unordered())?;
        self.conning = Some(id);
        self.drain = None;
        self.pump(now);
        Ok(())
    }

    /// Ends the session: closes the transport and its streams, tells the
    /// remote side, and closes the link after a grace period.
    pub fn hangup(&mut self, now: Instant) {
        info!("hanging up");
        self.close_session();
        self.status_due = None;

        if !self.link.is_open() {
            self.link.close();
            return;
        }
        if let Err(e) = self.link.send(&ControlMessage::hangup()) {
            warn!("failed to send hangup: {}", e);
        }
        if let Some(connection) = self.link.detach() {
            self.lingering = Some((connection, now + self.settings.hangup_grace));
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.status_due,
            self.drain.as_ref().and_then(DrainTask::poll_timeout),
            self.lingering.as_ref().map(|(_, deadline)| *deadline),
            self.negotiator.poll_timeout(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self
            .lingering
            .as_ref()
            .is_some_and(|(_, deadline)| now >= *deadline)
        {
            if let Some((mut connection, _)) = self.lingering.take() {
                info!(connection = connection.id(), "closing signaling link after hangup");
                connection.close();
                self.events.push_back(VesselEvent::Disconnected);
            }
        }

        if self.status_due.is_some_and(|due| now >= due) {
            if self.link.is_open() {
                if let Err(e) = self.link.send(&ControlMessage::status(&self.status)) {
                    warn!("failed to send status: {}", e);
                }
            }
            self.status_due = Some(now + self.settings.status_interval);
        }

        if let Some(drain) = self.drain.as_mut() {
            if let Some(sentence) = drain.handle_timeout(now) {
                let stream = drain.stream();
                if self.conning == Some(stream) && self.negotiator.is_stream_open(stream) {
                    if let Err(e) = self.negotiator.send(stream, sentence.as_bytes()) {
                        debug!("dropping sentence: {}", e);
                    }
                } else {
                    debug!(id = *stream, "telemetry stream gone, dropping sentence");
                }
            }
            if drain.is_finished() {
                debug!(id = *drain.stream(), "telemetry drained");
                self.drain = None;
            }
        }

        self.negotiator.handle_timeout(now, &mut self.link);
        self.pump(now);
    }

    fn start_status_reports(&mut self, now: Instant) {
        if self.status_due.is_none() {
            self.status_due = Some(now + self.settings.status_initial_delay);
        }
    }

    fn close_session(&mut self) {
        self.negotiator.teardown();
        while let Some(event) = self.negotiator.poll_event() {
            debug!(?event, "session event on close");
        }
        self.clear_conning();
    }

    fn clear_conning(&mut self) {
        self.conning = None;
        self.drain = None;
    }

    fn on_link_closed(&mut self, was_open: bool) {
        self.status_due = None;
        self.close_session();
        self.events.push_back(VesselEvent::Disconnected);
        if was_open {
            error!("{}", LOST_CONNECTION_ALERT);
            self.events
                .push_back(VesselEvent::Alert(LOST_CONNECTION_ALERT.to_string()));
        }
    }

    fn on_conning_open(&mut self, stream: StreamId, now: Instant) {
        info!(id = *stream, "telemetry stream open");
        if let Err(e) = self.negotiator.send(stream, CONNING_GREETING.as_bytes()) {
            warn!("failed to greet on telemetry stream: {}", e);
        }
        let drain = DrainTask::new(
            stream,
            self.sentences.snapshot(),
            self.settings.sentence_interval,
            now,
        );
        debug!(sentences = drain.remaining(), "draining telemetry");
        self.drain = Some(drain);
    }

    /// Lets the negotiator react to transport events, then routes its
    /// notifications.
    fn pump(&mut self, now: Instant) {
        self.negotiator.process(&mut self.link);
        while let Some(event) = self.negotiator.poll_event() {
            match event {
                SessionEvent::Connected => self.events.push_back(VesselEvent::PeerConnected),
                SessionEvent::StreamOpen(id) if self.conning == Some(id) => {
                    self.on_conning_open(id, now)
                }
                SessionEvent::StreamOpen(_) => {}
                SessionEvent::StreamClosed(id) => debug!(id = *id, "stream closed by transport"),
                SessionEvent::RemoteStream(info) => {
                    self.events.push_back(VesselEvent::RemoteStream(info))
                }
                SessionEvent::Hangup(reason) => {
                    self.events.push_back(VesselEvent::RemoteHangup(reason))
                }
                SessionEvent::Closed(state) => {
                    if state == SessionState::Failed {
                        warn!("peer transport failed");
                    }
                    self.clear_conning();
                }
            }
        }
    }
}
