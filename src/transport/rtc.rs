//! str0m backed peer transport
//!
//! [`RtcPeer`] adapts a sans-IO [`str0m::Rtc`] to the [`PeerTransport`] shape.
//! It owns one UDP socket and is driven the same way as the rest of the
//! engine: [`PeerTransport::handle_timeout`] reads whatever the socket has
//! buffered, moves time forward and flushes `poll_output` until str0m asks for
//! the next timeout.
//!
//! str0m negotiates in one step (`apply`, `accept_offer`, `accept_answer`), so
//! local descriptions are in effect as soon as they are created and
//! `set_local_description` has nothing left to do.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::{ChannelConfig, ChannelId, Reliability};
use str0m::media::Mid;
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::message::{IceCandidate, SdpKind, SessionDescription};
use crate::model::stream::{ChannelOptions, StreamId, StreamInfo, StreamKind};
use crate::transport::{
    ConnectionState, IceState, IceTransportPolicy, PeerConfig, PeerEvent, PeerFactory,
    PeerTransport,
};
use crate::util::{get_candidates, select_host_address};

const MAX_DATAGRAM: usize = 2000;

/// Allocates [`RtcPeer`]s.
#[derive(Debug, Default)]
pub struct RtcPeerFactory;

impl PeerFactory for RtcPeerFactory {
    type Peer = RtcPeer;

    fn create(&mut self, config: &PeerConfig) -> Result<RtcPeer> {
        for server in &config.ice_servers {
            for url in server.urls.iter() {
                // Only host candidates are gathered.
                debug!(url, "ice server not used for gathering");
            }
        }
        if config.ice_transport_policy == IceTransportPolicy::Relay {
            warn!("relay-only policy requested, host candidates will still be offered");
        }
        RtcPeer::bind()
    }
}

pub struct RtcPeer {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    buf: Vec<u8>,
    /// Channels created locally that wait for the next offer.
    staged: Vec<(StreamId, ChannelConfig)>,
    channels: HashMap<ChannelId, StreamId>,
    media: HashMap<Mid, StreamId>,
    open: HashSet<StreamId>,
    pending: Option<SdpPendingOffer>,
    answer: Option<SdpAnswer>,
    has_remote: bool,
    next_stream: u64,
    timeout: Option<Instant>,
    events: VecDeque<PeerEvent>,
    detached: bool,
    closed: bool,
}

impl RtcPeer {
    /// Binds a UDP socket on all interfaces and queues its host candidates.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(Error::transport)?;
        socket.set_nonblocking(true).map_err(Error::transport)?;
        let local_addr = socket.local_addr().map_err(Error::transport)?;

        let mut candidates = get_candidates(&socket)?;
        if candidates.is_empty() {
            let addr = SocketAddr::new(select_host_address()?, local_addr.port());
            candidates.push(Candidate::host(addr, Protocol::Udp).map_err(Error::transport)?);
        }

        let mut rtc = Rtc::builder().build();
        let mut events = VecDeque::new();
        for candidate in candidates {
            let sdp = candidate.to_sdp_string();
            if rtc.add_local_candidate(candidate).is_some() {
                events.push_back(PeerEvent::LocalCandidate(Some(IceCandidate::new(sdp))));
            }
        }
        events.push_back(PeerEvent::LocalCandidate(None));
        info!(%local_addr, "peer transport bound");

        Ok(Self {
            rtc,
            socket,
            local_addr,
            buf: vec![0; MAX_DATAGRAM],
            staged: vec![],
            channels: HashMap::new(),
            media: HashMap::new(),
            open: HashSet::new(),
            pending: None,
            answer: None,
            has_remote: false,
            next_stream: 0,
            timeout: None,
            events,
            detached: false,
            closed: false,
        })
    }

    fn allocate(&mut self) -> StreamId {
        self.next_stream += 1;
        StreamId(self.next_stream)
    }

    fn push(&mut self, event: PeerEvent) {
        if !self.detached {
            self.events.push_back(event);
        }
    }

    /// Reads everything the socket has buffered into the rtc.
    fn receive(&mut self) {
        loop {
            self.buf.resize(MAX_DATAGRAM, 0);
            let (n, source) = match self.socket.recv_from(&mut self.buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => return,
                Err(e) => {
                    warn!("udp receive failed: {}", e);
                    return;
                }
            };
            self.buf.truncate(n);

            let Ok(contents) = self.buf.as_slice().try_into() else {
                debug!(%source, "dropping unrecognized datagram");
                continue;
            };
            let input = Input::Receive(
                Instant::now(),
                Receive {
                    proto: Protocol::Udp,
                    source,
                    destination: self.local_addr,
                    contents,
                },
            );
            if let Err(e) = self.rtc.handle_input(input) {
                warn!("peer transport rejected input: {:?}", e);
                self.rtc.disconnect();
                return;
            }
        }
    }

    /// Flushes rtc output until it asks for a timeout.
    fn drive(&mut self) {
        while self.rtc.is_alive() {
            match self.rtc.poll_output() {
                Ok(Output::Timeout(at)) => {
                    self.timeout = Some(at);
                    break;
                }
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self.socket.send_to(&transmit.contents, transmit.destination) {
                        debug!(destination = %transmit.destination, "udp send failed: {}", e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_rtc_event(event),
                Err(e) => {
                    warn!("peer transport failed: {:?}", e);
                    self.rtc.disconnect();
                }
            }
        }

        if !self.rtc.is_alive() && !self.closed {
            self.closed = true;
            self.timeout = None;
            self.push(PeerEvent::ConnectionState(ConnectionState::Closed));
        }
    }

    fn handle_rtc_event(&mut self, event: Event) {
        match event {
            Event::Connected => self.push(PeerEvent::ConnectionState(ConnectionState::Connected)),
            Event::IceConnectionStateChange(state) => {
                let mapped = match state {
                    IceConnectionState::New => IceState::New,
                    IceConnectionState::Checking => IceState::Checking,
                    IceConnectionState::Connected => IceState::Connected,
                    IceConnectionState::Completed => IceState::Completed,
                    IceConnectionState::Disconnected => IceState::Disconnected,
                };
                self.push(PeerEvent::IceState(mapped));
                if mapped == IceState::Disconnected {
                    self.push(PeerEvent::ConnectionState(ConnectionState::Disconnected));
                }
            }
            Event::ChannelOpen(cid, label) => {
                let id = match self.channels.get(&cid) {
                    Some(id) => *id,
                    None => {
                        let id = self.allocate();
                        self.channels.insert(cid, id);
                        self.push(PeerEvent::DataStream(StreamInfo {
                            id,
                            label,
                            kind: StreamKind::Data,
                            ordered: true,
                        }));
                        id
                    }
                };
                self.open.insert(id);
                self.push(PeerEvent::StreamOpen(id));
            }
            Event::ChannelData(data) => {
                if let Some(id) = self.channels.get(&data.id).copied() {
                    self.push(PeerEvent::StreamData(id, data.data));
                }
            }
            Event::ChannelClose(cid) => {
                if let Some(id) = self.channels.remove(&cid) {
                    self.open.remove(&id);
                    self.push(PeerEvent::StreamClosed(id));
                }
            }
            Event::MediaAdded(added) => {
                let id = self.allocate();
                self.media.insert(added.mid, id);
                self.push(PeerEvent::MediaStream(StreamInfo {
                    id,
                    label: added.mid.to_string(),
                    kind: StreamKind::Media,
                    ordered: true,
                }));
            }
            other => debug!("unhandled rtc event: {:?}", other),
        }
    }

    fn stream_channel(&self, stream: StreamId) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, id)| **id == stream)
            .map(|(cid, _)| *cid)
    }
}

fn channel_config(label: &str, options: ChannelOptions) -> ChannelConfig {
    let reliability = match (options.max_retransmits, options.max_packet_life_time) {
        (Some(retransmits), _) => Reliability::MaxRetransmits { retransmits },
        (None, Some(lifetime)) => Reliability::MaxPacketLifetime { lifetime },
        (None, None) => Reliability::Reliable,
    };
    ChannelConfig {
        label: label.to_string(),
        ordered: options.ordered,
        reliability,
        ..Default::default()
    }
}

impl PeerTransport for RtcPeer {
    fn create_offer(&mut self) -> Result<SessionDescription> {
        let mut change = self.rtc.sdp_api();
        let mut added = Vec::with_capacity(self.staged.len());
        for (id, config) in self.staged.drain(..) {
            added.push((change.add_channel_with_config(config), id));
        }
        let (offer, pending) = change
            .apply()
            .ok_or_else(|| Error::Transport("nothing to negotiate".to_string()))?;

        self.channels.extend(added);
        self.pending = Some(pending);
        self.drive();
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    fn create_answer(&mut self) -> Result<SessionDescription> {
        let answer = self
            .answer
            .take()
            .ok_or_else(|| Error::Transport("no remote offer to answer".to_string()))?;
        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    fn set_local_description(&mut self, _: &SessionDescription) -> Result<()> {
        Ok(())
    }

    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()> {
        match description.kind {
            SdpKind::Offer => {
                let offer = SdpOffer::from_sdp_string(&description.sdp).map_err(Error::transport)?;
                if self.pending.take().is_some() {
                    debug!("remote offer replaces our pending offer");
                }
                let answer = self.rtc.sdp_api().accept_offer(offer).map_err(Error::transport)?;
                self.answer = Some(answer);
            }
            SdpKind::Answer => {
                let answer =
                    SdpAnswer::from_sdp_string(&description.sdp).map_err(Error::transport)?;
                let pending = self
                    .pending
                    .take()
                    .ok_or_else(|| Error::Transport("answer without pending offer".to_string()))?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(Error::transport)?;
            }
        }
        self.has_remote = true;
        self.drive();
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        if !self.has_remote {
            return Err(Error::Transport("no remote description".to_string()));
        }
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        let parsed = Candidate::from_sdp_string(&candidate.candidate).map_err(Error::transport)?;
        self.rtc.add_remote_candidate(parsed);
        self.drive();
        Ok(())
    }

    fn create_data_channel(&mut self, label: &str, options: ChannelOptions) -> Result<StreamId> {
        if self.closed {
            return Err(Error::Transport("peer transport closed".to_string()));
        }
        let id = self.allocate();
        self.staged.push((id, channel_config(label, options)));
        self.push(PeerEvent::NegotiationNeeded);
        Ok(id)
    }

    fn send(&mut self, stream: StreamId, data: &[u8]) -> Result<()> {
        let mut channel = self
            .stream_channel(stream)
            .filter(|_| self.open.contains(&stream))
            .and_then(|cid| self.rtc.channel(cid))
            .ok_or_else(|| Error::Transport(format!("{stream} is not open")))?;
        channel.write(false, data).map_err(Error::transport)?;
        self.drive();
        Ok(())
    }

    fn is_stream_open(&self, stream: StreamId) -> bool {
        self.open.contains(&stream)
    }

    fn close_stream(&mut self, stream: StreamId) {
        self.staged.retain(|(id, _)| *id != stream);
        if let Some(cid) = self.stream_channel(stream) {
            self.channels.remove(&cid);
            self.open.remove(&stream);
            self.rtc.direct_api().close_data_channel(cid);
        }
    }

    fn stop_stream(&mut self, stream: StreamId) {
        // Media ends with the transport; only the mapping goes.
        self.media.retain(|_, id| *id != stream);
    }

    fn close(&mut self) {
        if self.rtc.is_alive() {
            info!(local_addr = %self.local_addr, "closing peer transport");
            self.rtc.disconnect();
        }
        self.open.clear();
        self.timeout = None;
    }

    fn detach(&mut self) {
        self.detached = true;
        self.events.clear();
    }

    fn poll_event(&mut self) -> Option<PeerEvent> {
        if self.detached {
            return None;
        }
        self.events.pop_front()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.timeout
    }

    fn handle_timeout(&mut self, now: Instant) {
        if !self.rtc.is_alive() {
            return;
        }
        self.receive();
        if let Err(e) = self.rtc.handle_input(Input::Timeout(now)) {
            warn!("peer transport timeout failed: {:?}", e);
            self.rtc.disconnect();
        }
        self.drive();
    }
}
