//! In-memory collaborators for unit tests. Every call is recorded in a log
//! shared through `Rc<RefCell<_>>` so tests can inspect it after handing the
//! collaborator to the component under test.

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use url::Url;

use crate::error::{Error, Result};
use crate::model::message::{IceCandidate, SessionDescription};
use crate::model::stream::{ChannelOptions, StreamId};

use super::{Connection, ConnectionId, Connector, PeerConfig, PeerEvent, PeerFactory, PeerTransport};

#[derive(Debug, Default)]
pub struct LinkLog {
    pub connects: Vec<(ConnectionId, String, String)>,
    pub sent: Vec<(ConnectionId, String)>,
    pub closed: Vec<ConnectionId>,
    pub live: HashSet<ConnectionId>,
    pub max_live: usize,
}

impl LinkLog {
    pub fn sent_on(&self, id: ConnectionId) -> Vec<String> {
        self.sent
            .iter()
            .filter(|(sent_id, _)| *sent_id == id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub log: Rc<RefCell<LinkLog>>,
    next_id: ConnectionId,
}

impl FakeConnector {
    pub fn new() -> (Self, Rc<RefCell<LinkLog>>) {
        let connector = Self::default();
        let log = connector.log.clone();
        (connector, log)
    }
}

pub struct FakeConnection {
    id: ConnectionId,
    log: Rc<RefCell<LinkLog>>,
}

impl Connector for FakeConnector {
    type Connection = FakeConnection;

    fn connect(&mut self, url: &Url, protocol: &str) -> FakeConnection {
        self.next_id += 1;
        let mut log = self.log.borrow_mut();
        log.connects
            .push((self.next_id, url.to_string(), protocol.to_string()));
        log.live.insert(self.next_id);
        log.max_live = log.max_live.max(log.live.len());
        FakeConnection {
            id: self.next_id,
            log: self.log.clone(),
        }
    }
}

impl Connection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&mut self, text: String) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if !log.live.contains(&self.id) {
            return Err(Error::Transport("connection closed".to_string()));
        }
        log.sent.push((self.id, text));
        Ok(())
    }

    fn close(&mut self) {
        let mut log = self.log.borrow_mut();
        if log.live.remove(&self.id) {
            log.closed.push(self.id);
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerLog {
    pub created: Vec<PeerConfig>,
    pub channels: Vec<(StreamId, String, ChannelOptions)>,
    pub local_descriptions: Vec<SessionDescription>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub sent: Vec<(StreamId, Vec<u8>)>,
    pub closed_streams: Vec<StreamId>,
    pub stopped_streams: Vec<StreamId>,
    pub open_streams: HashSet<StreamId>,
    pub detached: usize,
    pub closed: usize,
    /// Events delivered by the next `poll_event` calls of the live peer.
    pub events: VecDeque<PeerEvent>,
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub log: Rc<RefCell<PeerLog>>,
}

impl FakePeerFactory {
    pub fn new() -> (Self, Rc<RefCell<PeerLog>>) {
        let factory = Self::default();
        let log = factory.log.clone();
        (factory, log)
    }
}

pub struct FakePeer {
    log: Rc<RefCell<PeerLog>>,
    next_stream: u64,
    offers: u32,
    has_remote: bool,
    detached: bool,
}

impl PeerFactory for FakePeerFactory {
    type Peer = FakePeer;

    fn create(&mut self, config: &PeerConfig) -> Result<FakePeer> {
        let mut log = self.log.borrow_mut();
        log.created.push(config.clone());
        let next_stream = log.channels.len() as u64 + 1;
        Ok(FakePeer {
            log: self.log.clone(),
            next_stream,
            offers: 0,
            has_remote: false,
            detached: false,
        })
    }
}

impl PeerTransport for FakePeer {
    fn create_offer(&mut self) -> Result<SessionDescription> {
        self.offers += 1;
        Ok(SessionDescription::offer(format!("fake-offer-{}", self.offers)))
    }

    fn create_answer(&mut self) -> Result<SessionDescription> {
        if !self.has_remote {
            return Err(Error::Transport("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("fake-answer"))
    }

    fn set_local_description(&mut self, description: &SessionDescription) -> Result<()> {
        self.log
            .borrow_mut()
            .local_descriptions
            .push(description.clone());
        Ok(())
    }

    fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()> {
        if description.sdp.is_empty() {
            return Err(Error::Transport("empty description".to_string()));
        }
        self.has_remote = true;
        self.log
            .borrow_mut()
            .remote_descriptions
            .push(description.clone());
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        if !self.has_remote {
            return Err(Error::Transport("remote description not set".to_string()));
        }
        self.log.borrow_mut().candidates.push(candidate.clone());
        Ok(())
    }

    fn create_data_channel(&mut self, label: &str, options: ChannelOptions) -> Result<StreamId> {
        let id = StreamId(self.next_stream);
        self.next_stream += 1;
        let mut log = self.log.borrow_mut();
        log.channels.push((id, label.to_string(), options));
        log.events.push_back(PeerEvent::NegotiationNeeded);
        Ok(id)
    }

    fn send(&mut self, stream: StreamId, data: &[u8]) -> Result<()> {
        let mut log = self.log.borrow_mut();
        if !log.open_streams.contains(&stream) {
            return Err(Error::Transport(format!("{stream} is not open")));
        }
        log.sent.push((stream, data.to_vec()));
        Ok(())
    }

    fn is_stream_open(&self, stream: StreamId) -> bool {
        self.log.borrow().open_streams.contains(&stream)
    }

    fn close_stream(&mut self, stream: StreamId) {
        let mut log = self.log.borrow_mut();
        log.open_streams.remove(&stream);
        log.closed_streams.push(stream);
    }

    fn stop_stream(&mut self, stream: StreamId) {
        self.log.borrow_mut().stopped_streams.push(stream);
    }

    fn close(&mut self) {
        let mut log = self.log.borrow_mut();
        log.closed += 1;
        log.open_streams.clear();
    }

    fn detach(&mut self) {
        self.detached = true;
        self.log.borrow_mut().detached += 1;
    }

    fn poll_event(&mut self) -> Option<PeerEvent> {
        if self.detached {
            return None;
        }
        self.log.borrow_mut().events.pop_front()
    }
}
