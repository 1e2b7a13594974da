//! Signaling link
//!
//! Owns the single message-channel connection to the intermediary. Inbound
//! traffic arrives as [`LinkEvent`]s tagged with the connection id that
//! produced them; events from a connection the link no longer owns are
//! dropped, so a replaced or detached connection can never reanimate it.

use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::model::message::ControlMessage;
use crate::transport::{Connection, ConnectionId, Connector, LinkEvent};

/// Anything control messages can be emitted through.
pub trait Outbox {
    fn send(&mut self, message: &ControlMessage) -> Result<()>;
}

/// Lifecycle notifications produced by [`SignalingLink::handle_event`].
///
/// Each fires at most once per transition of the owned connection.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotice {
    Opened,
    Message(ControlMessage),
    /// The connection went away. `was_open` is false when it never opened.
    Closed { was_open: bool },
}

pub struct SignalingLink<C: Connector> {
    connector: C,
    connection: Option<C::Connection>,
    open: bool,
    target: Option<Url>,
    protocol: String,
    initial: Option<ControlMessage>,
}

impl<C: Connector> SignalingLink<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connection: None,
            open: false,
            target: None,
            protocol: String::new(),
            initial: None,
        }
    }

    /// Starts opening a connection to `url`, closing any current one first.
    ///
    /// `initial` is sent as soon as the connection reports open, before
    /// anything else. Failure to connect is only reported through a later
    /// [`LinkNotice::Closed`].
    pub fn connect(&mut self, url: Url, protocol: &str, initial: Option<ControlMessage>) {
        self.close();

        let connection = self.connector.connect(&url, protocol);
        info!(
            url = %url,
            protocol,
            connection = connection.id(),
            "opening signaling link"
        );

        self.connection = Some(connection);
        self.target = Some(url);
        self.protocol = protocol.to_string();
        self.initial = initial;
    }

    /// Serializes and transmits `message`.
    ///
    /// Fails with [`Error::NotConnected`] unless a connection is open.
    pub fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let connection = match self.connection.as_mut() {
            Some(connection) if self.open => connection,
            _ => return Err(Error::NotConnected),
        };
        let text = message.encode()?;
        debug!(connection = connection.id(), %text, "-> signaling");
        connection.send(text)
    }

    pub fn is_open(&self) -> bool {
        self.open && self.connection.is_some()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(Connection::id)
    }

    pub fn target(&self) -> Option<&Url> {
        self.target.as_ref()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Closes the current connection without flushing. No notice is produced.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.detach() {
            info!(connection = connection.id(), "closing signaling link");
            connection.close();
        }
    }

    /// Gives up ownership of the current connection without closing it.
    /// Later events from it are ignored.
    pub fn detach(&mut self) -> Option<C::Connection> {
        self.open = false;
        self.initial = None;
        self.connection.take()
    }

    /// Feeds one event from the message channel.
    pub fn handle_event(&mut self, id: ConnectionId, event: LinkEvent) -> Option<LinkNotice> {
        if self.connection_id() != Some(id) {
            debug!(connection = id, ?event, "ignoring event from stale connection");
            return None;
        }

        match event {
            LinkEvent::Opened => {
                if self.open {
                    return None;
                }
                self.open = true;
                info!(connection = id, "signaling link open");
                if let Some(initial) = self.initial.take() {
                    if let Err(e) = self.send(&initial) {
                        warn!(connection = id, "failed to send initial message: {}", e);
                    }
                }
                Some(LinkNotice::Opened)
            }
            LinkEvent::Message(text) => {
                let message = ControlMessage::decode(&text);
                if message.is_error() {
                    warn!(connection = id, %text, "received unparsable signaling message");
                } else {
                    debug!(connection = id, %text, "<- signaling");
                }
                Some(LinkNotice::Message(message))
            }
            LinkEvent::Error(reason) => {
                warn!(connection = id, %reason, "signaling link error");
                None
            }
            LinkEvent::Closed => {
                let was_open = self.open;
                if let Some(mut connection) = self.detach() {
                    connection.close();
                }
                info!(connection = id, was_open, "signaling link closed");
                Some(LinkNotice::Closed { was_open })
            }
        }
    }
}

impl<C: Connector> Outbox for SignalingLink<C> {
    fn send(&mut self, message: &ControlMessage) -> Result<()> {
        SignalingLink::send(self, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeConnector;

    fn url() -> Url {
        Url::parse("wss://example.org/vessels/123456789").unwrap()
    }

    #[test]
    fn send_before_open_fails_with_not_connected() {
        let (connector, log) = FakeConnector::new();
        let mut link = SignalingLink::new(connector);

        assert!(matches!(
            link.send(&ControlMessage::hangup()),
            Err(Error::NotConnected)
        ));

        link.connect(url(), "vrgp-1.0", None);
        assert!(matches!(
            link.send(&ControlMessage::hangup()),
            Err(Error::NotConnected)
        ));
        assert!(log.borrow().sent.is_empty());
    }

    #[test]
    fn reconnecting_closes_previous_connection_first() {
        let (connector, log) = FakeConnector::new();
        let mut link = SignalingLink::new(connector);

        for _ in 0..4 {
            link.connect(url(), "vrgp-1.0", None);
            let id = link.connection_id().unwrap();
            link.handle_event(id, LinkEvent::Opened);
        }
        assert_eq!(link.target(), Some(&url()));
        assert_eq!(link.protocol(), "vrgp-1.0");

        let log = log.borrow();
        assert_eq!(log.max_live, 1);
        assert_eq!(log.closed, vec![1, 2, 3]);
        assert_eq!(log.live.len(), 1);
    }

    #[test]
    fn initial_message_is_sent_first_on_open() {
        let (connector, log) = FakeConnector::new();
        let mut link = SignalingLink::new(connector);
        link.connect(url(), "vrgp-1.0", Some(ControlMessage::bye()));

        assert_eq!(link.handle_event(1, LinkEvent::Opened), Some(LinkNotice::Opened));
        link.send(&ControlMessage::hangup()).unwrap();

        assert_eq!(
            log.borrow().sent_on(1),
            vec![r#"{"bye":true}"#.to_string(), r#"{"hangup":true}"#.to_string()]
        );
        assert_eq!(log.borrow().connects[0].2, "vrgp-1.0");
    }

    #[test]
    fn malformed_inbound_payload_is_delivered_as_error_record() {
        let (connector, _log) = FakeConnector::new();
        let mut link = SignalingLink::new(connector);
        link.connect(url(), "vrgp-1.0", None);
        link.handle_event(1, LinkEvent::Opened);

        match link.handle_event(1, LinkEvent::Message("{oops".to_string())) {
            Some(LinkNotice::Message(msg)) => assert!(msg.is_error()),
            other => panic!("unexpected notice {other:?}"),
        }
    }

    #[test]
    fn close_fires_once_and_stale_events_are_ignored() {
        let (connector, _log) = FakeConnector::new();
        let mut link = SignalingLink::new(connector);
        link.connect(url(), "vrgp-1.0", None);
        link.handle_event(1, LinkEvent::Opened);

        assert_eq!(
            link.handle_event(1, LinkEvent::Closed),
            Some(LinkNotice::Closed { was_open: true })
        );
        assert_eq!(link.handle_event(1, LinkEvent::Closed), None);
        assert_eq!(link.handle_event(1, LinkEvent::Opened), None);
        assert!(!link.is_open());
        assert!(matches!(
            link.send(&ControlMessage::hangup()),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn refused_connection_reports_close_without_open() {
        let (connector, _log) = FakeConnector::new();
        let mut link = SignalingLink::new(connector);
        link.connect(url(), "vrgp-1.0", Some(ControlMessage::hangup()));

        assert_eq!(
            link.handle_event(1, LinkEvent::Error("connection refused".to_string())),
            None
        );
        assert_eq!(
            link.handle_event(1, LinkEvent::Closed),
            Some(LinkNotice::Closed { was_open: false })
        );
    }

    #[test]
    fn events_of_replaced_connection_are_dropped() {
        let (connector, _log) = FakeConnector::new();
        let mut link = SignalingLink::new(connector);
        link.connect(url(), "vrgp-1.0", None);
        link.connect(url(), "vrgp-1.0", None);

        assert_eq!(link.handle_event(1, LinkEvent::Opened), None);
        assert_eq!(link.handle_event(1, LinkEvent::Closed), None);
        assert_eq!(link.handle_event(2, LinkEvent::Opened), Some(LinkNotice::Opened));
    }
}
