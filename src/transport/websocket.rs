//! WebSocket message channel
//!
//! Each connection runs as its own tokio task. Inbound traffic and lifecycle
//! changes of every connection are funneled into one channel as
//! `(ConnectionId, LinkEvent)` pairs, which the runtime loop feeds to the
//! signaling link. Outbound text goes through an unbounded queue owned by the
//! [`WsConnection`] handle.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{Connection, ConnectionId, Connector, LinkEvent};

/// Events of all connections opened by one [`WsConnector`].
pub type LinkEvents = UnboundedReceiver<(ConnectionId, LinkEvent)>;

pub struct WsConnector {
    next_id: ConnectionId,
    events: UnboundedSender<(ConnectionId, LinkEvent)>,
}

impl WsConnector {
    pub fn new() -> (Self, LinkEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { next_id: 0, events }, rx)
    }
}

impl Connector for WsConnector {
    type Connection = WsConnection;

    /// Must be called from within a tokio runtime.
    fn connect(&mut self, url: &Url, protocol: &str) -> WsConnection {
        self.next_id += 1;
        let id = self.next_id;
        let (outgoing, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(
            id,
            url.clone(),
            protocol.to_string(),
            rx,
            self.events.clone(),
        ));
        WsConnection {
            id,
            outgoing: Some(outgoing),
        }
    }
}

/// Handle to one WebSocket connection. Dropping it closes the connection.
pub struct WsConnection {
    id: ConnectionId,
    outgoing: Option<UnboundedSender<Message>>,
}

impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&mut self, text: String) -> Result<()> {
        let outgoing = self.outgoing.as_ref().ok_or(Error::NotConnected)?;
        outgoing
            .send(Message::Text(text))
            .map_err(|_| Error::NotConnected)
    }

    fn close(&mut self) {
        if let Some(outgoing) = self.outgoing.take() {
            let _ = outgoing.send(Message::Close(None));
        }
    }
}

async fn run_connection(
    id: ConnectionId,
    url: Url,
    protocol: String,
    mut outgoing: UnboundedReceiver<Message>,
    events: UnboundedSender<(ConnectionId, LinkEvent)>,
) {
    let report = |event: LinkEvent| {
        // The receiver is gone once the runtime loop ended.
        let _ = events.send((id, event));
    };

    let stream = match open(&url, &protocol).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(connection = id, %url, "websocket connect failed: {}", e);
            report(LinkEvent::Error(e.to_string()));
            report(LinkEvent::Closed);
            return;
        }
    };
    info!(connection = id, %url, "websocket connected");
    report(LinkEvent::Opened);

    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            message = outgoing.recv() => {
                let message = message.unwrap_or(Message::Close(None));
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    report(LinkEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    debug!(connection = id, "websocket closed locally");
                    break;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => report(LinkEvent::Message(text)),
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection = id, ?frame, "websocket closed by peer");
                    break;
                }
                Some(Ok(other)) => debug!(connection = id, "ignoring frame: {:?}", other),
                Some(Err(e)) => {
                    report(LinkEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
        }
    }

    report(LinkEvent::Closed);
}

async fn open(
    url: &Url,
    protocol: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
> {
    let mut request = url.as_str().into_client_request().map_err(Error::transport)?;
    let protocol = HeaderValue::from_str(protocol).map_err(Error::transport)?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", protocol);
    let (stream, _) = connect_async(request).await.map_err(Error::transport)?;
    Ok(stream)
}
