//! Stream registry
//!
//! Tracks the sub-streams attached to one transport handle so they can be torn
//! down together. The registry only records what exists; reading and writing a
//! stream goes through the transport itself.

use tracing::debug;

use crate::model::stream::{StreamId, StreamInfo, StreamKind};
use crate::transport::PeerTransport;

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Vec<StreamInfo>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `stream`. Duplicates are kept; closing twice is harmless.
    pub fn add_stream(&mut self, stream: StreamInfo) {
        debug!(id = *stream.id, label = %stream.label, kind = ?stream.kind, "tracking stream");
        self.streams.push(stream);
    }

    /// Forgets a stream that closed on its own.
    pub fn remove(&mut self, id: StreamId) -> Option<StreamInfo> {
        let index = self.streams.iter().position(|s| s.id == id)?;
        Some(self.streams.remove(index))
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Stops media streams and closes data channels, most recent first, then
    /// forgets all of them.
    pub fn close_all<P: PeerTransport + ?Sized>(&mut self, peer: &mut P) {
        while let Some(stream) = self.streams.pop() {
            debug!(id = *stream.id, label = %stream.label, "closing stream");
            match stream.kind {
                StreamKind::Media => peer.stop_stream(stream.id),
                StreamKind::Data => peer.close_stream(stream.id),
            }
        }
    }
}
