//! Sub-stream descriptors
//!
//! A sub-stream is one independently opened lane of a peer transport, either
//! a data channel or a remote media stream.

use std::fmt;
use std::ops::Deref;

/// Identifier of a sub-stream, unique within one transport handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl Deref for StreamId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Whether a sub-stream carries application data or media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Data,
    Media,
}

/// What is known about a sub-stream when it appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: StreamId,
    /// Channel label, or the media id for media streams.
    pub label: String,
    pub kind: StreamKind,
    pub ordered: bool,
}

/// Options for a locally opened data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    pub max_packet_life_time: Option<u16>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
            max_packet_life_time: None,
        }
    }
}

impl ChannelOptions {
    pub fn unordered() -> Self {
        Self {
            ordered: false,
            ..Default::default()
        }
    }
}
