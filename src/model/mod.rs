//! Data models for the signaling protocol
//!
//! This module contains the wire format exchanged over the signaling link and
//! the descriptors used to track sub-streams of a peer session.

pub mod message;
pub mod stream;
