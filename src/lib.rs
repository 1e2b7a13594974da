//! Vessel-side peer negotiation and session lifecycle.
//!
//! A vessel contacts a monitoring centre through a WebSocket intermediary,
//! negotiates a direct peer connection over it and shares telemetry on a data
//! channel. The protocol engine is sans-IO; [`runtime`] hosts it on tokio with
//! the [`transport::websocket`] and [`transport::rtc`] collaborators.

pub mod config;
pub mod error;
pub mod link;
pub mod model;
pub mod negotiator;
pub mod registry;
pub mod runtime;
pub mod telemetry;
pub mod transport;
pub mod util;
pub mod vessel;

pub use error::{Error, Result};
pub use link::{LinkNotice, Outbox, SignalingLink};
pub use negotiator::{Negotiator, SessionEvent, SessionState};
pub use vessel::{Vessel, VesselEvent, VesselSettings};
