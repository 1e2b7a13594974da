//! Event loop hosting a [`Vessel`] on a current-thread tokio runtime.
//!
//! One `select!` multiplexes signaling events, the nearest session deadline
//! and Ctrl-C. The peer transport reads its socket when its timeout is
//! handled, so the loop never sleeps longer than [`MAX_WAIT`].

use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::json;
use tokio::signal;
use tokio::time::sleep_until;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::model::stream::StreamInfo;
use crate::negotiator::DataHandler;
use crate::transport::rtc::RtcPeerFactory;
use crate::transport::websocket::WsConnector;
use crate::vessel::{Vessel, VesselEvent};

const MAX_WAIT: Duration = Duration::from_millis(50);

type HostedVessel = Vessel<WsConnector, RtcPeerFactory>;

/// Builds the runtime and runs the vessel until its signaling link is gone.
pub fn main(config: Config) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(run_vessel(config))
}

pub async fn run_vessel(config: Config) -> anyhow::Result<()> {
    let (connector, mut link_events) = WsConnector::new();
    let mut vessel = Vessel::new(connector, RtcPeerFactory, config.settings(), config.sentences()?);
    vessel.set_identity(config.mmsi.as_str());
    vessel.set_ice_servers(config.ice_servers.clone());
    vessel.set_stream_handler(Box::new(log_remote_stream));

    let capabilities = json!({"conning": {"formats": ["nmea"]}});
    vessel.begin_contact(&config.moc, capabilities, &config.guidance)?;

    let mut hanging_up = false;
    loop {
        if drain_events(&mut vessel) {
            break;
        }

        let now = Instant::now();
        let deadline = vessel
            .poll_timeout()
            .map_or(now + MAX_WAIT, |at| at.min(now + MAX_WAIT));

        tokio::select! {
            event = link_events.recv() => {
                let Some((id, event)) = event else {
                    break;
                };
                if let Err(e) = vessel.handle_link_event(id, event, Instant::now()) {
                    warn!("{}", e);
                }
            }
            _ = sleep_until(deadline.into()) => vessel.handle_timeout(Instant::now()),
            _ = signal::ctrl_c(), if !hanging_up => {
                info!("interrupted");
                hanging_up = true;
                vessel.hangup(Instant::now());
                if !vessel.is_linked() {
                    break;
                }
            }
        }
    }

    info!("vessel session ended");
    Ok(())
}

/// Logs what the session reports. Returns true once the link is gone.
fn drain_events(vessel: &mut HostedVessel) -> bool {
    let mut disconnected = false;
    while let Some(event) = vessel.poll_event() {
        match event {
            VesselEvent::LinkOpened => {
                let link = vessel.link();
                info!(
                    url = link.target().map(|url| url.as_str()),
                    protocol = link.protocol(),
                    "connected to monitoring centre"
                )
            }
            VesselEvent::PeerConnected => info!("peer connection established"),
            VesselEvent::Disconnected => disconnected = true,
            VesselEvent::Alert(text) => error!("ALERT: {}", text),
            VesselEvent::RemoteHangup(reason) => info!(%reason, "monitoring centre hung up"),
            VesselEvent::RemoteStream(info) => {
                info!(id = *info.id, label = %info.label, kind = ?info.kind, "remote stream")
            }
            VesselEvent::Message(message) => debug!(?message, "control message"),
        }
    }
    disconnected
}

fn log_remote_stream(info: &StreamInfo) -> Vec<DataHandler> {
    let label = info.label.clone();
    vec![Box::new(move |data: &[u8]| {
        info!(stream = %label, "{}", String::from_utf8_lossy(data));
    })]
}
