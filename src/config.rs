//! Environment configuration for the hosting binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::model::message::IceServer;
use crate::telemetry::SentenceBuffer;
use crate::vessel::VesselSettings;

pub const DEFAULT_GUIDANCE: &str = "recommendation";
const DEFAULT_STATUS_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Vessel identity (MMSI).
    pub mmsi: String,
    /// Intermediary host or full signaling URL.
    pub moc: String,
    pub guidance: String,
    pub secure: bool,
    pub status_interval: Duration,
    pub nmea_file: Option<PathBuf>,
    pub ice_servers: Vec<IceServer>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads every setting through `lookup`. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let mmsi = var("VRGP_MMSI").ok_or_else(|| anyhow!("VRGP_MMSI is not set"))?;
        let moc = var("VRGP_MOC").ok_or_else(|| anyhow!("VRGP_MOC is not set"))?;
        let guidance = var("VRGP_GUIDANCE").unwrap_or_else(|| DEFAULT_GUIDANCE.to_string());
        let secure = match var("VRGP_SECURE") {
            Some(value) => parse_bool(&value)
                .ok_or_else(|| anyhow!("VRGP_SECURE must be true or false, got {value}"))?,
            None => true,
        };
        let status_interval = match var("VRGP_STATUS_INTERVAL_MS") {
            Some(value) => value
                .trim()
                .parse()
                .with_context(|| format!("VRGP_STATUS_INTERVAL_MS is not a number: {value}"))?,
            None => DEFAULT_STATUS_INTERVAL_MS,
        };
        let ice_servers = match var("VRGP_ICE_SERVERS") {
            Some(value) => serde_json::from_str(&value).context("VRGP_ICE_SERVERS is not valid")?,
            None => vec![],
        };

        Ok(Self {
            mmsi,
            moc,
            guidance,
            secure,
            status_interval: Duration::from_millis(status_interval),
            nmea_file: var("VRGP_NMEA_FILE").map(PathBuf::from),
            ice_servers,
        })
    }

    pub fn settings(&self) -> VesselSettings {
        VesselSettings {
            secure: self.secure,
            status_interval: self.status_interval,
            ..Default::default()
        }
    }

    /// The configured sentence file, or the built-in sample track.
    pub fn sentences(&self) -> anyhow::Result<SentenceBuffer> {
        match &self.nmea_file {
            Some(path) => SentenceBuffer::from_file(path)
                .with_context(|| format!("cannot read {}", path.display())),
            None => Ok(SentenceBuffer::sample()),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::message::IceUrls;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_required_values_are_set() {
        let config = config(&[("VRGP_MMSI", "230000001"), ("VRGP_MOC", "moc.example.org")]).unwrap();

        assert_eq!(config.mmsi, "230000001");
        assert_eq!(config.guidance, DEFAULT_GUIDANCE);
        assert!(config.secure);
        assert_eq!(config.status_interval, Duration::from_secs(5));
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.settings(), VesselSettings::default());
        assert_eq!(config.sentences().unwrap(), SentenceBuffer::sample());
    }

    #[test]
    fn missing_identity_is_an_error() {
        assert!(config(&[("VRGP_MOC", "moc.example.org")]).is_err());
        assert!(config(&[("VRGP_MMSI", " "), ("VRGP_MOC", "moc.example.org")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("VRGP_MMSI", "230000001"),
            ("VRGP_MOC", "ws://localhost:8080/vessels/230000001"),
            ("VRGP_GUIDANCE", "control"),
            ("VRGP_SECURE", "false"),
            ("VRGP_STATUS_INTERVAL_MS", "250"),
            ("VRGP_ICE_SERVERS", r#"[{"urls":"stun:stun.example.org"}]"#),
        ])
        .unwrap();

        assert_eq!(config.guidance, "control");
        assert!(!config.secure);
        assert_eq!(config.settings().status_interval, Duration::from_millis(250));
        assert_eq!(
            config.ice_servers[0].urls,
            IceUrls::One("stun:stun.example.org".to_string())
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        let base = [("VRGP_MMSI", "1"), ("VRGP_MOC", "m")];
        for bad in [
            ("VRGP_SECURE", "maybe"),
            ("VRGP_STATUS_INTERVAL_MS", "soon"),
            ("VRGP_ICE_SERVERS", "{"),
        ] {
            let mut vars = base.to_vec();
            vars.push(bad);
            assert!(config(&vars).is_err(), "{bad:?}");
        }
    }
}
