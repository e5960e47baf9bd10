//! Process-level configuration (component K), read from environment
//! variables following the teacher's minimal-configuration startup style:
//! no CLI-argument framework is pulled in since nothing here needs
//! subcommands or positional arguments.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::proxy::PalCapabilities;

const DEFAULT_KEEP_ALIVE_SECS: u64 = 10;

/// Scheme an MQTT broker URL was configured with, or left unset so the
/// connection manager may flip between WebSocket and raw TLS on repeated
/// reconnect failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScheme {
    WebSocket,
    Tls,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_host: String,
    pub broker_port: u16,
    /// `None` when the broker URL carried no explicit scheme; the
    /// connection manager is then free to alternate transports on
    /// reconnect (see `conn::reconnect` and the REDESIGN FLAGS decision
    /// recorded in DESIGN.md).
    pub scheme: Option<TransportScheme>,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Which PAL surfaces this agent is built with; the connection manager
    /// queries the `WSCLIENT` bit before picking the WebSocket transport
    /// (see `conn::reconnect`).
    pub capabilities: PalCapabilities,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let broker_url = env::var("PROXY_AGENT_BROKER_URL")
            .context("PROXY_AGENT_BROKER_URL must be set")?;
        let (scheme, rest) = split_scheme(&broker_url);
        let (host, port) = split_host_port(rest, scheme)
            .with_context(|| format!("invalid broker URL: {broker_url}"))?;

        let client_id = env::var("PROXY_AGENT_CLIENT_ID").unwrap_or_else(|_| random_client_id());

        let keep_alive = env::var("PROXY_AGENT_KEEP_ALIVE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS));

        let mut capabilities = PalCapabilities::ALL;
        if env::var("PROXY_AGENT_DISABLE_WSCLIENT").is_ok() {
            capabilities = capabilities.without(PalCapabilities::WSCLIENT);
        }

        Ok(Self {
            broker_host: host,
            broker_port: port,
            scheme,
            client_id,
            keep_alive,
            capabilities,
        })
    }
}

fn split_scheme(url: &str) -> (Option<TransportScheme>, &str) {
    if let Some(rest) = url.strip_prefix("wss://").or_else(|| url.strip_prefix("ws://")) {
        (Some(TransportScheme::WebSocket), rest)
    } else if let Some(rest) = url
        .strip_prefix("tls://")
        .or_else(|| url.strip_prefix("ssl://"))
    {
        (Some(TransportScheme::Tls), rest)
    } else {
        (None, url)
    }
}

fn split_host_port(rest: &str, scheme: Option<TransportScheme>) -> Result<(String, u16)> {
    let default_port = match scheme {
        Some(TransportScheme::WebSocket) => 443,
        _ => 8883,
    };
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().context("invalid port")?;
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), default_port)),
    }
}

/// Mirrors the original's `STRING_construct_random(8)` client identifier
/// generation for when no explicit client id is configured.
fn random_client_id() -> String {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("proxy-agent-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_scheme_and_host_port() {
        let (scheme, rest) = split_scheme("wss://broker.example.com:443");
        assert_eq!(scheme, Some(TransportScheme::WebSocket));
        let (host, port) = split_host_port(rest, scheme).unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn defaults_port_when_unspecified() {
        let (scheme, rest) = split_scheme("tls://broker.example.com");
        let (host, port) = split_host_port(rest, scheme).unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 8883);
    }

    #[test]
    fn no_scheme_is_none() {
        let (scheme, _rest) = split_scheme("broker.example.com:1883");
        assert_eq!(scheme, None);
    }
}
