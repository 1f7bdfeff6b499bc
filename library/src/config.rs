use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::MediaConstraints;

/// One network-reachability discovery server handed to the transport.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    fn stun(host: &str) -> Self {
        IceServer {
            urls: vec![format!("stun:{host}")],
            username: None,
            credential: None,
        }
    }
}

/// How far apart the two participants may be, which decides the discovery
/// servers handed to the transport.
#[derive(Debug, Clone)]
pub enum ConnectionType {
    /// Same network, host candidates are enough
    Local,
    /// Reflexive candidates from one STUN host
    Stun { host: String },
    /// STUN host that also relays through TURN with these credentials
    StunAndTurn {
        host: String,
        username: String,
        credential: String,
    },
}

impl ConnectionType {
    pub fn ice_servers(&self) -> Vec<IceServer> {
        match self {
            ConnectionType::Local => Vec::new(),
            ConnectionType::Stun { host } => vec![IceServer::stun(host)],
            ConnectionType::StunAndTurn {
                host,
                username,
                credential,
            } => vec![
                IceServer::stun(host),
                IceServer {
                    urls: vec![format!("turn:{host}")],
                    username: Some(username.clone()),
                    credential: Some(credential.clone()),
                },
            ],
        }
    }
}

/// Bounds on the asynchronous steps of a negotiation.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Timeouts {
    /// Per transport step (create / set description, add candidate)
    pub description: Duration,
    /// From the start of negotiation until the transport reports a connection
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            description: Duration::from_secs(10),
            connect: Duration::from_secs(30),
        }
    }
}

/// Settings of one call. The ICE fields are not interpreted here, they are
/// meant for whoever builds the [`Transport`](crate::Transport).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub relay_url: String,
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
    pub media: MediaConstraints,
    pub description_timeout: Duration,
    pub connect_timeout: Duration,
}

impl SessionConfig {
    /// Replace the discovery servers with the ones `connection` needs.
    pub fn with_connection_type(mut self, connection: &ConnectionType) -> Self {
        self.ice_servers = connection.ice_servers();
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            description: self.description_timeout,
            connect: self.connect_timeout,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        SessionConfig {
            relay_url: "ws://127.0.0.1:9000/signaling".to_owned(),
            ice_servers: vec![IceServer {
                urls: vec![
                    "stun:stun1.l.google.com:19302".to_owned(),
                    "stun:stun2.l.google.com:19302".to_owned(),
                ],
                username: None,
                credential: None,
            }],
            ice_candidate_pool_size: 10,
            media: MediaConstraints::default(),
            description_timeout: timeouts.description,
            connect_timeout: timeouts.connect,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_connection_type_selects_ice_servers() {
        let config = SessionConfig::default().with_connection_type(&ConnectionType::StunAndTurn {
            host: "relay.example.org:3478".into(),
            username: "user".into(),
            credential: "secret".into(),
        });
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:relay.example.org:3478"]);
        assert_eq!(config.ice_servers[1].urls, vec!["turn:relay.example.org:3478"]);
        assert_eq!(config.ice_servers[1].credential.as_deref(), Some("secret"));

        let local = config.with_connection_type(&ConnectionType::Local);
        assert!(local.ice_servers.is_empty());
        assert_eq!(local.ice_candidate_pool_size, 10);
    }

    #[test]
    fn test_partial_config_falls_back_to_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"relay_url": "ws://10.0.0.1:9000/signaling"}"#).unwrap();
        assert_eq!(config.relay_url, "ws://10.0.0.1:9000/signaling");
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.ice_servers[0].urls.len(), 2);
        assert_eq!(config.timeouts(), Timeouts::default());
    }
}
