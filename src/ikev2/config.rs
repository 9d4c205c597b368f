use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use log::debug;

use super::message::{ProtocolId, Proposal, TrafficSelector, Transform};

/// Engine tunables shared by every Association.
#[derive(Clone, Debug)]
pub struct Settings {
    pub retransmit_timeout: Duration,
    pub retransmit_base: f64,
    pub retransmit_tries: usize,
    pub half_open_timeout: Duration,
    pub dpd_interval: Duration,
    pub cleanup_interval: Duration,
    pub ike_port: u16,
    pub nat_port: u16,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            retransmit_timeout: Duration::from_secs(4),
            retransmit_base: 1.8,
            retransmit_tries: 5,
            half_open_timeout: Duration::from_secs(30),
            dpd_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15),
            ike_port: 500,
            nat_port: 4500,
        }
    }
}

/// Negotiation policy for one peer; published once and never mutated.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub name: String,
    pub local_id: String,
    pub remote_id: Option<String>,
    pub remote_addr: Option<SocketAddr>,
    pub ike_proposals: Vec<Proposal>,
    pub esp_proposals: Vec<Proposal>,
    pub local_ts: Vec<TrafficSelector>,
    pub remote_ts: Vec<TrafficSelector>,
    pub mobike: bool,
    // The initiator replaces the Association with a fresh one after this long.
    pub reauth_time: Option<Duration>,
    // Child Contexts older than this are deleted.
    pub child_lifetime: Option<Duration>,
}

impl PeerConfig {
    pub fn new(name: &str, local_id: &str) -> PeerConfig {
        PeerConfig {
            name: name.to_string(),
            local_id: local_id.to_string(),
            remote_id: None,
            remote_addr: None,
            ike_proposals: default_ike_proposals(),
            esp_proposals: default_esp_proposals(),
            local_ts: any_traffic(),
            remote_ts: any_traffic(),
            mobike: true,
            reauth_time: None,
            child_lifetime: None,
        }
    }

    fn accepts_remote_id(&self, remote_id: &str) -> bool {
        self.remote_id
            .as_ref()
            .map(|expected| expected == remote_id)
            .unwrap_or(true)
    }

    fn accepts_remote_addr(&self, remote: IpAddr) -> bool {
        self.remote_addr
            .map(|addr| addr.ip() == remote)
            .unwrap_or(true)
    }
}

fn default_ike_proposals() -> Vec<Proposal> {
    // AES-GCM-256 with SHA-256 PRF and ECP-256, matching the suites most clients offer first.
    vec![
        Proposal::new(
            ProtocolId::IKE,
            vec![
                Transform::new(Transform::ENCRYPTION_ALGORITHM, 20, Some(256)),
                Transform::new(Transform::PSEUDORANDOM_FUNCTION, 5, None),
                Transform::new(Transform::KEY_EXCHANGE_METHOD, 19, None),
            ],
        ),
        Proposal::new(
            ProtocolId::IKE,
            vec![
                Transform::new(Transform::ENCRYPTION_ALGORITHM, 12, Some(256)),
                Transform::new(Transform::PSEUDORANDOM_FUNCTION, 5, None),
                Transform::new(Transform::INTEGRITY_ALGORITHM, 12, None),
                Transform::new(Transform::KEY_EXCHANGE_METHOD, 14, None),
            ],
        ),
    ]
}

fn default_esp_proposals() -> Vec<Proposal> {
    vec![Proposal::new(
        ProtocolId::ESP,
        vec![
            Transform::new(Transform::ENCRYPTION_ALGORITHM, 20, Some(256)),
            Transform::new(Transform::SEQUENCE_NUMBERS, 0, None),
        ],
    )]
}

fn any_traffic() -> Vec<TrafficSelector> {
    [
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)..=IpAddr::V4(Ipv4Addr::BROADCAST),
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            ..=IpAddr::V6(Ipv6Addr::new(
                0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
            )),
    ]
    .into_iter()
    .filter_map(|range| TrafficSelector::from_ip_range(range).ok())
    .collect()
}

/// Resolves peers to their negotiation policy.
///
/// Lookups may be slow and are never performed while an Association is checked out.
pub trait Backend: Send + Sync {
    /// Policy for an IKE_SA_INIT arriving on `local` from `remote`.
    fn peer_config(&self, local: IpAddr, remote: IpAddr) -> Option<Arc<PeerConfig>>;

    /// Policy for the identity a peer claims in IKE_AUTH.
    fn peer_config_by_id(&self, remote_id: &str) -> Option<Arc<PeerConfig>>;
}

pub struct StaticBackend {
    peers: Vec<Arc<PeerConfig>>,
}

impl StaticBackend {
    pub fn new(peers: Vec<PeerConfig>) -> StaticBackend {
        StaticBackend {
            peers: peers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn peers(&self) -> &[Arc<PeerConfig>] {
        &self.peers
    }
}

impl Backend for StaticBackend {
    fn peer_config(&self, local: IpAddr, remote: IpAddr) -> Option<Arc<PeerConfig>> {
        let config = self
            .peers
            .iter()
            .find(|peer| peer.accepts_remote_addr(remote))
            .cloned();
        if config.is_none() {
            debug!("No peer config for {} -> {}", remote, local);
        }
        config
    }

    fn peer_config_by_id(&self, remote_id: &str) -> Option<Arc<PeerConfig>> {
        self.peers
            .iter()
            .find(|peer| peer.accepts_remote_id(remote_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_backend_matches_address_and_identity() {
        let mut office = PeerConfig::new("office", "gw.example.com");
        office.remote_addr = Some("192.0.2.10:500".parse().unwrap());
        office.remote_id = Some("office.example.com".to_string());
        let mut roaming = PeerConfig::new("roaming", "gw.example.com");
        roaming.remote_id = Some("laptop.example.com".to_string());
        let backend = StaticBackend::new(vec![office, roaming]);

        let local = "198.51.100.1".parse().unwrap();
        let by_addr = backend
            .peer_config(local, "192.0.2.10".parse().unwrap())
            .unwrap();
        assert_eq!(by_addr.name, "office");
        let wildcard = backend
            .peer_config(local, "203.0.113.7".parse().unwrap())
            .unwrap();
        assert_eq!(wildcard.name, "roaming");

        assert_eq!(
            backend.peer_config_by_id("laptop.example.com").unwrap().name,
            "roaming"
        );
        assert!(backend.peer_config_by_id("unknown.example.com").is_none());
    }
}
