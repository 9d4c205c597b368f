use futures::TryStreamExt;
use log::trace;
use netlink_packet_route::address::{AddressAttribute, AddressMessage, AddressScope};
use rtnetlink::{new_connection, Handle};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::{Mutex, MutexGuard},
};

/// Networking collaborator: address enumeration and route lookups.
pub trait Kernel: Send + Sync {
    /// Every usable local address, the current IKE path included.
    fn local_addresses(&self) -> Vec<IpAddr>;

    /// Source address the routing table would pick to reach `destination`.
    fn source_address(&self, destination: SocketAddr) -> Option<IpAddr>;
}

/// Kernel backed by rtnetlink; interface addresses are cached until the next refresh.
pub struct SystemKernel {
    listen_ips: Vec<IpAddr>,
    handle: Handle,
    interface_addresses: Mutex<Vec<IpAddr>>,
}

impl SystemKernel {
    /// Opens a netlink connection, must be called from within a Tokio runtime.
    pub fn new(listen_ips: &[IpAddr]) -> io::Result<SystemKernel> {
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);
        Ok(SystemKernel {
            listen_ips: listen_ips.to_vec(),
            handle,
            interface_addresses: Mutex::new(vec![]),
        })
    }

    /// Reads the addresses of all interfaces from the kernel.
    pub async fn refresh(&self) -> Result<(), rtnetlink::Error> {
        let mut addresses = vec![];
        let mut messages = self.handle.address().get().execute();
        while let Some(message) = messages.try_next().await? {
            if let Some(addr) = interface_address(&message) {
                addresses.push(addr);
            }
        }
        trace!("Interface addresses {:?}", addresses);
        *self.interface_addresses() = addresses;
        Ok(())
    }

    fn interface_addresses(&self) -> MutexGuard<'_, Vec<IpAddr>> {
        self.interface_addresses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Connecting a UDP socket performs a route lookup without sending anything.
    fn route_lookup(destination: SocketAddr) -> Option<IpAddr> {
        let bind_addr: SocketAddr = match destination {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr).ok()?;
        socket.connect(destination).ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }
}

// Loopback and link-local addresses cannot carry an IKE path to a remote peer.
fn interface_address(message: &AddressMessage) -> Option<IpAddr> {
    if message.header.scope != AddressScope::Universe {
        return None;
    }
    let mut address = None;
    for attribute in &message.attributes {
        match attribute {
            // Point-to-point links report the peer as Address and our end as Local.
            AddressAttribute::Local(addr) => return Some(*addr),
            AddressAttribute::Address(addr) => address = Some(*addr),
            _ => {}
        }
    }
    address
}

fn is_listening(listen_ips: &[IpAddr], addr: &IpAddr) -> bool {
    listen_ips
        .iter()
        .any(|ip| (ip.is_unspecified() && ip.is_ipv4() == addr.is_ipv4()) || ip == addr)
}

fn select_addresses(listen_ips: &[IpAddr], interface_addresses: &[IpAddr]) -> Vec<IpAddr> {
    let mut addresses = interface_addresses
        .iter()
        .filter(|addr| is_listening(listen_ips, addr))
        .copied()
        .collect::<Vec<_>>();
    addresses.sort();
    addresses.dedup();
    addresses
}

impl Kernel for SystemKernel {
    fn local_addresses(&self) -> Vec<IpAddr> {
        select_addresses(&self.listen_ips, &self.interface_addresses())
    }

    fn source_address(&self, destination: SocketAddr) -> Option<IpAddr> {
        let source = Self::route_lookup(destination)?;
        if is_listening(&self.listen_ips, &source) {
            Some(source)
        } else {
            None
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::{
        net::{IpAddr, SocketAddr},
        sync::Mutex,
    };

    use super::Kernel;

    /// Kernel with a fixed address list; the first address of a matching family is the route.
    pub struct StaticKernel {
        addresses: Mutex<Vec<IpAddr>>,
    }

    impl StaticKernel {
        pub fn new(addresses: &[&str]) -> StaticKernel {
            StaticKernel {
                addresses: Mutex::new(addresses.iter().map(|a| a.parse().unwrap()).collect()),
            }
        }

        pub fn set_addresses(&self, addresses: &[&str]) {
            *self.addresses.lock().unwrap() =
                addresses.iter().map(|a| a.parse().unwrap()).collect();
        }
    }

    impl Kernel for StaticKernel {
        fn local_addresses(&self) -> Vec<IpAddr> {
            self.addresses.lock().unwrap().clone()
        }

        fn source_address(&self, destination: SocketAddr) -> Option<IpAddr> {
            self.addresses
                .lock()
                .unwrap()
                .iter()
                .find(|addr| addr.is_ipv4() == destination.is_ipv4())
                .copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(scope: AddressScope, attributes: Vec<AddressAttribute>) -> AddressMessage {
        let mut message = AddressMessage::default();
        message.header.scope = scope;
        message.attributes = attributes;
        message
    }

    #[test]
    fn interface_address_skips_local_scopes() {
        let global = message(
            AddressScope::Universe,
            vec![
                AddressAttribute::Address("192.0.2.1".parse().unwrap()),
                AddressAttribute::Label("eth0".to_string()),
            ],
        );
        assert_eq!(interface_address(&global), Some("192.0.2.1".parse().unwrap()));

        let point_to_point = message(
            AddressScope::Universe,
            vec![
                AddressAttribute::Address("10.8.0.1".parse().unwrap()),
                AddressAttribute::Local("10.8.0.2".parse().unwrap()),
            ],
        );
        assert_eq!(interface_address(&point_to_point), Some("10.8.0.2".parse().unwrap()));

        let loopback = message(
            AddressScope::Host,
            vec![AddressAttribute::Address("127.0.0.1".parse().unwrap())],
        );
        assert_eq!(interface_address(&loopback), None);
        let link_local = message(
            AddressScope::Link,
            vec![AddressAttribute::Address("fe80::1".parse().unwrap())],
        );
        assert_eq!(interface_address(&link_local), None);
    }

    #[test]
    fn addresses_are_filtered_by_listen_ips() {
        let interfaces: Vec<IpAddr> = ["203.0.113.5", "192.0.2.1", "2001:db8::1", "192.0.2.1"]
            .iter()
            .map(|addr| addr.parse().unwrap())
            .collect();

        let wildcard = [IpAddr::V4(Ipv4Addr::UNSPECIFIED)];
        assert_eq!(
            select_addresses(&wildcard, &interfaces),
            vec![
                "192.0.2.1".parse::<IpAddr>().unwrap(),
                "203.0.113.5".parse().unwrap()
            ]
        );

        let listen_ips = ["203.0.113.5".parse().unwrap(), IpAddr::V6(Ipv6Addr::UNSPECIFIED)];
        assert_eq!(
            select_addresses(&listen_ips, &interfaces),
            vec![
                "203.0.113.5".parse::<IpAddr>().unwrap(),
                "2001:db8::1".parse().unwrap()
            ]
        );
        assert!(select_addresses(&listen_ips, &[]).is_empty());
    }
}
