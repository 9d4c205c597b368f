use std::{fmt, net::SocketAddr, time::Instant};

use log::info;

use super::message::TrafficSelector;

/// A data-plane ESP tunnel bound to an Association.
pub struct ChildSa {
    inbound_spi: u32,
    outbound_spi: u32,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    encapsulation: bool,
    local_ts: Vec<TrafficSelector>,
    remote_ts: Vec<TrafficSelector>,
    installed: Instant,
}

impl ChildSa {
    pub fn new(
        inbound_spi: u32,
        outbound_spi: u32,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        encapsulation: bool,
        local_ts: Vec<TrafficSelector>,
        remote_ts: Vec<TrafficSelector>,
    ) -> ChildSa {
        ChildSa {
            inbound_spi,
            outbound_spi,
            local_addr,
            remote_addr,
            encapsulation,
            local_ts,
            remote_ts,
            installed: Instant::now(),
        }
    }

    pub fn inbound_spi(&self) -> u32 {
        self.inbound_spi
    }

    pub fn outbound_spi(&self) -> u32 {
        self.outbound_spi
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn encapsulation(&self) -> bool {
        self.encapsulation
    }

    pub fn local_ts(&self) -> &[TrafficSelector] {
        &self.local_ts
    }

    pub fn remote_ts(&self) -> &[TrafficSelector] {
        &self.remote_ts
    }

    pub fn installed(&self) -> Instant {
        self.installed
    }

    /// Moves the tunnel endpoints; returns true if anything changed.
    pub fn update_hosts(
        &mut self,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        encapsulation: bool,
    ) -> bool {
        if self.local_addr == local_addr
            && self.remote_addr == remote_addr
            && self.encapsulation == encapsulation
        {
            return false;
        }
        info!(
            "Updating CHILD_SA {} from {} - {} to {} - {} (UDP encapsulation {})",
            self, self.local_addr, self.remote_addr, local_addr, remote_addr, encapsulation
        );
        self.local_addr = local_addr;
        self.remote_addr = remote_addr;
        self.encapsulation = encapsulation;
        true
    }
}

impl fmt::Display for ChildSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}_i {:08x}_o", self.inbound_spi, self.outbound_spi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_hosts_reports_changes() {
        let local: SocketAddr = "10.0.0.1:500".parse().unwrap();
        let remote: SocketAddr = "10.0.0.2:500".parse().unwrap();
        let mut child = ChildSa::new(0x1000, 0x2000, local, remote, false, vec![], vec![]);
        assert!(!child.update_hosts(local, remote, false));

        let moved: SocketAddr = "10.0.1.1:4500".parse().unwrap();
        assert!(child.update_hosts(moved, remote, true));
        assert_eq!(child.local_addr(), moved);
        assert!(child.encapsulation());
    }
}
