use aws_lc_rs::digest;
use log::{debug, info, trace};
use std::net::{IpAddr, SocketAddr};

use super::{Task, TaskKind, TaskStatus};
use crate::{
    ikev2::{
        ike_sa::{Conditions, Extensions, IkeSaContext},
        message::{ExchangeType, Message, NotifyMessageType},
    },
    logger::fmt_slice_hex,
};

/// NAT detection through NAT_DETECTION_*_IP notifies.
pub struct IkeNatd {
    initiator: bool,
    source_seen: bool,
    source_matched: bool,
    destination_seen: bool,
    destination_matched: bool,
}

impl IkeNatd {
    pub fn new(initiator: bool) -> IkeNatd {
        IkeNatd {
            initiator,
            source_seen: false,
            source_matched: false,
            destination_seen: false,
            destination_matched: false,
        }
    }

    fn is_natd_exchange(message: &Message) -> bool {
        message.exchange_type() == ExchangeType::IKE_SA_INIT
            || message.exchange_type() == ExchangeType::INFORMATIONAL
    }

    fn add_hashes(&self, message: &mut Message) {
        let (spi_i, spi_r) = (message.initiator_spi(), message.responder_spi());
        let source = nat_detection_hash(spi_i, spi_r, message.source());
        let destination = nat_detection_hash(spi_i, spi_r, message.destination());
        trace!(
            "NAT detection hashes source {} destination {}",
            fmt_slice_hex(&source),
            fmt_slice_hex(&destination)
        );
        message.add_notify(NotifyMessageType::NAT_DETECTION_SOURCE_IP, &source);
        message.add_notify(NotifyMessageType::NAT_DETECTION_DESTINATION_IP, &destination);
    }

    fn check_hashes(&mut self, message: &Message) {
        let (spi_i, spi_r) = (message.initiator_spi(), message.responder_spi());
        let expected_source = nat_detection_hash(spi_i, spi_r, message.source());
        let expected_destination = nat_detection_hash(spi_i, spi_r, message.destination());
        for notify in message.iter_notify() {
            match notify.message_type() {
                NotifyMessageType::NAT_DETECTION_SOURCE_IP => {
                    // Multihomed peers may send one hash per address.
                    self.source_seen = true;
                    self.source_matched |= notify.data() == expected_source.as_slice();
                }
                NotifyMessageType::NAT_DETECTION_DESTINATION_IP => {
                    self.destination_seen = true;
                    self.destination_matched |= notify.data() == expected_destination.as_slice();
                }
                _ => {}
            }
        }
    }

    fn apply(&self, sa: &mut IkeSaContext) {
        if !(self.source_seen && self.destination_seen) {
            debug!("IKE SA {} peer did not send NAT detection payloads", sa.id());
            return;
        }
        sa.enable_extension(Extensions::NATT);
        sa.set_condition(Conditions::NAT_HERE, !self.destination_matched);
        sa.set_condition(Conditions::NAT_THERE, !self.source_matched);
        if !self.destination_matched {
            info!("IKE SA {} local host is behind NAT", sa.id());
        }
        if !self.source_matched {
            info!("IKE SA {} remote host is behind NAT", sa.id());
        }
    }
}

impl Task for IkeNatd {
    fn kind(&self) -> TaskKind {
        TaskKind::IkeNatd
    }

    fn build(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if !Self::is_natd_exchange(message) {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            self.add_hashes(message);
            TaskStatus::NeedMore
        } else {
            // Only answer with hashes if the peer is NAT-T capable.
            if sa.supports_extension(Extensions::NATT) {
                self.add_hashes(message);
            }
            TaskStatus::Success
        }
    }

    fn process(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if !Self::is_natd_exchange(message) {
            return TaskStatus::NeedMore;
        }
        self.check_hashes(message);
        self.apply(sa);
        if !self.initiator {
            return TaskStatus::NeedMore;
        }
        // MOBIKE requires port 4500 from IKE_AUTH on, even without a NAT.
        let mobike = sa.config().map(|config| config.mobike).unwrap_or(false);
        if message.exchange_type() == ExchangeType::IKE_SA_INIT
            && (sa.has_condition(Conditions::NAT_ANY) || mobike)
        {
            sa.float_ports();
        }
        TaskStatus::Success
    }

    fn migrate(&mut self, _sa: &IkeSaContext) {
        // Hashes are bound to the previous Association's SPIs.
        *self = IkeNatd::new(self.initiator);
    }
}

/// SHA-1 over SPIi | SPIr | IP | port, RFC 7296 Section 2.23.
pub fn nat_detection_hash(initiator_spi: u64, responder_spi: u64, addr: SocketAddr) -> [u8; 20] {
    let mut src_data = [0u8; 8 + 8 + 16 + 2];
    src_data[0..8].copy_from_slice(&initiator_spi.to_be_bytes());
    src_data[8..16].copy_from_slice(&responder_spi.to_be_bytes());
    let addr_len = match addr.ip() {
        IpAddr::V4(ip) => {
            src_data[16..16 + 4].copy_from_slice(&ip.octets());
            4
        }
        IpAddr::V6(ip) => {
            src_data[16..16 + 16].copy_from_slice(&ip.octets());
            16
        }
    };
    src_data[16 + addr_len..16 + addr_len + 2].copy_from_slice(&addr.port().to_be_bytes());
    let src_data = &src_data[..16 + addr_len + 2];

    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, src_data);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(digest.as_ref());
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::{ike_sa::testing, kernel::testing::StaticKernel};
    use std::sync::Arc;

    fn informational(source: &str, destination: &str) -> Message {
        Message::new(
            0x1111,
            0x2222,
            ExchangeType::INFORMATIONAL,
            true,
            false,
            3,
            source.parse().unwrap(),
            destination.parse().unwrap(),
        )
    }

    #[test]
    fn hash_depends_on_address_and_port() {
        let a = nat_detection_hash(1, 2, "192.0.2.1:500".parse().unwrap());
        let b = nat_detection_hash(1, 2, "192.0.2.1:4500".parse().unwrap());
        let c = nat_detection_hash(1, 2, "[2001:db8::1]:500".parse().unwrap());
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, nat_detection_hash(1, 2, "192.0.2.1:500".parse().unwrap()));
    }

    #[test]
    fn detects_translated_source() {
        let kernel = Arc::new(StaticKernel::new(&["192.0.2.1"]));
        let mut sa = testing::established_sa(false, kernel, "192.0.2.1:4500", "198.51.100.7:4500");

        // Peer computed its hashes from its private address.
        let mut sent = informational("10.0.0.5:4500", "192.0.2.1:4500");
        IkeNatd::new(true).add_hashes(&mut sent);
        let mut received = informational("198.51.100.7:4500", "192.0.2.1:4500");
        sent.iter_notify()
            .for_each(|notify| received.add_notify(notify.message_type(), notify.data()));

        let mut natd = IkeNatd::new(false);
        assert_eq!(natd.process(sa.context_mut(), &received), TaskStatus::NeedMore);
        assert!(sa.context().has_condition(Conditions::NAT_THERE));
        assert!(!sa.context().has_condition(Conditions::NAT_HERE));
        assert!(sa.context().supports_extension(Extensions::NATT));
    }

    #[test]
    fn initiator_floats_to_nat_port() {
        let kernel = Arc::new(StaticKernel::new(&["192.0.2.1"]));
        let mut sa = testing::established_sa(true, kernel, "192.0.2.1:500", "198.51.100.7:500");
        let mut response = Message::new(
            0x1111,
            0x2222,
            ExchangeType::IKE_SA_INIT,
            false,
            true,
            0,
            "198.51.100.7:500".parse().unwrap(),
            "192.0.2.1:500".parse().unwrap(),
        );
        IkeNatd::new(false).add_hashes(&mut response);
        let mut natd = IkeNatd::new(true);
        assert_eq!(natd.process(sa.context_mut(), &response), TaskStatus::Success);
        assert!(!sa.context().has_condition(Conditions::NAT_ANY));
        // MOBIKE is enabled in the test policy.
        assert_eq!(sa.context().my_host().port(), 4500);
        assert_eq!(sa.context().other_host().port(), 4500);
    }
}
