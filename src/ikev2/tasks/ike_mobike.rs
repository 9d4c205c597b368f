use log::{debug, info, warn};
use rand::Rng;
use std::net::IpAddr;

use super::{IkeNatd, Task, TaskKind, TaskStatus};
use crate::{
    ikev2::{
        ike_sa::{Extensions, IkeSaContext},
        message::{self, ExchangeType, Message, NotifyMessageType, PayloadType},
    },
    logger::fmt_slice_hex,
};

const COOKIE2_LENGTH: usize = 16;

/// MOBIKE (RFC 4555) support negotiation, address lists and path updates.
pub struct IkeMobike {
    initiator: bool,
    // Whether the request announces new addresses for the Association.
    update: bool,
    // Whether the request carries the additional-address list.
    address: bool,
    cookie2: Option<Vec<u8>>,
    natd: Option<IkeNatd>,
    main_exchange: bool,
}

impl IkeMobike {
    pub fn new(initiator: bool) -> IkeMobike {
        IkeMobike {
            initiator,
            update: false,
            address: false,
            cookie2: None,
            natd: None,
            main_exchange: false,
        }
    }

    /// Requests an address update, merging with anything already requested.
    pub fn roam(&mut self, update: bool, address: bool) {
        self.update |= update;
        self.address |= address;
    }

    /// Whether an INFORMATIONAL request needs a MOBIKE responder.
    pub fn is_mobike_request(sa: &IkeSaContext, message: &Message) -> bool {
        if !sa.supports_extension(Extensions::MOBIKE) {
            return false;
        }
        message.iter_notify().any(|notify| {
            matches!(
                notify.message_type(),
                NotifyMessageType::UPDATE_SA_ADDRESSES
                    | NotifyMessageType::ADDITIONAL_IP4_ADDRESS
                    | NotifyMessageType::ADDITIONAL_IP6_ADDRESS
                    | NotifyMessageType::NO_ADDITIONAL_ADDRESSES
                    | NotifyMessageType::COOKIE2
            )
        })
    }

    // IKE_AUTH negotiates MOBIKE only together with a CHILD_SA.
    fn is_main_exchange(message: &Message) -> bool {
        message.exchange_type() == ExchangeType::IKE_AUTH
            && message.has_payload(PayloadType::SECURITY_ASSOCIATION)
    }

    fn process_payloads(&mut self, sa: &mut IkeSaContext, message: &Message) {
        let mut addresses: Option<Vec<IpAddr>> = None;
        for notify in message.iter_notify() {
            match notify.message_type() {
                NotifyMessageType::MOBIKE_SUPPORTED => {
                    if sa.config().map(|config| config.mobike).unwrap_or(false) {
                        if !sa.supports_extension(Extensions::MOBIKE) {
                            info!("IKE SA {} peer supports MOBIKE", sa.id());
                        }
                        sa.enable_extension(Extensions::MOBIKE);
                    } else {
                        debug!("IKE SA {} MOBIKE disabled by policy", sa.id());
                    }
                }
                NotifyMessageType::ADDITIONAL_IP4_ADDRESS
                | NotifyMessageType::ADDITIONAL_IP6_ADDRESS => {
                    // The first address in a message replaces the whole list.
                    let list = addresses.get_or_insert_with(Vec::new);
                    match message::ip_from_notify(notify) {
                        Some(addr) => {
                            debug!("IKE SA {} peer announced address {}", sa.id(), addr);
                            list.push(addr);
                        }
                        None => warn!(
                            "IKE SA {} ignoring malformed {} notify",
                            sa.id(),
                            notify.message_type()
                        ),
                    }
                }
                NotifyMessageType::NO_ADDITIONAL_ADDRESSES => {
                    addresses = Some(vec![]);
                }
                NotifyMessageType::UPDATE_SA_ADDRESSES => {
                    self.update = true;
                }
                NotifyMessageType::NAT_DETECTION_SOURCE_IP
                | NotifyMessageType::NAT_DETECTION_DESTINATION_IP => {
                    if self.natd.is_none() {
                        self.natd = Some(IkeNatd::new(self.initiator));
                    }
                }
                _ => {}
            }
        }
        if let Some(addresses) = addresses {
            sa.replace_peer_addresses(addresses);
        }
    }

    fn build_address_list(sa: &IkeSaContext, message: &mut Message) {
        let primary = sa.my_host().ip();
        let mut additional = 0;
        for addr in sa.kernel().local_addresses() {
            if addr == primary || addr.is_unspecified() || addr.is_loopback() {
                continue;
            }
            match addr {
                IpAddr::V4(addr) => {
                    message.add_notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS, &addr.octets())
                }
                IpAddr::V6(addr) => {
                    message.add_notify(NotifyMessageType::ADDITIONAL_IP6_ADDRESS, &addr.octets())
                }
            }
            additional += 1;
        }
        if additional == 0 {
            message.add_notify(NotifyMessageType::NO_ADDITIONAL_ADDRESSES, &[]);
        }
    }

    fn build_i(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        match message.exchange_type() {
            ExchangeType::IKE_AUTH => {
                if Self::is_main_exchange(message) {
                    message.add_notify(NotifyMessageType::MOBIKE_SUPPORTED, &[]);
                    Self::build_address_list(sa, message);
                    self.main_exchange = true;
                }
            }
            ExchangeType::INFORMATIONAL => {
                if self.update {
                    message.add_notify(NotifyMessageType::UPDATE_SA_ADDRESSES, &[]);
                }
                let mut cookie2 = vec![0u8; COOKIE2_LENGTH];
                rand::thread_rng().fill(cookie2.as_mut_slice());
                message.add_notify(NotifyMessageType::COOKIE2, &cookie2);
                self.cookie2 = Some(cookie2);
                if self.address {
                    Self::build_address_list(sa, message);
                }
                if self.update {
                    let natd = self.natd.get_or_insert_with(|| IkeNatd::new(true));
                    natd.build(sa, message);
                    sa.update_children();
                }
            }
            _ => {}
        }
        TaskStatus::NeedMore
    }

    fn process_i(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        match message.exchange_type() {
            ExchangeType::IKE_AUTH => {
                // Without a CHILD_SA the peer's MOBIKE notifies are not part of the negotiation.
                if self.main_exchange && Self::is_main_exchange(message) {
                    self.process_payloads(sa, message);
                }
                TaskStatus::Success
            }
            ExchangeType::INFORMATIONAL => {
                let pending = sa.pending_updates().saturating_sub(1);
                sa.set_pending_updates(pending);
                if pending > 0 {
                    debug!(
                        "IKE SA {} newer MOBIKE update queued, ignoring response",
                        sa.id()
                    );
                    return TaskStatus::Success;
                }
                if let Some(cookie2) = self.cookie2.take() {
                    let echoed = message
                        .notify(NotifyMessageType::COOKIE2)
                        .map(|notify| notify.data());
                    if echoed != Some(cookie2.as_slice()) {
                        warn!(
                            "IKE SA {} COOKIE2 mismatch, expected {}",
                            sa.id(),
                            fmt_slice_hex(&cookie2)
                        );
                        return TaskStatus::Failed;
                    }
                }
                self.process_payloads(sa, message);
                if let Some(natd) = self.natd.as_mut() {
                    natd.process(sa, message);
                }
                if self.update {
                    // NAT detection may have changed the encapsulation.
                    sa.update_children();
                }
                TaskStatus::Success
            }
            _ => TaskStatus::NeedMore,
        }
    }

    fn process_r(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        match message.exchange_type() {
            ExchangeType::IKE_AUTH => {
                if Self::is_main_exchange(message) {
                    self.main_exchange = true;
                    self.process_payloads(sa, message);
                }
            }
            ExchangeType::INFORMATIONAL => {
                self.process_payloads(sa, message);
                if self.update {
                    sa.set_my_host(message.destination());
                    sa.set_other_host(message.source());
                }
                self.cookie2 = message
                    .notify(NotifyMessageType::COOKIE2)
                    .map(|notify| notify.data().to_vec());
                if let Some(natd) = self.natd.as_mut() {
                    natd.process(sa, message);
                }
            }
            _ => {}
        }
        TaskStatus::NeedMore
    }

    fn build_r(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        match message.exchange_type() {
            ExchangeType::IKE_AUTH => {
                if self.main_exchange
                    && Self::is_main_exchange(message)
                    && sa.supports_extension(Extensions::MOBIKE)
                {
                    message.add_notify(NotifyMessageType::MOBIKE_SUPPORTED, &[]);
                    Self::build_address_list(sa, message);
                }
                TaskStatus::Success
            }
            ExchangeType::INFORMATIONAL => {
                if let Some(cookie2) = self.cookie2.as_ref() {
                    message.add_notify(NotifyMessageType::COOKIE2, cookie2);
                }
                if let Some(natd) = self.natd.as_mut() {
                    natd.build(sa, message);
                }
                if self.update {
                    sa.update_children();
                }
                TaskStatus::Success
            }
            _ => TaskStatus::NeedMore,
        }
    }
}

impl Task for IkeMobike {
    fn kind(&self) -> TaskKind {
        TaskKind::IkeMobike
    }

    fn build(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if self.initiator {
            self.build_i(sa, message)
        } else {
            self.build_r(sa, message)
        }
    }

    fn process(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if self.initiator {
            self.process_i(sa, message)
        } else {
            self.process_r(sa, message)
        }
    }

    fn migrate(&mut self, sa: &IkeSaContext) {
        if let Some(natd) = self.natd.as_mut() {
            natd.migrate(sa);
        }
    }

    // A roaming update runs in its own INFORMATIONAL exchange.
    fn is_setup(&self) -> bool {
        !self.update && !self.address
    }

    fn as_mobike(&mut self) -> Option<&mut IkeMobike> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::{
        child_sa::ChildSa,
        ike_sa::{testing, IkeSa, SaStatus},
        kernel::testing::StaticKernel,
        message::{Payload, SecurityAssociation},
        task_manager::PendingAction,
    };
    use std::sync::Arc;

    fn message(
        exchange_type: ExchangeType,
        response: bool,
        source: &str,
        destination: &str,
    ) -> Message {
        Message::new(
            0x1111,
            0x2222,
            exchange_type,
            !response,
            response,
            1,
            source.parse().unwrap(),
            destination.parse().unwrap(),
        )
    }

    // IKE_AUTH carrying a CHILD_SA proposal.
    fn main_exchange(response: bool, source: &str, destination: &str) -> Message {
        let mut message = message(ExchangeType::IKE_AUTH, response, source, destination);
        message.add_payload(Payload::SecurityAssociation(SecurityAssociation::new(vec![])));
        message
    }

    fn notify_types(message: &Message) -> Vec<NotifyMessageType> {
        message.iter_notify().map(|notify| notify.message_type()).collect()
    }

    fn sent(sa: &mut IkeSa) -> Vec<Message> {
        sa.take_pending_actions()
            .into_iter()
            .filter_map(|action| match action {
                PendingAction::Send(packet) => Some(
                    Message::decode(&packet.data, packet.source, packet.destination).unwrap(),
                ),
                PendingAction::Retransmit { .. } => None,
            })
            .collect()
    }

    // Delivers messages back and forth until both sides are quiet; returns the number of requests.
    fn run_exchanges(initiator: &mut IkeSa, responder: &mut IkeSa) -> usize {
        let mut exchanges = 0;
        loop {
            let requests = sent(initiator);
            if requests.is_empty() {
                return exchanges;
            }
            for request in requests {
                exchanges += 1;
                assert_eq!(
                    responder.process_message(&request, None).unwrap(),
                    SaStatus::Continue
                );
                for response in sent(responder) {
                    assert_eq!(
                        initiator.process_message(&response, None).unwrap(),
                        SaStatus::Continue
                    );
                }
            }
        }
    }

    fn add_child(sa: &mut IkeSa, inbound: u32, outbound: u32) {
        let ctx = sa.context_mut();
        let child = ChildSa::new(
            inbound,
            outbound,
            ctx.my_host(),
            ctx.other_host(),
            false,
            vec![],
            vec![],
        );
        ctx.add_child_sa(child);
    }

    #[test]
    fn responder_announces_additional_addresses() {
        let kernel = Arc::new(StaticKernel::new(&["198.51.100.1", "203.0.113.9"]));
        let mut sa = testing::established_sa(false, kernel, "198.51.100.1:4500", "192.0.2.1:4500");
        let mut request = main_exchange(
            false,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        request.add_notify(NotifyMessageType::MOBIKE_SUPPORTED, &[]);

        let mut task = IkeMobike::new(false);
        assert_eq!(task.process(sa.context_mut(), &request), TaskStatus::NeedMore);
        let mut response = main_exchange(
            true,
            "198.51.100.1:4500",
            "192.0.2.1:4500",
        );
        assert_eq!(task.build(sa.context_mut(), &mut response), TaskStatus::Success);
        assert_eq!(
            notify_types(&response),
            vec![
                NotifyMessageType::MOBIKE_SUPPORTED,
                NotifyMessageType::ADDITIONAL_IP4_ADDRESS
            ]
        );
        let addr = response
            .notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS)
            .and_then(message::ip_from_notify);
        assert_eq!(addr, Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn responder_without_extra_addresses() {
        let kernel = Arc::new(StaticKernel::new(&["198.51.100.1"]));
        let mut sa = testing::established_sa(false, kernel, "198.51.100.1:4500", "192.0.2.1:4500");
        let mut request = main_exchange(
            false,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        request.add_notify(NotifyMessageType::MOBIKE_SUPPORTED, &[]);
        let mut task = IkeMobike::new(false);
        task.process(sa.context_mut(), &request);
        let mut response = main_exchange(
            true,
            "198.51.100.1:4500",
            "192.0.2.1:4500",
        );
        task.build(sa.context_mut(), &mut response);
        assert_eq!(
            notify_types(&response),
            vec![
                NotifyMessageType::MOBIKE_SUPPORTED,
                NotifyMessageType::NO_ADDITIONAL_ADDRESSES
            ]
        );
    }

    #[test]
    fn address_list_is_replaced() {
        let kernel = Arc::new(StaticKernel::new(&["198.51.100.1"]));
        let mut sa = testing::established_sa(false, kernel, "198.51.100.1:4500", "192.0.2.1:4500");
        let ctx = sa.context_mut();

        let mut first = message(
            ExchangeType::INFORMATIONAL,
            false,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        first.add_notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS, &[10, 0, 0, 1]);
        first.add_notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS, &[10, 0, 0, 2]);
        IkeMobike::new(false).process(ctx, &first);
        assert_eq!(
            ctx.peer_addresses(),
            &["10.0.0.1".parse::<IpAddr>().unwrap(), "10.0.0.2".parse().unwrap()]
        );

        let mut second = message(
            ExchangeType::INFORMATIONAL,
            false,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        second.add_notify(
            NotifyMessageType::ADDITIONAL_IP6_ADDRESS,
            &"2001:db8::7".parse::<std::net::Ipv6Addr>().unwrap().octets(),
        );
        IkeMobike::new(false).process(ctx, &second);
        assert_eq!(ctx.peer_addresses(), &["2001:db8::7".parse::<IpAddr>().unwrap()]);

        let mut none = message(
            ExchangeType::INFORMATIONAL,
            false,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        none.add_notify(NotifyMessageType::NO_ADDITIONAL_ADDRESSES, &[]);
        IkeMobike::new(false).process(ctx, &none);
        assert!(ctx.peer_addresses().is_empty());
    }

    #[test]
    fn roam_updates_peer_and_children() {
        let kernel_i = Arc::new(StaticKernel::new(&["192.0.2.1", "203.0.113.5"]));
        let kernel_r = Arc::new(StaticKernel::new(&["198.51.100.1"]));
        let mut initiator = testing::established_sa(
            true,
            kernel_i.clone(),
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        let mut responder =
            testing::established_sa(false, kernel_r, "198.51.100.1:4500", "192.0.2.1:4500");
        add_child(&mut initiator, 0x100, 0x200);
        add_child(&mut responder, 0x200, 0x100);

        // The old uplink disappears.
        kernel_i.set_addresses(&["203.0.113.5", "192.0.2.1"]);
        assert_eq!(initiator.roam(true).unwrap(), SaStatus::Continue);
        assert_eq!(initiator.context().my_host(), "203.0.113.5:4500".parse().unwrap());

        let requests = sent(&mut initiator);
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.exchange_type(), ExchangeType::INFORMATIONAL);
        let types = notify_types(request);
        assert!(types.contains(&NotifyMessageType::UPDATE_SA_ADDRESSES));
        assert!(types.contains(&NotifyMessageType::COOKIE2));
        assert!(types.contains(&NotifyMessageType::NAT_DETECTION_SOURCE_IP));
        assert_eq!(
            request
                .notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS)
                .and_then(message::ip_from_notify),
            Some("192.0.2.1".parse().unwrap())
        );

        responder.process_message(request, None).unwrap();
        assert_eq!(
            responder.context().other_host(),
            "203.0.113.5:4500".parse().unwrap()
        );
        assert_eq!(
            responder.context().child_sas()[0].remote_addr(),
            "203.0.113.5:4500".parse().unwrap()
        );
        let responses = sent(&mut responder);
        assert_eq!(responses.len(), 1);
        assert!(responses[0].notify(NotifyMessageType::COOKIE2).is_some());

        assert_eq!(
            initiator.process_message(&responses[0], None).unwrap(),
            SaStatus::Continue
        );
        let child = &initiator.context().child_sas()[0];
        assert_eq!(child.local_addr(), initiator.context().my_host());
        assert_eq!(child.remote_addr(), initiator.context().other_host());
        assert_eq!(initiator.context().pending_updates(), 0);
        assert!(initiator.task_manager().is_idle());
    }

    #[test]
    fn repeated_roams_are_coalesced() {
        let kernel_i = Arc::new(StaticKernel::new(&["192.0.2.1", "203.0.113.5"]));
        let kernel_r = Arc::new(StaticKernel::new(&["198.51.100.1"]));
        let mut initiator = testing::established_sa(
            true,
            kernel_i,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        let mut responder =
            testing::established_sa(false, kernel_r, "198.51.100.1:4500", "192.0.2.1:4500");

        for _ in 0..5 {
            initiator.roam(true).unwrap();
        }
        // One update in flight and one merged update queued.
        assert_eq!(initiator.context().pending_updates(), 2);
        assert_eq!(initiator.task_manager().queued_tasks().count(), 1);

        assert_eq!(run_exchanges(&mut initiator, &mut responder), 2);
        assert_eq!(initiator.context().pending_updates(), 0);
        assert!(initiator.task_manager().is_idle());
    }

    #[test]
    fn cookie2_mismatch_fails() {
        let kernel = Arc::new(StaticKernel::new(&["192.0.2.1"]));
        let mut sa = testing::established_sa(true, kernel, "192.0.2.1:4500", "198.51.100.1:4500");
        sa.context_mut().set_pending_updates(1);
        let mut task = IkeMobike::new(true);
        task.roam(true, false);

        let mut request = message(
            ExchangeType::INFORMATIONAL,
            false,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        assert_eq!(task.build(sa.context_mut(), &mut request), TaskStatus::NeedMore);
        assert!(request.notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS).is_none());

        let mut response = message(
            ExchangeType::INFORMATIONAL,
            true,
            "198.51.100.1:4500",
            "192.0.2.1:4500",
        );
        response.add_notify(NotifyMessageType::COOKIE2, &[0u8; COOKIE2_LENGTH]);
        assert_eq!(task.process(sa.context_mut(), &response), TaskStatus::Failed);
    }

    #[test]
    fn mobike_support_requires_policy() {
        let kernel = Arc::new(StaticKernel::new(&["192.0.2.1"]));
        let mut config = (*testing::peer_config()).clone();
        config.mobike = false;
        let mut sa = IkeSa::new(
            crate::ikev2::ike_sa::IkeSaId::new(0x1111, 0x2222, false),
            Arc::new(crate::ikev2::config::Settings::default()),
            kernel,
            "192.0.2.1:4500".parse().unwrap(),
            "198.51.100.1:4500".parse().unwrap(),
            Some(Arc::new(config)),
        );
        let mut request = main_exchange(
            false,
            "198.51.100.1:4500",
            "192.0.2.1:4500",
        );
        request.add_notify(NotifyMessageType::MOBIKE_SUPPORTED, &[]);
        let mut task = IkeMobike::new(false);
        task.process(sa.context_mut(), &request);
        let mut response = main_exchange(
            true,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        task.build(sa.context_mut(), &mut response);
        assert!(!sa.context().supports_extension(Extensions::MOBIKE));
        assert!(response.payloads().iter().all(|payload| !matches!(payload, Payload::Notify(_))));
    }

    #[test]
    fn auth_without_child_sa_skips_mobike() {
        let kernel = Arc::new(StaticKernel::new(&["198.51.100.1", "203.0.113.9"]));
        let mut sa = IkeSa::new(
            crate::ikev2::ike_sa::IkeSaId::new(0x1111, 0x2222, false),
            Arc::new(crate::ikev2::config::Settings::default()),
            kernel,
            "198.51.100.1:4500".parse().unwrap(),
            "192.0.2.1:4500".parse().unwrap(),
            Some(testing::peer_config()),
        );
        let mut request = message(
            ExchangeType::IKE_AUTH,
            false,
            "192.0.2.1:4500",
            "198.51.100.1:4500",
        );
        request.add_notify(NotifyMessageType::MOBIKE_SUPPORTED, &[]);
        request.add_notify(NotifyMessageType::ADDITIONAL_IP4_ADDRESS, &[192, 0, 2, 77]);
        let mut task = IkeMobike::new(false);
        assert_eq!(task.process(sa.context_mut(), &request), TaskStatus::NeedMore);
        let mut response = message(
            ExchangeType::IKE_AUTH,
            true,
            "198.51.100.1:4500",
            "192.0.2.1:4500",
        );
        assert_eq!(task.build(sa.context_mut(), &mut response), TaskStatus::Success);
        assert!(notify_types(&response).is_empty());
        assert!(!sa.context().supports_extension(Extensions::MOBIKE));
        assert!(sa.context().peer_addresses().is_empty());
    }
}
