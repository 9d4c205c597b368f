use log::{debug, warn};
use rand::Rng;

use super::{Task, TaskKind, TaskStatus};
use crate::ikev2::{
    child_sa::ChildSa,
    ike_sa::{Conditions, IkeSaContext},
    message::{
        ExchangeType, Message, NotifyMessageType, Payload, PayloadType, Proposal,
        SecurityAssociation, TrafficSelector,
    },
};

/// Negotiates one ESP Child Context, piggybacked on IKE_AUTH or in CREATE_CHILD_SA.
pub struct ChildCreate {
    initiator: bool,
    // Piggybacked on IKE_AUTH instead of running its own CREATE_CHILD_SA exchange.
    setup: bool,
    inbound_spi: u32,
    proposal: Option<Proposal>,
    outbound_spi: Option<u32>,
    local_ts: Vec<TrafficSelector>,
    remote_ts: Vec<TrafficSelector>,
    error: Option<NotifyMessageType>,
}

impl ChildCreate {
    pub fn new(initiator: bool) -> ChildCreate {
        ChildCreate {
            initiator,
            setup: true,
            inbound_spi: allocate_spi(),
            proposal: None,
            outbound_spi: None,
            local_ts: vec![],
            remote_ts: vec![],
            error: None,
        }
    }

    /// Initiates a Child Context for the traffic selectors of an existing one.
    pub fn recreate(child_sa: &ChildSa, setup: bool) -> ChildCreate {
        ChildCreate {
            setup,
            local_ts: child_sa.local_ts().to_vec(),
            remote_ts: child_sa.remote_ts().to_vec(),
            ..ChildCreate::new(true)
        }
    }

    fn is_child_exchange(message: &Message) -> bool {
        message.exchange_type() == ExchangeType::IKE_AUTH
            || message.exchange_type() == ExchangeType::CREATE_CHILD_SA
    }

    fn install(&self, sa: &mut IkeSaContext) {
        let outbound_spi = match self.outbound_spi {
            Some(spi) => spi,
            None => return,
        };
        let child_sa = ChildSa::new(
            self.inbound_spi,
            outbound_spi,
            sa.my_host(),
            sa.other_host(),
            sa.has_condition(Conditions::NAT_ANY),
            self.local_ts.clone(),
            self.remote_ts.clone(),
        );
        sa.add_child_sa(child_sa);
    }

    fn build_i(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        let config = match sa.config() {
            Some(config) => config,
            None => return TaskStatus::Failed,
        };
        let spi = self.inbound_spi.to_be_bytes();
        let proposals = config
            .esp_proposals
            .iter()
            .enumerate()
            .map(|(i, proposal)| proposal.with_spi((i + 1) as u8, &spi))
            .collect::<Vec<_>>();
        if self.local_ts.is_empty() || self.remote_ts.is_empty() {
            self.local_ts = config.local_ts.clone();
            self.remote_ts = config.remote_ts.clone();
        }
        message.add_payload(Payload::SecurityAssociation(SecurityAssociation::new(
            proposals,
        )));
        message.add_payload(Payload::TrafficSelectorInitiator(self.local_ts.clone()));
        message.add_payload(Payload::TrafficSelectorResponder(self.remote_ts.clone()));
        TaskStatus::NeedMore
    }

    fn process_i(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if let Some(error) = message.iter_notify().find(|notify| notify.message_type().is_error()) {
            // The Association survives a failed Child Context.
            warn!(
                "IKE SA {} CHILD_SA not established: {}",
                sa.id(),
                error.message_type()
            );
            return TaskStatus::Success;
        }
        let supported = sa
            .config()
            .map(|config| config.esp_proposals.clone())
            .unwrap_or_default();
        let chosen = match message.payload(PayloadType::SECURITY_ASSOCIATION) {
            Some(Payload::SecurityAssociation(offer)) => offer.select(&supported).cloned(),
            _ => None,
        };
        let chosen = match chosen {
            Some(chosen) => chosen,
            None => {
                warn!("IKE SA {} responder chose an invalid CHILD_SA proposal", sa.id());
                return TaskStatus::Success;
            }
        };
        self.outbound_spi = chosen.esp_spi();
        if let Some(Payload::TrafficSelectorResponder(ts)) =
            message.payload(PayloadType::TRAFFIC_SELECTOR_RESPONDER)
        {
            self.remote_ts = ts.clone();
        }
        if let Some(Payload::TrafficSelectorInitiator(ts)) =
            message.payload(PayloadType::TRAFFIC_SELECTOR_INITIATOR)
        {
            self.local_ts = ts.clone();
        }
        self.proposal = Some(chosen);
        self.install(sa);
        TaskStatus::Success
    }

    fn process_r(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        let supported = sa
            .config()
            .map(|config| config.esp_proposals.clone())
            .unwrap_or_default();
        let chosen = match message.payload(PayloadType::SECURITY_ASSOCIATION) {
            Some(Payload::SecurityAssociation(offer)) => offer.select(&supported).cloned(),
            _ => None,
        };
        match chosen {
            Some(chosen) => {
                self.outbound_spi = chosen.esp_spi();
                self.proposal = Some(chosen);
            }
            None => {
                debug!("IKE SA {} no acceptable CHILD_SA proposal", sa.id());
                self.error = Some(NotifyMessageType::NO_PROPOSAL_CHOSEN);
                return TaskStatus::NeedMore;
            }
        }
        if self.outbound_spi.is_none() {
            self.error = Some(NotifyMessageType::INVALID_SYNTAX);
            return TaskStatus::NeedMore;
        }
        match (
            message.payload(PayloadType::TRAFFIC_SELECTOR_INITIATOR),
            message.payload(PayloadType::TRAFFIC_SELECTOR_RESPONDER),
        ) {
            (
                Some(Payload::TrafficSelectorInitiator(tsi)),
                Some(Payload::TrafficSelectorResponder(tsr)),
            ) if !tsi.is_empty() && !tsr.is_empty() => {
                self.remote_ts = tsi.clone();
                self.local_ts = tsr.clone();
            }
            _ => self.error = Some(NotifyMessageType::TS_UNACCEPTABLE),
        }
        TaskStatus::NeedMore
    }

    fn build_r(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if let Some(error) = self.error {
            message.add_notify(error, &[]);
            return TaskStatus::Success;
        }
        let chosen = match self.proposal.as_ref() {
            Some(chosen) => chosen.with_spi(chosen.proposal_num(), &self.inbound_spi.to_be_bytes()),
            None => return TaskStatus::Success,
        };
        message.add_payload(Payload::SecurityAssociation(SecurityAssociation::new(vec![
            chosen,
        ])));
        message.add_payload(Payload::TrafficSelectorInitiator(self.remote_ts.clone()));
        message.add_payload(Payload::TrafficSelectorResponder(self.local_ts.clone()));
        self.install(sa);
        TaskStatus::Success
    }
}

impl Task for ChildCreate {
    fn kind(&self) -> TaskKind {
        TaskKind::ChildCreate
    }

    fn is_setup(&self) -> bool {
        self.setup
    }

    fn build(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if !Self::is_child_exchange(message) {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            self.build_i(sa, message)
        } else {
            self.build_r(sa, message)
        }
    }

    fn process(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if !Self::is_child_exchange(message) {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            self.process_i(sa, message)
        } else {
            self.process_r(sa, message)
        }
    }

    fn migrate(&mut self, _sa: &IkeSaContext) {
        self.inbound_spi = allocate_spi();
        self.proposal = None;
        self.outbound_spi = None;
        self.error = None;
    }
}

// Values below 256 are reserved by IANA.
fn allocate_spi() -> u32 {
    rand::thread_rng().gen_range(256..=u32::MAX)
}
