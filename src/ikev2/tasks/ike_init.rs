use log::{debug, warn};
use rand::Rng;

use super::{Task, TaskKind, TaskStatus};
use crate::ikev2::{
    ike_sa::{IkeSaContext, IkeSaState},
    message::{ExchangeType, Message, NotifyMessageType, Payload, PayloadType, SecurityAssociation},
};

const NONCE_LENGTH: usize = 32;

/// IKE_SA_INIT proposal negotiation and nonce exchange.
pub struct IkeInit {
    initiator: bool,
    my_nonce: Vec<u8>,
    other_nonce: Option<Vec<u8>>,
    error: Option<NotifyMessageType>,
}

impl IkeInit {
    pub fn new(initiator: bool) -> IkeInit {
        let mut my_nonce = vec![0u8; NONCE_LENGTH];
        rand::thread_rng().fill(my_nonce.as_mut_slice());
        IkeInit {
            initiator,
            my_nonce,
            other_nonce: None,
            error: None,
        }
    }

    fn build_i(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        let config = match sa.config() {
            Some(config) => config,
            None => {
                warn!("IKE SA {} has no peer config to initiate", sa.id());
                return TaskStatus::Failed;
            }
        };
        let proposals = config
            .ike_proposals
            .iter()
            .enumerate()
            .map(|(i, proposal)| proposal.with_spi((i + 1) as u8, &[]))
            .collect::<Vec<_>>();
        message.add_payload(Payload::SecurityAssociation(SecurityAssociation::new(
            proposals,
        )));
        message.add_payload(Payload::Nonce(self.my_nonce.clone()));
        TaskStatus::NeedMore
    }

    fn process_i(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if let Some(error) = message.iter_notify().find(|notify| notify.message_type().is_error()) {
            warn!(
                "IKE SA {} received {} in IKE_SA_INIT response",
                sa.id(),
                error.message_type()
            );
            return TaskStatus::Failed;
        }
        if message.responder_spi() == 0 {
            warn!("IKE SA {} responder sent an empty SPI", sa.id());
            return TaskStatus::Failed;
        }
        let chosen = match message.payload(PayloadType::SECURITY_ASSOCIATION) {
            Some(Payload::SecurityAssociation(offer)) if offer.proposals().len() == 1 => {
                let supported = sa
                    .config()
                    .map(|config| config.ike_proposals.as_slice())
                    .unwrap_or_default();
                offer.select(supported).cloned()
            }
            _ => None,
        };
        let chosen = match chosen {
            Some(chosen) => chosen,
            None => {
                warn!("IKE SA {} responder chose an invalid proposal", sa.id());
                return TaskStatus::Failed;
            }
        };
        match message.payload(PayloadType::NONCE) {
            Some(Payload::Nonce(nonce)) => self.other_nonce = Some(nonce.clone()),
            _ => {
                warn!("IKE SA {} responder didn't provide nonce", sa.id());
                return TaskStatus::Failed;
            }
        }
        sa.set_responder_spi(message.responder_spi());
        sa.set_ike_proposal(chosen);
        sa.set_state(IkeSaState::Connecting);
        TaskStatus::Success
    }

    fn process_r(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        let supported = sa
            .config()
            .map(|config| config.ike_proposals.clone())
            .unwrap_or_default();
        let chosen = match message.payload(PayloadType::SECURITY_ASSOCIATION) {
            Some(Payload::SecurityAssociation(offer)) => offer.select(&supported).cloned(),
            _ => None,
        };
        match chosen {
            Some(chosen) => sa.set_ike_proposal(chosen),
            None => {
                debug!("IKE SA {} no acceptable proposal offered", sa.id());
                self.error = Some(NotifyMessageType::NO_PROPOSAL_CHOSEN);
                return TaskStatus::NeedMore;
            }
        }
        match message.payload(PayloadType::NONCE) {
            Some(Payload::Nonce(nonce)) => self.other_nonce = Some(nonce.clone()),
            _ => {
                warn!("IKE SA {} initiator didn't provide nonce", sa.id());
                self.error = Some(NotifyMessageType::INVALID_SYNTAX);
            }
        }
        TaskStatus::NeedMore
    }

    fn build_r(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if let Some(error) = self.error {
            message.add_notify(error, &[]);
            return TaskStatus::Failed;
        }
        let chosen = match sa.ike_proposal() {
            Some(chosen) => chosen.clone(),
            None => return TaskStatus::Failed,
        };
        message.add_payload(Payload::SecurityAssociation(SecurityAssociation::new(vec![
            chosen,
        ])));
        message.add_payload(Payload::Nonce(self.my_nonce.clone()));
        sa.set_state(IkeSaState::Connecting);
        TaskStatus::Success
    }
}

impl Task for IkeInit {
    fn kind(&self) -> TaskKind {
        TaskKind::IkeInit
    }

    fn build(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::IKE_SA_INIT {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            self.build_i(sa, message)
        } else {
            self.build_r(sa, message)
        }
    }

    fn process(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::IKE_SA_INIT {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            self.process_i(sa, message)
        } else {
            self.process_r(sa, message)
        }
    }

    fn migrate(&mut self, _sa: &IkeSaContext) {
        self.other_nonce = None;
        self.error = None;
    }
}
