use log::{info, warn};

use super::{Task, TaskKind, TaskStatus};
use crate::ikev2::{
    ike_sa::{IkeSaContext, IkeSaState},
    message::{ExchangeType, Identification, Message, NotifyMessageType, Payload, PayloadType},
};

/// IKE_AUTH identity exchange; establishes the Association.
pub struct IkeAuth {
    initiator: bool,
    error: Option<NotifyMessageType>,
}

impl IkeAuth {
    pub fn new(initiator: bool) -> IkeAuth {
        IkeAuth {
            initiator,
            error: None,
        }
    }

    fn verify_peer(
        sa: &mut IkeSaContext,
        id: Option<&Identification>,
    ) -> Result<(), NotifyMessageType> {
        let id = match id {
            Some(id) => id.to_text(),
            None => {
                warn!("IKE SA {} peer did not send its identity", sa.id());
                return Err(NotifyMessageType::INVALID_SYNTAX);
            }
        };
        let expected = sa.config().and_then(|config| config.remote_id.clone());
        if let Some(expected) = expected {
            if expected != id {
                warn!(
                    "IKE SA {} peer identity {} does not match {}",
                    sa.id(),
                    id,
                    expected
                );
                return Err(NotifyMessageType::AUTHENTICATION_FAILED);
            }
        }
        sa.set_other_id(id);
        Ok(())
    }

    fn establish(sa: &mut IkeSaContext) {
        sa.set_state(IkeSaState::Established);
        info!(
            "IKE SA {} established between {} and {} ({})",
            sa.id(),
            sa.my_host(),
            sa.other_host(),
            sa.other_id().unwrap_or("unknown")
        );
    }

    fn local_id(sa: &IkeSaContext) -> Option<Identification> {
        sa.config().map(|config| Identification::fqdn(&config.local_id))
    }
}

impl Task for IkeAuth {
    fn kind(&self) -> TaskKind {
        TaskKind::IkeAuth
    }

    fn build(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::IKE_AUTH {
            return TaskStatus::NeedMore;
        }
        if !self.initiator {
            if let Some(error) = self.error {
                message.add_notify(error, &[]);
                return TaskStatus::Failed;
            }
        }
        let id = match Self::local_id(sa) {
            Some(id) => id,
            None => return TaskStatus::Failed,
        };
        if self.initiator {
            message.add_payload(Payload::IdInitiator(id));
            if let Some(remote_id) = sa.config().and_then(|config| config.remote_id.as_deref()) {
                message.add_payload(Payload::IdResponder(Identification::fqdn(remote_id)));
            }
            TaskStatus::NeedMore
        } else {
            message.add_payload(Payload::IdResponder(id));
            Self::establish(sa);
            TaskStatus::Success
        }
    }

    fn process(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::IKE_AUTH {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            if let Some(error) = message
                .iter_notify()
                .find(|notify| notify.message_type().is_error())
            {
                warn!(
                    "IKE SA {} received {} in IKE_AUTH response",
                    sa.id(),
                    error.message_type()
                );
                return TaskStatus::Failed;
            }
            let id = match message.payload(PayloadType::ID_RESPONDER) {
                Some(Payload::IdResponder(id)) => Some(id),
                _ => None,
            };
            if Self::verify_peer(sa, id).is_err() {
                return TaskStatus::Failed;
            }
            Self::establish(sa);
            TaskStatus::Success
        } else {
            let id = match message.payload(PayloadType::ID_INITIATOR) {
                Some(Payload::IdInitiator(id)) => Some(id),
                _ => None,
            };
            if let Err(error) = Self::verify_peer(sa, id) {
                self.error = Some(error);
            }
            TaskStatus::NeedMore
        }
    }

    fn migrate(&mut self, _sa: &IkeSaContext) {
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::{
        config::{PeerConfig, Settings},
        ike_sa::{IkeSa, IkeSaId},
        kernel::testing::StaticKernel,
    };
    use std::sync::Arc;

    fn connecting_responder(remote_id: Option<&str>) -> IkeSa {
        let mut config = PeerConfig::new("test", "gw.example.com");
        config.remote_id = remote_id.map(|id| id.to_string());
        let mut sa = IkeSa::new(
            IkeSaId::new(0x1111, 0x2222, false),
            Arc::new(Settings::default()),
            Arc::new(StaticKernel::new(&["192.0.2.1"])),
            "192.0.2.1:4500".parse().unwrap(),
            "198.51.100.1:4500".parse().unwrap(),
            Some(Arc::new(config)),
        );
        sa.context_mut().set_state(IkeSaState::Connecting);
        sa
    }

    fn auth_message(response: bool, id: &str) -> Message {
        let mut message = Message::new(
            0x1111,
            0x2222,
            ExchangeType::IKE_AUTH,
            !response,
            response,
            1,
            "198.51.100.1:4500".parse().unwrap(),
            "192.0.2.1:4500".parse().unwrap(),
        );
        message.add_payload(Payload::IdInitiator(Identification::fqdn(id)));
        message
    }

    #[test]
    fn responder_establishes_with_matching_identity() {
        let mut sa = connecting_responder(Some("client.example.com"));
        let mut task = IkeAuth::new(false);
        let request = auth_message(false, "client.example.com");
        assert_eq!(task.process(sa.context_mut(), &request), TaskStatus::NeedMore);
        let mut response = auth_message(true, "unused");
        assert_eq!(task.build(sa.context_mut(), &mut response), TaskStatus::Success);
        assert_eq!(sa.state(), IkeSaState::Established);
        assert_eq!(sa.context().other_id(), Some("client.example.com"));
    }

    #[test]
    fn responder_rejects_wrong_identity() {
        let mut sa = connecting_responder(Some("client.example.com"));
        let mut task = IkeAuth::new(false);
        task.process(sa.context_mut(), &auth_message(false, "intruder.example.com"));
        let mut response = auth_message(true, "unused");
        assert_eq!(task.build(sa.context_mut(), &mut response), TaskStatus::Failed);
        assert!(response
            .notify(NotifyMessageType::AUTHENTICATION_FAILED)
            .is_some());
        assert_eq!(sa.state(), IkeSaState::Connecting);
    }
}
