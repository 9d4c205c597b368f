use log::{debug, info};

use super::{Task, TaskKind, TaskStatus};
use crate::ikev2::{
    ike_sa::{IkeSaContext, IkeSaState},
    message::{Delete, ExchangeType, Message, Payload, ProtocolId},
};

enum Target {
    Ike,
    Child(Vec<u32>),
}

/// INFORMATIONAL delete of the Association or of Child Contexts.
pub struct IkeDelete {
    initiator: bool,
    target: Option<Target>,
}

impl IkeDelete {
    pub fn ike() -> IkeDelete {
        IkeDelete {
            initiator: true,
            target: Some(Target::Ike),
        }
    }

    /// Deletes Child Contexts by their inbound SPI.
    pub fn child(inbound_spis: Vec<u32>) -> IkeDelete {
        IkeDelete {
            initiator: true,
            target: Some(Target::Child(inbound_spis)),
        }
    }

    pub fn responder() -> IkeDelete {
        IkeDelete {
            initiator: false,
            target: None,
        }
    }

    fn build_i(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        match self.target.as_ref() {
            Some(Target::Ike) => {
                info!("IKE SA {} deleting", sa.id());
                sa.set_state(IkeSaState::Deleting);
                message.add_payload(Payload::Delete(Delete::ike()));
            }
            Some(Target::Child(spis)) => {
                message.add_payload(Payload::Delete(Delete::esp(spis)));
            }
            None => return TaskStatus::Failed,
        }
        TaskStatus::NeedMore
    }

    fn process_i(&mut self, sa: &mut IkeSaContext) -> TaskStatus {
        match self.target.as_ref() {
            Some(Target::Ike) => TaskStatus::Destroy,
            Some(Target::Child(spis)) => {
                for spi in spis {
                    sa.remove_child_sa(*spi);
                }
                TaskStatus::Success
            }
            None => TaskStatus::Failed,
        }
    }

    fn process_r(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        let mut inbound_spis = vec![];
        for payload in message.payloads() {
            let delete = match payload {
                Payload::Delete(delete) => delete,
                _ => continue,
            };
            match delete.protocol_id() {
                ProtocolId::IKE => {
                    info!("IKE SA {} deleted by peer", sa.id());
                    self.target = Some(Target::Ike);
                    return TaskStatus::NeedMore;
                }
                ProtocolId::ESP => {
                    // Peer names its inbound SPIs, which are our outbound ones.
                    for outbound_spi in delete.esp_spis() {
                        match sa
                            .child_sas()
                            .iter()
                            .find(|child| child.outbound_spi() == outbound_spi)
                        {
                            Some(child) => inbound_spis.push(child.inbound_spi()),
                            None => debug!(
                                "IKE SA {} peer deleted unknown CHILD_SA {:08x}",
                                sa.id(),
                                outbound_spi
                            ),
                        }
                    }
                }
                protocol_id => debug!(
                    "IKE SA {} ignoring delete for protocol {}",
                    sa.id(),
                    protocol_id
                ),
            }
        }
        self.target = Some(Target::Child(inbound_spis));
        TaskStatus::NeedMore
    }

    fn build_r(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        match self.target.as_ref() {
            Some(Target::Ike) => {
                sa.set_state(IkeSaState::Deleting);
                TaskStatus::Destroy
            }
            Some(Target::Child(spis)) => {
                for spi in spis {
                    sa.remove_child_sa(*spi);
                }
                if !spis.is_empty() {
                    message.add_payload(Payload::Delete(Delete::esp(spis)));
                }
                TaskStatus::Success
            }
            None => TaskStatus::Success,
        }
    }
}

impl Task for IkeDelete {
    fn kind(&self) -> TaskKind {
        TaskKind::IkeDelete
    }

    fn build(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::INFORMATIONAL {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            self.build_i(sa, message)
        } else {
            self.build_r(sa, message)
        }
    }

    fn process(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::INFORMATIONAL {
            return TaskStatus::NeedMore;
        }
        if self.initiator {
            self.process_i(sa)
        } else {
            self.process_r(sa, message)
        }
    }

    fn migrate(&mut self, _sa: &IkeSaContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::{child_sa::ChildSa, ike_sa::testing, kernel::testing::StaticKernel};
    use std::sync::Arc;

    fn informational(response: bool) -> Message {
        Message::new(
            0x1111,
            0x2222,
            ExchangeType::INFORMATIONAL,
            !response,
            response,
            4,
            "198.51.100.1:4500".parse().unwrap(),
            "192.0.2.1:4500".parse().unwrap(),
        )
    }

    #[test]
    fn responder_deletes_named_children() {
        let kernel = Arc::new(StaticKernel::new(&["192.0.2.1"]));
        let mut sa = testing::established_sa(false, kernel, "192.0.2.1:4500", "198.51.100.1:4500");
        let ctx = sa.context_mut();
        for (inbound, outbound) in [(0x100, 0x200), (0x101, 0x201)] {
            ctx.add_child_sa(ChildSa::new(
                inbound,
                outbound,
                ctx.my_host(),
                ctx.other_host(),
                false,
                vec![],
                vec![],
            ));
        }

        let mut request = informational(false);
        request.add_payload(Payload::Delete(Delete::esp(&[0x201])));
        let mut task = IkeDelete::responder();
        assert_eq!(task.process(sa.context_mut(), &request), TaskStatus::NeedMore);
        let mut response = informational(true);
        assert_eq!(task.build(sa.context_mut(), &mut response), TaskStatus::Success);

        let remaining = sa.context().child_sas();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].inbound_spi(), 0x100);
        match response.payloads() {
            [Payload::Delete(delete)] => {
                assert_eq!(delete.esp_spis().collect::<Vec<_>>(), vec![0x101])
            }
            _ => panic!("expected delete payload"),
        }
    }

    #[test]
    fn ike_delete_destroys_both_sides() {
        let kernel = Arc::new(StaticKernel::new(&["192.0.2.1"]));
        let mut responder =
            testing::established_sa(false, kernel, "192.0.2.1:4500", "198.51.100.1:4500");
        let mut request = informational(false);
        request.add_payload(Payload::Delete(Delete::ike()));
        let mut task = IkeDelete::responder();
        task.process(responder.context_mut(), &request);
        let mut response = informational(true);
        assert_eq!(
            task.build(responder.context_mut(), &mut response),
            TaskStatus::Destroy
        );
        assert!(response.payloads().is_empty());
    }
}
