use super::{Task, TaskKind, TaskStatus};
use crate::ikev2::{
    ike_sa::IkeSaContext,
    message::{ExchangeType, Message},
};

/// Empty INFORMATIONAL exchange proving the peer is alive.
pub struct IkeDpd {
    initiator: bool,
}

impl IkeDpd {
    pub fn new(initiator: bool) -> IkeDpd {
        IkeDpd { initiator }
    }
}

impl Task for IkeDpd {
    fn kind(&self) -> TaskKind {
        TaskKind::IkeDpd
    }

    fn build(&mut self, _sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::INFORMATIONAL || self.initiator {
            TaskStatus::NeedMore
        } else {
            TaskStatus::Success
        }
    }

    fn process(&mut self, _sa: &mut IkeSaContext, message: &Message) -> TaskStatus {
        if message.exchange_type() != ExchangeType::INFORMATIONAL || !self.initiator {
            TaskStatus::NeedMore
        } else {
            TaskStatus::Success
        }
    }

    fn migrate(&mut self, _sa: &IkeSaContext) {}
}
