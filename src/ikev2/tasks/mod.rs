use std::fmt;

use super::{
    ike_sa::{IkeSaContext, IkeSaState},
    message::{ExchangeType, Message},
};

mod child_create;
mod ike_auth;
mod ike_delete;
mod ike_dpd;
mod ike_init;
mod ike_mobike;
mod ike_natd;

pub use child_create::ChildCreate;
pub use ike_auth::IkeAuth;
pub use ike_delete::IkeDelete;
pub use ike_dpd::IkeDpd;
pub use ike_init::IkeInit;
pub use ike_mobike::IkeMobike;
pub use ike_natd::IkeNatd;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskKind {
    IkeInit,
    IkeNatd,
    IkeAuth,
    ChildCreate,
    IkeMobike,
    IkeDelete,
    IkeDpd,
}

impl TaskKind {
    /// Tasks that take part in IKE_SA_INIT and IKE_AUTH.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::IkeInit | Self::IkeNatd | Self::IkeAuth | Self::ChildCreate | Self::IkeMobike
        )
    }

    pub fn exchange_type(&self, state: IkeSaState) -> ExchangeType {
        match (state, self) {
            (IkeSaState::Created, _) => ExchangeType::IKE_SA_INIT,
            (IkeSaState::Connecting, _) => ExchangeType::IKE_AUTH,
            (_, Self::ChildCreate) => ExchangeType::CREATE_CHILD_SA,
            _ => ExchangeType::INFORMATIONAL,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IkeInit => write!(f, "IKE_INIT"),
            Self::IkeNatd => write!(f, "IKE_NATD"),
            Self::IkeAuth => write!(f, "IKE_AUTH"),
            Self::ChildCreate => write!(f, "CHILD_CREATE"),
            Self::IkeMobike => write!(f, "IKE_MOBIKE"),
            Self::IkeDelete => write!(f, "IKE_DELETE"),
            Self::IkeDpd => write!(f, "IKE_DPD"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskStatus {
    /// The task takes part in the next exchange too.
    NeedMore,
    Success,
    /// Unrecoverable; the Association is destroyed.
    Failed,
    /// Completed, and the Association must be destroyed (e.g. after a delete).
    Destroy,
}

/// A unit of negotiation logic taking part in one or more exchanges.
///
/// The role (exchange initiator or responder) is fixed when the task is created;
/// `build` and `process` dispatch on it. Dropping a task destroys it.
pub trait Task: Send {
    fn kind(&self) -> TaskKind;

    /// Adds this task's payloads to an outbound request (initiator) or response (responder).
    fn build(&mut self, sa: &mut IkeSaContext, message: &mut Message) -> TaskStatus;

    /// Handles an inbound response (initiator) or request (responder).
    fn process(&mut self, sa: &mut IkeSaContext, message: &Message) -> TaskStatus;

    /// Re-binds the task, and any nested task, to another Association.
    fn migrate(&mut self, sa: &IkeSaContext);

    fn is_setup(&self) -> bool {
        self.kind().is_setup()
    }

    fn as_mobike(&mut self) -> Option<&mut IkeMobike> {
        None
    }
}
