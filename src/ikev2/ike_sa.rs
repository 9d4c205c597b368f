use log::{debug, info, warn};
use std::{
    error, fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use super::{
    child_sa::ChildSa,
    config::{PeerConfig, Settings},
    kernel::Kernel,
    message::{self, Message, Proposal},
    task_manager::{PendingAction, TaskManager},
    tasks::{
        ChildCreate, IkeAuth, IkeDelete, IkeDpd, IkeInit, IkeMobike, IkeNatd, Task, TaskKind,
    },
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct IkeSaId {
    initiator_spi: u64,
    responder_spi: u64,
    is_initiator: bool,
}

impl IkeSaId {
    pub fn new(initiator_spi: u64, responder_spi: u64, is_initiator: bool) -> IkeSaId {
        IkeSaId {
            initiator_spi,
            responder_spi,
            is_initiator,
        }
    }

    pub fn initiator_spi(&self) -> u64 {
        self.initiator_spi
    }

    pub fn responder_spi(&self) -> u64 {
        self.responder_spi
    }

    /// Local role for the lifetime of the Association.
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    pub fn local_spi(&self) -> u64 {
        if self.is_initiator {
            self.initiator_spi
        } else {
            self.responder_spi
        }
    }

    pub fn remote_spi(&self) -> u64 {
        if self.is_initiator {
            self.responder_spi
        } else {
            self.initiator_spi
        }
    }
}

impl fmt::Display for IkeSaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}_i {:016x}_r", self.initiator_spi, self.responder_spi)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IkeSaState {
    Created,
    Connecting,
    Established,
    Deleting,
    Destroying,
}

impl fmt::Display for IkeSaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Established => write!(f, "ESTABLISHED"),
            Self::Deleting => write!(f, "DELETING"),
            Self::Destroying => write!(f, "DESTROYING"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Extensions(u8);

impl Extensions {
    pub const MOBIKE: Extensions = Extensions(1 << 0);
    pub const NATT: Extensions = Extensions(1 << 1);

    pub fn has(&self, extension: Extensions) -> bool {
        self.0 & extension.0 == extension.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Conditions(u8);

impl Conditions {
    pub const NAT_HERE: Conditions = Conditions(1 << 0);
    pub const NAT_THERE: Conditions = Conditions(1 << 1);
    pub const NAT_ANY: Conditions = Conditions(Self::NAT_HERE.0 | Self::NAT_THERE.0);

    pub fn has(&self, condition: Conditions) -> bool {
        self.0 & condition.0 != 0
    }
}

/// Association state visible to tasks while the Association is checked out.
pub struct IkeSaContext {
    id: IkeSaId,
    state: IkeSaState,
    settings: Arc<Settings>,
    kernel: Arc<dyn Kernel>,
    config: Option<Arc<PeerConfig>>,
    my_host: SocketAddr,
    other_host: SocketAddr,
    other_id: Option<String>,
    extensions: Extensions,
    conditions: Conditions,
    peer_addresses: Vec<IpAddr>,
    pending_updates: u32,
    child_sas: Vec<ChildSa>,
    ike_proposal: Option<Proposal>,
    created: Instant,
    last_activity: Instant,
}

impl IkeSaContext {
    pub fn id(&self) -> IkeSaId {
        self.id
    }

    pub fn state(&self) -> IkeSaState {
        self.state
    }

    pub fn set_state(&mut self, state: IkeSaState) {
        if self.state != state {
            debug!("IKE SA {} state {} => {}", self.id, self.state, state);
            self.state = state;
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    pub fn config(&self) -> Option<&PeerConfig> {
        self.config.as_deref()
    }

    pub fn my_host(&self) -> SocketAddr {
        self.my_host
    }

    pub fn other_host(&self) -> SocketAddr {
        self.other_host
    }

    pub fn set_my_host(&mut self, host: SocketAddr) {
        if self.my_host != host {
            debug!("IKE SA {} local address {} => {}", self.id, self.my_host, host);
            self.my_host = host;
        }
    }

    pub fn set_other_host(&mut self, host: SocketAddr) {
        if self.other_host != host {
            debug!(
                "IKE SA {} remote address {} => {}",
                self.id, self.other_host, host
            );
            self.other_host = host;
        }
    }

    pub fn other_id(&self) -> Option<&str> {
        self.other_id.as_deref()
    }

    pub fn set_other_id(&mut self, other_id: String) {
        self.other_id = Some(other_id);
    }

    pub fn supports_extension(&self, extension: Extensions) -> bool {
        self.extensions.has(extension)
    }

    pub fn enable_extension(&mut self, extension: Extensions) {
        self.extensions.0 |= extension.0;
    }

    pub fn has_condition(&self, condition: Conditions) -> bool {
        self.conditions.has(condition)
    }

    pub fn set_condition(&mut self, condition: Conditions, enabled: bool) {
        if enabled {
            self.conditions.0 |= condition.0;
        } else {
            self.conditions.0 &= !condition.0;
        }
    }

    /// Peer's additional addresses announced through MOBIKE.
    pub fn peer_addresses(&self) -> &[IpAddr] {
        &self.peer_addresses
    }

    pub fn replace_peer_addresses(&mut self, addresses: Vec<IpAddr>) {
        self.peer_addresses = addresses;
    }

    pub fn pending_updates(&self) -> u32 {
        self.pending_updates
    }

    pub fn set_pending_updates(&mut self, pending_updates: u32) {
        self.pending_updates = pending_updates;
    }

    pub fn child_sas(&self) -> &[ChildSa] {
        &self.child_sas
    }

    pub fn add_child_sa(&mut self, child_sa: ChildSa) {
        info!("IKE SA {} established CHILD_SA {}", self.id, child_sa);
        self.child_sas.push(child_sa);
    }

    pub fn remove_child_sa(&mut self, inbound_spi: u32) -> Option<ChildSa> {
        let index = self
            .child_sas
            .iter()
            .position(|child| child.inbound_spi() == inbound_spi)?;
        let child_sa = self.child_sas.remove(index);
        info!("IKE SA {} deleted CHILD_SA {}", self.id, child_sa);
        Some(child_sa)
    }

    /// Keeps every Child Context on the Association's current path.
    pub fn update_children(&mut self) {
        let encapsulation = self.conditions.has(Conditions::NAT_ANY);
        for child_sa in self.child_sas.iter_mut() {
            child_sa.update_hosts(self.my_host, self.other_host, encapsulation);
        }
    }

    pub fn set_responder_spi(&mut self, spi: u64) {
        self.id.responder_spi = spi;
    }

    pub fn ike_proposal(&self) -> Option<&Proposal> {
        self.ike_proposal.as_ref()
    }

    pub fn set_ike_proposal(&mut self, proposal: Proposal) {
        self.ike_proposal = Some(proposal);
    }

    /// Switches both ends from the IKE port to the NAT-T port.
    pub fn float_ports(&mut self) {
        let (ike_port, nat_port) = (self.settings.ike_port, self.settings.nat_port);
        if self.my_host.port() == ike_port {
            self.set_my_host(SocketAddr::new(self.my_host.ip(), nat_port));
        }
        if self.other_host.port() == ike_port {
            self.set_other_host(SocketAddr::new(self.other_host.ip(), nat_port));
        }
    }

    // A peer behind a NAT may have its mapping changed at any time; without MOBIKE
    // the only signal is the source of its requests.
    pub(super) fn adopt_request_path(&mut self, request: &Message) {
        let nat_update = self.has_condition(Conditions::NAT_THERE)
            && !self.supports_extension(Extensions::MOBIKE);
        if self.state == IkeSaState::Connecting || nat_update {
            self.set_my_host(request.destination());
            self.set_other_host(request.source());
        }
    }

    pub(super) fn is_original_initiator(&self) -> bool {
        self.id.is_initiator
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SaStatus {
    Continue,
    Destroy,
}

/// One IKEv2 Association with its Task Manager.
pub struct IkeSa {
    ctx: IkeSaContext,
    task_manager: TaskManager,
    half_open_key: Option<(SocketAddr, u64)>,
    destroyed: bool,
}

impl IkeSa {
    pub fn new(
        id: IkeSaId,
        settings: Arc<Settings>,
        kernel: Arc<dyn Kernel>,
        my_host: SocketAddr,
        other_host: SocketAddr,
        config: Option<Arc<PeerConfig>>,
    ) -> IkeSa {
        let now = Instant::now();
        IkeSa {
            ctx: IkeSaContext {
                id,
                state: IkeSaState::Created,
                settings,
                kernel,
                config,
                my_host,
                other_host,
                other_id: None,
                extensions: Extensions::default(),
                conditions: Conditions::default(),
                peer_addresses: vec![],
                pending_updates: 0,
                child_sas: vec![],
                ike_proposal: None,
                created: now,
                last_activity: now,
            },
            task_manager: TaskManager::new(),
            half_open_key: None,
            destroyed: false,
        }
    }

    pub fn id(&self) -> IkeSaId {
        self.ctx.id
    }

    pub fn local_spi(&self) -> u64 {
        self.ctx.id.local_spi()
    }

    pub fn state(&self) -> IkeSaState {
        self.ctx.state
    }

    pub fn context(&self) -> &IkeSaContext {
        &self.ctx
    }

    pub fn config(&self) -> Option<Arc<PeerConfig>> {
        self.ctx.config.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(super) fn half_open_key(&self) -> Option<(SocketAddr, u64)> {
        self.half_open_key
    }

    pub(super) fn set_half_open_key(&mut self, key: Option<(SocketAddr, u64)>) {
        self.half_open_key = key;
    }

    pub fn is_half_open_expired(&self, now: Instant) -> bool {
        matches!(self.ctx.state, IkeSaState::Created | IkeSaState::Connecting)
            && self.ctx.created + self.ctx.settings.half_open_timeout < now
    }

    pub fn needs_liveness_check(&self, now: Instant) -> bool {
        self.ctx.state == IkeSaState::Established
            && self.task_manager.is_idle()
            && self.ctx.last_activity + self.ctx.settings.dpd_interval < now
    }

    pub fn needs_reauthentication(&self, now: Instant) -> bool {
        let reauth_time = match self.ctx.config.as_ref().and_then(|config| config.reauth_time) {
            Some(reauth_time) => reauth_time,
            None => return false,
        };
        self.ctx.state == IkeSaState::Established
            && self.ctx.id.is_initiator()
            && self.task_manager.is_idle()
            && self.ctx.created + reauth_time < now
    }

    /// Inbound SPI of a Child Context that outlived the policy's lifetime.
    pub fn expired_child(&self, now: Instant) -> Option<u32> {
        let lifetime = self.ctx.config.as_ref().and_then(|config| config.child_lifetime)?;
        if self.ctx.state != IkeSaState::Established || !self.task_manager.is_idle() {
            return None;
        }
        self.ctx
            .child_sas
            .iter()
            .find(|child| child.installed() + lifetime < now)
            .map(|child| child.inbound_spi())
    }

    /// Feeds an inbound message to the Task Manager.
    ///
    /// `config` is the policy the backend resolved for the identity claimed in an IKE_AUTH request.
    pub fn process_message(
        &mut self,
        message: &Message,
        config: Option<Arc<PeerConfig>>,
    ) -> Result<SaStatus, SaError> {
        if message.is_from_initiator() == self.ctx.id.is_initiator() {
            debug!(
                "IKE SA {} ignoring message with our own initiator flag from {}",
                self.ctx.id,
                message.source()
            );
            return Ok(SaStatus::Continue);
        }
        if message.is_request() && message.exchange_type() == message::ExchangeType::IKE_AUTH {
            if let Some(config) = config {
                self.ctx.config = Some(config);
            }
        }
        self.ctx.last_activity = Instant::now();
        self.task_manager.process(&mut self.ctx, message)
    }

    /// Starts (or continues) negotiation as the initiator.
    pub fn initiate(&mut self) -> Result<SaStatus, SaError> {
        // Adopted tasks may already be queued when reauthenticating.
        if self.ctx.state == IkeSaState::Created && !self.task_manager.has_task(TaskKind::IkeInit) {
            let mobike = self.ctx.config().map(|config| config.mobike).unwrap_or(false);
            self.task_manager.queue_task(Box::new(IkeInit::new(true)));
            self.task_manager.queue_task(Box::new(IkeNatd::new(true)));
            self.task_manager.queue_task(Box::new(IkeAuth::new(true)));
            if !self.task_manager.has_setup_task(TaskKind::ChildCreate) {
                self.task_manager.queue_task(Box::new(ChildCreate::new(true)));
            }
            if mobike {
                self.task_manager.queue_task(Box::new(IkeMobike::new(true)));
            }
        }
        self.task_manager.initiate(&mut self.ctx)
    }

    pub fn queue_task(&mut self, task: Box<dyn Task>) -> Result<SaStatus, SaError> {
        self.task_manager.queue_task(task);
        self.task_manager.initiate(&mut self.ctx)
    }

    /// Reacts to a local network change.
    ///
    /// `address` requests that the additional-address list is sent along with the update.
    pub fn roam(&mut self, address: bool) -> Result<SaStatus, SaError> {
        if self.ctx.state != IkeSaState::Established {
            debug!(
                "IKE SA {} in state {}, skipping roam",
                self.ctx.id, self.ctx.state
            );
            return Ok(SaStatus::Continue);
        }
        if !self.ctx.supports_extension(Extensions::MOBIKE) {
            debug!("IKE SA {} peer does not support MOBIKE", self.ctx.id);
            return Ok(SaStatus::Continue);
        }
        // Only the original initiator may move the Association.
        let is_initiator = self.ctx.id.is_initiator();
        let path_changed = if is_initiator {
            match self.select_path() {
                Some(changed) => changed,
                None => return Ok(SaStatus::Continue),
            }
        } else {
            false
        };
        if !path_changed && !address {
            debug!("IKE SA {} keeping connection path", self.ctx.id);
            return Ok(SaStatus::Continue);
        }
        if let Some(task) = self.task_manager.queued_mobike() {
            debug!("IKE SA {} merging roam into queued MOBIKE update", self.ctx.id);
            task.roam(is_initiator, address);
        } else {
            let mut task = IkeMobike::new(true);
            task.roam(is_initiator, address);
            self.ctx.pending_updates += 1;
            self.task_manager.queue_task(Box::new(task));
        }
        self.task_manager.initiate(&mut self.ctx)
    }

    // Picks a source address for the current peer address, falling back to the
    // peer's additional addresses. Returns whether the path changed.
    fn select_path(&mut self) -> Option<bool> {
        let kernel = self.ctx.kernel.clone();
        let current = self.ctx.other_host;
        let candidates = std::iter::once(current.ip()).chain(self.ctx.peer_addresses.clone());
        for peer_ip in candidates {
            let other = SocketAddr::new(peer_ip, current.port());
            if let Some(source) = kernel.source_address(other) {
                let me = SocketAddr::new(source, self.ctx.my_host.port());
                let changed = me != self.ctx.my_host || other != self.ctx.other_host;
                self.ctx.set_my_host(me);
                self.ctx.set_other_host(other);
                return Some(changed);
            }
        }
        warn!("IKE SA {} has no usable path to its peer", self.ctx.id);
        None
    }

    pub fn retransmit(&mut self, message_id: u32) -> Result<SaStatus, SaError> {
        self.task_manager.retransmit(&mut self.ctx, message_id)
    }

    /// Deletes the Association; unestablished Associations are destroyed without an exchange.
    pub fn delete(&mut self) -> Result<SaStatus, SaError> {
        match self.ctx.state {
            IkeSaState::Established => self.queue_task(Box::new(IkeDelete::ike())),
            IkeSaState::Deleting => Ok(SaStatus::Continue),
            _ => {
                info!(
                    "IKE SA {} deleted in state {} without exchange",
                    self.ctx.id, self.ctx.state
                );
                Ok(SaStatus::Destroy)
            }
        }
    }

    pub fn delete_child(&mut self, inbound_spi: u32) -> Result<SaStatus, SaError> {
        if !self
            .ctx
            .child_sas
            .iter()
            .any(|child| child.inbound_spi() == inbound_spi)
        {
            warn!(
                "IKE SA {} has no CHILD_SA {:08x} to delete",
                self.ctx.id, inbound_spi
            );
            return Ok(SaStatus::Continue);
        }
        self.queue_task(Box::new(IkeDelete::child(vec![inbound_spi])))
    }

    pub fn check_liveness(&mut self) -> Result<SaStatus, SaError> {
        self.queue_task(Box::new(IkeDpd::new(true)))
    }

    /// Takes over another Association's path, negotiated extensions and pending tasks
    /// for reauthentication.
    ///
    /// Child Contexts stay with `other` and are torn down along with it; each one is
    /// negotiated again here, the first in IKE_AUTH and the rest in CREATE_CHILD_SA.
    pub fn inherit(&mut self, other: &mut IkeSa) {
        info!(
            "IKE SA {} inheriting state of IKE SA {}",
            self.ctx.id, other.ctx.id
        );
        self.ctx.my_host = other.ctx.my_host;
        self.ctx.other_host = other.ctx.other_host;
        self.ctx.extensions = other.ctx.extensions;
        self.ctx.conditions = other.ctx.conditions;
        self.ctx.peer_addresses = other.ctx.peer_addresses.clone();
        self.ctx.pending_updates = other.ctx.pending_updates;
        other.ctx.pending_updates = 0;
        for (i, child_sa) in other.ctx.child_sas.iter().enumerate() {
            debug!(
                "IKE SA {} recreating CHILD_SA {} of IKE SA {}",
                self.ctx.id, child_sa, other.ctx.id
            );
            self.task_manager
                .queue_task(Box::new(ChildCreate::recreate(child_sa, i == 0)));
        }
        self.task_manager
            .adopt_tasks(&mut other.task_manager, &self.ctx);
    }

    pub fn take_pending_actions(&mut self) -> Vec<PendingAction> {
        self.task_manager.take_pending_actions()
    }

    /// Tears down all Child Contexts; the Association becomes unusable.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for child_sa in self.ctx.child_sas.drain(..) {
            debug!("IKE SA {} tearing down CHILD_SA {}", self.ctx.id, child_sa);
        }
        self.ctx.set_state(IkeSaState::Destroying);
        self.destroyed = true;
        info!(
            "IKE SA {} between {} and {} destroyed",
            self.ctx.id, self.ctx.my_host, self.ctx.other_host
        );
    }

    #[cfg(test)]
    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    #[cfg(test)]
    pub fn context_mut(&mut self) -> &mut IkeSaContext {
        &mut self.ctx
    }
}

#[derive(Debug)]
pub enum SaError {
    Internal(&'static str),
    Format(message::FormatError),
}

impl fmt::Display for SaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Format(e) => write!(f, "Format error: {e}"),
        }
    }
}

impl error::Error for SaError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_msg) => None,
            Self::Format(err) => Some(err),
        }
    }
}

impl From<&'static str> for SaError {
    fn from(msg: &'static str) -> SaError {
        Self::Internal(msg)
    }
}

impl From<message::FormatError> for SaError {
    fn from(err: message::FormatError) -> SaError {
        Self::Format(err)
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Arc;

    use super::*;
    use crate::ikev2::kernel::testing::StaticKernel;

    pub fn peer_config() -> Arc<PeerConfig> {
        let mut config = PeerConfig::new("test", "responder.example.com");
        config.remote_id = None;
        Arc::new(config)
    }

    pub fn established_sa(
        is_initiator: bool,
        kernel: Arc<StaticKernel>,
        my_host: &str,
        other_host: &str,
    ) -> IkeSa {
        let id = IkeSaId::new(0x1111, 0x2222, is_initiator);
        let mut sa = IkeSa::new(
            id,
            Arc::new(Settings::default()),
            kernel,
            my_host.parse().unwrap(),
            other_host.parse().unwrap(),
            Some(peer_config()),
        );
        sa.ctx.state = IkeSaState::Established;
        sa.ctx.enable_extension(Extensions::MOBIKE);
        sa
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::{kernel::testing::StaticKernel, message::TrafficSelector};
    use std::time::Duration;

    fn kernel() -> Arc<StaticKernel> {
        Arc::new(StaticKernel::new(&["192.0.2.1", "203.0.113.5"]))
    }

    fn established() -> IkeSa {
        testing::established_sa(true, kernel(), "192.0.2.1:4500", "198.51.100.1:4500")
    }

    fn child(inbound_spi: u32, sa: &IkeSa) -> ChildSa {
        ChildSa::new(
            inbound_spi,
            inbound_spi + 1,
            sa.context().my_host(),
            sa.context().other_host(),
            false,
            vec![],
            vec![TrafficSelector::from_ip_range(
                "10.0.0.0".parse().unwrap()..="10.0.0.255".parse().unwrap(),
            )
            .unwrap()],
        )
    }

    #[test]
    fn roam_needs_established_mobike_sa() {
        let mut sa = IkeSa::new(
            IkeSaId::new(0x1111, 0, true),
            Arc::new(Settings::default()),
            kernel(),
            "192.0.2.1:500".parse().unwrap(),
            "198.51.100.1:500".parse().unwrap(),
            Some(testing::peer_config()),
        );
        assert_eq!(sa.roam(true).unwrap(), SaStatus::Continue);
        assert!(sa.take_pending_actions().is_empty());

        let mut sa = established();
        sa.ctx.extensions = Extensions::default();
        assert_eq!(sa.roam(true).unwrap(), SaStatus::Continue);
        assert!(sa.take_pending_actions().is_empty());
        assert_eq!(sa.context().pending_updates(), 0);
    }

    #[test]
    fn half_open_and_idle_sas_are_detected() {
        let settings = Arc::new(Settings {
            half_open_timeout: Duration::ZERO,
            ..Settings::default()
        });
        let sa = IkeSa::new(
            IkeSaId::new(0x1111, 0, false),
            settings,
            kernel(),
            "192.0.2.1:500".parse().unwrap(),
            "198.51.100.1:500".parse().unwrap(),
            None,
        );
        let later = Instant::now() + Duration::from_millis(1);
        assert!(sa.is_half_open_expired(later));
        assert!(!sa.needs_liveness_check(later));

        let mut sa = established();
        let idle = Instant::now() + sa.context().settings().dpd_interval + Duration::from_secs(1);
        assert!(!sa.is_half_open_expired(idle));
        assert!(sa.needs_liveness_check(idle));
        sa.check_liveness().unwrap();
        assert!(!sa.needs_liveness_check(idle));
    }

    #[test]
    fn lifetimes_follow_peer_config() {
        let mut config = PeerConfig::new("test", "responder.example.com");
        config.reauth_time = Some(Duration::from_secs(3600));
        config.child_lifetime = Some(Duration::from_secs(600));
        let config = Arc::new(config);

        let mut sa = established();
        let child_sa = child(0xc1c1_0001, &sa);
        sa.ctx.add_child_sa(child_sa);
        let later = Instant::now() + Duration::from_secs(7200);
        assert!(!sa.needs_reauthentication(later));
        assert_eq!(sa.expired_child(later), None);

        sa.ctx.config = Some(config.clone());
        assert!(!sa.needs_reauthentication(Instant::now()));
        assert_eq!(sa.expired_child(Instant::now()), None);
        assert!(sa.needs_reauthentication(later));
        assert_eq!(sa.expired_child(later), Some(0xc1c1_0001));

        sa.check_liveness().unwrap();
        assert!(!sa.needs_reauthentication(later));
        assert_eq!(sa.expired_child(later), None);

        let mut responder =
            testing::established_sa(false, kernel(), "192.0.2.1:4500", "198.51.100.1:4500");
        responder.ctx.config = Some(config);
        assert!(!responder.needs_reauthentication(later));
    }

    #[test]
    fn inherit_recreates_children_and_unknown_child_is_kept() {
        let mut old = established();
        let first = child(0x100, &old);
        old.context_mut().add_child_sa(first);
        let second = child(0x200, &old);
        old.context_mut().add_child_sa(second);
        assert_eq!(old.delete_child(0x999).unwrap(), SaStatus::Continue);
        assert!(old.take_pending_actions().is_empty());

        let mut new = IkeSa::new(
            IkeSaId::new(0x3333, 0, true),
            Arc::new(Settings::default()),
            kernel(),
            "192.0.2.1:500".parse().unwrap(),
            "198.51.100.1:500".parse().unwrap(),
            Some(testing::peer_config()),
        );
        new.inherit(&mut old);
        // Old Child Contexts go away with the old Association.
        assert_eq!(old.context().child_sas().len(), 2);
        assert!(new.context().child_sas().is_empty());
        assert_eq!(new.context().my_host(), "192.0.2.1:4500".parse().unwrap());
        assert!(new.context().supports_extension(Extensions::MOBIKE));

        new.initiate().unwrap();
        assert_eq!(
            new.task_manager().active_tasks().collect::<Vec<_>>(),
            vec![
                TaskKind::ChildCreate,
                TaskKind::IkeInit,
                TaskKind::IkeNatd,
                TaskKind::IkeAuth,
                TaskKind::IkeMobike,
            ]
        );
        assert_eq!(
            new.task_manager().queued_tasks().collect::<Vec<_>>(),
            vec![TaskKind::ChildCreate]
        );

        old.destroy();
        assert!(old.is_destroyed());
        assert!(old.context().child_sas().is_empty());
        assert_eq!(old.state(), IkeSaState::Destroying);
    }
}
