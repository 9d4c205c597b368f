use log::{debug, trace, warn};
use rand::Rng;
use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use super::{
    config::Settings,
    ike_sa::{IkeSaContext, IkeSaState, SaError, SaStatus},
    message::{ExchangeType, Message, NotifyMessageType, PayloadType},
    tasks::{
        ChildCreate, IkeAuth, IkeDelete, IkeDpd, IkeInit, IkeMobike, IkeNatd, Task, TaskKind,
        TaskStatus,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub data: Vec<u8>,
}

/// Side effects collected while an Association is checked out, performed by the caller.
#[derive(Debug)]
pub enum PendingAction {
    Send(Packet),
    Retransmit { message_id: u32, delay: Duration },
}

struct Initiating {
    message_id: u32,
    exchange_type: ExchangeType,
    packet: Packet,
    retransmitted: usize,
}

struct Responding {
    expected_message_id: u32,
    last_response: Option<Packet>,
}

/// Per-Association task queues and request/response bookkeeping.
pub struct TaskManager {
    queued: VecDeque<Box<dyn Task>>,
    active: Vec<Box<dyn Task>>,
    passive: Vec<Box<dyn Task>>,
    initiating: Option<Initiating>,
    responding: Responding,
    next_message_id: u32,
    actions: Vec<PendingAction>,
}

impl TaskManager {
    pub fn new() -> TaskManager {
        TaskManager {
            queued: VecDeque::new(),
            active: vec![],
            passive: vec![],
            initiating: None,
            responding: Responding {
                expected_message_id: 0,
                last_response: None,
            },
            next_message_id: 0,
            actions: vec![],
        }
    }

    pub fn queue_task(&mut self, task: Box<dyn Task>) {
        trace!("Queueing task {}", task.kind());
        self.queued.push_back(task);
    }

    pub fn queued_mobike(&mut self) -> Option<&mut IkeMobike> {
        self.queued.iter_mut().find_map(|task| task.as_mobike())
    }

    /// No exchange in flight and nothing waiting to be initiated.
    pub fn is_idle(&self) -> bool {
        self.initiating.is_none() && self.active.is_empty() && self.queued.is_empty()
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.active.iter().map(|task| task.kind())
    }

    pub fn queued_tasks(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.queued.iter().map(|task| task.kind())
    }

    pub fn has_task(&self, kind: TaskKind) -> bool {
        self.active_tasks()
            .chain(self.queued_tasks())
            .any(|task| task == kind)
    }

    /// Whether a task of `kind` is waiting for the IKE_SA_INIT or IKE_AUTH exchange.
    pub fn has_setup_task(&self, kind: TaskKind) -> bool {
        self.active
            .iter()
            .chain(self.queued.iter())
            .any(|task| task.kind() == kind && task.is_setup())
    }

    pub fn take_pending_actions(&mut self) -> Vec<PendingAction> {
        std::mem::take(&mut self.actions)
    }

    /// Starts the next exchange unless one is already in flight.
    pub fn initiate(&mut self, sa: &mut IkeSaContext) -> Result<SaStatus, SaError> {
        if self.initiating.is_some() {
            debug!(
                "IKE SA {} delaying task initiation, exchange in progress",
                sa.id()
            );
            return Ok(SaStatus::Continue);
        }
        if self.active.is_empty() && !self.activate_queued(sa.state()) {
            trace!("IKE SA {} has nothing to initiate", sa.id());
            return Ok(SaStatus::Continue);
        }
        let exchange_type = match self.active.first() {
            Some(task) => task.kind().exchange_type(sa.state()),
            None => return Ok(SaStatus::Continue),
        };

        let message_id = self.next_message_id;
        let mut request = Message::new(
            sa.id().initiator_spi(),
            sa.id().responder_spi(),
            exchange_type,
            sa.is_original_initiator(),
            false,
            message_id,
            sa.my_host(),
            sa.other_host(),
        );
        let mut failed = false;
        let mut remaining = Vec::with_capacity(self.active.len());
        for mut task in self.active.drain(..) {
            match task.build(sa, &mut request) {
                TaskStatus::NeedMore => remaining.push(task),
                TaskStatus::Success => trace!("IKE SA {} task {} completed", sa.id(), task.kind()),
                TaskStatus::Failed | TaskStatus::Destroy => {
                    warn!(
                        "IKE SA {} task {} failed building {} request",
                        sa.id(),
                        task.kind(),
                        exchange_type
                    );
                    failed = true;
                    break;
                }
            }
        }
        self.active = remaining;
        if failed {
            return Ok(SaStatus::Destroy);
        }
        if self.active.is_empty() {
            return Ok(SaStatus::Continue);
        }

        let packet = Packet {
            source: request.source(),
            destination: request.destination(),
            data: request.encode()?,
        };
        debug!(
            "IKE SA {} sending {} request {} to {}",
            sa.id(),
            exchange_type,
            message_id,
            packet.destination
        );
        trace!("{:?}", request);
        self.actions.push(PendingAction::Send(packet.clone()));
        self.actions.push(PendingAction::Retransmit {
            message_id,
            delay: retransmit_delay(sa.settings(), 0),
        });
        self.initiating = Some(Initiating {
            message_id,
            exchange_type,
            packet,
            retransmitted: 0,
        });
        Ok(SaStatus::Continue)
    }

    // Setup tasks share the IKE_SA_INIT and IKE_AUTH exchanges, everything else runs alone.
    fn activate_queued(&mut self, state: IkeSaState) -> bool {
        match state {
            IkeSaState::Created | IkeSaState::Connecting => {
                let (setup, rest): (VecDeque<_>, VecDeque<_>) = self
                    .queued
                    .drain(..)
                    .partition(|task| task.is_setup());
                self.active = setup.into();
                self.queued = rest;
            }
            IkeSaState::Established => {
                if let Some(task) = self.queued.pop_front() {
                    self.active.push(task);
                }
            }
            IkeSaState::Deleting | IkeSaState::Destroying => {}
        }
        !self.active.is_empty()
    }

    pub fn process(
        &mut self,
        sa: &mut IkeSaContext,
        message: &Message,
    ) -> Result<SaStatus, SaError> {
        trace!("{:?}", message);
        if message.is_request() {
            self.process_request(sa, message)
        } else {
            self.process_response(sa, message)
        }
    }

    fn process_response(
        &mut self,
        sa: &mut IkeSaContext,
        response: &Message,
    ) -> Result<SaStatus, SaError> {
        let initiating = match self.initiating.as_ref() {
            Some(initiating) if initiating.message_id == response.message_id() => initiating,
            _ => {
                debug!(
                    "IKE SA {} ignoring response with unexpected message ID {}",
                    sa.id(),
                    response.message_id()
                );
                return Ok(SaStatus::Continue);
            }
        };
        if response.exchange_type() != initiating.exchange_type {
            warn!(
                "IKE SA {} received {} response, but expected {}",
                sa.id(),
                response.exchange_type(),
                initiating.exchange_type
            );
            return Ok(SaStatus::Destroy);
        }
        debug!(
            "IKE SA {} received {} response {} from {}",
            sa.id(),
            response.exchange_type(),
            response.message_id(),
            response.source()
        );
        self.initiating = None;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let mut remaining = Vec::with_capacity(self.active.len());
        for mut task in self.active.drain(..) {
            match task.process(sa, response) {
                TaskStatus::NeedMore => remaining.push(task),
                TaskStatus::Success => trace!("IKE SA {} task {} completed", sa.id(), task.kind()),
                TaskStatus::Failed => {
                    warn!(
                        "IKE SA {} task {} failed processing {} response",
                        sa.id(),
                        task.kind(),
                        response.exchange_type()
                    );
                    return Ok(SaStatus::Destroy);
                }
                TaskStatus::Destroy => return Ok(SaStatus::Destroy),
            }
        }
        self.active = remaining;
        self.initiate(sa)
    }

    fn process_request(
        &mut self,
        sa: &mut IkeSaContext,
        request: &Message,
    ) -> Result<SaStatus, SaError> {
        let message_id = request.message_id();
        let expected = self.responding.expected_message_id;
        if message_id != expected {
            match self.responding.last_response.as_ref() {
                Some(response) if message_id.wrapping_add(1) == expected => {
                    debug!(
                        "IKE SA {} received retransmit of request {}, retransmitting response",
                        sa.id(),
                        message_id
                    );
                    self.actions.push(PendingAction::Send(response.clone()));
                }
                _ => debug!(
                    "IKE SA {} ignoring request with ID {}, expected {}",
                    sa.id(),
                    message_id,
                    expected
                ),
            }
            return Ok(SaStatus::Continue);
        }

        if let Some(payload_type) = request.unsupported_critical_payload() {
            warn!(
                "IKE SA {} received unsupported critical payload {}",
                sa.id(),
                payload_type
            );
            let mut response = Self::response_for(sa, request);
            response.add_notify(
                NotifyMessageType::UNSUPPORTED_CRITICAL_PAYLOAD,
                &[payload_type.value()],
            );
            self.send_response(response)?;
            return Ok(if sa.state() == IkeSaState::Created {
                SaStatus::Destroy
            } else {
                SaStatus::Continue
            });
        }

        if !self.create_passive_tasks(sa, request) {
            warn!(
                "IKE SA {} received unexpected {} request in state {}",
                sa.id(),
                request.exchange_type(),
                sa.state()
            );
            return Ok(SaStatus::Continue);
        }
        debug!(
            "IKE SA {} received {} request {} from {}",
            sa.id(),
            request.exchange_type(),
            message_id,
            request.source()
        );
        sa.adopt_request_path(request);

        let mut remaining = Vec::with_capacity(self.passive.len());
        for mut task in self.passive.drain(..) {
            match task.process(sa, request) {
                TaskStatus::NeedMore => remaining.push(task),
                TaskStatus::Success => {}
                TaskStatus::Failed | TaskStatus::Destroy => {
                    warn!(
                        "IKE SA {} task {} rejected {} request",
                        sa.id(),
                        task.kind(),
                        request.exchange_type()
                    );
                    return Ok(SaStatus::Destroy);
                }
            }
        }

        let mut response = Self::response_for(sa, request);
        let mut status = SaStatus::Continue;
        self.passive = Vec::with_capacity(remaining.len());
        for mut task in remaining.into_iter() {
            match task.build(sa, &mut response) {
                TaskStatus::NeedMore => self.passive.push(task),
                TaskStatus::Success => {}
                TaskStatus::Failed => {
                    warn!(
                        "IKE SA {} task {} failed building {} response",
                        sa.id(),
                        task.kind(),
                        response.exchange_type()
                    );
                    status = SaStatus::Destroy;
                    break;
                }
                TaskStatus::Destroy => status = SaStatus::Destroy,
            }
        }
        // The peer is told why, even if the Association is going away.
        self.send_response(response)?;
        Ok(status)
    }

    fn create_passive_tasks(&mut self, sa: &IkeSaContext, request: &Message) -> bool {
        if !self.passive.is_empty() {
            return true;
        }
        let tasks: Vec<Box<dyn Task>> = match (sa.state(), request.exchange_type()) {
            (IkeSaState::Created, ExchangeType::IKE_SA_INIT) => {
                vec![Box::new(IkeInit::new(false)), Box::new(IkeNatd::new(false))]
            }
            (IkeSaState::Connecting, ExchangeType::IKE_AUTH) => {
                let mut tasks: Vec<Box<dyn Task>> = vec![Box::new(IkeAuth::new(false))];
                if request.has_payload(PayloadType::SECURITY_ASSOCIATION) {
                    tasks.push(Box::new(ChildCreate::new(false)));
                }
                tasks.push(Box::new(IkeMobike::new(false)));
                tasks
            }
            (IkeSaState::Established, ExchangeType::CREATE_CHILD_SA) => {
                vec![Box::new(ChildCreate::new(false))]
            }
            (IkeSaState::Established | IkeSaState::Deleting, ExchangeType::INFORMATIONAL) => {
                if request.has_payload(PayloadType::DELETE) {
                    vec![Box::new(IkeDelete::responder())]
                } else if IkeMobike::is_mobike_request(sa, request) {
                    vec![Box::new(IkeMobike::new(false))]
                } else {
                    vec![Box::new(IkeDpd::new(false))]
                }
            }
            _ => return false,
        };
        self.passive = tasks;
        true
    }

    fn response_for(sa: &IkeSaContext, request: &Message) -> Message {
        Message::new(
            sa.id().initiator_spi(),
            sa.id().responder_spi(),
            request.exchange_type(),
            sa.is_original_initiator(),
            true,
            request.message_id(),
            request.destination(),
            request.source(),
        )
    }

    fn send_response(&mut self, response: Message) -> Result<(), SaError> {
        trace!("{:?}", response);
        let packet = Packet {
            source: response.source(),
            destination: response.destination(),
            data: response.encode()?,
        };
        self.responding.expected_message_id = response.message_id().wrapping_add(1);
        self.responding.last_response = Some(packet.clone());
        self.actions.push(PendingAction::Send(packet));
        Ok(())
    }

    /// Resends the request in flight, or gives up once the retry limit is reached.
    pub fn retransmit(
        &mut self,
        sa: &mut IkeSaContext,
        message_id: u32,
    ) -> Result<SaStatus, SaError> {
        let initiating = match self.initiating.as_mut() {
            Some(initiating) if initiating.message_id == message_id => initiating,
            _ => return Ok(SaStatus::Continue),
        };
        if initiating.retransmitted >= sa.settings().retransmit_tries {
            warn!(
                "IKE SA {} giving up on {} request {} after {} retransmits",
                sa.id(),
                initiating.exchange_type,
                message_id,
                initiating.retransmitted
            );
            return Ok(SaStatus::Destroy);
        }
        initiating.retransmitted += 1;
        debug!(
            "IKE SA {} retransmit {} of {} request {}",
            sa.id(),
            initiating.retransmitted,
            initiating.exchange_type,
            message_id
        );
        self.actions
            .push(PendingAction::Send(initiating.packet.clone()));
        self.actions.push(PendingAction::Retransmit {
            message_id,
            delay: retransmit_delay(sa.settings(), initiating.retransmitted),
        });
        Ok(SaStatus::Continue)
    }

    /// Re-binds every active and queued task to another Association.
    pub fn migrate(&mut self, sa: &IkeSaContext) {
        for task in self.active.iter_mut().chain(self.queued.iter_mut()) {
            task.migrate(sa);
        }
    }

    /// Moves all active and queued tasks of `other` into this queue.
    pub fn adopt_tasks(&mut self, other: &mut TaskManager, sa: &IkeSaContext) {
        other.initiating = None;
        other.passive.clear();
        other.migrate(sa);
        for task in other.active.drain(..).chain(other.queued.drain(..)) {
            debug!("IKE SA {} adopting task {}", sa.id(), task.kind());
            self.queued.push_back(task);
        }
    }
}

impl Default for TaskManager {
    fn default() -> TaskManager {
        TaskManager::new()
    }
}

fn retransmit_delay(settings: &Settings, retransmitted: usize) -> Duration {
    let exponent = i32::try_from(retransmitted).unwrap_or(i32::MAX);
    let delay = settings.retransmit_timeout.as_millis() as f64
        * settings.retransmit_base.powi(exponent);
    let delay = delay as u64;
    let jitter = delay / 100 * 15;
    let delay = rand::thread_rng()
        .gen_range(delay.saturating_sub(jitter)..=delay.saturating_add(jitter));
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::{
        ike_sa::{testing, IkeSa, IkeSaId},
        kernel::testing::StaticKernel,
        message::Payload,
    };
    use std::sync::Arc;

    fn sent(actions: &[PendingAction]) -> Vec<Message> {
        actions
            .iter()
            .filter_map(|action| match action {
                PendingAction::Send(packet) => Some(
                    Message::decode(&packet.data, packet.source, packet.destination).unwrap(),
                ),
                _ => None,
            })
            .collect()
    }

    fn kernel() -> Arc<StaticKernel> {
        Arc::new(StaticKernel::new(&["192.0.2.1"]))
    }

    fn established(is_initiator: bool) -> IkeSa {
        testing::established_sa(is_initiator, kernel(), "192.0.2.1:4500", "198.51.100.1:4500")
    }

    fn request_to(sa: &IkeSa, exchange_type: ExchangeType, message_id: u32) -> Message {
        Message::new(
            sa.id().initiator_spi(),
            sa.id().responder_spi(),
            exchange_type,
            !sa.id().is_initiator(),
            false,
            message_id,
            sa.context().other_host(),
            sa.context().my_host(),
        )
    }

    #[test]
    fn retransmits_with_growing_delay() {
        let settings = Settings::default();
        let first = retransmit_delay(&settings, 0);
        let third = retransmit_delay(&settings, 2);
        assert!(first >= Duration::from_millis(3400) && first <= Duration::from_millis(4600));
        assert!(third > first);
    }

    #[test]
    fn initiator_sends_one_request_at_a_time() {
        let mut sa = IkeSa::new(
            IkeSaId::new(0xabcd, 0, true),
            Arc::new(Settings::default()),
            kernel(),
            "192.0.2.1:500".parse().unwrap(),
            "198.51.100.1:500".parse().unwrap(),
            Some(testing::peer_config()),
        );
        assert_eq!(sa.initiate().unwrap(), SaStatus::Continue);
        let actions = sa.take_pending_actions();
        let requests = sent(&actions);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].exchange_type(), ExchangeType::IKE_SA_INIT);
        assert!(requests[0].has_payload(PayloadType::SECURITY_ASSOCIATION));
        assert!(requests[0]
            .notify(NotifyMessageType::NAT_DETECTION_SOURCE_IP)
            .is_some());
        assert!(matches!(
            actions[1],
            PendingAction::Retransmit { message_id: 0, .. }
        ));

        // A second trigger while the exchange is in flight sends nothing.
        sa.check_liveness().unwrap();
        assert!(sa.take_pending_actions().is_empty());
    }

    #[test]
    fn setup_tasks_share_exchange_and_others_wait() {
        let mut sa = IkeSa::new(
            IkeSaId::new(0xabcd, 0, true),
            Arc::new(Settings::default()),
            kernel(),
            "192.0.2.1:500".parse().unwrap(),
            "198.51.100.1:500".parse().unwrap(),
            Some(testing::peer_config()),
        );
        // Nothing to send before the Association is set up.
        sa.check_liveness().unwrap();
        assert!(sa.take_pending_actions().is_empty());

        sa.initiate().unwrap();
        assert_eq!(
            sa.task_manager().active_tasks().collect::<Vec<_>>(),
            vec![
                TaskKind::IkeInit,
                TaskKind::IkeNatd,
                TaskKind::IkeAuth,
                TaskKind::ChildCreate,
                TaskKind::IkeMobike,
            ]
        );
        assert_eq!(
            sa.task_manager().queued_tasks().collect::<Vec<_>>(),
            vec![TaskKind::IkeDpd]
        );
        let requests = sent(&sa.take_pending_actions());
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].exchange_type(), ExchangeType::IKE_SA_INIT);
    }

    #[test]
    fn gives_up_after_retry_limit() {
        let mut sa = established(true);
        sa.check_liveness().unwrap();
        sa.take_pending_actions();
        let tries = Settings::default().retransmit_tries;
        for _ in 0..tries {
            assert_eq!(sa.retransmit(0).unwrap(), SaStatus::Continue);
            let actions = sa.take_pending_actions();
            assert_eq!(sent(&actions).len(), 1);
        }
        // Stale timers are harmless.
        assert_eq!(sa.retransmit(7).unwrap(), SaStatus::Continue);
        assert_eq!(sa.retransmit(0).unwrap(), SaStatus::Destroy);
    }

    #[test]
    fn duplicate_response_is_ignored() {
        let mut sa = established(true);
        sa.check_liveness().unwrap();
        sa.take_pending_actions();
        let response = Message::new(
            0x1111,
            0x2222,
            ExchangeType::INFORMATIONAL,
            false,
            true,
            0,
            "198.51.100.1:4500".parse().unwrap(),
            "192.0.2.1:4500".parse().unwrap(),
        );
        assert_eq!(
            sa.process_message(&response, None).unwrap(),
            SaStatus::Continue
        );
        assert!(sa.task_manager().is_idle());

        sa.check_liveness().unwrap();
        sa.take_pending_actions();
        // Response to the first exchange again: neither completes nor disturbs the second.
        sa.process_message(&response, None).unwrap();
        assert!(!sa.task_manager().is_idle());
        assert_eq!(
            sa.task_manager().active_tasks().collect::<Vec<_>>(),
            vec![TaskKind::IkeDpd]
        );
        assert!(sa.take_pending_actions().is_empty());
    }

    #[test]
    fn responder_resends_cached_response() {
        let mut sa = established(false);
        let request = request_to(&sa, ExchangeType::INFORMATIONAL, 0);
        sa.process_message(&request, None).unwrap();
        let first = sent(&sa.take_pending_actions());
        assert_eq!(first.len(), 1);
        assert!(first[0].is_response());

        sa.process_message(&request, None).unwrap();
        let again = sa.take_pending_actions();
        match again.as_slice() {
            [PendingAction::Send(packet)] => {
                assert_eq!(packet.data, first[0].encode().unwrap())
            }
            _ => panic!("expected cached response"),
        }

        // Too old or too new: dropped.
        let stale = request_to(&sa, ExchangeType::INFORMATIONAL, 5);
        sa.process_message(&stale, None).unwrap();
        assert!(sa.take_pending_actions().is_empty());
    }

    #[test]
    fn unknown_critical_payload_is_rejected() {
        let mut sa = established(false);
        let mut request = request_to(&sa, ExchangeType::INFORMATIONAL, 0);
        request.add_payload(Payload::Generic(PayloadType::from_u8(222), true, vec![]));
        let status = sa.process_message(&request, None).unwrap();
        assert_eq!(status, SaStatus::Continue);
        let responses = sent(&sa.take_pending_actions());
        let notify = responses[0]
            .notify(NotifyMessageType::UNSUPPORTED_CRITICAL_PAYLOAD)
            .unwrap();
        assert_eq!(notify.data(), &[222]);
    }

    #[test]
    fn adopted_tasks_are_queued_and_migrated() {
        let mut old = established(true);
        old.check_liveness().unwrap();
        old.roam(true).unwrap();
        let mut new = IkeSa::new(
            IkeSaId::new(0x3333, 0, true),
            Arc::new(Settings::default()),
            kernel(),
            "192.0.2.1:500".parse().unwrap(),
            "198.51.100.1:500".parse().unwrap(),
            Some(testing::peer_config()),
        );
        new.inherit(&mut old);
        assert!(old.task_manager().is_idle());
        assert_eq!(
            new.task_manager().queued_tasks().collect::<Vec<_>>(),
            vec![TaskKind::IkeDpd, TaskKind::IkeMobike]
        );
        assert_eq!(new.context().pending_updates(), 1);
    }
}
