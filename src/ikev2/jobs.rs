use log::{debug, info, trace, warn};
use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
    time,
};

use super::{
    config::{Backend, PeerConfig},
    ike_sa::{SaError, SaStatus},
    kernel::Kernel,
    manager::{CheckedOut, IkeSaManager},
    message::{ExchangeType, Message, Payload, PayloadType},
    task_manager::{Packet, PendingAction},
};

/// Unit of work executed by the worker pool.
pub enum Job {
    ProcessMessage(Message),
    Initiate(Arc<PeerConfig>),
    Retransmit(u64, u32),
    Roam(bool),
    Delete(u64),
    DeleteChild(u64, u32),
    Reauthenticate(u64),
    Cleanup,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessMessage(message) => write!(
                f,
                "process {} {} from {}",
                message.exchange_type(),
                if message.is_response() { "response" } else { "request" },
                message.source()
            ),
            Self::Initiate(config) => write!(f, "initiate {}", config.name),
            Self::Retransmit(spi, message_id) => {
                write!(f, "retransmit {} of {:016x}", message_id, spi)
            }
            Self::Roam(address) => write!(f, "roam (address {})", address),
            Self::Delete(spi) => write!(f, "delete {:016x}", spi),
            Self::DeleteChild(spi, child_spi) => {
                write!(f, "delete CHILD_SA {:08x} of {:016x}", child_spi, spi)
            }
            Self::Reauthenticate(spi) => write!(f, "reauthenticate {:016x}", spi),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Queues jobs for the worker pool, immediately or after a delay.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Job>,
}

impl Scheduler {
    pub fn new() -> (Scheduler, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Scheduler { tx }, rx)
    }

    pub fn queue_job(&self, job: Job) {
        trace!("Queueing job {}", job);
        if self.tx.send(job).is_err() {
            debug!("Job queue closed");
        }
    }

    /// Queues `job` once `delay` has passed; must be called from within the runtime.
    pub fn schedule_job(&self, job: Job, delay: Duration) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(job);
        });
    }
}

/// Everything a job needs, passed to each worker.
pub struct Workers {
    manager: Arc<IkeSaManager>,
    backend: Arc<dyn Backend>,
    kernel: Arc<dyn Kernel>,
    scheduler: Scheduler,
    outbound: mpsc::Sender<Packet>,
}

impl Workers {
    pub fn new(
        manager: Arc<IkeSaManager>,
        backend: Arc<dyn Backend>,
        kernel: Arc<dyn Kernel>,
        scheduler: Scheduler,
        outbound: mpsc::Sender<Packet>,
    ) -> Workers {
        Workers {
            manager,
            backend,
            kernel,
            scheduler,
            outbound,
        }
    }

    /// Spawns `count` workers draining one shared queue.
    pub fn start(
        self: Arc<Self>,
        rx: mpsc::UnboundedReceiver<Job>,
        count: usize,
    ) -> JoinSet<()> {
        let rx = Arc::new(Mutex::new(rx));
        let mut join_set = JoinSet::new();
        for worker in 0..count.max(1) {
            let workers = self.clone();
            let rx = rx.clone();
            join_set.spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    match job {
                        Some(job) => {
                            trace!("Worker {} executing job {}", worker, job);
                            workers.execute(job).await
                        }
                        None => {
                            debug!("Worker {} stopping, job queue closed", worker);
                            return;
                        }
                    }
                }
            });
        }
        join_set
    }

    pub async fn execute(&self, job: Job) {
        match job {
            Job::ProcessMessage(message) => self.process_message(message).await,
            Job::Initiate(config) => self.initiate(config).await,
            Job::Retransmit(spi, message_id) => {
                if let Some(mut sa) = self.manager.checkout(spi).await {
                    let result = sa.retransmit(message_id);
                    self.finish(sa, result).await;
                }
            }
            Job::Roam(address) => {
                for spi in self.manager.local_spis() {
                    if let Some(mut sa) = self.manager.checkout(spi).await {
                        let result = sa.roam(address);
                        self.finish(sa, result).await;
                    }
                }
            }
            Job::Delete(spi) => match self.manager.checkout(spi).await {
                Some(mut sa) => {
                    let result = sa.delete();
                    self.finish(sa, result).await;
                }
                None => debug!("No IKE SA {:016x} to delete", spi),
            },
            Job::DeleteChild(spi, child_spi) => {
                if let Some(mut sa) = self.manager.checkout(spi).await {
                    let result = sa.delete_child(child_spi);
                    self.finish(sa, result).await;
                }
            }
            Job::Reauthenticate(spi) => self.reauthenticate(spi).await,
            Job::Cleanup => {
                self.cleanup().await;
                self.scheduler
                    .schedule_job(Job::Cleanup, self.manager.settings().cleanup_interval);
            }
        }
    }

    // Backend lookups may be slow, so they happen before checkout.
    fn lookup_configs(
        &self,
        message: &Message,
    ) -> (Option<Arc<PeerConfig>>, Option<Arc<PeerConfig>>) {
        if !message.is_request() {
            return (None, None);
        }
        match message.exchange_type() {
            ExchangeType::IKE_SA_INIT if message.responder_spi() == 0 => (
                self.backend
                    .peer_config(message.destination().ip(), message.source().ip()),
                None,
            ),
            ExchangeType::IKE_AUTH => {
                let config = match message.payload(PayloadType::ID_INITIATOR) {
                    Some(Payload::IdInitiator(id)) => {
                        let id = id.to_text();
                        let config = self.backend.peer_config_by_id(&id);
                        if config.is_none() {
                            warn!("No peer config for identity {}", id);
                        }
                        config
                    }
                    _ => None,
                };
                (None, config)
            }
            _ => (None, None),
        }
    }

    async fn process_message(&self, message: Message) {
        let (init_config, auth_config) = self.lookup_configs(&message);
        let mut sa = match self.manager.checkout_by_message(&message, init_config).await {
            Some(sa) => sa,
            None => {
                debug!(
                    "Dropping {} message {} from {}",
                    message.exchange_type(),
                    message.message_id(),
                    message.source()
                );
                return;
            }
        };
        let result = sa.process_message(&message, auth_config);
        self.finish(sa, result).await;
    }

    async fn initiate(&self, config: Arc<PeerConfig>) {
        let other_host = match config.remote_addr {
            Some(addr) => addr,
            None => {
                warn!("Peer config {} has no remote address to initiate to", config.name);
                return;
            }
        };
        let my_host = match self.kernel.source_address(other_host) {
            Some(ip) => SocketAddr::new(ip, self.manager.settings().ike_port),
            None => {
                warn!("No route to {} for peer config {}", other_host, config.name);
                return;
            }
        };
        let name = config.name.clone();
        let mut sa = match self.manager.checkout_new(config, my_host, other_host) {
            Some(sa) => sa,
            None => return,
        };
        info!("Initiating IKE SA {} for {} to {}", sa.id(), name, other_host);
        let result = sa.initiate();
        self.finish(sa, result).await;
    }

    async fn reauthenticate(&self, spi: u64) {
        let mut old = match self.manager.checkout(spi).await {
            Some(sa) => sa,
            None => {
                debug!("No IKE SA {:016x} to reauthenticate", spi);
                return;
            }
        };
        let config = match old.config() {
            Some(config) => config,
            None => {
                warn!("IKE SA {} has no peer config to reauthenticate", old.id());
                self.manager.checkin(old);
                return;
            }
        };
        let (my_host, other_host) = (old.context().my_host(), old.context().other_host());
        let mut new = match self.manager.checkout_new(config, my_host, other_host) {
            Some(sa) => sa,
            None => {
                self.manager.checkin(old);
                return;
            }
        };
        info!("Reauthenticating IKE SA {} as IKE SA {}", old.id(), new.id());
        new.inherit(&mut old);
        let result = new.initiate();
        self.finish(new, result).await;
        let result = old.delete();
        self.finish(old, result).await;
    }

    async fn cleanup(&self) {
        let now = Instant::now();
        for spi in self.manager.local_spis() {
            let mut sa = match self.manager.checkout(spi).await {
                Some(sa) => sa,
                None => continue,
            };
            if sa.is_half_open_expired(now) {
                info!("IKE SA {} expired in state {}", sa.id(), sa.state());
                self.manager.checkin_and_destroy(sa);
            } else if sa.needs_reauthentication(now) {
                info!("IKE SA {} reached its reauthentication time", sa.id());
                self.manager.checkin(sa);
                self.scheduler.queue_job(Job::Reauthenticate(spi));
            } else if let Some(child_spi) = sa.expired_child(now) {
                info!("IKE SA {} CHILD_SA {:08x} expired", sa.id(), child_spi);
                self.manager.checkin(sa);
                self.scheduler.queue_job(Job::DeleteChild(spi, child_spi));
            } else if sa.needs_liveness_check(now) {
                let result = sa.check_liveness();
                self.finish(sa, result).await;
            } else {
                self.manager.checkin(sa);
            }
        }
    }

    /// Performs the Association's pending actions, then checks it in or destroys it.
    async fn finish(&self, mut sa: CheckedOut, result: Result<SaStatus, SaError>) {
        let status = match result {
            Ok(status) => status,
            Err(err) => {
                warn!("IKE SA {} failed: {}", sa.id(), err);
                SaStatus::Destroy
            }
        };
        let spi = sa.local_spi();
        for action in sa.take_pending_actions() {
            match action {
                PendingAction::Send(packet) => {
                    if self.outbound.send(packet).await.is_err() {
                        warn!("Outbound packet channel closed");
                    }
                }
                PendingAction::Retransmit { message_id, delay } => {
                    if status == SaStatus::Continue {
                        self.scheduler
                            .schedule_job(Job::Retransmit(spi, message_id), delay);
                    }
                }
            }
        }
        match status {
            SaStatus::Continue => self.manager.checkin(sa),
            SaStatus::Destroy => self.manager.checkin_and_destroy(sa),
        }
    }
}
