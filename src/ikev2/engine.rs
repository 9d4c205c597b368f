use log::{debug, info, warn};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinSet};

use super::{
    config::{Backend, PeerConfig, Settings},
    jobs::{Job, Scheduler, Workers},
    kernel::Kernel,
    manager::IkeSaManager,
    message::Message,
    task_manager::Packet,
};

const OUTBOUND_QUEUE_SIZE: usize = 64;

/// The Task Engine as seen by the daemon: every operation becomes a job.
pub struct Engine {
    manager: Arc<IkeSaManager>,
    scheduler: Scheduler,
    workers: JoinSet<()>,
}

impl Engine {
    /// Starts the worker pool; outbound packets are delivered through the returned receiver.
    pub fn start(
        settings: Arc<Settings>,
        kernel: Arc<dyn Kernel>,
        backend: Arc<dyn Backend>,
        worker_count: usize,
    ) -> (Engine, mpsc::Receiver<Packet>) {
        let manager = Arc::new(IkeSaManager::new(settings.clone(), kernel.clone()));
        let (scheduler, jobs) = Scheduler::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let workers = Arc::new(Workers::new(
            manager.clone(),
            backend,
            kernel,
            scheduler.clone(),
            outbound_tx,
        ));
        let workers = workers.start(jobs, worker_count);
        scheduler.schedule_job(Job::Cleanup, settings.cleanup_interval);
        debug!("Started {} workers", worker_count.max(1));
        (
            Engine {
                manager,
                scheduler,
                workers,
            },
            outbound_rx,
        )
    }

    pub fn manager(&self) -> &Arc<IkeSaManager> {
        &self.manager
    }

    pub fn initiate(&self, config: Arc<PeerConfig>) {
        self.scheduler.queue_job(Job::Initiate(config));
    }

    /// Sole entry point for messages received from the network.
    pub fn submit(&self, message: Message) {
        self.scheduler.queue_job(Job::ProcessMessage(message));
    }

    /// Re-evaluates the path of every Association after a network change.
    pub fn roam(&self, address: bool) {
        self.scheduler.queue_job(Job::Roam(address));
    }

    pub fn delete(&self, local_spi: u64) {
        self.scheduler.queue_job(Job::Delete(local_spi));
    }

    /// Queues an IKE delete for every Association.
    pub fn delete_all(&self) {
        let spis = self.manager.local_spis();
        info!("Deleting {} IKE SAs", spis.len());
        for spi in spis {
            self.delete(spi);
        }
    }

    /// Stops the worker pool; jobs still queued are dropped.
    pub async fn stop(&mut self) {
        if !self.manager.is_empty() {
            warn!("Stopping with {} IKE SAs remaining", self.manager.len());
        }
        self.workers.abort_all();
        while let Some(res) = self.workers.join_next().await {
            if let Err(err) = res {
                if !err.is_cancelled() {
                    warn!("Worker failed: {}", err);
                }
            }
        }
    }
}
