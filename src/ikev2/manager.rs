use log::{debug, info, trace, warn};
use rand::Rng;
use std::{
    collections::HashMap,
    net::SocketAddr,
    ops::{Deref, DerefMut},
    sync::{self, Arc},
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{
    config::{PeerConfig, Settings},
    ike_sa::{IkeSa, IkeSaId, IkeSaState},
    kernel::Kernel,
    message::{ExchangeType, Message},
};

/// Exclusive access to one Association; dropping it without checkin releases the lock too.
pub struct CheckedOut {
    guard: OwnedMutexGuard<IkeSa>,
}

impl Deref for CheckedOut {
    type Target = IkeSa;

    fn deref(&self) -> &IkeSa {
        &self.guard
    }
}

impl DerefMut for CheckedOut {
    fn deref_mut(&mut self) -> &mut IkeSa {
        &mut self.guard
    }
}

#[derive(Default)]
struct Store {
    sas: HashMap<u64, Arc<Mutex<IkeSa>>>,
    // Remote address and initiator SPI of IKE_SA_INIT requests, to local SPI.
    half_open: HashMap<(SocketAddr, u64), u64>,
}

/// Association store with checkout/checkin semantics.
///
/// The store lock is only held for map lookups; waiting for an Association happens on
/// its own FIFO-fair lock, so different Associations are checked out in parallel.
pub struct IkeSaManager {
    settings: Arc<Settings>,
    kernel: Arc<dyn Kernel>,
    store: sync::Mutex<Store>,
}

impl IkeSaManager {
    pub fn new(settings: Arc<Settings>, kernel: Arc<dyn Kernel>) -> IkeSaManager {
        IkeSaManager {
            settings,
            kernel,
            store: sync::Mutex::new(Store::default()),
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    fn store(&self) -> sync::MutexGuard<'_, Store> {
        // Map operations never panic halfway, so a poisoned store is still consistent.
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, local_spi: u64) -> Option<Arc<Mutex<IkeSa>>> {
        self.store().sas.get(&local_spi).cloned()
    }

    fn allocate_spi(store: &Store) -> u64 {
        loop {
            let spi = rand::thread_rng().gen::<u64>();
            if spi != 0 && !store.sas.contains_key(&spi) {
                return spi;
            }
        }
    }

    fn register(store: &mut Store, sa: IkeSa) -> Option<CheckedOut> {
        let local_spi = sa.local_spi();
        let sa = Arc::new(Mutex::new(sa));
        let guard = match sa.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Newly created IKE SA {:016x} is already locked", local_spi);
                return None;
            }
        };
        store.sas.insert(local_spi, sa);
        Some(CheckedOut { guard })
    }

    /// Checks out an Association by its local SPI, waiting until it is checked in.
    pub async fn checkout(&self, local_spi: u64) -> Option<CheckedOut> {
        let sa = self.lookup(local_spi)?;
        let guard = sa.lock_owned().await;
        if guard.is_destroyed() {
            trace!("IKE SA {:016x} was destroyed while waiting", local_spi);
            return None;
        }
        Some(CheckedOut { guard })
    }

    /// Resolves the Association a message belongs to, creating one for a new IKE_SA_INIT.
    ///
    /// `config` is only used when a new Association is created; without it, no
    /// Association is created. Messages that match nothing return `None` and must be dropped.
    pub async fn checkout_by_message(
        &self,
        message: &Message,
        config: Option<Arc<PeerConfig>>,
    ) -> Option<CheckedOut> {
        if message.is_from_initiator() && message.responder_spi() == 0 {
            return self.checkout_half_open(message, config).await;
        }
        let local_spi = if message.is_from_initiator() {
            message.responder_spi()
        } else {
            message.initiator_spi()
        };
        let sa = match self.lookup(local_spi) {
            Some(sa) => sa,
            None => {
                debug!(
                    "No IKE SA {:016x} for {} message from {}",
                    local_spi,
                    message.exchange_type(),
                    message.source()
                );
                return None;
            }
        };
        let guard = sa.lock_owned().await;
        if guard.is_destroyed() {
            return None;
        }
        let id = guard.id();
        let remote_spi = if message.is_from_initiator() {
            message.initiator_spi()
        } else {
            message.responder_spi()
        };
        // Our IKE_SA_INIT response doesn't know the peer's SPI yet.
        let learning_spi = id.remote_spi() == 0
            && message.exchange_type() == ExchangeType::IKE_SA_INIT
            && message.is_response();
        if id.is_initiator() == message.is_from_initiator()
            || (id.remote_spi() != remote_spi && !learning_spi)
        {
            debug!(
                "IKE SA {} does not match message SPIs {:016x}_i {:016x}_r from {}",
                id,
                message.initiator_spi(),
                message.responder_spi(),
                message.source()
            );
            return None;
        }
        Some(CheckedOut { guard })
    }

    async fn checkout_half_open(
        &self,
        message: &Message,
        config: Option<Arc<PeerConfig>>,
    ) -> Option<CheckedOut> {
        if message.exchange_type() != ExchangeType::IKE_SA_INIT
            || !message.is_request()
            || message.message_id() != 0
        {
            debug!(
                "Dropping {} message without responder SPI from {}",
                message.exchange_type(),
                message.source()
            );
            return None;
        }
        let key = (message.source(), message.initiator_spi());
        let existing = {
            let mut store = self.store();
            let half_open = store.half_open.get(&key).copied();
            match half_open {
                Some(local_spi) => store.sas.get(&local_spi).cloned(),
                None => {
                    let config = match config {
                        Some(config) => config,
                        None => {
                            debug!("No peer config for IKE_SA_INIT from {}", message.source());
                            return None;
                        }
                    };
                    let local_spi = Self::allocate_spi(&store);
                    let id = IkeSaId::new(message.initiator_spi(), local_spi, false);
                    let mut sa = IkeSa::new(
                        id,
                        self.settings.clone(),
                        self.kernel.clone(),
                        message.destination(),
                        message.source(),
                        Some(config),
                    );
                    sa.set_half_open_key(Some(key));
                    debug!("Created IKE SA {} for {}", id, message.source());
                    store.half_open.insert(key, local_spi);
                    return Self::register(&mut store, sa);
                }
            }
        };
        // Retransmitted IKE_SA_INIT goes to the Association created by the first copy.
        let guard = existing?.lock_owned().await;
        if guard.is_destroyed() {
            return None;
        }
        Some(CheckedOut { guard })
    }

    /// Creates and checks out a new Association as the initiator.
    pub fn checkout_new(
        &self,
        config: Arc<PeerConfig>,
        my_host: SocketAddr,
        other_host: SocketAddr,
    ) -> Option<CheckedOut> {
        let mut store = self.store();
        let local_spi = Self::allocate_spi(&store);
        let id = IkeSaId::new(local_spi, 0, true);
        debug!("Created IKE SA {} to {}", id, other_host);
        let sa = IkeSa::new(
            id,
            self.settings.clone(),
            self.kernel.clone(),
            my_host,
            other_host,
            Some(config),
        );
        Self::register(&mut store, sa)
    }

    /// Releases an Association for the next checkout.
    pub fn checkin(&self, mut sa: CheckedOut) {
        if sa.state() == IkeSaState::Established {
            if let Some(key) = sa.half_open_key() {
                self.store().half_open.remove(&key);
                sa.set_half_open_key(None);
            }
        }
        trace!("IKE SA {} checked in", sa.id());
    }

    /// Destroys an Association and removes it from the store.
    pub fn checkin_and_destroy(&self, mut sa: CheckedOut) {
        sa.destroy();
        let mut store = self.store();
        if let Some(key) = sa.half_open_key() {
            store.half_open.remove(&key);
        }
        if store.sas.remove(&sa.local_spi()).is_some() {
            info!("IKE SA {} removed, {} remaining", sa.id(), store.sas.len());
        }
    }

    pub fn local_spis(&self) -> Vec<u64> {
        self.store().sas.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.store().sas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store().sas.is_empty()
    }
}
